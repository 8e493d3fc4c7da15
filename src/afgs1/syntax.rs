//! Bit-exact writer for the AFGS1 `film_grain_param_sets` syntax.

use anyhow::{ensure, Result};

use super::{database::MAX_PARAM_SETS, params::FilmGrainParams};
use crate::bits::BitWriter;

// Resolutions are expressed in integer luma samples. A future revision may
// derive this from a maximum-resolution constraint instead.
const APPLY_UNITS_RESOLUTION_LOG2: u32 = 0;

// Scaling increments, scaling values, and AR coefficients are all carried in
// 8 bits in this profile.
const BITS_INCR: u32 = 8;
const BITS_SCAL: u32 = 8;
const BITS_AR: u32 = 8;

/// Writes one or more film grain parameter payloads, preceded by the
/// enable flag, four reserved alignment bits, and the set count.
///
/// Conformance is checked before any bit is committed, so a failure leaves
/// `writer` untouched.
pub fn write_film_grain_param_sets(
    sets: &[FilmGrainParams],
    writer: &mut BitWriter,
) -> Result<()> {
    ensure!(
        (1..=MAX_PARAM_SETS).contains(&sets.len()),
        "A film grain payload must carry between 1 and {MAX_PARAM_SETS} parameter sets, got {}",
        sets.len()
    );
    for (i, first) in sets.iter().enumerate() {
        for second in &sets[i + 1..] {
            ensure!(
                (first.apply_horz_resolution, first.apply_vert_resolution)
                    != (second.apply_horz_resolution, second.apply_vert_resolution),
                "Multiple parameter sets have the same value for resolution ({}x{})",
                first.apply_horz_resolution,
                first.apply_vert_resolution
            );
            ensure!(
                first.film_grain_param_set_idx != second.film_grain_param_set_idx,
                "Multiple parameter sets have the same value for film_grain_param_set_idx ({})",
                first.film_grain_param_set_idx
            );
        }
    }
    for params in sets {
        validate(params)?;
    }

    writer.write_bit(true); // afgs1_enable_flag
    // Reserved bits, so that each film_grain_payload starts byte aligned.
    writer.write_literal(0, 4);
    writer.write_literal(sets.len() as u32 - 1, 3); // num_film_grain_sets_minus_1
    for params in sets {
        write_film_grain_payload(params, writer);
    }
    Ok(())
}

/// Writes one size-prefixed, zero-padded `film_grain_payload`.
///
/// The parameter set is serialized twice: once into a scratch buffer to
/// measure the body, then into `writer` behind the size fields the
/// measurement determined.
fn write_film_grain_payload(params: &FilmGrainParams, writer: &mut BitWriter) {
    let start_position = writer.position();

    let mut scratch = BitWriter::new();
    write_film_grain_params(params, &mut scratch);

    // Size prefix overhead is 9 bits, then the whole payload rounds up to a
    // byte boundary.
    let mut payload_bits = scratch.position() + 9;
    if payload_bits % 8 != 0 {
        payload_bits += 8 - payload_bits % 8;
    }
    let payload_size = payload_bits / 8;

    let payload_less_than_4byte_flag = payload_size < 4;
    writer.write_bit(payload_less_than_4byte_flag);
    writer.write_literal(
        payload_size as u32,
        if payload_less_than_4byte_flag { 2 } else { 8 },
    );

    write_film_grain_params(params, writer);

    // Zero padding up to the declared payload size.
    writer.write_literal(0, payload_size * 8 - (writer.position() - start_position));
}

#[allow(clippy::too_many_lines)]
fn write_film_grain_params(params: &FilmGrainParams, writer: &mut BitWriter) {
    writer.write_literal(u32::from(params.film_grain_param_set_idx), 3);

    writer.write_bit(params.apply_grain);
    if !params.apply_grain {
        return;
    }

    writer.write_literal(u32::from(params.grain_seed), 16);

    writer.write_bit(params.update_parameters);
    if !params.update_parameters {
        return;
    }

    writer.write_literal(APPLY_UNITS_RESOLUTION_LOG2, 4);
    writer.write_literal(u32::from(params.apply_horz_resolution), 12);
    writer.write_literal(u32::from(params.apply_vert_resolution), 12);

    writer.write_bit(params.luma_only_flag);
    if !params.luma_only_flag {
        writer.write_bit(params.subsampling_x);
        writer.write_bit(params.subsampling_y);
    }

    writer.write_bit(params.video_signal_characteristics_flag);

    // Parameter prediction is not used in this profile.
    writer.write_bit(false); // predict_scaling_flag

    writer.write_literal(params.scaling_points_y.len() as u32, 4);
    if !params.scaling_points_y.is_empty() {
        writer.write_literal(BITS_INCR - 1, 3);
        writer.write_literal(BITS_SCAL - 5, 2);
        write_scaling_points(&params.scaling_points_y, writer);
    }

    if !params.luma_only_flag {
        writer.write_bit(params.chroma_scaling_from_luma);
    }

    if !params.luma_only_flag && !params.chroma_scaling_from_luma {
        writer.write_literal(params.scaling_points_cb.len() as u32, 4);
        if !params.scaling_points_cb.is_empty() {
            writer.write_literal(BITS_INCR - 1, 3);
            writer.write_literal(BITS_SCAL - 5, 2);
            writer.write_literal(0, 8); // reserved
            write_scaling_points(&params.scaling_points_cb, writer);
        }

        writer.write_literal(params.scaling_points_cr.len() as u32, 4);
        if !params.scaling_points_cr.is_empty() {
            writer.write_literal(BITS_INCR - 1, 3);
            writer.write_literal(BITS_SCAL - 5, 2);
            writer.write_literal(0, 8); // reserved
            write_scaling_points(&params.scaling_points_cr, writer);
        }
    }

    writer.write_literal(u32::from(params.scaling_shift) - 8, 2);

    writer.write_literal(u32::from(params.ar_coeff_lag), 2);
    let num_pos_luma = params.num_pos_luma();
    let num_pos_chroma = if params.scaling_points_y.is_empty() {
        num_pos_luma
    } else {
        writer.write_literal(BITS_AR - 5, 2);
        for &coeff in &params.ar_coeffs_y[..num_pos_luma] {
            writer.write_literal((i32::from(coeff) + 128) as u32, 8);
        }
        num_pos_luma + 1
    };

    if !params.scaling_points_cb.is_empty() || params.chroma_scaling_from_luma {
        writer.write_literal(BITS_AR - 5, 2);
        for &coeff in &params.ar_coeffs_cb[..num_pos_chroma] {
            writer.write_literal((i32::from(coeff) + 128) as u32, 8);
        }
    }

    if !params.scaling_points_cr.is_empty() || params.chroma_scaling_from_luma {
        writer.write_literal(BITS_AR - 5, 2);
        for &coeff in &params.ar_coeffs_cr[..num_pos_chroma] {
            writer.write_literal((i32::from(coeff) + 128) as u32, 8);
        }
    }

    writer.write_literal(u32::from(params.ar_coeff_shift) - 6, 2);
    writer.write_literal(u32::from(params.grain_scale_shift), 2);

    if !params.scaling_points_cb.is_empty() {
        writer.write_literal(u32::from(params.cb_mult), 8);
        writer.write_literal(u32::from(params.cb_luma_mult), 8);
        writer.write_literal(u32::from(params.cb_offset), 9);
    }

    if !params.scaling_points_cr.is_empty() {
        writer.write_literal(u32::from(params.cr_mult), 8);
        writer.write_literal(u32::from(params.cr_luma_mult), 8);
        writer.write_literal(u32::from(params.cr_offset), 9);
    }

    writer.write_bit(params.overlap_flag);
    writer.write_bit(params.clip_to_restricted_range);
}

fn write_scaling_points(points: &[[u8; 2]], writer: &mut BitWriter) {
    // Point x coordinates are transmitted as deltas from the previous point.
    let mut previous = 0u32;
    for (i, point) in points.iter().enumerate() {
        let increment = if i == 0 {
            u32::from(point[0])
        } else {
            u32::from(point[0]) - previous
        };
        writer.write_literal(increment, BITS_INCR as usize);
        writer.write_literal(u32::from(point[1]), BITS_SCAL as usize);
        previous = u32::from(point[0]);
    }
}

fn validate(params: &FilmGrainParams) -> Result<()> {
    ensure!(
        usize::from(params.film_grain_param_set_idx) < MAX_PARAM_SETS,
        "film_grain_param_set_idx {} out of range 0..{MAX_PARAM_SETS}",
        params.film_grain_param_set_idx
    );
    if !params.apply_grain || !params.update_parameters {
        // Only the set index, seed, and flags are transmitted.
        return Ok(());
    }

    ensure!(
        params.apply_horz_resolution < (1 << 12) && params.apply_vert_resolution < (1 << 12),
        "Resolution {}x{} does not fit in 12 bits per dimension",
        params.apply_horz_resolution,
        params.apply_vert_resolution
    );
    ensure!(!params.luma_only_flag, "Luma-only operation is not supported");
    ensure!(
        params.subsampling_x && params.subsampling_y,
        "Only 4:2:0 chroma subsampling is supported"
    );
    ensure!(
        !params.video_signal_characteristics_flag,
        "Video signal characteristics must not be signaled"
    );
    ensure!(
        (8..=11).contains(&params.scaling_shift),
        "scaling_shift {} out of range 8..=11",
        params.scaling_shift
    );
    ensure!(
        params.ar_coeff_lag <= 3,
        "ar_coeff_lag {} out of range 0..=3",
        params.ar_coeff_lag
    );
    ensure!(
        (6..=9).contains(&params.ar_coeff_shift),
        "ar_coeff_shift {} out of range 6..=9",
        params.ar_coeff_shift
    );
    ensure!(
        params.grain_scale_shift <= 3,
        "grain_scale_shift {} out of range 0..=3",
        params.grain_scale_shift
    );
    ensure!(
        params.cb_offset < (1 << 9) && params.cr_offset < (1 << 9),
        "Chroma offsets must fit in 9 bits"
    );

    strictly_increasing(&params.scaling_points_y, "y")?;
    strictly_increasing(&params.scaling_points_cb, "cb")?;
    strictly_increasing(&params.scaling_points_cr, "cr")?;
    if params.chroma_scaling_from_luma {
        ensure!(
            params.scaling_points_cb.is_empty() && params.scaling_points_cr.is_empty(),
            "Chroma scaling points cannot be combined with chroma_scaling_from_luma"
        );
    }

    let num_pos_luma = params.num_pos_luma();
    if !params.scaling_points_y.is_empty() {
        ensure!(
            params.ar_coeffs_y.len() >= num_pos_luma,
            "Expected {} luma AR coefficients, have {}",
            num_pos_luma,
            params.ar_coeffs_y.len()
        );
    }
    let num_pos_chroma = if params.scaling_points_y.is_empty() {
        num_pos_luma
    } else {
        num_pos_luma + 1
    };
    if !params.scaling_points_cb.is_empty() || params.chroma_scaling_from_luma {
        ensure!(
            params.ar_coeffs_cb.len() >= num_pos_chroma,
            "Expected {} cb AR coefficients, have {}",
            num_pos_chroma,
            params.ar_coeffs_cb.len()
        );
    }
    if !params.scaling_points_cr.is_empty() || params.chroma_scaling_from_luma {
        ensure!(
            params.ar_coeffs_cr.len() >= num_pos_chroma,
            "Expected {} cr AR coefficients, have {}",
            num_pos_chroma,
            params.ar_coeffs_cr.len()
        );
    }

    Ok(())
}

fn strictly_increasing(points: &[[u8; 2]], plane: &str) -> Result<()> {
    ensure!(
        points.windows(2).all(|pair| pair[0][0] < pair[1][0]),
        "Scaling point x coordinates for {plane} must be strictly increasing"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::write_film_grain_param_sets;
    use crate::{
        afgs1::params::{sample_params, FilmGrainParams},
        bits::BitWriter,
    };

    fn minimal_disabled_set() -> FilmGrainParams {
        FilmGrainParams {
            apply_grain: false,
            apply_horz_resolution: 1920,
            apply_vert_resolution: 1080,
            ..FilmGrainParams::default()
        }
    }

    /// Reads `bits` bits starting at `offset` from the emitted bytes.
    fn read_bits(writer: &BitWriter, offset: usize, bits: usize) -> u32 {
        let mut value = 0;
        for i in offset..offset + bits {
            value = (value << 1) | u32::from((writer.byte_at(i / 8) >> (7 - i % 8)) & 1);
        }
        value
    }

    #[test]
    fn minimal_disabled_set_has_stable_bytes() {
        let mut writer = BitWriter::new();
        write_film_grain_param_sets(&[minimal_disabled_set()], &mut writer).unwrap();
        // Enable flag, 4 reserved bits, and a zero set count fill the first
        // byte; the two-byte payload is the size prefix (flag set, size 2),
        // the set index, a cleared apply_grain flag, and zero padding.
        assert_eq!(writer.as_bytes(), &[0x80, 0xC0, 0x00]);
    }

    #[test]
    fn emission_is_deterministic() {
        let mut first = BitWriter::new();
        let mut second = BitWriter::new();
        write_film_grain_param_sets(&[sample_params()], &mut first).unwrap();
        write_film_grain_param_sets(&[sample_params()], &mut second).unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn emission_is_byte_aligned() {
        for sets in [
            vec![minimal_disabled_set()],
            vec![sample_params()],
            {
                let mut second = sample_params();
                second.film_grain_param_set_idx = 1;
                second.apply_horz_resolution = 1280;
                second.apply_vert_resolution = 720;
                vec![sample_params(), second]
            },
        ] {
            let mut writer = BitWriter::new();
            write_film_grain_param_sets(&sets, &mut writer).unwrap();
            assert_eq!(writer.position() % 8, 0);
        }
    }

    #[test]
    fn header_carries_the_set_count() {
        let mut second = sample_params();
        second.film_grain_param_set_idx = 1;
        second.apply_horz_resolution = 1280;
        second.apply_vert_resolution = 720;

        let mut writer = BitWriter::new();
        write_film_grain_param_sets(&[sample_params(), second], &mut writer).unwrap();
        // afgs1_enable_flag, four reserved zeros, num_film_grain_sets_minus_1.
        assert_eq!(writer.byte_at(0), 0b1000_0001);
    }

    #[test]
    fn declared_payload_size_is_the_true_size() {
        let mut writer = BitWriter::new();
        write_film_grain_param_sets(&[sample_params()], &mut writer).unwrap();

        // The payload begins after the one-byte header.
        let less_than_4byte = read_bits(&writer, 8, 1) == 1;
        let size_bits = if less_than_4byte { 2 } else { 8 };
        let payload_size = read_bits(&writer, 9, size_bits) as usize;
        assert_eq!(writer.position(), 8 + payload_size * 8);
    }

    #[test]
    fn payload_padding_is_zero() {
        // A cleared update flag truncates the body to 21 bits, leaving two
        // padding bits in a four-byte payload.
        let mut params = sample_params();
        params.update_parameters = false;
        params.grain_seed = 0xFFFF;

        let mut writer = BitWriter::new();
        write_film_grain_param_sets(&[params], &mut writer).unwrap();
        let payload_size = read_bits(&writer, 9, 8) as usize;
        assert_eq!(payload_size, 4);
        assert_eq!(writer.position(), 8 + 32);
        // Bits past the update flag must be exact zeros.
        assert_eq!(read_bits(&writer, 8 + 30, 2), 0);
    }

    #[test]
    fn y_only_scaling_set_round_trips_its_size_prefix() {
        let mut params = sample_params();
        params.ar_coeff_lag = 0;
        params.ar_coeffs_y.clear();
        params.ar_coeffs_cb.clear();
        params.ar_coeffs_cb.push(0);
        params.ar_coeffs_cr.clear();
        params.ar_coeffs_cr.push(0);

        let mut writer = BitWriter::new();
        write_film_grain_param_sets(&[params], &mut writer).unwrap();

        let less_than_4byte = read_bits(&writer, 8, 1) == 1;
        assert!(!less_than_4byte);
        let payload_size = read_bits(&writer, 9, 8) as usize;
        assert_eq!(writer.position(), 8 + payload_size * 8);
        // 116 body bits plus the 9-bit prefix, rounded up.
        assert_eq!(payload_size, 16);
    }

    #[test]
    fn rejects_duplicate_resolutions() {
        let mut second = sample_params();
        second.film_grain_param_set_idx = 1;

        let mut writer = BitWriter::new();
        let err =
            write_film_grain_param_sets(&[sample_params(), second], &mut writer).unwrap_err();
        assert!(err.to_string().contains("same value for resolution"));
        // Nothing may be committed on failure.
        assert_eq!(writer.position(), 0);
    }

    #[test]
    fn rejects_duplicate_set_indices() {
        let mut second = sample_params();
        second.apply_horz_resolution = 1280;
        second.apply_vert_resolution = 720;

        let mut writer = BitWriter::new();
        let err =
            write_film_grain_param_sets(&[sample_params(), second], &mut writer).unwrap_err();
        assert!(err
            .to_string()
            .contains("same value for film_grain_param_set_idx"));
    }

    #[test]
    fn rejects_an_empty_set_list() {
        let mut writer = BitWriter::new();
        assert!(write_film_grain_param_sets(&[], &mut writer).is_err());
    }

    #[test]
    fn rejects_out_of_range_fields() {
        let mut params = sample_params();
        params.scaling_shift = 12;
        let mut writer = BitWriter::new();
        let err = write_film_grain_param_sets(&[params], &mut writer).unwrap_err();
        assert!(err.to_string().contains("scaling_shift"));

        let mut params = sample_params();
        params.scaling_points_y.clear();
        params.scaling_points_y.push([64, 0]);
        params.scaling_points_y.push([64, 1]);
        let mut writer = BitWriter::new();
        let err = write_film_grain_param_sets(&[params], &mut writer).unwrap_err();
        assert!(err.to_string().contains("strictly increasing"));
    }
}
