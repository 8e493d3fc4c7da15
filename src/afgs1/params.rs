use arrayvec::ArrayVec;

pub const NUM_Y_POINTS: usize = 14;
pub const NUM_UV_POINTS: usize = 10;
pub const NUM_Y_COEFFS: usize = 24;
pub const NUM_UV_COEFFS: usize = 25;

/// One AFGS1 film grain parameter set.
///
/// A set describes decoder-side grain synthesis for pictures of one
/// resolution; the database tags each set with the presentation-time window
/// it applies to.
#[derive(Debug, Clone)]
pub struct FilmGrainParams {
    /// Which of the 8 decoder-side parameter slots this set occupies.
    pub film_grain_param_set_idx: u8,
    /// Whether grain synthesis is enabled for this set at all.
    pub apply_grain: bool,
    /// Random seed used for generating grain. Stored unsigned; the filmgrn1
    /// file carries it as a signed 16-bit value.
    pub grain_seed: u16,
    /// Whether the body of the parameter set is transmitted, or the decoder
    /// reuses the set already stored in its buffer slot.
    pub update_parameters: bool,

    /// Horizontal resolution this set applies to, in luma samples.
    pub apply_horz_resolution: u16,
    /// Vertical resolution this set applies to, in luma samples.
    pub apply_vert_resolution: u16,
    pub luma_only_flag: bool,
    pub subsampling_x: bool,
    pub subsampling_y: bool,
    pub video_signal_characteristics_flag: bool,

    /// Values for the cutoffs and scale factors for luma scaling points
    pub scaling_points_y: ArrayVec<[u8; 2], NUM_Y_POINTS>,
    /// Values for the cutoffs and scale factors for Cb scaling points
    pub scaling_points_cb: ArrayVec<[u8; 2], NUM_UV_POINTS>,
    /// Values for the cutoffs and scale factors for Cr scaling points
    pub scaling_points_cr: ArrayVec<[u8; 2], NUM_UV_POINTS>,
    /// Scale chroma grain from luma instead of providing chroma scaling
    /// points
    pub chroma_scaling_from_luma: bool,

    /// Determines the range and quantization step of the standard deviation
    /// of film grain.
    ///
    /// Accepts values between `8..=11`.
    pub scaling_shift: u8,

    /// A factor specifying how many AR coefficients are provided, based on
    /// the formula `coeffs_len = 2 * ar_coeff_lag * (ar_coeff_lag + 1)`.
    ///
    /// Accepts values between `0..=3`.
    pub ar_coeff_lag: u8,
    /// Values for the AR coefficients for luma scaling points
    pub ar_coeffs_y: ArrayVec<i8, NUM_Y_COEFFS>,
    /// Values for the AR coefficients for Cb scaling points
    pub ar_coeffs_cb: ArrayVec<i8, NUM_UV_COEFFS>,
    /// Values for the AR coefficients for Cr scaling points
    pub ar_coeffs_cr: ArrayVec<i8, NUM_UV_COEFFS>,
    /// Shift value: Specifies the range of acceptable AR coefficients
    /// 6: [-2, 2)
    /// 7: [-1, 1)
    /// 8: [-0.5, 0.5)
    /// 9: [-0.25, 0.25)
    pub ar_coeff_shift: u8,
    /// Specifies how much the Gaussian random numbers should be scaled down
    /// during the grain synthesis process.
    pub grain_scale_shift: u8,

    /// Multiplier to the grain strength of the Cb plane
    pub cb_mult: u8,
    /// Multiplier to the grain strength of the Cb plane inherited from the
    /// luma plane
    pub cb_luma_mult: u8,
    /// A base value for the Cb plane grain
    pub cb_offset: u16,
    /// Multiplier to the grain strength of the Cr plane
    pub cr_mult: u8,
    /// Multiplier to the grain strength of the Cr plane inherited from the
    /// luma plane
    pub cr_luma_mult: u8,
    /// A base value for the Cr plane grain
    pub cr_offset: u16,

    /// Whether film grain blocks should overlap or not
    pub overlap_flag: bool,
    pub clip_to_restricted_range: bool,
}

impl Default for FilmGrainParams {
    fn default() -> Self {
        Self {
            film_grain_param_set_idx: 0,
            apply_grain: false,
            grain_seed: 0,
            update_parameters: false,
            apply_horz_resolution: 0,
            apply_vert_resolution: 0,
            luma_only_flag: false,
            subsampling_x: true,
            subsampling_y: true,
            video_signal_characteristics_flag: false,
            scaling_points_y: ArrayVec::new(),
            scaling_points_cb: ArrayVec::new(),
            scaling_points_cr: ArrayVec::new(),
            chroma_scaling_from_luma: false,
            scaling_shift: 8,
            ar_coeff_lag: 0,
            ar_coeffs_y: ArrayVec::new(),
            ar_coeffs_cb: ArrayVec::new(),
            ar_coeffs_cr: ArrayVec::new(),
            ar_coeff_shift: 6,
            grain_scale_shift: 0,
            cb_mult: 0,
            cb_luma_mult: 0,
            cb_offset: 0,
            cr_mult: 0,
            cr_luma_mult: 0,
            cr_offset: 0,
            overlap_flag: false,
            clip_to_restricted_range: false,
        }
    }
}

impl FilmGrainParams {
    /// Number of luma AR coefficients implied by `ar_coeff_lag`.
    #[must_use]
    pub fn num_pos_luma(&self) -> usize {
        2 * usize::from(self.ar_coeff_lag) * (usize::from(self.ar_coeff_lag) + 1)
    }
}

fn active_slice<T, const CAP: usize>(values: &ArrayVec<T, CAP>, len: usize) -> &[T] {
    &values[..len.min(values.len())]
}

impl PartialEq for FilmGrainParams {
    fn eq(&self, other: &Self) -> bool {
        // The grain seed is deliberately excluded: it is remodulated per
        // picture, and a seed-only difference must still hit the buffer.
        // Coefficient arrays are compared only over the lengths the lag
        // declares active.
        let num_pos_luma = self.num_pos_luma();
        let num_pos_chroma = num_pos_luma + 1;
        self.film_grain_param_set_idx == other.film_grain_param_set_idx
            && self.apply_grain == other.apply_grain
            && self.update_parameters == other.update_parameters
            && self.apply_horz_resolution == other.apply_horz_resolution
            && self.apply_vert_resolution == other.apply_vert_resolution
            && self.luma_only_flag == other.luma_only_flag
            && self.subsampling_x == other.subsampling_x
            && self.subsampling_y == other.subsampling_y
            && self.video_signal_characteristics_flag == other.video_signal_characteristics_flag
            && self.scaling_points_y == other.scaling_points_y
            && self.scaling_points_cb == other.scaling_points_cb
            && self.scaling_points_cr == other.scaling_points_cr
            && self.chroma_scaling_from_luma == other.chroma_scaling_from_luma
            && self.scaling_shift == other.scaling_shift
            && self.ar_coeff_lag == other.ar_coeff_lag
            && active_slice(&self.ar_coeffs_y, num_pos_luma)
                == active_slice(&other.ar_coeffs_y, num_pos_luma)
            && active_slice(&self.ar_coeffs_cb, num_pos_chroma)
                == active_slice(&other.ar_coeffs_cb, num_pos_chroma)
            && active_slice(&self.ar_coeffs_cr, num_pos_chroma)
                == active_slice(&other.ar_coeffs_cr, num_pos_chroma)
            && self.ar_coeff_shift == other.ar_coeff_shift
            && self.grain_scale_shift == other.grain_scale_shift
            && self.cb_mult == other.cb_mult
            && self.cb_luma_mult == other.cb_luma_mult
            && self.cb_offset == other.cb_offset
            && self.cr_mult == other.cr_mult
            && self.cr_luma_mult == other.cr_luma_mult
            && self.cr_offset == other.cr_offset
            && self.overlap_flag == other.overlap_flag
            && self.clip_to_restricted_range == other.clip_to_restricted_range
    }
}

/// A fully populated set for use across the crate's tests.
#[cfg(test)]
pub(crate) fn sample_params() -> FilmGrainParams {
    let mut params = FilmGrainParams {
        film_grain_param_set_idx: 0,
        apply_grain: true,
        grain_seed: 1000,
        update_parameters: true,
        apply_horz_resolution: 1920,
        apply_vert_resolution: 1080,
        scaling_shift: 8,
        ar_coeff_lag: 1,
        ar_coeff_shift: 6,
        overlap_flag: true,
        clip_to_restricted_range: false,
        ..FilmGrainParams::default()
    };
    params.scaling_points_y.push([0, 0]);
    params.scaling_points_y.push([64, 128]);
    for _ in 0..params.num_pos_luma() {
        params.ar_coeffs_y.push(4);
    }
    for _ in 0..=params.num_pos_luma() {
        params.ar_coeffs_cb.push(-3);
        params.ar_coeffs_cr.push(2);
    }
    params
}
