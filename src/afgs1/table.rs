//! Reader for the "filmgrn1" parameter file format produced by noise
//! modeling tools.
//!
//! The format is an ascii representation for readability and editability.
//! Each entry is prefixed with `E`, and the parameter body is only present
//! when the entry's update flag is nonzero:
//!
//! ```text
//! filmgrn1
//! E <start-time> <end-time> <apply-grain> <random-seed> <update-parms>
//!  p <ar_coeff_lag> <ar_coeff_shift> <grain_scale_shift> ...
//!  sY <num_y_points> <point_0_x> <point_0_y> ...
//!  sCb <num_cb_points> <point_0_x> <point_0_y> ...
//!  sCr <num_cr_points> <point_0_x> <point_0_y> ...
//!  cY <ar_coeff_y_0> ...
//!  cCb <ar_coeff_cb_0> ...
//!  cCr <ar_coeff_cr_0> ...
//! ```

use anyhow::{anyhow, Result};
use arrayvec::ArrayVec;
use nom::{
    bytes::complete::{tag, take},
    character::complete::{
        i16 as parse_i16, i64 as parse_i64, i8 as parse_i8, multispace0, multispace1,
        u16 as parse_u16, u8 as parse_u8,
    },
    combinator::{map, verify},
    error::{context, convert_error, VerboseError},
    sequence::preceded,
    Finish, IResult,
};

use super::params::{FilmGrainParams, NUM_UV_COEFFS, NUM_UV_POINTS, NUM_Y_COEFFS, NUM_Y_POINTS};

type ParseResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

/// Film grain parameters for a segment of video running from `start_time`
/// to `end_time`, expressed in 100-nanosecond ticks.
#[derive(Debug, Clone)]
pub struct GrainTableSegment {
    pub start_time: i64,
    pub end_time: i64,
    pub grain_params: FilmGrainParams,
}

/// Parses the contents of a filmgrn1 file into its segments.
///
/// Resolution, subsampling, and the parameter set index are not part of the
/// file format; the database annotates them after loading.
pub fn parse_table(input: &str) -> Result<Vec<GrainTableSegment>> {
    match table(input).finish() {
        Ok((_, segments)) => Ok(segments),
        Err(e) => Err(anyhow!(
            "Unable to parse film grain table: {}",
            convert_error(input, e)
        )),
    }
}

fn table(input: &str) -> ParseResult<'_, Vec<GrainTableSegment>> {
    let (mut input, _) = context("file header", file_header)(input)?;
    let mut segments = Vec::new();
    loop {
        let (rest, _) = multispace0(input)?;
        if rest.is_empty() {
            return Ok((rest, segments));
        }
        let (rest, segment) = entry(rest)?;
        segments.push(segment);
        input = rest;
    }
}

fn file_header(input: &str) -> ParseResult<'_, ()> {
    // The byte following the magic is consumed and ignored; historically it
    // is a newline.
    let (input, _) = tag("filmgrn1")(input)?;
    map(take(1usize), |_| ())(input)
}

fn entry(input: &str) -> ParseResult<'_, GrainTableSegment> {
    let (input, _) = context("entry header", tag("E"))(input)?;
    let (input, start_time) = context("entry header", preceded(multispace1, parse_i64))(input)?;
    let (input, end_time) = context("entry header", preceded(multispace1, parse_i64))(input)?;
    let (input, apply_grain) = context("entry header", preceded(multispace1, flag))(input)?;
    let (input, grain_seed) = context("entry header", preceded(multispace1, parse_i16))(input)?;
    let (input, update_parameters) = context("entry header", preceded(multispace1, flag))(input)?;

    let mut grain_params = FilmGrainParams {
        apply_grain,
        grain_seed: grain_seed as u16,
        update_parameters,
        ..FilmGrainParams::default()
    };
    if !update_parameters {
        return Ok((
            input,
            GrainTableSegment {
                start_time,
                end_time,
                grain_params,
            },
        ));
    }

    let (input, line) = context("entry params", params_line)(input)?;
    grain_params.ar_coeff_lag = line.ar_coeff_lag;
    grain_params.ar_coeff_shift = line.ar_coeff_shift;
    grain_params.grain_scale_shift = line.grain_scale_shift;
    grain_params.scaling_shift = line.scaling_shift;
    grain_params.chroma_scaling_from_luma = line.chroma_scaling_from_luma;
    grain_params.overlap_flag = line.overlap_flag;
    grain_params.cb_mult = line.cb_mult;
    grain_params.cb_luma_mult = line.cb_luma_mult;
    grain_params.cb_offset = line.cb_offset;
    grain_params.cr_mult = line.cr_mult;
    grain_params.cr_luma_mult = line.cr_luma_mult;
    grain_params.cr_offset = line.cr_offset;

    let (input, scaling_points_y) =
        context("y scaling points", scaling_points::<NUM_Y_POINTS>("sY"))(input)?;
    let (input, scaling_points_cb) =
        context("cb scaling points", scaling_points::<NUM_UV_POINTS>("sCb"))(input)?;
    let (input, scaling_points_cr) =
        context("cr scaling points", scaling_points::<NUM_UV_POINTS>("sCr"))(input)?;
    grain_params.scaling_points_y = scaling_points_y;
    grain_params.scaling_points_cb = scaling_points_cb;
    grain_params.scaling_points_cr = scaling_points_cr;

    let num_pos_luma = grain_params.num_pos_luma();
    let (input, ar_coeffs_y) = context(
        "y coefficients",
        coefficients::<NUM_Y_COEFFS>("cY", num_pos_luma),
    )(input)?;
    let (input, ar_coeffs_cb) = context(
        "cb coefficients",
        coefficients::<NUM_UV_COEFFS>("cCb", num_pos_luma + 1),
    )(input)?;
    let (input, ar_coeffs_cr) = context(
        "cr coefficients",
        coefficients::<NUM_UV_COEFFS>("cCr", num_pos_luma + 1),
    )(input)?;
    grain_params.ar_coeffs_y = ar_coeffs_y;
    grain_params.ar_coeffs_cb = ar_coeffs_cb;
    grain_params.ar_coeffs_cr = ar_coeffs_cr;

    Ok((
        input,
        GrainTableSegment {
            start_time,
            end_time,
            grain_params,
        },
    ))
}

struct ParamsLine {
    ar_coeff_lag: u8,
    ar_coeff_shift: u8,
    grain_scale_shift: u8,
    scaling_shift: u8,
    chroma_scaling_from_luma: bool,
    overlap_flag: bool,
    cb_mult: u8,
    cb_luma_mult: u8,
    cb_offset: u16,
    cr_mult: u8,
    cr_luma_mult: u8,
    cr_offset: u16,
}

fn params_line(input: &str) -> ParseResult<'_, ParamsLine> {
    let (input, _) = tag("p")(input)?;
    // A lag above 3 would imply more coefficients than the syntax can carry.
    let (input, ar_coeff_lag) =
        verify(preceded(multispace1, parse_u8), |&lag| lag <= 3)(input)?;
    let (input, ar_coeff_shift) = preceded(multispace1, parse_u8)(input)?;
    let (input, grain_scale_shift) = preceded(multispace1, parse_u8)(input)?;
    let (input, scaling_shift) = preceded(multispace1, parse_u8)(input)?;
    let (input, chroma_scaling_from_luma) = preceded(multispace1, flag)(input)?;
    let (input, overlap_flag) = preceded(multispace1, flag)(input)?;
    let (input, cb_mult) = preceded(multispace1, parse_u8)(input)?;
    let (input, cb_luma_mult) = preceded(multispace1, parse_u8)(input)?;
    let (input, cb_offset) = preceded(multispace1, parse_u16)(input)?;
    let (input, cr_mult) = preceded(multispace1, parse_u8)(input)?;
    let (input, cr_luma_mult) = preceded(multispace1, parse_u8)(input)?;
    let (input, cr_offset) = preceded(multispace1, parse_u16)(input)?;
    Ok((
        input,
        ParamsLine {
            ar_coeff_lag,
            ar_coeff_shift,
            grain_scale_shift,
            scaling_shift,
            chroma_scaling_from_luma,
            overlap_flag,
            cb_mult,
            cb_luma_mult,
            cb_offset,
            cr_mult,
            cr_luma_mult,
            cr_offset,
        },
    ))
}

fn scaling_points<const CAP: usize>(
    label: &'static str,
) -> impl Fn(&str) -> ParseResult<'_, ArrayVec<[u8; 2], CAP>> {
    move |input| {
        let (input, _) = preceded(multispace1, tag(label))(input)?;
        let (mut input, count) = verify(preceded(multispace1, parse_u8), |&count| {
            usize::from(count) <= CAP
        })(input)?;
        let mut points = ArrayVec::new();
        for _ in 0..count {
            let (rest, x) = preceded(multispace1, parse_u8)(input)?;
            let (rest, y) = preceded(multispace1, parse_u8)(rest)?;
            points.push([x, y]);
            input = rest;
        }
        Ok((input, points))
    }
}

fn coefficients<const CAP: usize>(
    label: &'static str,
    count: usize,
) -> impl Fn(&str) -> ParseResult<'_, ArrayVec<i8, CAP>> {
    move |input| {
        let (mut input, _) = preceded(multispace1, tag(label))(input)?;
        let mut values = ArrayVec::new();
        for _ in 0..count {
            let (rest, value) = preceded(multispace1, parse_i8)(input)?;
            values.push(value);
            input = rest;
        }
        Ok((input, values))
    }
}

fn flag(input: &str) -> ParseResult<'_, bool> {
    map(parse_u8, |value| value != 0)(input)
}
