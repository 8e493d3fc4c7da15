#![deny(clippy::all)]
#![warn(clippy::nursery)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::ignored_unit_patterns)]
#![allow(clippy::inconsistent_struct_constructor)]
#![allow(clippy::inline_always)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::similar_names)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::use_self)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::create_dir)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::default_numeric_fallback)]
#![warn(clippy::exit)]
#![warn(clippy::filetype_is_file)]
#![warn(clippy::float_cmp_const)]
#![warn(clippy::if_then_some_else_none)]
#![warn(clippy::lossy_float_literal)]
#![warn(clippy::map_err_ignore)]
#![warn(clippy::mem_forget)]
#![warn(clippy::mod_module_files)]
#![warn(clippy::multiple_inherent_impl)]
#![warn(clippy::pattern_type_mismatch)]
#![warn(clippy::rc_buffer)]
#![warn(clippy::rc_mutex)]
#![warn(clippy::rest_pat_in_fully_bound_structs)]
#![warn(clippy::same_name_method)]
#![warn(clippy::str_to_string)]
#![warn(clippy::string_to_string)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![warn(clippy::unnecessary_self_imports)]
#![warn(clippy::unneeded_field_pattern)]
#![warn(clippy::use_debug)]
#![warn(clippy::verbose_file_reads)]
// For binary-only crates
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod afgs1;
pub mod annexb;
pub mod bits;
pub mod sei;

use std::{
    env,
    fs::File,
    io::{stderr, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, ensure, Context, Result};
use clap::{error::ErrorKind, CommandFactory, FromArgMatches, Parser};
use crossterm::tty::IsTty;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, warn};
use num_rational::Rational64;
use num_traits::ToPrimitive;

use crate::{
    afgs1::{
        buffer::ParamsBuffer,
        database::{presentation_time, GrainDatabase, ParamSetIndexAllocator},
        syntax::write_film_grain_param_sets,
    },
    annexb::{encapsulate, write_nal, AnnexBReader, NalHeader, NalUnitType},
    bits::BitWriter,
    sei::{encode_sei_message, Afgs1Sei},
};

const INDICATIF_SPINNER_TEMPLATE: &str = if cfg!(windows) {
    // Do not use a spinner on Windows since the default console cannot
    // display the characters used for the spinner
    "{elapsed_precise:.bold} {pos} pictures"
} else {
    "{spinner:.green.bold} {elapsed_precise:.bold} {pos} pictures"
};

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template(INDICATIF_SPINNER_TEMPLATE)
        .unwrap()
}

pub fn main() -> Result<()> {
    init_logger();

    let args = parse_args()?;
    let config = Config::from_args(&args)?;

    let mut allocator = ParamSetIndexAllocator::new();
    let mut database = GrainDatabase::new();
    for table in &config.tables {
        database.load_table(&table.path, table.width, table.height, &mut allocator)?;
    }
    info!(
        "Loaded {} film grain records from {} tables",
        database.all_frames().count(),
        config.tables.len()
    );
    info!(
        "Using frame rate {}/{} ({:.3} fps)",
        config.frame_rate.numer(),
        config.frame_rate.denom(),
        config.frame_rate.to_f64().unwrap_or_default()
    );

    match config.mode {
        Mode::Inject {
            ref input,
            ref output,
        } => inject(&database, config.frame_rate, input, output),
        Mode::Standalone { frame, ref output } => {
            emit_standalone(&database, config.frame_rate, frame, output)
        }
    }
}

/// Rewrites the bitstream at `input` into `output`, inserting an AFGS1
/// T.35 SEI message before the first slice of every picture.
fn inject(
    database: &GrainDatabase,
    frame_rate: Rational64,
    input: &Path,
    output: &Path,
) -> Result<()> {
    let file = File::open(input).with_context(|| {
        format!("Failed to open bitstream file {} for reading", input.display())
    })?;
    let mut reader = AnnexBReader::new(BufReader::new(file));
    let mut writer = BufWriter::new(File::create(output).with_context(|| {
        format!(
            "Failed to open bitstream file {} for writing",
            output.display()
        )
    })?);

    let progress = if stderr().is_tty() {
        let pb = ProgressBar::new_spinner().with_style(spinner_style());
        pb.set_draw_target(ProgressDrawTarget::stderr());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    } else {
        ProgressBar::hidden()
    };

    let mut buffer = ParamsBuffer::new();
    let mut poc = 0u64;
    let mut seen_picture = false;
    let mut pictures = 0u64;

    while let Some(nal) = reader.next_nal()? {
        if nal.data.is_empty() {
            // Back-to-back start codes, or a start code right before EOF.
            warn!("Attempt to process an empty NAL unit");
            continue;
        }

        let header = NalHeader::parse(&nal.data)?;
        if nal.is_first_slice_of_picture(header) {
            if header.nal_unit_type.is_irap() {
                // A decoder joining the stream here has no buffer state, so
                // the emulation must forget everything as well.
                buffer.reset();
                poc = 0;
            } else if seen_picture {
                poc += 1;
            }
            seen_picture = true;
            pictures += 1;

            debug!("Creating AFGS1 message (POC {poc})");
            let mut message = Afgs1Sei::with_buffer(database, poc, frame_rate, &buffer)?;
            if message.is_empty() {
                debug!("No film grain parameters active at POC {poc}");
            } else {
                let t35 = message.to_t35()?;
                let sei_nal = encapsulate(
                    NalUnitType::PrefixSei,
                    header.temporal_id,
                    &encode_sei_message(&t35),
                );
                write_nal(&mut writer, &sei_nal)?;
                message.update_buffer(&mut buffer);
            }
            progress.inc(1);
        }

        write_nal(&mut writer, &nal)?;
    }
    progress.finish();
    writer
        .flush()
        .with_context(|| format!("Failed writing {}", output.display()))?;

    if pictures == 0 {
        warn!("No coded pictures found in the input bitstream");
    }
    info!("Inserted film grain messages for {pictures} pictures");
    info!("Done, wrote output file to {}", output.to_string_lossy());
    Ok(())
}

/// Serializes the parameter sets active at picture `frame` into a bare
/// AFGS1 bytestream with no SEI envelope.
fn emit_standalone(
    database: &GrainDatabase,
    frame_rate: Rational64,
    frame: u64,
    output: &Path,
) -> Result<()> {
    let sets = database.find_frames(presentation_time(frame, frame_rate));
    let mut writer = BitWriter::new();
    write_film_grain_param_sets(&sets, &mut writer)?;
    writer.write_to_path(output)?;
    info!(
        "Wrote {} parameter sets for picture {} to {}",
        sets.len(),
        frame,
        output.to_string_lossy()
    );
    Ok(())
}

fn init_logger() {
    let mut builder = pretty_env_logger::formatted_builder();
    if let Ok(filters) = env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    } else {
        builder.parse_filters("error,grainsei=info");
    }
    builder.init();
}

#[derive(Parser, Debug)]
#[clap(version, about)]
pub struct Args {
    /// Film grain parameter info as `<filename>,<width>,<height>`.
    /// May be given multiple times or concatenated with commas.
    #[clap(long = "input", short = 'p', value_parser)]
    pub input: Vec<String>,
    /// Bitstream input file name.
    #[clap(long = "BitstreamFileIn", short = 'b', value_parser)]
    pub bitstream_in: Option<PathBuf>,
    /// Bitstream output file name.
    #[clap(long = "BitstreamFileOut", short = 'o', value_parser)]
    pub bitstream_out: Option<PathBuf>,
    /// Frame rate used to generate the parameter files, as
    /// `<numerator>/<denominator>`.
    #[clap(long = "fps", short = 'f', value_parser)]
    pub fps: Option<String>,
    /// Picture number to serialize as a standalone payload.
    #[clap(long = "output_frame", value_parser)]
    pub output_frame: Option<u64>,
    /// Output file name for the standalone payload.
    #[clap(long = "output", value_parser)]
    pub output: Option<PathBuf>,
    /// Warn for unknown command line parameters instead of failing.
    #[clap(long = "WarnUnknowParameter", short = 'w', default_value_t = 0)]
    pub warn_unknown_parameter: u8,
}

fn parse_args() -> Result<Args> {
    match Args::try_parse() {
        Ok(args) => Ok(args),
        Err(e) if e.kind() == ErrorKind::UnknownArgument && warn_unknown_requested() => {
            warn!("Unknown command line parameters ignored");
            let matches = Args::command().ignore_errors(true).get_matches();
            Ok(Args::from_arg_matches(&matches)?)
        }
        Err(e) => e.exit(),
    }
}

/// Peeks at the raw command line for the warn flag, which has to be honored
/// before argument parsing itself can succeed.
fn warn_unknown_requested() -> bool {
    let args: Vec<String> = env::args().collect();
    args.iter().enumerate().any(|(i, arg)| {
        (arg == "-w" || arg == "--WarnUnknowParameter")
            && args.get(i + 1).is_none_or(|value| value != "0")
    })
}

#[derive(Debug)]
enum Mode {
    Inject { input: PathBuf, output: PathBuf },
    Standalone { frame: u64, output: PathBuf },
}

#[derive(Debug)]
struct TableInfo {
    path: PathBuf,
    width: u16,
    height: u16,
}

#[derive(Debug)]
struct Config {
    tables: Vec<TableInfo>,
    frame_rate: Rational64,
    mode: Mode,
}

impl Config {
    fn from_args(args: &Args) -> Result<Self> {
        let tables = parse_parameter_strings(&args.input)?;
        ensure!(
            !tables.is_empty(),
            "No film grain parameter files specified, aborting"
        );

        let frame_rate = args
            .fps
            .as_deref()
            .ok_or_else(|| anyhow!("No frame rate specified, aborting"))
            .and_then(parse_frame_rate)?;

        let standalone = args.output_frame.is_some() || args.output.is_some();
        let mode = if standalone {
            ensure!(
                args.bitstream_in.is_none() && args.bitstream_out.is_none(),
                "Standalone payload output and bitstream rewriting are mutually exclusive"
            );
            let frame = args
                .output_frame
                .ok_or_else(|| anyhow!("--output requires --output_frame"))?;
            let output = args
                .output
                .clone()
                .ok_or_else(|| anyhow!("--output_frame requires --output"))?;
            Mode::Standalone { frame, output }
        } else {
            let input = args
                .bitstream_in
                .clone()
                .ok_or_else(|| anyhow!("No input file specified, aborting"))?;
            let output = args
                .bitstream_out
                .clone()
                .ok_or_else(|| anyhow!("No output file specified, aborting"))?;
            ensure!(
                input != output,
                "Input and output paths are the same. This is probably a typo, because this \
                 would overwrite your input. Exiting."
            );
            Mode::Inject { input, output }
        };

        Ok(Self {
            tables,
            frame_rate,
            mode,
        })
    }
}

fn parse_parameter_strings(values: &[String]) -> Result<Vec<TableInfo>> {
    let tokens: Vec<&str> = values.iter().flat_map(|value| value.split(',')).collect();
    ensure!(
        tokens.len() % 3 == 0,
        "Parameter string must be of the form <filename>,<width>,<height>"
    );

    tokens
        .chunks_exact(3)
        .map(|chunk| {
            let width: u16 = chunk[1]
                .parse()
                .with_context(|| format!("Invalid width {} in parameter string", chunk[1]))?;
            let height: u16 = chunk[2]
                .parse()
                .with_context(|| format!("Invalid height {} in parameter string", chunk[2]))?;
            ensure!(
                width < (1 << 12) && height < (1 << 12),
                "Resolution {width}x{height} does not fit in 12 bits per dimension"
            );
            Ok(TableInfo {
                path: PathBuf::from(chunk[0]),
                width,
                height,
            })
        })
        .collect()
}

fn parse_frame_rate(value: &str) -> Result<Rational64> {
    let (numerator, denominator) = value.split_once('/').ok_or_else(|| {
        anyhow!("Frame Rate string must be of the form <numerator>/<denominator>")
    })?;
    let numerator: i64 = numerator
        .parse()
        .with_context(|| format!("Invalid frame rate numerator {numerator}"))?;
    let denominator: i64 = denominator
        .parse()
        .with_context(|| format!("Invalid frame rate denominator {denominator}"))?;
    ensure!(
        numerator > 0 && denominator > 0,
        "Frame rate must be positive"
    );
    Ok(Rational64::new(numerator, denominator))
}
