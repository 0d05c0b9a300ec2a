//! ebcot CLI - block-coder inspection utility.
//!
//! Feeds coefficient blocks through the Tier-1 coder and reports coded
//! sizes, pass tables and rate-control allocations. Useful for eyeballing
//! coder behaviour without a full codestream around it.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};

use ebcot_rs::{
    allocate, encode_all, BlockRequest, CodeBlock, EncodeOptions, RateControlConfiguration,
    RateControlMode, Subband,
};

/// JPEG 2000 block-coder inspection tool
#[derive(Parser)]
#[command(name = "ebcot")]
#[command(version)]
#[command(about = "Encode, decode and inspect JPEG 2000 code-blocks", long_about = None)]
#[command(after_help = "EXAMPLES:
    ebcot roundtrip -w 16 -g 16 -p gradient
    ebcot inspect -i coeffs.raw -w 32 -g 32 -s hl
    ebcot allocate -n 24 -b 1.5 -l 3

Raw input files hold one little-endian i32 per coefficient, row-major.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a block, decode it back and verify the reconstruction
    #[command(visible_alias = "r")]
    Roundtrip {
        #[command(flatten)]
        block: BlockArgs,
    },

    /// Encode a block and print its per-pass rate/distortion table
    #[command(visible_alias = "i")]
    Inspect {
        #[command(flatten)]
        block: BlockArgs,
    },

    /// Encode a set of synthetic blocks and run the rate controller
    #[command(visible_alias = "a")]
    Allocate {
        /// Number of 16x16 blocks to encode
        #[arg(short = 'n', long, default_value_t = 16)]
        blocks: usize,

        /// Target bitrate in bits per pixel
        #[arg(short = 'b', long, default_value_t = 2.0)]
        bitrate: f64,

        /// Number of quality layers
        #[arg(short = 'l', long, default_value_t = 1)]
        layers: usize,
    },
}

#[derive(clap::Args)]
struct BlockArgs {
    /// Raw coefficient file (little-endian i32); synthetic if omitted
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Block width
    #[arg(short, long, default_value_t = 16)]
    width: u32,

    /// Block height
    #[arg(short = 'g', long, default_value_t = 16)]
    height: u32,

    /// Subband orientation
    #[arg(short, long, value_enum, default_value = "ll")]
    subband: SubbandArg,

    /// Bit depth of the coefficients
    #[arg(short = 'd', long, default_value_t = 8)]
    bit_depth: u32,

    /// Synthetic pattern when no input file is given
    #[arg(short, long, value_enum, default_value = "gradient")]
    pattern: Pattern,
}

#[derive(Clone, Copy, ValueEnum)]
enum SubbandArg {
    Ll,
    Hl,
    Lh,
    Hh,
}

impl From<SubbandArg> for Subband {
    fn from(arg: SubbandArg) -> Self {
        match arg {
            SubbandArg::Ll => Subband::LL,
            SubbandArg::Hl => Subband::HL,
            SubbandArg::Lh => Subband::LH,
            SubbandArg::Hh => Subband::HH,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Pattern {
    /// Diagonal ramp
    Gradient,
    /// Alternating signs
    Checker,
    /// Single corner spike
    Impulse,
}

fn synthesize(pattern: Pattern, width: u32, height: u32, bit_depth: u32) -> Vec<i64> {
    let peak = (1i64 << (bit_depth - 1)) - 1;
    let area = (width * height) as i64;
    (0..area)
        .map(|i| {
            let (x, y) = (i % i64::from(width), i / i64::from(width));
            match pattern {
                Pattern::Gradient => (x + y) * peak / i64::from(width + height),
                Pattern::Checker => {
                    if (x + y) % 2 == 0 {
                        peak / 3
                    } else {
                        -peak / 3
                    }
                }
                Pattern::Impulse => {
                    if i == 0 {
                        peak
                    } else {
                        0
                    }
                }
            }
        })
        .collect()
}

fn load_block(args: &BlockArgs) -> Result<Vec<i64>, String> {
    match &args.input {
        None => Ok(synthesize(args.pattern, args.width, args.height, args.bit_depth)),
        Some(path) => {
            let bytes = fs::read(path).map_err(|e| format!("{}: {}", path.display(), e))?;
            if bytes.len() % 4 != 0 {
                return Err(format!("{}: not a whole number of i32s", path.display()));
            }
            Ok(bytes
                .chunks_exact(4)
                .map(|c| i64::from(i32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                .collect())
        }
    }
}

fn encode_one(args: &BlockArgs) -> Result<(Vec<i64>, CodeBlock), String> {
    let coefficients = load_block(args)?;
    let options = EncodeOptions::default();
    let block = CodeBlock::encode(
        &coefficients,
        args.width,
        args.height,
        args.subband.into(),
        args.bit_depth,
        &options,
    )
    .map_err(|e| e.to_string())?;
    Ok((coefficients, block))
}

fn run_roundtrip(args: &BlockArgs) -> Result<(), String> {
    let (coefficients, block) = encode_one(args)?;
    let options = EncodeOptions::default();
    let decoded = block.decode(args.bit_depth, &options).map_err(|e| e.to_string())?;
    if decoded.coefficients != coefficients {
        return Err("reconstruction mismatch".into());
    }
    println!(
        "{}x{} block: {} coefficients -> {} bytes, {} passes, {} zero bit-planes, round-trip OK",
        args.width,
        args.height,
        coefficients.len(),
        block.data().len(),
        block.pass_count(),
        block.zero_bit_planes()
    );
    Ok(())
}

fn run_inspect(args: &BlockArgs) -> Result<(), String> {
    let (_, block) = encode_one(args)?;
    println!(
        "{}x{} {:?} block: {} bytes, {} passes, {} zero bit-planes",
        args.width,
        args.height,
        block.subband(),
        block.data().len(),
        block.pass_count(),
        block.zero_bit_planes()
    );
    println!("{:>4} {:>24} {:>8} {:>14} {:>12}", "pass", "kind", "bytes", "distortion", "slope");
    for (i, pass) in block.passes().iter().enumerate() {
        println!(
            "{:>4} {:>24} {:>8} {:>14.1} {:>12.4}",
            i,
            format!("{:?}", pass.kind),
            pass.cumulative_bytes,
            pass.cumulative_distortion,
            pass.slope
        );
    }
    Ok(())
}

fn run_allocate(blocks: usize, bitrate: f64, layers: usize) -> Result<(), String> {
    let bit_depth = 8;
    let coefficient_sets: Vec<Vec<i64>> = (0..blocks)
        .map(|seed| {
            (0..256)
                .map(|i| ((i as i64 + seed as i64 * 37) * 11) % 255 - 127)
                .collect()
        })
        .collect();
    let requests: Vec<BlockRequest<'_>> = coefficient_sets
        .iter()
        .map(|coefficients| BlockRequest {
            coefficients,
            width: 16,
            height: 16,
            subband: Subband::HL,
        })
        .collect();
    let encoded = encode_all(&requests, bit_depth, &EncodeOptions::default(), 4)
        .map_err(|e| e.to_string())?;

    let total_pixels = blocks * 256;
    let config = RateControlConfiguration {
        mode: RateControlMode::TargetBitrate(bitrate),
        layer_count: layers,
        ..RateControlConfiguration::default()
    };
    let allocation = allocate(&encoded, total_pixels, &config).map_err(|e| e.to_string())?;

    println!(
        "{} blocks, {} pixels, target {} bpp over {} layer(s)",
        blocks, total_pixels, bitrate, layers
    );
    for layer in &allocation {
        let bytes: usize = layer
            .contributions
            .iter()
            .zip(&encoded)
            .map(|(&passes, block)| block.truncate_at(passes).len())
            .sum();
        let passes: usize = layer.contributions.iter().sum();
        match layer.target_rate {
            Some(target) => println!(
                "layer {}: {} passes, {} bytes (target {})",
                layer.index, passes, bytes, target
            ),
            None => println!("layer {}: {} passes, {} bytes", layer.index, passes, bytes),
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    let result = match &cli.command {
        Commands::Roundtrip { block } => run_roundtrip(block),
        Commands::Inspect { block } => run_inspect(block),
        Commands::Allocate {
            blocks,
            bitrate,
            layers,
        } => run_allocate(*blocks, *bitrate, *layers),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {}", message);
            ExitCode::FAILURE
        }
    }
}
