use clap::{Args, Parser, Subcommand};
use gsedit_lib::common::ZSTD_MAX_COMPRESSION_LVL;
use gsedit_lib::ply::write_scene_points_ply;
use gsedit_lib::{
    compress, compress_async, decompress, decompress_async, load_and_fix_scene, EditorConfig,
    GaussianManager,
};
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "gsedit",
    version = "0.1.0",
    author = "Denis Avvakumov",
    about = "Levels, initializes, crops and packs 3D Gaussian Splatting scenes"
)]
struct Cli {
    #[arg(
        short = 'c',
        long = "config",
        value_name = "CONFIG",
        global = true,
        help = "Path to a JSON editor configuration."
    )]
    config: Option<PathBuf>,

    #[arg(
        long = "seed",
        value_name = "SEED",
        global = true,
        help = "Seed for the up vector estimation (overrides the config)."
    )]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rotates a COLMAP scene so that its ground plane is level.
    Fix {
        #[arg(short = 's', long = "source", value_name = "DIR", help = "COLMAP dataset root.")]
        source: PathBuf,

        #[arg(
            short = 'p',
            long = "points",
            value_name = "PLY",
            help = "Write the fixed point cloud to this file."
        )]
        points: Option<PathBuf>,

        #[arg(
            short = 't',
            long = "threshold",
            value_name = "Z",
            help = "Minimum Z of the re-estimated up vector."
        )]
        threshold: Option<f64>,
    },
    /// Fixes a scene and creates gaussians from its point cloud.
    Init {
        #[arg(short = 's', long = "source", value_name = "DIR", help = "COLMAP dataset root.")]
        source: PathBuf,

        #[arg(short = 'o', long = "output", value_name = "PLY", help = "Output gaussian PLY.")]
        output: PathBuf,

        #[arg(long = "sh-degree", value_name = "DEGREE", help = "Spherical harmonics degree.")]
        sh_degree: Option<u32>,
    },
    /// Deletes the gaussians inside a box, or everything outside it with --keep.
    Crop {
        #[arg(short = 'i', long = "input", value_name = "PLY", help = "Input gaussian PLY.")]
        input: PathBuf,

        #[arg(short = 'o', long = "output", value_name = "PLY", help = "Output gaussian PLY.")]
        output: PathBuf,

        #[arg(
            long = "min",
            num_args = 3,
            required = true,
            allow_negative_numbers = true,
            value_names = ["X", "Y", "Z"],
            help = "Lower box corner."
        )]
        min: Vec<f32>,

        #[arg(
            long = "max",
            num_args = 3,
            required = true,
            allow_negative_numbers = true,
            value_names = ["X", "Y", "Z"],
            help = "Upper box corner."
        )]
        max: Vec<f32>,

        #[arg(short = 'k', long = "keep", help = "Keep only the gaussians inside the box.")]
        keep: bool,
    },
    /// Packs a gaussian PLY into a zstd checkpoint.
    Compress {
        #[command(flatten)]
        io: CodecArgs,

        #[arg(
            short = 'l',
            long = "compression-level",
            value_name = "LEVEL",
            default_value = "3",
            help = "Set the compression level."
        )]
        compression_level: u32,

        #[arg(
            short = 'w',
            long = "workers",
            value_name = "WORKERS",
            default_value = "3",
            help = "Set the workers count for ZSTD."
        )]
        workers: u32,
    },
    /// Unpacks a zstd checkpoint into a gaussian PLY.
    Decompress {
        #[command(flatten)]
        io: CodecArgs,
    },
}

#[derive(Args, Debug)]
struct CodecArgs {
    #[arg(short = 'i', long = "input", value_name = "INPUT", help = "Path to the input file.")]
    input: PathBuf,

    #[arg(short = 'o', long = "output", value_name = "OUTPUT", help = "Path to the output file.")]
    output: PathBuf,

    #[arg(
        short = 'a',
        long = "async",
        default_value = "false",
        help = "Enable asynchronous compression/decompression mode."
    )]
    async_mode: bool,
}

type BoxError = Box<dyn Error + Send + Sync>;

fn load_config(cli: &Cli) -> Result<EditorConfig, BoxError> {
    let mut config = match &cli.config {
        Some(path) => EditorConfig::from_json_file(path)?,
        None => EditorConfig::default(),
    };
    if cli.seed.is_some() {
        config.seed = cli.seed;
    }
    Ok(config)
}

fn fix_scene(source: &Path, config: &EditorConfig) -> Result<gsedit_lib::SceneManager, BoxError> {
    let mut rng = config.rng();
    let start = Instant::now();
    let fixed = load_and_fix_scene(source, config, &mut rng)?;
    info!(elapsed_ms = start.elapsed().as_millis() as u64, "scene ready");
    Ok(fixed)
}

fn to_corner(values: &[f32]) -> Result<[f32; 3], BoxError> {
    values
        .try_into()
        .map_err(|_| format!("expected 3 coordinates, got {}", values.len()).into())
}

fn run_codec(io: &CodecArgs, compress_mode: bool, level: u32, workers: u32) -> Result<(), BoxError> {
    let raw_data = fs::read(&io.input).unwrap_or_else(|e| {
        eprintln!("Error reading input file {}: {}", io.input.display(), e);
        process::exit(1);
    });

    let op = if compress_mode {
        "Compression"
    } else {
        "Decompression"
    };
    let mode = if io.async_mode { "async" } else { "sync" };
    info!(
        mode,
        op,
        input = %io.input.display(),
        output = %io.output.display(),
        level,
        "starting"
    );

    let start = Instant::now();
    let result: Vec<u8> = if io.async_mode {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        rt.block_on(async {
            let mut buf = Vec::new();
            if compress_mode {
                compress_async(&raw_data, level, workers, &mut buf).await?;
            } else {
                decompress_async(&raw_data, &mut buf).await?;
            }
            Ok::<Vec<u8>, BoxError>(buf)
        })?
    } else {
        let mut buf = Vec::new();
        if compress_mode {
            compress(&raw_data, level, workers, &mut buf)?;
        } else {
            decompress(&raw_data, &mut buf)?;
        }
        buf
    };
    info!(elapsed_ms = start.elapsed().as_millis() as u64, "{} done", op);

    fs::write(&io.output, &result).unwrap_or_else(|e| {
        eprintln!("Error writing output '{}': {}", io.output.display(), e);
        process::exit(1);
    });
    println!("Successfully wrote to '{}'.", io.output.display());
    Ok(())
}

fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli)?;

    match &cli.command {
        Command::Fix {
            source,
            points,
            threshold,
        } => {
            if let Some(threshold) = threshold {
                config.calibration_threshold = *threshold;
            }
            let fixed = fix_scene(source, &config)?;
            let scene = fixed.scene();
            println!(
                "Fixed scene: {} cameras, {} points.",
                scene.cameras.len(),
                scene.points.len()
            );
            if let Some(path) = points {
                let mut buf = Vec::new();
                write_scene_points_ply(&mut buf, scene)?;
                fs::write(path, &buf)?;
                println!("Successfully wrote to '{}'.", path.display());
            }
        }
        Command::Init {
            source,
            output,
            sh_degree,
        } => {
            if let Some(degree) = sh_degree {
                config.sh_degree = *degree;
            }
            let fixed = fix_scene(source, &config)?;
            let mut model = GaussianManager::from_scene(fixed.scene(), config.sh_degree)?;
            model.set_background(config.background);
            model.save_ply_file(output)?;
            println!(
                "Created {} gaussians in '{}'.",
                model.len(),
                output.display()
            );
        }
        Command::Crop {
            input,
            output,
            min,
            max,
            keep,
        } => {
            let (min, max) = (to_corner(min)?, to_corner(max)?);
            let mut model = GaussianManager::from_ply_file(input)?;
            let inside = model.position_mask(min, max);
            let doomed = if *keep { inside.inverted() } else { inside };
            let removed = model.delete_by_mask(&doomed)?;
            model.save_ply_file(output)?;
            println!(
                "Removed {} gaussians, {} left in '{}'.",
                removed,
                model.len(),
                output.display()
            );
        }
        Command::Compress {
            io,
            compression_level,
            workers,
        } => {
            let level = (*compression_level).min(ZSTD_MAX_COMPRESSION_LVL);
            run_codec(io, true, level, *workers)?;
        }
        Command::Decompress { io } => run_codec(io, false, 0, 0)?,
    }

    Ok(())
}
