// src/bin/lora_transcoder_cli.rs
use clap::Parser;
use flux_lora_transcoder::{convert, ConvertOptions, FusedLayout, StorageDtype, WeightSource};
use std::error::Error;
use std::path::PathBuf;

/// Convert a kohya/ComfyUI Flux LoRA into diffusers format.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct CliArgs {
    /// Path to the source LoRA safetensors file
    #[clap(short = 'i', long, value_parser)]
    input_path: PathBuf,
    /// Path of the diffusers LoRA safetensors file to write
    #[clap(short = 'o', long, value_parser)]
    output_path: PathBuf,
    /// Minimum rank for the LoRA weights; smaller adapters are zero-padded
    #[clap(long, value_parser)]
    min_rank: Option<usize>,
    /// Storage dtype of the output (defaults to the input's dtype)
    #[clap(long, value_enum)]
    dtype: Option<StorageDtype>,
    /// JSON file with fused-layout widths or a diffusers transformer config
    #[clap(long, value_parser)]
    layout_config: Option<PathBuf>,
}

fn run_cli() -> Result<(), Box<dyn Error>> {
    let args = CliArgs::parse();

    let layout = match &args.layout_config {
        Some(path) => FusedLayout::load(&path.to_string_lossy())?,
        None => FusedLayout::default(),
    };

    let options = ConvertOptions {
        output_path: Some(args.output_path.clone()),
        min_rank: args.min_rank,
        output_dtype: args.dtype,
        layout,
    };
    let converted = convert(WeightSource::Path(args.input_path.clone()), &options)?;

    println!(
        "Converted {} -> {} ({} tensors)",
        args.input_path.display(),
        args.output_path.display(),
        converted.len()
    );
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run_cli() {
        eprintln!("Application error: {}", e);
        let mut current_err: Option<&(dyn Error + 'static)> = e.source();
        while let Some(source) = current_err {
            eprintln!("Caused by: {}", source);
            current_err = source.source();
        }
        std::process::exit(1);
    }
}
