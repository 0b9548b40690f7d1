//! CLI entry point for offline classifier training.
//!
//! Subcommands:
//!   train  -- Train a patch classifier from a directory of RGBA images and
//!             write the exported ONNX artifact.

use clap::{Parser, Subcommand};
use patchseg_core::{ImageBlob, PatchSegError, Result};
use patchseg_pipeline::extractor::FeatureExtractor;
use patchseg_pipeline::{train_classifier, PipelineConfig};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "patchseg", about = "Patch classifier training pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a classifier from a directory of RGBA images.
    Train {
        /// Directory of training images (alpha channel = foreground mask).
        #[arg(long)]
        images: PathBuf,

        /// Path to the frozen feature-extractor ONNX graph.
        #[arg(long)]
        extractor: PathBuf,

        /// Output path for the exported classifier.
        #[arg(long, default_value = "classifier.onnx")]
        output: PathBuf,

        /// Patch stride in pixels.
        #[arg(long, default_value = "16")]
        patch_size: usize,

        /// Target grid long-edge size in pixels.
        #[arg(long, default_value = "768")]
        grid_size: usize,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Train {
            images,
            extractor,
            output,
            patch_size,
            grid_size,
        } => train(&images, &extractor, &output, patch_size, grid_size),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn train(
    images_dir: &Path,
    extractor_path: &Path,
    output: &Path,
    patch_size: usize,
    grid_size: usize,
) -> Result<()> {
    let config = PipelineConfig {
        patch_size,
        grid_size,
        ..PipelineConfig::default()
    };
    let extractor = load_extractor(extractor_path)?;
    let blobs = read_image_dir(images_dir)?;
    println!("Loaded {} files from {}", blobs.len(), images_dir.display());

    let outcome = train_classifier(&blobs, extractor.as_ref(), &config)?;

    std::fs::write(output, &outcome.artifact_bytes)
        .map_err(|e| PatchSegError::Storage(format!("failed to write {}: {e}", output.display())))?;
    println!("Classifier saved to {}", output.display());
    println!("  {}", outcome.report);
    Ok(())
}

/// Read every file in the directory, sorted by name for a stable table
/// order. Non-image files are skipped later by the aligner's batch policy.
fn read_image_dir(dir: &Path) -> Result<Vec<ImageBlob>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| PatchSegError::Storage(format!("failed to read {}: {e}", dir.display())))?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    let mut blobs = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = std::fs::read(&path)
            .map_err(|e| PatchSegError::Storage(format!("failed to read {}: {e}", path.display())))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        blobs.push(ImageBlob { file_name, bytes });
    }
    Ok(blobs)
}

#[cfg(feature = "ort")]
fn load_extractor(path: &Path) -> Result<Box<dyn FeatureExtractor>> {
    Ok(Box::new(
        patchseg_pipeline::extractor::OnnxFeatureExtractor::load(path)?,
    ))
}

#[cfg(not(feature = "ort"))]
fn load_extractor(path: &Path) -> Result<Box<dyn FeatureExtractor>> {
    let _ = path;
    Err(PatchSegError::Config(
        "this binary was built without the `ort` feature; \
         rebuild with `--features ort` to load an ONNX feature extractor"
            .to_string(),
    ))
}
