//! roiflow CLI
//!
//! Drives the demo pipelines on synthetic volumes and inspects project files.
#![allow(
    clippy::uninlined_format_args,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::too_many_lines,
    clippy::unnecessary_wraps
)]

use clap::{Parser, Subcommand};
use ndarray::{ArrayD, Axis, Dimension, IxDyn};
use roiflow_core::{slicing_to_string, string_to_slicing, ArrayData, Roi, Value};
use roiflow_graph::{Graph, OperatorHandle, Scheduler, SchedulerConfig};
#[cfg(feature = "hdf5")]
use roiflow_io::{PixelClassificationSerializer, SerializerOptions};
use roiflow_io::Project;
use roiflow_operators::{OpPixelClassification, OpSplitBodyCarving, BACKGROUND, OBJECT};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("Pipeline error: {0}")]
    Core(#[from] roiflow_core::Error),

    #[error("Project error: {0}")]
    Project(#[from] roiflow_io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Lazy region-of-interest dataflow pipelines.
#[derive(Parser)]
#[command(name = "roiflow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbose logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a slicing string such as "[0:10,5:20]" and print it normalized
    Slicing {
        /// Slicing text
        text: String,
    },

    /// Carve one body of a synthetic label volume
    Carve {
        /// Volume shape (comma separated)
        #[arg(long, value_delimiter = ',', default_values_t = [16, 64, 64])]
        shape: Vec<usize>,

        /// Body label to split
        #[arg(long, default_value = "1")]
        label: i64,

        /// Worker threads (defaults to the number of CPUs)
        #[arg(short = 'j', long)]
        threads: Option<usize>,
    },

    /// Train a pixel classifier on a synthetic image and predict
    Classify {
        /// Image shape (comma separated)
        #[arg(long, value_delimiter = ',', default_values_t = [16, 64, 64])]
        shape: Vec<usize>,

        /// Worker threads (defaults to the number of CPUs)
        #[arg(short = 'j', long)]
        threads: Option<usize>,

        /// Save the project to this HDF5 file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the content of a project file
    #[cfg(feature = "hdf5")]
    Inspect {
        /// Project file
        input: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

fn new_graph(threads: Option<usize>) -> Result<Graph> {
    let mut config = SchedulerConfig::default();
    if let Some(threads) = threads {
        config = config.try_with_num_threads(threads)?;
    }
    let scheduler = Scheduler::new(&config)?;
    log::debug!("scheduler with {} threads", scheduler.num_threads());
    Ok(Graph::new(Arc::new(scheduler)))
}

fn check_shape(shape: &[usize]) -> Result<()> {
    if shape.is_empty() || shape.contains(&0) {
        return Err(CliError::InvalidArgument(format!(
            "shape must have positive extents, got {:?}",
            shape
        )));
    }
    Ok(())
}

/// Bright ball in the middle of a dark volume.
fn synthetic_image(shape: &[usize]) -> ArrayData {
    let center: Vec<f64> = shape.iter().map(|n| *n as f64 / 2.0).collect();
    let radius = shape.iter().copied().min().unwrap_or(1) as f64 / 3.0;
    ArrayData::F32(ArrayD::from_shape_fn(IxDyn(shape), |ix| {
        let distance = ix
            .slice()
            .iter()
            .zip(&center)
            .map(|(i, c)| (*i as f64 + 0.5 - c).powi(2))
            .sum::<f64>()
            .sqrt();
        if distance < radius {
            200.0
        } else {
            20.0
        }
    }))
}

/// Body `label` is the middle half of the last axis; `label + 1` fills the rest.
fn synthetic_bodies(shape: &[usize], label: i64) -> Result<ArrayData> {
    let inner = u32::try_from(label)
        .map_err(|_| CliError::InvalidArgument(format!("label {label} does not fit in u32")))?;
    let outer = inner.wrapping_add(1);
    let last = shape.len() - 1;
    let band = shape[last] / 4..shape[last] - shape[last] / 4;
    Ok(ArrayData::U32(ArrayD::from_shape_fn(IxDyn(shape), |ix| {
        if band.contains(&ix[last]) {
            inner
        } else {
            outer
        }
    })))
}

fn center_voxel(shape: &[usize]) -> Result<Roi> {
    let start: Vec<usize> = shape.iter().map(|n| n / 2).collect();
    let stop: Vec<usize> = start.iter().map(|s| s + 1).collect();
    Ok(Roi::new(start, stop)?)
}

fn single(shape_len: usize, value: u8) -> ArrayData {
    ArrayData::U8(ArrayD::from_elem(IxDyn(&vec![1; shape_len]), value))
}

fn carve(shape: &[usize], label: i64, threads: Option<usize>) -> Result<()> {
    check_shape(shape)?;
    let graph = new_graph(threads)?;
    let op = graph.add_operator("SplitBodyCarving", OpSplitBodyCarving::build)?;
    op.carving().raw_data.set_value(synthetic_image(shape))?;
    op.raveler_labels.set_value(synthetic_bodies(shape, label)?)?;
    op.current_raveler_label.set_value(Value::Int(label))?;

    let start = Instant::now();
    op.carving()
        .write_seeds
        .write(&center_voxel(shape)?, &single(shape.len(), OBJECT))?;
    let blocks = op.auto_seed_background(label)?;
    println!("Background seeds written in {} block(s)", blocks);

    let masked = op.masked_segmentation.read(&Roi::from_shape(shape))?.to_u8();
    let object = masked.iter().filter(|v| **v == OBJECT).count();
    let background = masked.iter().filter(|v| **v == BACKGROUND).count();
    println!(
        "Body {}: {} object voxels, {} background voxels ({:.1}% object)",
        label,
        object,
        background,
        100.0 * object as f64 / (object + background).max(1) as f64
    );
    println!("Carved in {:.2}s", start.elapsed().as_secs_f64());
    graph.teardown();
    Ok(())
}

fn classify(shape: &[usize], threads: Option<usize>, output: Option<PathBuf>) -> Result<()> {
    check_shape(shape)?;
    let graph = new_graph(threads)?;
    let op = graph.add_operator("PixelClassification", OpPixelClassification::build)?;
    op.input_images.resize(1)?;
    op.input_images.child(0)?.set_value(synthetic_image(shape))?;

    // Created before labeling so the serializer sees every change.
    let mut project = match &output {
        Some(path) => Some(new_project(&op, path)?),
        None => None,
    };

    let start = Instant::now();
    let labels = op.label_inputs.child(0)?;
    labels.write(&Roi::from_shape(&vec![1; shape.len()]), &single(shape.len(), 1))?;
    labels.write(&center_voxel(shape)?, &single(shape.len(), 2))?;

    let predictions = op.prediction_probabilities.child(0)?;
    let meta = predictions.meta()?;
    let probabilities = predictions.read(&Roi::from_shape(&meta.shape))?.to_f32();
    let channel = Axis(meta.shape.len() - 1);
    let mut winners = vec![0_usize; meta.shape[channel.index()]];
    for pixel in probabilities.lanes(channel) {
        let best = pixel
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |best, (c, p)| if *p > best.1 { (c, *p) } else { best });
        winners[best.0] += 1;
    }
    let pixels: usize = winners.iter().sum();
    for (class, count) in winners.iter().enumerate() {
        println!(
            "Class {}: {} pixels ({:.1}%)",
            class + 1,
            count,
            100.0 * *count as f64 / pixels.max(1) as f64
        );
    }
    println!("Classified in {:.2}s", start.elapsed().as_secs_f64());

    if let (Some(path), Some(project)) = (output, project.as_mut()) {
        save_project(project, &path)?;
        println!("Project saved to {}", path.display());
    }
    graph.teardown();
    Ok(())
}

#[cfg(feature = "hdf5")]
fn new_project(op: &OperatorHandle<OpPixelClassification>, _path: &Path) -> Result<Project> {
    let serializer = PixelClassificationSerializer::new(op.clone(), SerializerOptions::default())
        .with_progress(|p| log::info!("saving project: {p}%"));
    let mut project = Project::new();
    project.add_serializer(serializer);
    Ok(project)
}

#[cfg(not(feature = "hdf5"))]
fn new_project(_op: &OperatorHandle<OpPixelClassification>, path: &Path) -> Result<Project> {
    Err(CliError::InvalidArgument(format!(
        "cannot write {}: built without HDF5 support",
        path.display()
    )))
}

#[cfg(feature = "hdf5")]
fn save_project(project: &mut Project, path: &Path) -> Result<()> {
    project.save_hdf5(path)?;
    Ok(())
}

#[cfg(not(feature = "hdf5"))]
fn save_project(_project: &mut Project, _path: &Path) -> Result<()> {
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Slicing { text } => {
            let roi = string_to_slicing(&text)?;
            println!("{}", slicing_to_string(&roi));
            println!("Shape: {:?}", roi.shape());
            println!("Volume: {}", roi.volume());
        }

        Commands::Carve {
            shape,
            label,
            threads,
        } => carve(&shape, label, threads)?,

        Commands::Classify {
            shape,
            threads,
            output,
        } => classify(&shape, threads, output)?,

        #[cfg(feature = "hdf5")]
        Commands::Inspect { input } => {
            let tree = roiflow_io::read_project_hdf5(&input)?;
            println!("File: {}", input.display());
            print!("{tree}");
        }
    }

    Ok(())
}
