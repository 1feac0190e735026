use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use batchflow_core::{AcceleratorBackend, ChannelOrder, LoadRequest, Result};
use batchflow_device::{assign_cores, HostBackend, ModelDescriptor};
use batchflow_pipeline::{FlowGeometry, PipelineConfig, RunReport};

#[derive(Parser)]
#[command(name = "batchflow", about = "Batched multi-stage inference pipeline")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Accelerator device ordinal.
    #[arg(long, global = true)]
    pub device: Option<u32>,

    /// Path to pipeline config file (JSON).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Start from the device-saturating preset instead of the defaults.
    #[arg(long, global = true, conflicts_with = "config")]
    pub saturate: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,
}

impl Cli {
    /// Configuration before command-line overrides are applied.
    pub fn base_config(&self) -> Result<PipelineConfig> {
        match &self.config {
            Some(path) => PipelineConfig::from_json_file(path),
            None if self.saturate => Ok(PipelineConfig::saturate()),
            None => Ok(PipelineConfig::default()),
        }
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the pipeline over a set of images.
    Run {
        /// Image directory, single image, or text file listing one path
        /// per line. Optional with --fake-input.
        input: Option<PathBuf>,
        /// Model descriptor file.
        #[arg(long)]
        model: Option<PathBuf>,
        /// Function to load from the model.
        #[arg(long)]
        function: Option<String>,
        /// Data parallelism per invocation.
        #[arg(long)]
        dp: Option<usize>,
        /// Passes over the input list.
        #[arg(long)]
        epochs: Option<u32>,
        /// Feed a synthetic image instead of decoding files.
        #[arg(long)]
        fake_input: bool,
        /// Number of synthetic inputs when no input path is given.
        #[arg(long, default_value = "1000")]
        fake_count: usize,
        /// Dedicated decode workers (0 = decode inside preprocess).
        #[arg(long)]
        loaders: Option<usize>,
        #[arg(long)]
        preprocess: Option<usize>,
        #[arg(long)]
        infer: Option<usize>,
        #[arg(long)]
        postprocess: Option<usize>,
        /// Buffer sets per pool.
        #[arg(long)]
        pool_slots: Option<usize>,
        /// Channel order the model expects.
        #[arg(long)]
        channel_order: Option<ChannelOrderArg>,
        /// Output format for the run report.
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },
    /// Print a model's tensor shapes and the per-call geometry.
    Describe {
        /// Model descriptor file.
        #[arg(long)]
        model: Option<PathBuf>,
        #[arg(long)]
        function: Option<String>,
        #[arg(long)]
        dp: Option<usize>,
    },
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum ChannelOrderArg {
    Rgb,
    Bgr,
}

impl From<ChannelOrderArg> for ChannelOrder {
    fn from(arg: ChannelOrderArg) -> Self {
        match arg {
            ChannelOrderArg::Rgb => ChannelOrder::Rgb,
            ChannelOrderArg::Bgr => ChannelOrder::Bgr,
        }
    }
}

const IMAGE_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "bmp", "tif", "tiff", "webp"];

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Expand an input argument into image paths.
///
/// A directory yields its image files sorted by name; an image file is
/// taken as is; any other file is read as a list with one path per line
/// (blank lines and `#` comments skipped, relative paths resolved against
/// the list's directory).
pub fn collect_inputs(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_dir() {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(input)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_image(p))
            .collect();
        paths.sort();
        return Ok(paths);
    }
    if is_image(input) {
        return Ok(vec![input.to_path_buf()]);
    }

    let base = input.parent().unwrap_or(Path::new("."));
    let list = std::fs::read_to_string(input)?;
    Ok(list
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| {
            let p = PathBuf::from(l);
            if p.is_absolute() {
                p
            } else {
                base.join(p)
            }
        })
        .collect())
}

/// Placeholder paths for synthetic-input runs.
pub fn fake_inputs(count: usize) -> Vec<PathBuf> {
    (0..count)
        .map(|i| PathBuf::from(format!("fake-{i:06}.jpg")))
        .collect()
}

pub fn print_report(report: &RunReport, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Text => {
            for epoch in &report.epochs {
                let t = &epoch.throughput;
                println!(
                    "epoch {}: {} images in {:.3}s | qps {:.1} | steady qps {} | infer p50 {}us p99 {}us",
                    epoch.epoch,
                    t.images,
                    t.elapsed_us as f64 / 1e6,
                    t.e2e_qps,
                    t.steady_qps
                        .map_or_else(|| "n/a".to_string(), |q| format!("{q:.1}")),
                    epoch.infer.p50_us,
                    epoch.infer.p99_us,
                );
            }
            if let Some(us) = report.solo_latency_us {
                println!("solo latency: {us}us");
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
    }
    Ok(())
}

/// Print a model's shapes and the geometry a flow would derive from it.
pub fn describe(config: &PipelineConfig) -> anyhow::Result<()> {
    let descriptor = ModelDescriptor::from_path(&config.model_path)?;
    for (name, function) in &descriptor.functions {
        println!("function {name} (latency {}us)", function.latency_us);
        for (i, s) in function.inputs.iter().enumerate() {
            println!("  input  {i}: [{}, {}, {}, {}]", s.n, s.c, s.h, s.w);
        }
        for (i, s) in function.outputs.iter().enumerate() {
            println!("  output {i}: [{}, {}, {}, {}]", s.n, s.c, s.h, s.w);
        }
    }

    let accelerator = HostBackend::new().load(&LoadRequest {
        model_path: config.model_path.clone(),
        function_name: config.function_name.clone(),
        device_id: config.device_id,
        data_parallelism: config.data_parallelism,
    })?;
    let geometry = FlowGeometry::derive(accelerator.as_ref())?;
    let cores = assign_cores(geometry.images_per_call(), 0);
    println!(
        "{} with dp={}: {} images per call, input bytes {:?}, output bytes {:?}, {} cores per context",
        config.function_name,
        geometry.data_parallelism,
        geometry.images_per_call(),
        geometry.input_bytes,
        geometry.output_bytes,
        cores.core_count,
    );
    Ok(())
}
