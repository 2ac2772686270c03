//! Cerebellum sub-segmentation CLI
//!
//! Batch front end for the segmentation pipeline: builds subject
//! descriptors from a subjects directory, loads the configuration, and maps
//! the batch outcome onto the process exit code.

use anyhow::{Context as _, Result};
use cereb_seg_pipeline::{
    NiftiVolumeIo, Pipeline, PipelineConfig, SubjectDescriptor,
};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(
    name = "cereb-seg",
    version,
    about = "Cerebellum sub-segmentation from conformed brain volumes",
    long_about = "Runs three view-specific predictors over a cerebellum crop of each \
                  subject, fuses the views into one labeled volume, remaps it into the \
                  target nomenclature, and optionally reports per-region volumes.\n\n\
                  Requires the whole-brain segmentation of each subject to exist."
)]
struct Cli {
    /// Subject identifiers (one directory per subject below --sd)
    #[arg(value_name = "SUBJECT", required = true)]
    subjects: Vec<String>,

    /// Root directory containing the subject directories
    #[arg(long, value_name = "DIR")]
    sd: PathBuf,

    /// Pipeline configuration file (YAML); defaults apply when omitted
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Whole-brain segmentation file name inside each subject directory
    #[arg(long, default_value = "mri/aparc+aseg.nii.gz")]
    seg_name: String,

    /// Conformed volume file name inside each subject directory
    #[arg(long, default_value = "mri/orig.nii.gz")]
    conformed_name: String,

    /// Original (unconformed) volume file name, used as conform source
    #[arg(long)]
    orig_name: Option<String>,

    /// Output segmentation file name inside each subject directory
    #[arg(long, default_value = "mri/cerebellum.nii.gz")]
    out_name: String,

    /// Compute per-region volume statistics
    #[arg(long)]
    stats: bool,

    /// Bias-field-corrected intensity volume, required with --stats
    #[arg(long)]
    intensity_name: Option<String>,

    /// Statistics output file name inside each subject directory
    #[arg(long, default_value = "stats/cerebellum.stats")]
    stats_name: String,

    /// Worker threads (0 = all cores); overrides the config file
    #[arg(long)]
    threads: Option<usize>,

    /// Run I/O asynchronously on the worker pool
    #[arg(long)]
    async_io: bool,

    /// Slabs per inference batch; overrides the config file
    #[arg(long)]
    batch_size: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_yaml_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => PipelineConfig::default(),
        };
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if self.async_io {
            config.async_io = true;
        }
        Ok(config)
    }

    fn subject_list(&self) -> Vec<SubjectDescriptor> {
        self.subjects
            .iter()
            .map(|id| {
                let root = self.sd.join(id);
                let mut subject = SubjectDescriptor::new(
                    id.clone(),
                    root.join(&self.seg_name),
                    root.join(&self.conformed_name),
                    root.join(&self.out_name),
                );
                subject.orig_path = self.orig_name.as_ref().map(|name| root.join(name));
                subject.intensity_path =
                    self.intensity_name.as_ref().map(|name| root.join(name));
                if self.stats {
                    subject.stats_path = Some(root.join(&self.stats_name));
                }
                subject
            })
            .collect()
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = cli.pipeline_config()?;
    let subjects = cli.subject_list();
    info!("=== Cerebellum Segmentation ===");
    info!("Subjects: {}", subjects.len());

    let pipeline = Pipeline::with_onnx_predictors(config, Arc::new(NiftiVolumeIo))
        .context("building the segmentation pipeline")?;
    pipeline.run(&subjects)?;
    info!("=== Batch Complete ===");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Failed to set tracing subscriber");
        return ExitCode::FAILURE;
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // The failure is already logged in full by the driver; the
            // message itself is the process outcome.
            error!("{e:#}");
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
