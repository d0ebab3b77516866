//! Implementation of the mesh creation command of the makemesh CLI.

use crate::cli::Switch;
use crate::logging;
use crate::make::arguments::*;
use anyhow::Context;
use clap::value_parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use makemesh_lib::{InterruptFlag, Parameters, Pipeline, PipelineResult, Stage};
use std::convert::TryFrom;
use std::path::PathBuf;
use std::time::Duration;

static ARGS_IO: &str = "Input/output";
static ARGS_MODELS: &str = "Model checkpoints";
static ARGS_PARAMS: &str = "Pipeline parameters";
static ARGS_ADV: &str = "Advanced options";

/// Command line arguments for creating a mesh from an image
#[derive(Clone, Debug, clap::Args)]
pub(crate) struct MakeArgs {
    /// Path to the input image
    #[arg(help_heading = ARGS_IO, long, value_parser = value_parser!(PathBuf))]
    pub input: PathBuf,
    /// Path of the GLB file to write, missing parent directories are created
    #[arg(help_heading = ARGS_IO, long, value_parser = value_parser!(PathBuf))]
    pub output: PathBuf,

    /// Path to the Wonder3D checkpoint used for multi-view synthesis
    #[arg(help_heading = ARGS_MODELS, long = "w3d_ckpt", visible_alias = "w3d-ckpt", value_parser = value_parser!(PathBuf))]
    pub w3d_ckpt: PathBuf,
    /// Path to the DreamGaussian checkpoint used for reconstruction
    #[arg(help_heading = ARGS_MODELS, long = "dg_ckpt", visible_alias = "dg-ckpt", value_parser = value_parser!(PathBuf))]
    pub dg_ckpt: PathBuf,

    /// Number of views synthesized from the input image
    #[arg(
        help_heading = ARGS_PARAMS,
        long,
        default_value_t = Parameters::DEFAULT_VIEWS,
        value_parser = value_parser!(u32).range(1..)
    )]
    pub views: u32,
    /// Resolution of the synthesized views
    #[arg(
        help_heading = ARGS_PARAMS,
        long,
        default_value_t = Parameters::DEFAULT_RESOLUTION,
        value_parser = value_parser!(u32).range(1..)
    )]
    pub res: u32,
    /// Number of optimization iterations of the reconstruction
    #[arg(
        help_heading = ARGS_PARAMS,
        long = "dg_iters",
        visible_alias = "dg-iters",
        default_value_t = Parameters::DEFAULT_ITERATIONS,
        value_parser = value_parser!(u32).range(1..)
    )]
    pub dg_iters: u32,
    /// Target ratio of triangles kept by the mesh decimation, in the interval (0, 1]
    #[arg(
        help_heading = ARGS_PARAMS,
        long,
        default_value_t = Parameters::DEFAULT_DECIMATE_RATIO,
        value_parser = parse_ratio
    )]
    pub decimate: f64,

    /// Enable checking that each stage wrote the files required by the following stage
    #[arg(
        help_heading = ARGS_ADV,
        long,
        default_value = "on",
        value_name = "off|on",
        ignore_case = true,
        require_equals = true
    )]
    pub check_artifacts: Switch,
    /// Directory in which the temporary working directory is created (default: system temp directory)
    #[arg(help_heading = ARGS_ADV, long, value_parser = value_parser!(PathBuf))]
    pub work_dir: Option<PathBuf>,
}

fn parse_ratio(value: &str) -> Result<f64, String> {
    let ratio: f64 = value
        .trim()
        .parse()
        .map_err(|e| format!("invalid number: {}", e))?;
    if ratio > 0.0 && ratio <= 1.0 {
        Ok(ratio)
    } else {
        Err(format!("{} is not in the interval (0, 1]", value))
    }
}

/// Executes the pipeline for the given arguments
pub(crate) fn make_command(
    cmd_args: &MakeArgs,
    interrupt: InterruptFlag,
    show_progress: bool,
) -> Result<(), anyhow::Error> {
    let args = MakeRunnerArgs::try_from(cmd_args)
        .context("Failed processing parameters from command line")?;

    let _pb = if show_progress {
        let pb = ProgressBar::new(Stage::ALL.len() as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40}] {pos}/{len} {msg}",
            )
            .context("Invalid progress bar template")?
            .progress_chars("=> "),
        );
        pb.set_message(Stage::ALL[0].name());
        pb.enable_steady_tick(Duration::from_millis(200));
        logging::set_progress_bar(Some(pb.downgrade()));
        Some(pb)
    } else {
        None
    };

    let pipeline = Pipeline::new(args.toolchain).with_interrupt_flag(interrupt);
    let result = pipeline.run_with_progress(&args.params, |finished| {
        if let Some(pb) = logging::get_progress_bar() {
            pb.inc(1);
            if let Some(next) = Stage::ALL.get(finished.number()) {
                pb.set_message(next.name());
            }
        }
    });

    if let Some(pb) = logging::get_progress_bar() {
        pb.finish_and_clear();
    }
    logging::set_progress_bar(None);

    let result = result.with_context(|| {
        format!(
            "Failed to create mesh from input image \"{}\"",
            args.params.input.display()
        )
    })?;

    log_timings(&result);
    Ok(())
}

fn log_timings(result: &PipelineResult) {
    info!("Stage timings:");
    for timing in &result.timings {
        info!(
            "  {:<24} {:>10.2}s",
            timing.stage.name(),
            timing.duration.as_secs_f64()
        );
    }
    info!(
        "  {:<24} {:>10.2}s",
        "total",
        result.total_duration().as_secs_f64()
    );
}

pub(crate) mod arguments {
    use super::MakeArgs;
    use makemesh_lib::{Parameters, Toolchain};
    use std::convert::TryFrom;

    /// All arguments required to run the pipeline, converted to the types of the library
    pub struct MakeRunnerArgs {
        pub params: Parameters,
        pub toolchain: Toolchain,
    }

    impl TryFrom<&MakeArgs> for MakeRunnerArgs {
        type Error = anyhow::Error;

        fn try_from(args: &MakeArgs) -> Result<Self, Self::Error> {
            let mut params =
                Parameters::new(&args.input, &args.output, &args.w3d_ckpt, &args.dg_ckpt);
            params.views = args.views;
            params.resolution = args.res;
            params.iterations = args.dg_iters;
            params.decimate_ratio = args.decimate;
            params.check_artifacts = args.check_artifacts.into_bool();
            params.work_root = args.work_dir.clone();

            Ok(Self {
                params: params.resolve()?,
                toolchain: Toolchain::from_env(),
            })
        }
    }
}
