use crate::invocation::{Completion, Invocation};
use crate::layout::WorkDir;
use crate::stages::{self, Stage};
use crate::{InterruptFlag, PipelineError, Toolchain};
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Parameters of a single pipeline run
#[derive(Clone, Debug, PartialEq)]
pub struct Parameters {
    /// Path to the input image
    pub input: PathBuf,
    /// Path of the GLB file to write
    pub output: PathBuf,
    /// Checkpoint of the multi-view synthesis model
    pub multiview_checkpoint: PathBuf,
    /// Checkpoint of the reconstruction model
    pub reconstruction_checkpoint: PathBuf,
    /// Number of views to synthesize
    pub views: u32,
    /// Resolution of the synthesized views
    pub resolution: u32,
    /// Number of optimization iterations of the reconstruction
    pub iterations: u32,
    /// Target ratio of triangles kept by the mesh decimation, in the interval `(0, 1]`
    pub decimate_ratio: f64,
    /// Enable checking that every stage produced the files consumed by the following stages
    pub check_artifacts: bool,
    /// Directory in which the ephemeral working directory is created (default: system temp directory)
    pub work_root: Option<PathBuf>,
}

impl Parameters {
    pub const DEFAULT_VIEWS: u32 = 24;
    pub const DEFAULT_RESOLUTION: u32 = 512;
    pub const DEFAULT_ITERATIONS: u32 = 8000;
    pub const DEFAULT_DECIMATE_RATIO: f64 = 0.30;

    /// Creates parameters for the given paths using default values for all other settings
    pub fn new<P: Into<PathBuf>>(
        input: P,
        output: P,
        multiview_checkpoint: P,
        reconstruction_checkpoint: P,
    ) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            multiview_checkpoint: multiview_checkpoint.into(),
            reconstruction_checkpoint: reconstruction_checkpoint.into(),
            views: Self::DEFAULT_VIEWS,
            resolution: Self::DEFAULT_RESOLUTION,
            iterations: Self::DEFAULT_ITERATIONS,
            decimate_ratio: Self::DEFAULT_DECIMATE_RATIO,
            check_artifacts: true,
            work_root: None,
        }
    }

    /// Validates the parameters and returns a copy with all paths made absolute
    ///
    /// The tools run in their own installation directories, so relative paths have to be resolved
    /// against the current directory before they are passed on.
    pub fn resolve(&self) -> Result<Self, PipelineError> {
        let input = absolute(&self.input, "input image")?;
        if !input.is_file() {
            return Err(PipelineError::InvalidArgument(format!(
                "input image \"{}\" does not exist or is not a file",
                input.display()
            )));
        }
        fs::File::open(&input).map_err(|e| {
            PipelineError::InvalidArgument(format!(
                "input image \"{}\" is not readable ({})",
                input.display(),
                e
            ))
        })?;

        let output = absolute(&self.output, "output file")?;
        if output.is_dir() {
            return Err(PipelineError::InvalidArgument(format!(
                "output path \"{}\" is a directory",
                output.display()
            )));
        }

        let multiview_checkpoint = absolute(&self.multiview_checkpoint, "Wonder3D checkpoint")?;
        let reconstruction_checkpoint =
            absolute(&self.reconstruction_checkpoint, "DreamGaussian checkpoint")?;
        for (what, checkpoint) in [
            ("Wonder3D", &multiview_checkpoint),
            ("DreamGaussian", &reconstruction_checkpoint),
        ] {
            if !checkpoint.exists() {
                return Err(PipelineError::InvalidArgument(format!(
                    "{} checkpoint \"{}\" does not exist",
                    what,
                    checkpoint.display()
                )));
            }
        }

        for (name, value) in [
            ("number of views", self.views),
            ("resolution", self.resolution),
            ("number of reconstruction iterations", self.iterations),
        ] {
            if value == 0 {
                return Err(PipelineError::InvalidArgument(format!(
                    "{} has to be larger than zero",
                    name
                )));
            }
        }

        if !(self.decimate_ratio > 0.0 && self.decimate_ratio <= 1.0) {
            return Err(PipelineError::InvalidArgument(format!(
                "decimation ratio {} is not in the interval (0, 1]",
                self.decimate_ratio
            )));
        }

        let work_root = match &self.work_root {
            Some(root) => Some(absolute(root, "working directory root")?),
            None => None,
        };

        Ok(Self {
            input,
            output,
            multiview_checkpoint,
            reconstruction_checkpoint,
            work_root,
            ..self.clone()
        })
    }
}

fn absolute(path: &Path, what: &str) -> Result<PathBuf, PipelineError> {
    if path.as_os_str().is_empty() {
        return Err(PipelineError::InvalidArgument(format!(
            "empty path supplied for {}",
            what
        )));
    }
    std::path::absolute(path).map_err(|e| {
        PipelineError::InvalidArgument(format!(
            "unable to resolve {} path \"{}\" ({})",
            what,
            path.display(),
            e
        ))
    })
}

/// Wall clock time spent in a stage
#[derive(Copy, Clone, Debug)]
pub struct StageTiming {
    pub stage: Stage,
    pub duration: Duration,
}

/// Result of a successful pipeline run
#[derive(Clone, Debug)]
pub struct PipelineResult {
    /// Absolute path of the written GLB file
    pub output: PathBuf,
    /// Timings of all stages in the order they were run
    pub timings: Vec<StageTiming>,
}

impl PipelineResult {
    pub fn total_duration(&self) -> Duration {
        self.timings.iter().map(|t| t.duration).sum()
    }
}

/// Sequential runner of the four pipeline stages
///
/// Every run gets its own ephemeral working directory that is removed when the run ends. A stage
/// only starts after the previous one exited successfully, the first failing stage aborts the run.
#[derive(Clone, Debug)]
pub struct Pipeline {
    toolchain: Toolchain,
    interrupt: InterruptFlag,
}

impl Pipeline {
    pub fn new(toolchain: Toolchain) -> Self {
        Self {
            toolchain,
            interrupt: InterruptFlag::new(),
        }
    }

    /// Uses the given flag to observe termination requests (e.g. raised by a signal handler)
    pub fn with_interrupt_flag(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    pub fn interrupt_flag(&self) -> &InterruptFlag {
        &self.interrupt
    }

    /// Runs all stages and writes the final asset to the output path of the parameters
    pub fn run(&self, params: &Parameters) -> Result<PipelineResult, PipelineError> {
        self.run_with_progress(params, |_| {})
    }

    /// Runs all stages, calling `on_stage_finished` after each stage that completed successfully
    pub fn run_with_progress<F: FnMut(Stage)>(
        &self,
        params: &Parameters,
        mut on_stage_finished: F,
    ) -> Result<PipelineResult, PipelineError> {
        let params = params.resolve()?;
        self.toolchain.verify()?;

        let created_dirs = create_output_dir(&params.output)?;
        let result = self.run_stages(&params, &mut on_stage_finished);
        if result.is_err() {
            remove_created_dirs(&created_dirs);
        }
        result
    }

    fn run_stages<F: FnMut(Stage)>(
        &self,
        params: &Parameters,
        on_stage_finished: &mut F,
    ) -> Result<PipelineResult, PipelineError> {
        let output_existed = params.output.exists();

        let work_dir =
            WorkDir::create(params.work_root.as_deref()).map_err(PipelineError::WorkingDirectory)?;
        info!("Using working directory \"{}\"", work_dir.path().display());

        let mut timings = Vec::with_capacity(Stage::ALL.len());
        for stage in Stage::ALL {
            if self.interrupt.is_raised() {
                return Err(PipelineError::Interrupted { stage });
            }

            let invocation = stages::invocation(stage, &self.toolchain, work_dir.layout(), params);
            let start = Instant::now();

            if let Err(err) = self.run_stage(stage, &invocation) {
                if stage == Stage::Export && !output_existed {
                    remove_partial_output(&params.output);
                }
                return Err(err);
            }

            if params.check_artifacts {
                for artifact in stages::expected_artifacts(stage, work_dir.layout(), params) {
                    if !artifact.exists() {
                        return Err(PipelineError::MissingArtifact {
                            stage,
                            path: artifact,
                        });
                    }
                }
            }

            let duration = start.elapsed();
            info!(
                "Finished {} in {:.2}s",
                stage,
                duration.as_secs_f64()
            );
            timings.push(StageTiming { stage, duration });
            on_stage_finished(stage);
        }

        let work_dir_path = work_dir.path().to_path_buf();
        if let Err(err) = work_dir.close() {
            warn!(
                "Unable to remove working directory \"{}\": {}",
                work_dir_path.display(),
                err
            );
        }

        info!("Success: saved mesh to \"{}\"", params.output.display());
        Ok(PipelineResult {
            output: params.output.clone(),
            timings,
        })
    }

    fn run_stage(&self, stage: Stage, invocation: &Invocation) -> Result<(), PipelineError> {
        info!(
            "Stage {}/{}: {}",
            stage.number(),
            Stage::ALL.len(),
            stage.name()
        );
        info!("Running: {}", invocation);
        debug!(
            "Working directory: \"{}\"",
            invocation.working_dir().display()
        );

        let completion = invocation
            .execute(stage.tool(), &self.interrupt)
            .map_err(|source| PipelineError::Execution {
                stage,
                command: invocation.to_string(),
                source,
            })?;

        match completion {
            Completion::Interrupted => Err(PipelineError::Interrupted { stage }),
            // Tools in the same process group receive the terminal's SIGINT themselves
            Completion::Exited(status) if !status.success() && self.interrupt.is_raised() => {
                Err(PipelineError::Interrupted { stage })
            }
            Completion::Exited(status) if !status.success() => Err(PipelineError::StageFailed {
                stage,
                command: invocation.to_string(),
                status,
            }),
            Completion::Exited(_) => Ok(()),
        }
    }
}

/// Runs the full pipeline with the given toolchain and without interruption support
pub fn run(params: &Parameters, toolchain: &Toolchain) -> Result<PipelineResult, PipelineError> {
    Pipeline::new(toolchain.clone()).run(params)
}

/// Creates the missing parent directories of the output file, returns the created ones (deepest first)
fn create_output_dir(output: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let missing: Vec<PathBuf> = output
        .ancestors()
        .skip(1)
        .take_while(|dir| !dir.as_os_str().is_empty() && !dir.exists())
        .map(Path::to_path_buf)
        .collect();

    if let Some(output_dir) = missing.first() {
        info!(
            "The output directory \"{}\" does not exist. Trying to create it now...",
            output_dir.display()
        );
        fs::create_dir_all(output_dir).map_err(|source| PipelineError::OutputDirectory {
            path: output_dir.clone(),
            source,
        })?;
    }
    Ok(missing)
}

/// Removes directories created for the output of a failed run, as long as they are empty
fn remove_created_dirs(created_dirs: &[PathBuf]) {
    for dir in created_dirs {
        if let Err(err) = fs::remove_dir(dir) {
            debug!("Keeping output directory \"{}\": {}", dir.display(), err);
            return;
        }
        debug!("Removed output directory \"{}\"", dir.display());
    }
}

fn remove_partial_output(output: &Path) {
    if output.exists() {
        match fs::remove_file(output) {
            Ok(_) => info!("Removed partially written output \"{}\"", output.display()),
            Err(err) => warn!(
                "Unable to remove partially written output \"{}\": {}",
                output.display(),
                err
            ),
        }
    }
}
