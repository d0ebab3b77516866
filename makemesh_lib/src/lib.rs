//!
//! Library driving the conversion of a single image into a textured GLB mesh using external
//! machine-learning tools. Entry point is the [run] function or a configured [Pipeline].
//!
//! The pipeline consists of four stages that are run one after another, each implemented by an
//! external program that is treated as a black box:
//!  1. multi-view synthesis (Wonder3D) of RGB views and normal maps from the input image,
//!  2. Gaussian reconstruction (DreamGaussian) of a raw mesh and a texture from these views,
//!  3. decimation and Laplacian smoothing of the raw mesh,
//!  4. export of the cleaned mesh and its texture into a GLB file.
//!
//! Stages hand their results to the next stage only through files in an ephemeral working
//! directory that follows a fixed [layout](layout::Layout). The directory is removed when the run
//! ends, independent of whether it succeeded, failed or was interrupted.
//!

/// Typed descriptors of external program invocations
pub mod invocation;
mod interrupt;
/// Directory layout of the ephemeral working directory
pub mod layout;
mod pipeline;
pub mod stages;
/// Locations of the external tools
pub mod toolchain;

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error as ThisError;

pub use interrupt::InterruptFlag;
pub use invocation::Invocation;
pub use pipeline::{Parameters, Pipeline, PipelineResult, StageTiming, run};
pub use stages::Stage;
pub use toolchain::Toolchain;

/// Exit code used for invalid arguments (same as for command line parsing errors)
pub const EXIT_CODE_INVALID_ARGUMENT: i32 = 2;
/// Exit code used if the pipeline was interrupted (128 + SIGINT)
pub const EXIT_CODE_INTERRUPTED: i32 = 130;

/// Error type returned when a pipeline run fails
#[derive(Debug, ThisError)]
pub enum PipelineError {
    /// A user supplied argument is missing, unreadable or out of range
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A part of the external toolchain is not installed at the expected location
    #[error("{what} not found at \"{}\"", .path.display())]
    MissingToolchain { what: &'static str, path: PathBuf },
    /// The ephemeral working directory could not be created
    #[error("failed to create working directory")]
    WorkingDirectory(#[source] io::Error),
    /// The parent directory of the output file could not be created
    #[error("failed to create output directory \"{}\"", .path.display())]
    OutputDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The tool of a stage could not be started or waited on
    #[error("{stage}: failed to execute `{command}`")]
    Execution {
        stage: Stage,
        command: String,
        #[source]
        source: io::Error,
    },
    /// The tool of a stage exited with a non-zero status
    #[error("{stage} failed ({status}), command: `{command}`")]
    StageFailed {
        stage: Stage,
        command: String,
        status: ExitStatus,
    },
    /// The tool of a stage exited successfully but did not write a file required by the next stage
    #[error("{stage} did not produce expected output \"{}\"", .path.display())]
    MissingArtifact { stage: Stage, path: PathBuf },
    /// The run was interrupted by a termination request
    #[error("interrupted during {stage}")]
    Interrupted { stage: Stage },
}

impl PipelineError {
    /// Returns the stage during which the error occurred, if any
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Execution { stage, .. }
            | PipelineError::StageFailed { stage, .. }
            | PipelineError::MissingArtifact { stage, .. }
            | PipelineError::Interrupted { stage } => Some(*stage),
            _ => None,
        }
    }

    /// Returns the process exit code that should be reported for this error
    ///
    /// A failing tool's own exit code is passed through. If the tool was terminated by a signal,
    /// `128 + signal` is returned like a shell would.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::InvalidArgument(_) => EXIT_CODE_INVALID_ARGUMENT,
            PipelineError::Interrupted { .. } => EXIT_CODE_INTERRUPTED,
            PipelineError::StageFailed { status, .. } => status_exit_code(status),
            _ => 1,
        }
    }
}

fn status_exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        // Some platforms allow exit codes that are truncated to zero by the shell
        return if code == 0 { 1 } else { code };
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    1
}
