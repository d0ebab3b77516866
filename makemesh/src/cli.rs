//! The `makemesh` command line interface.
//!
//! Turns a single image into a textured GLB mesh by running Wonder3D, DreamGaussian and the mesh
//! cleanup/export tools one after another. The pipeline itself is provided by the [`makemesh_lib`] crate.

use crate::{logging, make};
use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use makemesh_lib::{InterruptFlag, PipelineError};

static HELP_TEMPLATE: &str = "{before-help}{name} (v{version}) - {about-with-newline}\n{usage-heading} {usage}\n\n{all-args}{after-help}";

#[derive(Clone, Debug, clap::Parser)]
#[command(
    name = "makemesh",
    about = "Image to textured mesh pipeline (multi-view synthesis with Wonder3D, reconstruction with DreamGaussian, mesh cleanup and GLB export)",
    version,
    help_template = HELP_TEMPLATE,
)]
pub(crate) struct CommandlineArgs {
    /// Enable quiet mode (no output except for severe panic messages), overrides verbosity level
    #[arg(long, short = 'q')]
    pub quiet: bool,
    /// Print more verbose output, use multiple "v"s for even more verbose output (-v, -vv)
    #[arg(short, action = clap::ArgAction::Count)]
    pub verbosity: u8,
    #[command(flatten)]
    pub make: make::MakeArgs,
}

/// A simple on/off switch for command line arguments.
///
/// For example an argument defined as:
/// ```rust ignore
/// /// Enable checking that each stage wrote the files required by the following stage
/// #[arg(
///     long,
///     default_value = "on",
///     value_name = "off|on",
///     ignore_case = true,
///     require_equals = true
/// )]
/// pub check_artifacts: Switch,
/// ```
/// can be used in the CLI as `--check-artifacts=on` or `--check-artifacts=off`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum Switch {
    Off,
    On,
}

impl Switch {
    pub(crate) fn into_bool(self) -> bool {
        match self {
            Switch::Off => false,
            Switch::On => true,
        }
    }
}

/// Runs the makemesh CLI with the provided command line arguments.
///
/// This function behaves like the binary `makemesh` command line tool including output to stdout
/// and stderr. It will also exit the process if the command line arguments cannot be parsed, so it
/// should not be used in typical library contexts.
/// Note that the first argument is always ignored - this is typically the binary name when called using
/// `std::env::args_os()` from the terminal:
/// ```no_run
/// let _ = makemesh::cli::run_makemesh(["makemesh", "--version"]);
/// ```
pub fn run_makemesh<I, T>(args: I) -> Result<(), anyhow::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    run_makemesh_impl(args).inspect_err(logging::log_error)
}

fn run_makemesh_impl<I, T>(args: I) -> Result<(), anyhow::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cmd_args = CommandlineArgs::parse_from(args);

    let verbosity = VerbosityLevel::from(cmd_args.verbosity);
    let is_quiet = cmd_args.quiet;

    logging::initialize_logging(verbosity, is_quiet).context("Failed to initialize logging")?;
    logging::log_program_info();

    let interrupt = install_interrupt_handler();
    let result = make::make_command(&cmd_args.make, interrupt, !is_quiet);

    info!(
        "Finished at {}.",
        chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
    );

    result
}

/// Returns the process exit code for an error returned by [`run_makemesh`]
///
/// Errors of the pipeline are mapped using [`PipelineError::exit_code`], i.e. the exit code of a
/// failing tool is passed through. All other errors result in exit code 1.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
        .map(PipelineError::exit_code)
        .unwrap_or(1)
}

/// Installs a handler for SIGINT/SIGTERM that raises the returned flag
fn install_interrupt_handler() -> InterruptFlag {
    let interrupt = InterruptFlag::new();
    let handler_flag = interrupt.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        warn!("Received termination request, stopping the current stage...");
        handler_flag.raise();
    }) {
        warn!("Failed to install interrupt handler: {}", err);
    }
    interrupt
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum VerbosityLevel {
    None,
    Verbose,
    VeryVerbose,
}

impl From<u8> for VerbosityLevel {
    fn from(value: u8) -> Self {
        match value {
            0 => VerbosityLevel::None,
            1 => VerbosityLevel::Verbose,
            _ => VerbosityLevel::VeryVerbose,
        }
    }
}

impl VerbosityLevel {
    /// Maps this verbosity level to a log filter
    pub fn into_filter(self) -> Option<log::LevelFilter> {
        match self {
            VerbosityLevel::None => None,
            VerbosityLevel::Verbose => Some(log::LevelFilter::Debug),
            VerbosityLevel::VeryVerbose => Some(log::LevelFilter::Trace),
        }
    }
}

#[cfg(test)]
mod cli_args_tests {
    use super::*;
    use clap::error::ErrorKind;
    use std::path::PathBuf;

    const REQUIRED: [&str; 9] = [
        "makemesh",
        "--input",
        "photo.jpg",
        "--output",
        "model.glb",
        "--w3d_ckpt",
        "wonder3d.ckpt",
        "--dg_ckpt",
        "dreamgaussian.ckpt",
    ];

    fn parse_with(extra: &[&str]) -> Result<CommandlineArgs, clap::Error> {
        CommandlineArgs::try_parse_from(REQUIRED.iter().chain(extra.iter()))
    }

    #[test]
    fn verify_main_cli() {
        use clap::CommandFactory;
        CommandlineArgs::command().debug_assert()
    }

    #[test]
    fn test_help_and_version() {
        assert_eq!(
            CommandlineArgs::try_parse_from(["makemesh", "--help"])
                .expect_err("this command is supposed to fail")
                .kind(),
            ErrorKind::DisplayHelp
        );
        assert_eq!(
            CommandlineArgs::try_parse_from(["makemesh", "--version"])
                .expect_err("this command is supposed to fail")
                .kind(),
            ErrorKind::DisplayVersion
        );
    }

    #[test]
    fn test_required_arguments() {
        assert_eq!(
            CommandlineArgs::try_parse_from(["makemesh"])
                .expect_err("this command is supposed to fail")
                .kind(),
            ErrorKind::MissingRequiredArgument
        );

        // Every path is required
        for skipped in [1, 3, 5, 7] {
            let args = REQUIRED
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != skipped && *i != skipped + 1)
                .map(|(_, a)| *a);
            assert_eq!(
                CommandlineArgs::try_parse_from(args)
                    .expect_err("this command is supposed to fail")
                    .kind(),
                ErrorKind::MissingRequiredArgument,
                "{} should be required",
                REQUIRED[skipped]
            );
        }
    }

    #[test]
    fn test_defaults() {
        let args = parse_with(&[]).expect("this command is supposed to work");

        assert!(!args.quiet);
        assert_eq!(args.verbosity, 0);
        assert_eq!(args.make.input, PathBuf::from("photo.jpg"));
        assert_eq!(args.make.output, PathBuf::from("model.glb"));
        assert_eq!(args.make.w3d_ckpt, PathBuf::from("wonder3d.ckpt"));
        assert_eq!(args.make.dg_ckpt, PathBuf::from("dreamgaussian.ckpt"));
        assert_eq!(args.make.views, 24);
        assert_eq!(args.make.res, 512);
        assert_eq!(args.make.dg_iters, 8000);
        assert_eq!(args.make.decimate, 0.30);
        assert_eq!(args.make.check_artifacts, Switch::On);
        assert_eq!(args.make.work_dir, None);
    }

    #[test]
    fn test_explicit_values() {
        let args = parse_with(&[
            "--views",
            "6",
            "--res=256",
            "--dg_iters",
            "100",
            "--decimate",
            "0.5",
            "--check-artifacts=off",
            "--work-dir",
            "/scratch",
            "-vv",
        ])
        .expect("this command is supposed to work");

        assert_eq!(args.make.views, 6);
        assert_eq!(args.make.res, 256);
        assert_eq!(args.make.dg_iters, 100);
        assert_eq!(args.make.decimate, 0.5);
        assert_eq!(args.make.check_artifacts, Switch::Off);
        assert_eq!(args.make.work_dir, Some(PathBuf::from("/scratch")));
        assert_eq!(
            VerbosityLevel::from(args.verbosity),
            VerbosityLevel::VeryVerbose
        );
    }

    #[test]
    fn test_kebab_case_aliases() {
        let args = CommandlineArgs::try_parse_from([
            "makemesh",
            "--input",
            "photo.jpg",
            "--output",
            "model.glb",
            "--w3d-ckpt",
            "a.ckpt",
            "--dg-ckpt",
            "b.ckpt",
            "--dg-iters",
            "42",
        ])
        .expect("this command is supposed to work");

        assert_eq!(args.make.w3d_ckpt, PathBuf::from("a.ckpt"));
        assert_eq!(args.make.dg_ckpt, PathBuf::from("b.ckpt"));
        assert_eq!(args.make.dg_iters, 42);
    }

    #[test]
    fn test_invalid_values() {
        for invalid in [
            ["--views", "0"],
            ["--res", "0"],
            ["--dg_iters", "many"],
            ["--decimate", "0"],
            ["--decimate", "1.5"],
            ["--decimate", "nan"],
        ] {
            let err = parse_with(&invalid).expect_err("this command is supposed to fail");
            assert!(
                matches!(
                    err.kind(),
                    ErrorKind::ValueValidation | ErrorKind::InvalidValue
                ),
                "unexpected error kind {:?} for {:?}",
                err.kind(),
                invalid
            );
        }

        assert_eq!(
            parse_with(&["--check-artifacts", "off"])
                .expect_err("switches require an equals sign")
                .kind(),
            ErrorKind::NoEquals
        );
    }

    #[test]
    fn test_exit_code_mapping() {
        let invalid = anyhow::Error::new(PipelineError::InvalidArgument("missing".to_string()))
            .context("Failed processing parameters from command line");
        assert_eq!(exit_code(&invalid), 2);

        let interrupted = anyhow::Error::new(PipelineError::Interrupted {
            stage: makemesh_lib::Stage::Reconstruction,
        })
        .context("Failed to create mesh");
        assert_eq!(exit_code(&interrupted), 130);

        assert_eq!(exit_code(&anyhow::anyhow!("something else")), 1);
    }
}
