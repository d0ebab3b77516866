use std::env;
use std::ffi::{OsStr, OsString};
use std::io::Write;

use anyhow::anyhow;
use fern::Output;
use indicatif::{ProgressBar, WeakProgressBar};
use log::{error, info};
use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::cli::VerbosityLevel;

/// Log target that pauses the progress bar of the running pipeline while a record is written
#[derive(Debug)]
pub struct BarAwareWriter<W: Write + Send> {
    inner: W,
}

/// The progress bar of the running pipeline, if there is one
static CURRENT_PROGRESS_BAR: Lazy<RwLock<Option<WeakProgressBar>>> =
    Lazy::new(|| RwLock::new(None));

impl<W: Write + Send> BarAwareWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    fn with_bar_suspended<R>(&mut self, write: impl FnOnce(&mut W) -> R) -> R {
        let inner = &mut self.inner;
        match get_progress_bar() {
            Some(pb) => pb.suspend(|| write(inner)),
            None => write(inner),
        }
    }
}

impl<W: Write + Send> Write for BarAwareWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.with_bar_suspended(|inner| inner.write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.with_bar_suspended(|inner| inner.flush())
    }
}

impl<W: Write + Send + 'static> From<BarAwareWriter<W>> for Output {
    fn from(writer: BarAwareWriter<W>) -> Self {
        let boxed: Box<dyn Write + Send> = Box::new(writer);
        boxed.into()
    }
}

/// Sets the progress bar that is suspended while log records are written
pub(crate) fn set_progress_bar(pb: Option<WeakProgressBar>) {
    *CURRENT_PROGRESS_BAR.write() = pb;
}

/// Returns the current progress bar if it is still alive
pub(crate) fn get_progress_bar() -> Option<ProgressBar> {
    CURRENT_PROGRESS_BAR.read().as_ref()?.upgrade()
}

/// Logs an error followed by every error in its source chain
pub(crate) fn log_error(err: &anyhow::Error) {
    error!("{}", err);
    for (depth, cause) in err.chain().enumerate().skip(1) {
        error!("{:>width$}caused by: {}", "", cause, width = 2 * depth);
    }
}

/// Level used if neither the command line nor `RUST_LOG` select one
const DEFAULT_LEVEL: log::LevelFilter = log::LevelFilter::Info;

/// Resolves the log filter level: quiet mode, then verbosity flags, then `RUST_LOG`, then the default
///
/// Returns the unrecognized value of `RUST_LOG` as second element, if any.
fn resolve_filter_level(
    verbosity: VerbosityLevel,
    quiet_mode: bool,
    rust_log: Option<&OsStr>,
) -> (log::LevelFilter, Option<String>) {
    if quiet_mode {
        return (log::LevelFilter::Off, None);
    }
    if let Some(level) = verbosity.into_filter() {
        return (level, None);
    }

    let Some(rust_log) = rust_log else {
        return (DEFAULT_LEVEL, None);
    };
    let rust_log = rust_log.to_string_lossy().trim().to_ascii_lowercase();
    match rust_log.parse::<log::LevelFilter>() {
        Ok(level) => (level, None),
        Err(_) => (DEFAULT_LEVEL, Some(rust_log)),
    }
}

/// Initializes logging with fern
pub(crate) fn initialize_logging(
    verbosity: VerbosityLevel,
    quiet_mode: bool,
) -> Result<(), anyhow::Error> {
    let rust_log = env::var_os("RUST_LOG");
    let (log_filter_level, unknown_log_filter_level) =
        resolve_filter_level(verbosity, quiet_mode, rust_log.as_deref());

    // Verbose output carries full timestamps and the module emitting the record
    let detailed = !matches!(verbosity, VerbosityLevel::None);
    fern::Dispatch::new()
        .format(move |out, message, record| {
            let now = chrono::Local::now();
            if detailed {
                out.finish(format_args!(
                    "[{}][{}][{}] {}",
                    now.to_rfc3339_opts(chrono::SecondsFormat::Micros, false),
                    record.target(),
                    record.level(),
                    message
                ))
            } else {
                out.finish(format_args!(
                    "[{}][{}] {}",
                    now.format("%T%.3f"),
                    record.level(),
                    message
                ))
            }
        })
        .level(log_filter_level)
        .chain(BarAwareWriter::new(std::io::stdout()))
        .apply()
        .map_err(|e| anyhow!("Unable to apply logger configuration ({})", e))?;

    if let Some(filter_level) = unknown_log_filter_level {
        error!(
            "Unknown log filter level '{}' defined in 'RUST_LOG' env variable, using INFO instead.",
            filter_level
        );
    }

    Ok(())
}

/// Prints program name, version and the command line to the log
pub(crate) fn log_program_info() {
    let cmd_line = command_line(env::args_os());
    info!(
        "{} v{} ({})",
        cmd_line.first().map(String::as_str).unwrap_or("makemesh"),
        env!("CARGO_PKG_VERSION"),
        env!("CARGO_PKG_NAME")
    );
    info!("Called with command line: {}", cmd_line.join(" "));
}

/// Converts the arguments for display, arguments that are not valid unicode are converted lossily
fn command_line<I: IntoIterator<Item = OsString>>(args: I) -> Vec<String> {
    args.into_iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}
