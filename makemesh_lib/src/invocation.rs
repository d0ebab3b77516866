use crate::InterruptFlag;
use log::{debug, info, warn};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Interval for polling a running tool for completion and the interrupt flag for termination requests
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Time the output of an exited tool is still forwarded while its pipes stay open
const FORWARD_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Description of a single run of an external program
///
/// The program is started directly (without a shell) with the given argument list and working
/// directory, so no quoting or escaping of paths is involved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    program: OsString,
    working_dir: PathBuf,
    args: Vec<OsString>,
}

/// Outcome of an [`Invocation`] that could be started
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Completion {
    /// The program ran to completion with the given status
    Exited(ExitStatus),
    /// The program was killed because the interrupt flag was raised
    Interrupted,
}

impl Invocation {
    /// Creates an invocation of `program` in `working_dir` without any arguments
    pub fn new<P: Into<OsString>, D: Into<PathBuf>>(program: P, working_dir: D) -> Self {
        Self {
            program: program.into(),
            working_dir: working_dir.into(),
            args: Vec::new(),
        }
    }

    /// Appends a positional argument
    pub fn arg<A: Into<OsString>>(mut self, arg: A) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends a flag followed by its value, e.g. `--out_dir <path>`
    pub fn flag<V: Into<OsString>>(self, name: &str, value: V) -> Self {
        self.arg(name).arg(value)
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Returns the value following the first occurrence of the given flag
    pub fn flag_value(&self, name: &str) -> Option<&OsStr> {
        self.args
            .iter()
            .position(|a| a == name)
            .and_then(|i| self.args.get(i + 1))
            .map(|v| v.as_os_str())
    }

    /// Returns a [`Command`] configured with the program, arguments and working directory of this invocation
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).current_dir(&self.working_dir);
        command
    }

    /// Runs the program and blocks until it exits or `interrupt` is raised
    ///
    /// Everything the program writes to stdout and stderr is forwarded line by line to the log,
    /// prefixed with `label`.
    pub(crate) fn execute(&self, label: &str, interrupt: &InterruptFlag) -> io::Result<Completion> {
        let mut child = self
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let forwarders = match spawn_forwarders(&mut child, label) {
            Ok(forwarders) => forwarders,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err);
            }
        };

        loop {
            let status = match child.try_wait() {
                Ok(status) => status,
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(err);
                }
            };

            if let Some(status) = status {
                finish_forwarders(forwarders, label, interrupt);
                return Ok(Completion::Exited(status));
            }

            if interrupt.is_raised() {
                warn!("[{}] Interrupt requested, terminating process...", label);
                // The child may have exited between `try_wait` and `kill`
                if let Err(err) = child.kill() {
                    debug!("[{}] Unable to kill process: {}", label, err);
                }
                child.wait()?;
                // Forwarders are not joined: grandchildren of the tool may still hold the pipes open
                return Ok(Completion::Interrupted);
            }

            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Waits for the forwarders to drain the pipes of an exited program
///
/// Background processes started by the program may keep the pipes open. Forwarders still running
/// after [`FORWARD_GRACE_PERIOD`] (or once `interrupt` is raised) are detached.
fn finish_forwarders(forwarders: Vec<JoinHandle<()>>, label: &str, interrupt: &InterruptFlag) {
    let deadline = Instant::now() + FORWARD_GRACE_PERIOD;
    while !forwarders.iter().all(JoinHandle::is_finished)
        && Instant::now() < deadline
        && !interrupt.is_raised()
    {
        thread::sleep(POLL_INTERVAL);
    }

    for forwarder in forwarders {
        if !forwarder.is_finished() {
            debug!(
                "[{}] Output pipe is still held open by another process, no longer forwarding it",
                label
            );
        } else if forwarder.join().is_err() {
            warn!("[{}] Output forwarding thread panicked", label);
        }
    }
}

/// Formats the invocation like a command line, quoting arguments where a shell would need it
impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

fn quote(arg: &OsStr) -> String {
    let arg = arg.to_string_lossy();
    let is_plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+@%".contains(c));

    if is_plain {
        arg.into_owned()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn spawn_forwarders(child: &mut Child, label: &str) -> io::Result<Vec<JoinHandle<()>>> {
    let mut forwarders = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        forwarders.push(forward_lines(stdout, label, "stdout")?);
    }
    if let Some(stderr) = child.stderr.take() {
        forwarders.push(forward_lines(stderr, label, "stderr")?);
    }
    Ok(forwarders)
}

fn forward_lines<R: Read + Send + 'static>(
    pipe: R,
    label: &str,
    stream: &'static str,
) -> io::Result<JoinHandle<()>> {
    let label = label.to_string();
    thread::Builder::new()
        .name(format!("{}-{}", label, stream))
        .spawn(move || {
            let mut reader = BufReader::new(pipe);
            let mut buffer = Vec::new();
            loop {
                buffer.clear();
                match reader.read_until(b'\n', &mut buffer) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buffer);
                        // Progress bars rewrite their line using carriage returns, only keep the latest state
                        if let Some(line) = line
                            .trim_end()
                            .rsplit('\r')
                            .find(|s| !s.trim().is_empty())
                        {
                            info!("[{}] {}", label, line);
                        }
                    }
                    Err(err) => {
                        debug!("[{}] Stopped reading {}: {}", label, stream, err);
                        break;
                    }
                }
            }
        })
}
