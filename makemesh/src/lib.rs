//! Library target of the makemesh CLI, see [`cli::run_makemesh`]

pub mod cli;
mod logging;
mod make;
