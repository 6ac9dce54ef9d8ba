//! Entry point for the `sqlstress` binary.
#![warn(missing_docs)]

use std::process::ExitCode;

fn main() -> ExitCode {
    sqlstress_cli::cli::execute()
}
