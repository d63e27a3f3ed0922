use crate::{run_tool, Error};
use std::{
    path::{Path, PathBuf},
    process::Command,
};

pub struct StackwalkOptions {
    /// The `minidump-stackwalk` executable to invoke.
    pub stackwalker: PathBuf,
    /// Ask for the condensed backtrace instead of the full report.
    pub brief: bool,
}

impl Default for StackwalkOptions {
    fn default() -> Self {
        Self {
            stackwalker: PathBuf::from("minidump-stackwalk"),
            brief: false,
        }
    }
}

/// Resolves a minidump into a human-readable backtrace using the symbol
/// store produced by [`dump_symbols`](crate::dump_symbols).
///
/// All of the actual unwinding and symbolication happens in the external
/// stackwalker; this only shells out and hands back its report.
pub fn stackwalk(
    minidump: &Path,
    symbols_dir: &Path,
    options: &StackwalkOptions,
) -> Result<String, Error> {
    let mut command = Command::new(&options.stackwalker);

    if options.brief {
        command.arg("--brief");
    }
    command.arg("--symbols-path").arg(symbols_dir).arg(minidump);

    let output = run_tool(&mut command)?;

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
