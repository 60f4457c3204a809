use std::ffi::OsString;
use std::io;
use std::process::{Command, Output};

/// Narrow command-execution seam: one method, program plus argument vector.
/// Production uses [`ProcessCommandRunner`]; tests script outputs instead.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[OsString]) -> io::Result<Output>;
}

#[derive(Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> io::Result<Output> {
        Command::new(program).args(args).output()
    }
}
