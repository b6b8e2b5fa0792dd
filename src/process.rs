//! Process module.
//!
//! This module contains helpers around `std::process` used to drive
//! the external spam classifier.

use log::debug;
use std::{
    io::{self, prelude::*},
    process::{Command, Stdio},
    result,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot spawn process for command {1:?}")]
    SpawnProcessError(#[source] io::Error, String),
    #[error("cannot get standard input")]
    GetStdinError,
    #[error("cannot write data to standard input")]
    WriteStdinError(#[source] io::Error),
    #[error("cannot get standard output")]
    GetStdoutError,
    #[error("cannot read data from standard output")]
    ReadStdoutError(#[source] io::Error),
    #[error("cannot wait for command {1:?}")]
    WaitError(#[source] io::Error, String),
    #[error("command {0:?} exited with {1}: {2}")]
    NonZeroExitError(String, i32, String),
}

pub type Result<T> = result::Result<T, Error>;

/// Runs the given program with the given arguments, feeds it the input
/// on its standard input and returns the collected output. A non-zero
/// exit status is an error carrying the output for diagnostics.
pub fn run(program: &str, args: &[&str], input: Option<&[u8]>) -> Result<Vec<u8>> {
    debug!("running command: {} {}", program, args.join(" "));

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| Error::SpawnProcessError(err, program.to_string()))?;

    let mut stdin = child.stdin.take().ok_or(Error::GetStdinError)?;
    if let Some(input) = input {
        stdin.write_all(input).map_err(Error::WriteStdinError)?;
    }
    drop(stdin);

    let mut output = Vec::new();
    child
        .stdout
        .take()
        .ok_or(Error::GetStdoutError)?
        .read_to_end(&mut output)
        .map_err(Error::ReadStdoutError)?;

    let status = child
        .wait()
        .map_err(|err| Error::WaitError(err, program.to_string()))?;

    match status.code() {
        Some(0) => Ok(output),
        code => Err(Error::NonZeroExitError(
            program.to_string(),
            code.unwrap_or(-1),
            String::from_utf8_lossy(&output).trim().to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::run;

    #[test]
    fn run_collects_output() {
        let output = run("cat", &[], Some(b"hello")).unwrap();
        assert_eq!(b"hello".to_vec(), output);
    }

    #[test]
    fn run_fails_on_non_zero_exit() {
        assert!(run("false", &[], None).is_err());
    }
}
