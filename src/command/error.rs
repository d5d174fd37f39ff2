//! Errors raised by the command backend.

use thiserror::Error;

/// Errors returned while driving the backend helper binary.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// The helper could not be started or its pipes failed.
    #[error("failed to run {program}: {message}")]
    Spawn {
        /// Program that could not be run.
        program: String,
        /// Operating system error message.
        message: String,
    },
    /// The helper exited with a non-zero status.
    #[error("{program} exited with status {status_text}: {stderr}")]
    Failure {
        /// Program that failed.
        program: String,
        /// Exit status reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the command, prefixed with the operation.
        stderr: String,
    },
    /// JSON output from the helper could not be parsed or produced.
    #[error("failed to parse {resource} output: {message}")]
    Parse {
        /// Resource being parsed (for example `regions`).
        resource: String,
        /// Parser error message.
        message: String,
    },
}
