//! Error taxonomy for the sweep.
//!
//! Only two kinds of problem abort a sweep: unusable inputs and a harness
//! that cannot do its job (e.g. the verifying client won't spawn). Anything
//! the server or the TLS stack does wrong is recorded per test case instead,
//! since order-sensitive rejections are exactly what the tool exists to
//! observe.

use std::{io, net::SocketAddr, path::PathBuf, process::ExitStatus};

use thiserror::Error;

/// Errors that abort the whole sweep. No partial report is produced for
/// invalid inputs; they are detected before any child process is spawned.
#[derive(Debug, Error)]
pub enum FatalError {
    /// A named input certificate or key file is missing or malformed.
    #[error("invalid input: {}: {}", .path.display(), .reason)]
    InvalidInput { path: PathBuf, reason: String },

    /// The harness itself malfunctioned: a bundle file could not be written,
    /// or the verifying client could not be spawned or never finished.
    /// Distinct from a clean TLS-level rejection.
    #[error("harness failure: {context}")]
    Harness {
        context: String,
        #[source]
        source: Option<io::Error>,
    },
}

impl FatalError {
    pub fn invalid_input(
        path: impl Into<PathBuf>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidInput {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn harness(context: impl Into<String>, source: io::Error) -> Self {
        Self::Harness {
            context: context.into(),
            source: Some(source),
        }
    }

    pub fn harness_msg(context: impl Into<String>) -> Self {
        Self::Harness {
            context: context.into(),
            source: None,
        }
    }
}

/// Ways the TLS server child can fail before the client ever connects.
/// Recorded on the test case's outcome; the sweep continues with the next
/// bundle.
#[derive(Debug, Error)]
pub enum ServerStartError {
    #[error("failed to launch server {}: {}", .bin.display(), .source)]
    Spawn { bin: PathBuf, source: io::Error },

    #[error(
        "server exited before accepting connections ({status}); stderr: {stderr}"
    )]
    ExitedEarly { status: ExitStatus, stderr: String },

    #[error("server not listening on {addr} after {timeout_ms}ms")]
    NotListening { addr: SocketAddr, timeout_ms: u64 },
}
