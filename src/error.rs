//! CLI and configuration-facing errors. Per-operation I/O failures are translated to
//! raw errno values at the FUSE/protocol boundary instead (see `server::handlers` and
//! `client::filesystem`), since that boundary must report POSIX errno, not a Rust
//! error enum.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetfsError {
    #[error("invalid mount source {0:?}: {1}")]
    InvalidSource(String, &'static str),

    #[error("export directory {0:?} does not exist or is not a directory")]
    InvalidExportDir(PathBuf),

    #[error("failed to bind server socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("failed to connect to {0}: {1}")]
    Connect(std::net::SocketAddr, #[source] std::io::Error),

    #[error("shared statistics record unavailable: {0}")]
    Stats(#[source] std::io::Error),

    #[error("mount failed: {0}")]
    Mount(#[source] std::io::Error),
}
