//! Error types for image assembly.
//!
//! Every variant names the path, device or image involved and carries the
//! underlying diagnostic as its source.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for image assembly operations.
pub type Result<T> = std::result::Result<T, ImageError>;

/// An external command that could not be run or exited unsuccessfully.
#[derive(Error, Debug)]
#[error("{message}: `{command}` {status}{}", render_output(.output))]
pub struct CommandError {
    /// Caller supplied description (defaults to "command failed").
    pub message: String,
    /// Rendered command line.
    pub command: String,
    /// Exit status or spawn failure.
    pub status: String,
    /// Combined stdout and stderr.
    pub output: String,
}

fn render_output(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(":\n{}", trimmed)
    }
}

/// Underlying reason for an [`ImageError`].
#[derive(Error, Debug)]
pub enum Cause {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("disk image is not attached to a loop device")]
    NotAttached,

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Install(#[from] anyhow::Error),
}

/// Main error type for image assembly.
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to partition {image:?}: {source}")]
    Partition {
        image: PathBuf,
        #[source]
        source: Cause,
    },

    #[error("Failed to attach {image:?} to a loop device: {source}")]
    Attach {
        image: PathBuf,
        #[source]
        source: Cause,
    },

    #[error("Failed to detach loop device {device:?}: {source}")]
    Detach {
        device: PathBuf,
        #[source]
        source: Cause,
    },

    #[error("Failed to create block device {path:?}: {source}")]
    DeviceNode {
        path: PathBuf,
        #[source]
        source: Cause,
    },

    #[error("Failed to format {device:?}: {source}")]
    Format {
        device: PathBuf,
        #[source]
        source: Cause,
    },

    #[error("Failed to mount {source_path:?} at {target:?}: {source}")]
    Mount {
        source_path: PathBuf,
        target: PathBuf,
        #[source]
        source: Cause,
    },

    #[error("Failed to unmount {target:?}: {source}")]
    Unmount {
        target: PathBuf,
        #[source]
        source: Cause,
    },

    #[error("Failed to query {device:?}: {source}")]
    Query {
        device: PathBuf,
        #[source]
        source: Cause,
    },

    #[error("Failed to unpack {file:?} ({step}): {source}")]
    Unpack {
        file: PathBuf,
        step: &'static str,
        #[source]
        source: Cause,
    },

    #[error("Sandbox failure at {root:?}: {source}")]
    Sandbox {
        root: PathBuf,
        #[source]
        source: Cause,
    },
}

impl ImageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ImageError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn unpack(
        file: impl Into<PathBuf>,
        step: &'static str,
        source: impl Into<Cause>,
    ) -> Self {
        ImageError::Unpack {
            file: file.into(),
            step,
            source: source.into(),
        }
    }
}
