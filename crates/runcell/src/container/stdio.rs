//! Files bound to the sandboxed process's standard streams

use std::fs::File;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::OpenOptions;
use tracing::debug;

use crate::types::FdConfig;

pub const NULL_DEVICE: &str = "/dev/null";

const OUTPUT_FILE_MODE: u32 = 0o644;

#[derive(Debug, Error)]
pub enum StdioError {
    #[error("failed to open the stdin file {path}: {source}")]
    Stdin {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to prepare the {stream} file {path}: {source}")]
    Output {
        stream: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to duplicate stdio handles: {0}")]
    Duplicate(#[source] std::io::Error),
}

/// Stdio handles given to the process
#[derive(Debug)]
pub struct ProcessStdio {
    pub stdin: File,
    pub stdout: File,
    pub stderr: File,
}

/// The run's stdio files, held open for the lifetime of the run
#[derive(Debug)]
pub struct StdioFiles {
    stdin: File,
    stdout: File,
    stderr: File,
    stdout_path: PathBuf,
    stderr_path: PathBuf,
}

impl StdioFiles {
    pub fn stdout_path(&self) -> &Path {
        &self.stdout_path
    }

    pub fn stderr_path(&self) -> &Path {
        &self.stderr_path
    }

    /// Duplicate the handles for the process
    pub fn for_process(&self) -> Result<ProcessStdio, StdioError> {
        Ok(ProcessStdio {
            stdin: self.stdin.try_clone().map_err(StdioError::Duplicate)?,
            stdout: self.stdout.try_clone().map_err(StdioError::Duplicate)?,
            stderr: self.stderr.try_clone().map_err(StdioError::Duplicate)?,
        })
    }

    /// Close the files and hand back the output paths
    pub fn close(self) -> (PathBuf, PathBuf) {
        (self.stdout_path, self.stderr_path)
    }
}

/// Open stdin read-only and create or truncate stdout and stderr.
/// Unset entries use the null device.
pub async fn provision(fd: Option<&FdConfig>) -> Result<StdioFiles, StdioError> {
    let stdin_path = or_null(fd.and_then(|fd| fd.stdin.as_deref()));
    let stdout_path = or_null(fd.and_then(|fd| fd.stdout.as_deref()));
    let stderr_path = or_null(fd.and_then(|fd| fd.stderr.as_deref()));

    let stdin = OpenOptions::new()
        .read(true)
        .open(&stdin_path)
        .await
        .map_err(|source| StdioError::Stdin {
            path: stdin_path.clone(),
            source,
        })?;

    let stdout = open_output(&stdout_path)
        .await
        .map_err(|source| StdioError::Output {
            stream: "stdout",
            path: stdout_path.clone(),
            source,
        })?;

    let stderr = open_output(&stderr_path)
        .await
        .map_err(|source| StdioError::Output {
            stream: "stderr",
            path: stderr_path.clone(),
            source,
        })?;

    debug!(
        stdin = %stdin_path.display(),
        stdout = %stdout_path.display(),
        stderr = %stderr_path.display(),
        "stdio files ready"
    );

    Ok(StdioFiles {
        stdin: stdin.into_std().await,
        stdout,
        stderr,
        stdout_path,
        stderr_path,
    })
}

fn or_null(path: Option<&Path>) -> PathBuf {
    match path {
        Some(path) if !path.as_os_str().is_empty() => path.to_path_buf(),
        _ => PathBuf::from(NULL_DEVICE),
    }
}

async fn open_output(path: &Path) -> std::io::Result<File> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(OUTPUT_FILE_MODE)
        .open(path)
        .await?;
    Ok(file.into_std().await)
}
