//! The produced channel tree and its external indexer.
//!
//! The channel is plain `<root>/<subdir>/<package>.conda`; repodata emission
//! is delegated to the external `rattler-index` tool, which writes
//! `repodata.json` (and its zstd-compressed counterpart) into each
//! subdirectory.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use miette::Diagnostic;
use thiserror::Error;

/// The executable that generates repodata.
const INDEXER_EXECUTABLE: &str = "rattler-index";

/// Errors while driving the external indexer.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum ChannelError {
    #[error("channel directory does not exist: {0}")]
    MissingChannel(PathBuf),

    #[error("could not find `{INDEXER_EXECUTABLE}` on PATH")]
    IndexerNotFound,

    #[error("the channel indexer exited with {0}")]
    IndexerFailed(ExitStatus),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Regenerates repodata for every subdirectory of the channel by invoking
/// the external indexer.
pub async fn index_channel(channel_dir: &Path) -> Result<(), ChannelError> {
    if !channel_dir.is_dir() {
        return Err(ChannelError::MissingChannel(channel_dir.to_path_buf()));
    }

    let indexer = which::which(INDEXER_EXECUTABLE).map_err(|_| ChannelError::IndexerNotFound)?;
    tracing::info!("indexing {} with {}", channel_dir.display(), indexer.display());

    let status = tokio::process::Command::new(indexer)
        .arg("file-system")
        .arg("--channel")
        .arg(channel_dir)
        .status()
        .await?;
    if !status.success() {
        return Err(ChannelError::IndexerFailed(status));
    }
    Ok(())
}
