//! Error taxonomy for the checkpoint engine (spec §7).

use std::path::PathBuf;
use thiserror::Error;

/// Errors the checkpoint engine can raise.
///
/// `Config` aborts construction. `Io`/`Compress` errors during a commit are
/// logged and the commit is skipped rather than propagated; see
/// [`crate::checkpoint::engine::Engine::on_post_tb`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid checkpoint configuration: {0}")]
    Config(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("zstd compression failed: {0}")]
    Compress(String),

    #[error("detail-model IPC failure: {0}")]
    Ipc(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
