/// Failure of one synchronisation step.
///
/// Every mutating path stops at the first failed step and hands one of these
/// back; nothing is retried. The next event, reconciliation pass or sweep
/// supersedes the failed write.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Listing or inspecting through the container engine failed.
    #[error(transparent)]
    Engine(anyhow::Error),

    #[error("store operation failed: {0}")]
    Store(#[from] kv_store::Error),

    /// An inspected record had an unexpected shape.
    #[error("unexpected record shape: {0}")]
    Codec(#[from] data_model::Error),
}

impl SyncError {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Engine(_) => "engine",
            SyncError::Store(_) => "store",
            SyncError::Codec(_) => "codec",
        }
    }
}
