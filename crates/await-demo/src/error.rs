use thiserror::Error;

#[derive(Debug, Error)]
pub enum DemoError {
    #[error("runtime: {0}")]
    Runtime(#[from] task::Error),

    #[error("awaited task failed: {0}")]
    Join(#[from] task::JoinError),
}
