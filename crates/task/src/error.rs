use std::{any::Any, io};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("runtime needs at least one worker")]
    NoWorkers,

    #[error("failed to spawn {name} thread")]
    SpawnThread {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("not running inside an executor task")]
    NoRuntime,
}

/// Why a joined task produced no value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("task panicked: {0}")]
    Panicked(String),

    /// Dropped at shutdown before it finished.
    #[error("task was cancelled")]
    Cancelled,
}

impl JoinError {
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        JoinError::Panicked(panic_message(payload.as_ref()))
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
