use thiserror::Error;

use crate::drain::DrainError;
use crate::event_bus::EventError;

#[derive(Error, Debug)]
pub enum Error {
    // event error
    #[error("Event error: {0}")]
    Event(#[from] EventError),
    #[error("Drain error: {0}")]
    Drain(#[from] DrainError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type InternalResult<T> = Result<T, Error>;

// エラー作成用のヘルパー関数
impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }
}
