use thiserror::Error;

use crate::{
    bus::BusError, client::ClientError, config::ConfigError, context::ReplyError,
    dispatcher::DispatchError, params::ParamError, server::ServerError, subject::SubjectError,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Subject error: {0}")]
    Subject(#[from] SubjectError),
    #[error("Param error: {0}")]
    Param(#[from] ParamError),
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
    #[error("Reply error: {0}")]
    Reply(#[from] ReplyError),
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
    #[error("Client error: {0}")]
    Client(#[from] ClientError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }
}
