use thiserror::Error;

/// The engine never panics: every fallible operation returns one of these kinds.
///
/// Local, non-protocol errors (`BadArgs`, `WontFit`, ...) never mutate any
/// state; everything else that reaches here from a parse or encode is
/// reported back to the caller unchanged so `mqtt-session` can decide
/// whether it is fatal to the connection.
#[derive(Debug, Error)]
pub enum Error {
    #[error("bad arguments: {0}")]
    BadArgs(String),

    #[error("bad null")]
    BadNull,

    #[error("bad state: {0}")]
    BadState(String),

    #[error("bad message: {0}")]
    BadMessage(String),

    #[error("bad response: {0}")]
    BadResponse(String),

    #[error("bad ack: {0}")]
    BadAck(String),

    #[error("bad session: {0}")]
    BadSession(String),

    #[error("message won't fit: {0}")]
    WontFit(String),

    #[error("out of memory")]
    Memory,
}

pub type Result<T> = std::result::Result<T, Error>;
