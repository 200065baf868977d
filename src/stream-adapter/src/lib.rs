//! This engine matches byte-stream fragments arriving from the active
//! message transport against per-endpoint receive requests, unpacks them
//! into user buffers with datatype semantics, and lends received
//! descriptors to the user on the zero-copy path.

use thiserror::Error;

pub mod config;
pub mod datatype;
pub mod engine;

pub(crate) mod desc;
pub(crate) mod pool;
pub(crate) mod request;
pub(crate) mod state;

pub use config::StreamAdapterConfig;
pub use datatype::{Datatype, GenericUnpack, RecvBuffer};
pub use desc::StreamData;
pub use engine::{AmData, RecvOp, StreamAdapterEngine};
pub use request::{RecvFlags, RecvParams, StreamCompletion, StreamRecvHandle};

/// Status space of the stream receive engine. A value of this type is
/// returned from the call paths and injected as the completion status of
/// posted requests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("stream feature not enabled or malformed parameters")]
    InvalidParam,
    #[error("request pool exhausted")]
    NoMemory,
    #[error("no received data immediately available")]
    NoResource,
    /// Internal matching signal. Never escapes the public API.
    #[error("no progress")]
    NoProgress,
    #[error("datatype unpack failed: {0}")]
    Unpack(String),
    #[error("operation canceled")]
    Canceled,
}
