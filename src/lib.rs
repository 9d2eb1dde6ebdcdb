pub mod async_client;
pub mod buffer;
pub mod cluster;
pub mod cluster_pubsub;
pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
pub mod executor;
pub mod logging;
pub mod parser;
pub mod pool;
pub mod reactor;
pub mod reply;
pub mod sentinel;
pub mod slot;
pub mod topology;

use std::time::Duration;

use thiserror::Error as ThisError;

pub use command::Command;
pub use reply::Reply;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] parser::ProtocolError),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("not connected")]
    NotConnected,
    #[error("{step} failed: {message}")]
    Startup { step: &'static str, message: String },
    #[error("no connection available for {0}")]
    PoolExhausted(String),
    #[error("no pool available")]
    NoPool,
    #[error("no node serves slot {0}")]
    SlotNotServed(u16),
    #[error("cluster topology unavailable from {0}")]
    TopologyUnavailable(String),
    #[error("too many redirects ({0})")]
    TooManyRedirects(usize),
    #[error("cluster is down: {0}")]
    ClusterDown(String),
    #[error("ASKING rejected by {0}")]
    AskingFailed(String),
    #[error("send queue is full")]
    Backpressure,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid uri: {0}")]
    InvalidUri(String),
    #[error("master {0} not found")]
    MasterNotFound(String),
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

pub type Result<T> = std::result::Result<T, Error>;
