//! Crate-wide error type. Protocol-level anomalies (stale ballots, wrong
//! phase, duplicate promises) never surface here; they are consumed with a
//! log line where they occur.

use thiserror::Error;

use crate::wire::{self, WireError};

#[derive(Debug, Error)]
pub enum Error {
    /// Fewer than a quorum of acceptors could be reached when broadcasting
    /// a phase message.
    #[error("cluster unavailable: reached {acked} acceptors, quorum is {quorum}")]
    ClusterUnavailable { acked: usize, quorum: usize },

    /// A client submitted a request to a node that runs no proposer.
    #[error("this node is not a proposer")]
    NotProposerLeader,

    #[error("network i/o failure: {0}")]
    NetworkIo(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] WireError),

    #[error("config file unreadable: {0}")]
    ConfigRead(std::io::Error),

    #[error("config file unwritable: {0}")]
    ConfigWrite(std::io::Error),

    #[error("config document invalid: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

impl Error {
    /// The `Response.ret` code reported back to a client when this error
    /// aborts its request.
    pub fn status(&self) -> u32 {
        match self {
            Error::ClusterUnavailable { .. } => wire::STATUS_CLUSTER_UNAVAILABLE,
            Error::NotProposerLeader => wire::STATUS_NOT_LEADER,
            Error::NetworkIo(_)
            | Error::MalformedFrame(_)
            | Error::ConfigRead(_)
            | Error::ConfigWrite(_)
            | Error::ConfigParse(_) => wire::STATUS_TIMEOUT,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
