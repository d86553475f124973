//! A simulated node runtime.
//!
//! [Backend] runs a minimal proof-of-authority chain over the [crate::pipe]
//! fabric so that the tracker and monitor can be exercised end to end:
//!
//! * Validators take turns proposing. The proposer of height `h` at round `r` is
//!   `validators[(h + r) % n]` and round `r` is due `period * (1 + 3r)` seconds
//!   after the parent was imported. Nodes that know of a peer ahead of them do not
//!   propose.
//! * Proposals are announced on the consensus overlay and relayed by every node
//!   that imports them.
//! * Transactions are gossiped and missing blocks are fetched on the execution
//!   overlay.
//! * When a peer serves a longer chain that does not extend the local head, the
//!   local chain is rewound and re-synced.
//!
//! There is no voting: the chain is only as safe as the proposer schedule.

mod backend;
mod ledger;
mod metrics;
mod peer;
pub mod wire;

pub use backend::Backend;
pub use ledger::Ledger;
pub use metrics::Metrics;

use crate::{chain, types::Address, types::Hash};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when importing a block.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("unexpected number: {0} (head {1})")]
    UnexpectedNumber(u64, u64),
    #[error("unknown parent: {0}")]
    UnknownParent(Hash),
    #[error("inconsistent transactions root")]
    InconsistentBlock,
    #[error("too many transactions: {0}")]
    TooManyTransactions(usize),
    #[error("invalid block time: {0}")]
    InvalidTime(u64),
    #[error("unexpected proposer: {0}")]
    UnexpectedProposer(Address),
    #[error("invalid transaction {0}: {1}")]
    InvalidTransaction(Hash, chain::Error),
}

/// Configuration for a [Backend].
#[derive(Clone, Debug)]
pub struct Config {
    /// Interval between attempts to connect to disconnected validators.
    pub redial_interval: Duration,

    /// Maximum size of a single frame on a pipe.
    pub max_frame_size: usize,

    /// Maximum number of blocks served per sync request.
    pub sync_batch: usize,

    /// Maximum number of transactions included in a proposed block.
    pub max_block_transactions: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redial_interval: Duration::from_secs(2),
            max_frame_size: 8 * 1024 * 1024,
            sync_batch: 16,
            max_block_transactions: 1024,
        }
    }
}
