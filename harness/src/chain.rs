//! Interfaces a node runtime exposes to the harness.
//!
//! The tracker only needs a [Source] of mined blocks and the monitor only needs a
//! [Reader] of chain state, so both can be driven by mocks as easily as by
//! [crate::sim::Backend].

use crate::types::{Address, Block, Hash, Header, Receipt, SyncProgress, Transaction};
use futures::{channel::mpsc, StreamExt};
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by a node runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("node stopped")]
    Stopped,
    #[error("subscription failed: {0}")]
    Subscription(String),
    #[error("unknown block: {0}")]
    UnknownBlock(Hash),
    #[error("unknown transaction: {0}")]
    UnknownTransaction(Hash),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("wrong chain id: {0}")]
    WrongChain(u64),
    #[error("transaction underpriced: {0} < {1}")]
    Underpriced(u64, u64),
    #[error("nonce too low: {0} < {1}")]
    NonceTooLow(u64, u64),
    #[error("nonce too high: {0} > {1}")]
    NonceTooHigh(u64, u64),
    #[error("insufficient funds: {0} < {1}")]
    InsufficientFunds(u64, u64),
    #[error("gas too low: {0} < {1}")]
    IntrinsicGas(u64, u64),
}

/// Read access to a node's chain.
pub trait Reader: Send + Sync + 'static {
    /// Head of the canonical chain.
    fn current_header(&self) -> Result<Header, Error>;

    /// Header of any known block.
    fn header_by_hash(&self, hash: &Hash) -> Result<Option<Header>, Error>;

    /// Progress of block synchronisation with peers.
    fn sync_progress(&self) -> Result<SyncProgress, Error>;
}

/// A producer of mined blocks.
pub trait Source {
    /// Subscribe to blocks appended to the canonical chain, in order.
    fn subscribe(&self) -> Result<Subscription, Error>;
}

/// Transaction submission and account queries.
pub trait Client: Reader {
    fn send_transaction(&self, tx: Transaction) -> Result<Hash, Error>;

    /// Next nonce for `address`, counting transactions still in the pool.
    fn pending_nonce(&self, address: &Address) -> Result<u64, Error>;

    fn balance(&self, address: &Address) -> Result<u64, Error>;

    fn receipt(&self, hash: &Hash) -> Result<Option<Receipt>, Error>;

    fn suggest_gas_price(&self) -> Result<u64, Error>;

    fn estimate_gas(&self, from: &Address, to: &Address, value: u64) -> Result<u64, Error>;
}

/// An ordered stream of blocks with explicit cancellation.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Arc<Block>>,
}

impl Subscription {
    /// Create a subscription and the sender that feeds it.
    pub fn new() -> (mpsc::UnboundedSender<Arc<Block>>, Self) {
        let (sender, receiver) = mpsc::unbounded();
        (sender, Self { receiver })
    }

    /// The next block, or `None` once the source closed or the subscription was
    /// cancelled and drained.
    pub async fn next(&mut self) -> Option<Arc<Block>> {
        self.receiver.next().await
    }

    /// Stop receiving new blocks. Blocks already delivered remain readable.
    pub fn unsubscribe(&mut self) {
        self.receiver.close();
    }
}
