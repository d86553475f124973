//! A cluster member that can be started, stopped and driven with transfers.

use crate::{
    chain::{self, Client, Reader},
    genesis::{Genesis, Validator},
    monitor::Member,
    deadline::Deadline,
    pipe::{Fabric, Inbound, Peer},
    sim::{self, Backend, Metrics},
    tracker::{self, Tracker},
    types::{Address, Block, Hash, PublicKey, Transaction, UnsignedTransaction},
};
use commonware_runtime::{Clock, Metrics as RuntimeMetrics, Spawner};
use futures::channel::mpsc;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur when operating a [Node].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("node {0} already running")]
    AlreadyRunning(usize),
    #[error("node {0} not running")]
    NotRunning(usize),
    #[error("chain: {0}")]
    Chain(#[from] chain::Error),
    #[error("tracker: {0}")]
    Tracker(#[from] tracker::Error),
}

/// The node's entry in the pipe fabric. It outlives individual runs.
#[derive(Default)]
struct Registration {
    running: AtomicBool,
    inbound: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
}

impl Registration {
    fn open(&self) -> mpsc::UnboundedReceiver<Inbound> {
        let (sender, receiver) = mpsc::unbounded();
        *self.inbound.lock().unwrap() = Some(sender);
        self.running.store(true, Ordering::SeqCst);
        receiver
    }

    fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        *self.inbound.lock().unwrap() = None;
    }
}

impl Peer for Registration {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn accept(&self, inbound: Inbound) {
        if let Some(sender) = self.inbound.lock().unwrap().as_ref() {
            let _ = sender.unbounded_send(inbound);
        }
    }
}

/// A validator of a simulated cluster.
///
/// A [Node] is created stopped. Every [Node::start] launches a fresh runtime and
/// a fresh [Tracker]; nothing tracked during a previous run survives a restart.
pub struct Node<E: Spawner + Clock + RuntimeMetrics> {
    context: E,
    id: usize,
    validator: Validator,
    identity: PublicKey,
    address: Address,
    genesis: Genesis,
    cfg: sim::Config,
    fabric: Fabric<E>,
    registration: Arc<Registration>,
    metrics: Metrics,

    backend: Option<Backend<E>>,
    tracker: Option<Tracker<E>>,
    nonce: u64,
    sent: Vec<Transaction>,
}

impl<E: Spawner + Clock + RuntimeMetrics> Node<E> {
    /// Create a stopped node and make it reachable through `fabric`.
    pub fn new(
        context: E,
        id: usize,
        validator: Validator,
        genesis: Genesis,
        fabric: Fabric<E>,
        cfg: sim::Config,
    ) -> Self {
        let context = context.with_label(&format!("node_{id}"));
        let identity = validator.identity();
        let registration = Arc::new(Registration::default());
        fabric.register(identity, registration.clone());
        let metrics = Metrics::init(context.clone());
        Self {
            context,
            id,
            address: identity.address(),
            identity,
            validator,
            genesis,
            cfg,
            fabric,
            registration,
            metrics,
            backend: None,
            tracker: None,
            nonce: 0,
            sent: Vec::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn identity(&self) -> &PublicKey {
        &self.identity
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn is_running(&self) -> bool {
        self.backend.is_some()
    }

    /// Next nonce this node will use, unless its runtime already knows a higher one.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Transactions sent through [Node::send_value], across restarts.
    pub fn sent_transactions(&self) -> &[Transaction] {
        &self.sent
    }

    /// Launch the runtime, subscribe to its blocks and start tracking.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.is_running() {
            return Err(Error::AlreadyRunning(self.id));
        }
        let inbound = self.registration.open();
        let backend = Backend::start(
            self.context.clone(),
            self.id,
            self.identity,
            self.genesis.clone(),
            self.cfg.clone(),
            &self.fabric,
            inbound,
            self.metrics.clone(),
        );
        let started = backend
            .pending_nonce(&self.address)
            .map_err(Error::from)
            .and_then(|nonce| Ok((nonce, Tracker::start(self.context.clone(), &backend)?)));
        match started {
            Ok((nonce, tracker)) => {
                self.nonce = nonce;
                self.tracker = Some(tracker);
                self.backend = Some(backend);
                info!(node = self.id, address = %self.address, "node started");
                Ok(())
            }
            Err(err) => {
                self.registration.close();
                backend.stop();
                Err(err)
            }
        }
    }

    /// Stop tracking, close every connection and stop the runtime.
    pub fn close(&mut self) -> Result<(), Error> {
        let Some(backend) = self.backend.take() else {
            return Err(Error::NotRunning(self.id));
        };
        if let Some(tracker) = self.tracker.take() {
            tracker.stop();
        }
        self.registration.close();
        backend.stop();
        info!(node = self.id, "node closed");
        Ok(())
    }

    pub fn backend(&self) -> Result<&Backend<E>, Error> {
        self.backend.as_ref().ok_or(Error::NotRunning(self.id))
    }

    pub fn tracker(&self) -> Result<&Tracker<E>, Error> {
        self.tracker.as_ref().ok_or(Error::NotRunning(self.id))
    }

    /// Build and sign a transfer of `value` to `to` at the node's next nonce,
    /// priced and sized by the runtime's suggestions.
    ///
    /// The nonce is the larger of the local counter and the runtime's pending
    /// nonce, so transfers made before a restart count once the chain is synced.
    pub fn value_transfer_transaction(&self, to: &Address, value: u64) -> Result<Transaction, Error> {
        let backend = self.backend()?;
        let nonce = self.nonce.max(backend.pending_nonce(&self.address)?);
        let gas_price = backend.suggest_gas_price()?;
        let gas = backend.estimate_gas(&self.address, to, value)?;
        Ok(UnsignedTransaction {
            chain_id: self.genesis.chain_id,
            nonce,
            to: *to,
            value,
            gas,
            gas_price,
        }
        .sign(&self.validator.key))
    }

    /// Submit a transfer and record it as sent.
    pub fn send_value(&mut self, to: &Address, value: u64) -> Result<Hash, Error> {
        let tx = self.value_transfer_transaction(to, value)?;
        let hash = self.backend()?.send_transaction(tx.clone())?;
        debug!(node = self.id, %hash, nonce = tx.nonce, "sent transfer");
        self.nonce = tx.nonce + 1;
        self.sent.push(tx);
        Ok(hash)
    }

    /// Submit a transfer and wait until this node has mined it.
    pub async fn send_value_tracked(
        &mut self,
        to: &Address,
        value: u64,
        deadline: &Deadline,
    ) -> Result<Hash, Error> {
        let hash = self.send_value(to, value)?;
        self.await_transactions(&[hash], deadline).await?;
        Ok(hash)
    }

    /// Wait until every hash in `hashes` is included in a block seen by this node.
    pub async fn await_transactions(&self, hashes: &[Hash], deadline: &Deadline) -> Result<(), Error> {
        self.tracker()?
            .await_transactions(hashes, deadline)
            .await
            .map_err(Error::from)
    }

    /// Wait until every transaction sent by this node is included.
    pub async fn await_sent_transactions(&self, deadline: &Deadline) -> Result<(), Error> {
        let hashes: Vec<Hash> = self.sent.iter().map(Transaction::hash).collect();
        self.await_transactions(&hashes, deadline).await
    }

    /// The block that included `hash`, as observed by this run's tracker.
    pub fn processed_tx_block(&self, hash: &Hash) -> Option<Arc<Block>> {
        self.tracker.as_ref()?.processed_block(hash)
    }

    /// Fee paid by an included transaction.
    pub fn tx_fee(&self, hash: &Hash) -> Result<u64, Error> {
        let receipt = self
            .backend()?
            .receipt(hash)?
            .ok_or(chain::Error::UnknownTransaction(*hash))?;
        Ok(receipt.fee)
    }

    pub fn balance(&self, address: &Address) -> Result<u64, Error> {
        Ok(self.backend()?.balance(address)?)
    }

    pub fn chain_height(&self) -> Result<u64, Error> {
        Ok(self.backend()?.current_header()?.number)
    }

    pub fn is_sync_complete(&self) -> Result<bool, Error> {
        Ok(self.backend()?.sync_progress()?.is_complete())
    }
}

impl<E: Spawner + Clock + RuntimeMetrics> Member for Node<E> {
    fn id(&self) -> usize {
        self.id
    }

    fn reader(&self) -> Option<Arc<dyn Reader>> {
        let backend = self.backend.as_ref()?;
        Some(Arc::new(backend.clone()))
    }
}

impl<E: Spawner + Clock + RuntimeMetrics> Drop for Node<E> {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.close();
        }
    }
}
