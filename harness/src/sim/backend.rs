use super::{
    ledger::Ledger,
    metrics::{self, Metrics},
    peer::{self, Sessions},
    wire::{Message, MAX_GOSSIP_TRANSACTIONS, MAX_SYNC_BLOCKS},
    Config, Error,
};
use crate::{
    chain::{self, Client, Reader, Source, Subscription},
    genesis::Genesis,
    pipe::{Fabric, Inbound, Overlay},
    types::{Address, Block, Hash, Header, PublicKey, Receipt, SyncProgress, Transaction, TRANSFER_GAS},
};
use commonware_macros::select;
use commonware_runtime::{
    signal::{Signal, Signaler},
    Clock, Metrics as RuntimeMetrics, Spawner,
};
use futures::{channel::mpsc, StreamExt};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, SystemTime},
};
use tracing::{debug, info, info_span, trace, warn, Instrument, Span};

struct Chain {
    ledger: Ledger,
    imported_at: SystemTime,
}

/// A proposal opportunity.
#[derive(Clone, Copy, Debug)]
struct Slot {
    number: u64,
    round: u64,
    due: SystemTime,
}

struct Inner {
    id: usize,
    identity: PublicKey,
    address: Address,
    genesis: Genesis,
    cfg: Config,

    chain: Mutex<Chain>,
    sessions: Mutex<Sessions>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Arc<Block>>>>,

    /// Wakes the producer whenever the head changes.
    head: mpsc::UnboundedSender<()>,

    stopped: AtomicBool,
    signaler: Mutex<Option<Signaler>>,
    signal: Signal,

    metrics: Metrics,
    span: Span,
}

/// A running simulated node.
///
/// Cloning a [Backend] yields another handle to the same node.
#[derive(Clone)]
pub struct Backend<E: Spawner + Clock + RuntimeMetrics> {
    context: E,
    inner: Arc<Inner>,
}

impl<E: Spawner + Clock + RuntimeMetrics> Backend<E> {
    /// Start a node that serves `inbound` connections and dials the other
    /// validators of `genesis` through `fabric`.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        context: E,
        id: usize,
        identity: PublicKey,
        genesis: Genesis,
        cfg: Config,
        fabric: &Fabric<E>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        metrics: Metrics,
    ) -> Self {
        let span = info_span!("node", id);
        let ledger = Ledger::new(genesis.clone(), cfg.max_block_transactions);
        let (head, head_changes) = mpsc::unbounded();
        let (signaler, signal) = Signaler::new();
        let imported_at = context.current();
        let backend = Self {
            context,
            inner: Arc::new(Inner {
                id,
                identity,
                address: identity.address(),
                genesis,
                cfg,
                chain: Mutex::new(Chain {
                    ledger,
                    imported_at,
                }),
                sessions: Mutex::new(Sessions::default()),
                subscribers: Mutex::new(Vec::new()),
                head,
                stopped: AtomicBool::new(false),
                signaler: Mutex::new(Some(signaler)),
                signal,
                metrics,
                span: span.clone(),
            }),
        };

        let accept = peer::accept(backend.clone(), inbound).instrument(span.clone());
        backend
            .context
            .with_label("accept")
            .spawn(move |_| accept);
        let connect = peer::connect(backend.clone(), fabric.clone()).instrument(span.clone());
        backend
            .context
            .with_label("connect")
            .spawn(move |_| connect);
        let produce = backend
            .clone()
            .produce(head_changes)
            .instrument(span.clone());
        backend
            .context
            .with_label("producer")
            .spawn(move |_| produce);
        span.in_scope(|| info!(%identity, "started node"));
        backend
    }

    pub(super) fn context(&self) -> &E {
        &self.context
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn identity(&self) -> &PublicKey {
        &self.inner.identity
    }

    pub fn genesis(&self) -> &Genesis {
        &self.inner.genesis
    }

    pub fn config(&self) -> &Config {
        &self.inner.cfg
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Number of peers connected on `overlay`.
    pub fn peers(&self, overlay: Overlay) -> usize {
        self.sessions().connected(overlay)
    }

    /// A block of the canonical chain by hash.
    pub fn block_by_hash(&self, hash: &Hash) -> Result<Option<Arc<Block>>, chain::Error> {
        self.check()?;
        Ok(self.chain().ledger.block_by_hash(hash).cloned())
    }

    /// Stop every task of the node and close its subscriptions and sessions.
    ///
    /// Calling this more than once has no further effect.
    pub fn stop(&self) {
        {
            let mut subscribers = self.inner.subscribers.lock().unwrap();
            if self.inner.stopped.swap(true, Ordering::SeqCst) {
                return;
            }
            subscribers.clear();
        }
        if let Some(signaler) = self.inner.signaler.lock().unwrap().take() {
            let _ = signaler.signal(0);
        }
        self.sessions().close();
        self.inner.span.in_scope(|| info!("stopped node"));
    }

    fn check(&self) -> Result<(), chain::Error> {
        if self.is_stopped() {
            return Err(chain::Error::Stopped);
        }
        Ok(())
    }

    fn chain(&self) -> MutexGuard<'_, Chain> {
        self.inner.chain.lock().unwrap()
    }

    fn sessions(&self) -> MutexGuard<'_, Sessions> {
        self.inner.sessions.lock().unwrap()
    }

    fn height(&self) -> u64 {
        self.chain().ledger.height()
    }

    fn peer_height(&self) -> u64 {
        self.sessions().highest()
    }

    pub(super) fn signal(&self) -> Signal {
        self.inner.signal.clone()
    }

    pub(super) fn status(&self) -> Message {
        let chain = self.chain();
        let head = chain.ledger.head();
        Message::Status {
            height: head.number(),
            head: head.hash(),
        }
    }

    /// Pooled transactions to hand to a newly connected peer.
    pub(super) fn pooled(&self) -> Vec<Transaction> {
        self.chain().ledger.pooled(MAX_GOSSIP_TRANSACTIONS)
    }

    pub(super) fn register_session(
        &self,
        overlay: Overlay,
        remote: PublicKey,
        sender: mpsc::UnboundedSender<Message>,
    ) -> Option<u64> {
        self.sessions().register(overlay, remote, sender)
    }

    pub(super) fn remove_session(&self, overlay: Overlay, remote: &PublicKey, id: u64) {
        self.sessions().remove(overlay, remote, id);
    }

    pub(super) fn start_dial(&self, overlay: Overlay, remote: &PublicKey) -> bool {
        self.sessions().start_dial(overlay, remote)
    }

    pub(super) fn finish_dial(&self, overlay: Overlay, remote: &PublicKey) {
        self.sessions().finish_dial(overlay, remote);
    }

    fn broadcast(&self, overlay: Overlay, message: Message, except: Option<&PublicKey>) {
        let sent = self.sessions().broadcast(overlay, &message, except);
        trace!(%overlay, kind = message.kind(), sent, "broadcast message");
    }

    /// Process a message received from `remote`.
    pub(super) fn handle(
        &self,
        overlay: Overlay,
        remote: &PublicKey,
        message: Message,
        reply: &mpsc::UnboundedSender<Message>,
    ) {
        self.inner
            .metrics
            .messages
            .get_or_create(&metrics::Message::new(overlay, message.kind()))
            .inc();
        match message {
            Message::Status { height, .. } => {
                self.sessions().observe(overlay, remote, height);
                if height > self.height() {
                    self.request_sync(remote);
                }
            }
            Message::Transactions(transactions) => {
                self.inner
                    .metrics
                    .transactions_received
                    .inc_by(transactions.len() as u64);
                let fresh: Vec<Transaction> = {
                    let mut chain = self.chain();
                    transactions
                        .into_iter()
                        .filter(|tx| match chain.ledger.add_transaction(tx.clone()) {
                            Ok(added) => added,
                            Err(err) => {
                                trace!(peer = %remote, error = ?err, "rejected transaction");
                                false
                            }
                        })
                        .collect()
                };
                if !fresh.is_empty() {
                    self.broadcast(Overlay::Execution, Message::Transactions(fresh), Some(remote));
                }
            }
            Message::GetBlocks { from } => {
                let limit = self.inner.cfg.sync_batch.min(MAX_SYNC_BLOCKS);
                let blocks = self.chain().ledger.blocks_from(from, limit);
                if !blocks.is_empty() {
                    let _ = reply.unbounded_send(Message::Blocks(blocks));
                }
            }
            Message::Blocks(blocks) => {
                if let Some(last) = blocks.last() {
                    self.sessions().observe(overlay, remote, last.number());
                }
                self.import_synced(remote, blocks);
            }
            Message::Commit(block) => {
                self.sessions().observe(overlay, remote, block.number());
                self.import_commit(remote, block);
            }
        }
    }

    /// Ask `remote` (or the most advanced peer) for the blocks above our head.
    fn request_sync(&self, remote: &PublicKey) {
        let from = self.height() + 1;
        let Some(sender) = self.sessions().sync_target(Overlay::Execution, remote) else {
            return;
        };
        debug!(peer = %remote, from, "requesting blocks");
        let _ = sender.unbounded_send(Message::GetBlocks { from });
    }

    fn import_synced(&self, remote: &PublicKey, blocks: Vec<Block>) {
        for block in blocks {
            let number = block.number();
            match self.import(block) {
                Ok(_) => {}
                Err(Error::UnexpectedNumber(number, head)) if number <= head => {}
                Err(Error::UnknownParent(parent)) => {
                    // The peer serves a longer chain that does not extend ours.
                    let target = self
                        .height()
                        .saturating_sub(self.inner.cfg.sync_batch as u64);
                    warn!(peer = %remote, number, %parent, target, "chain diverged, rewinding");
                    if let Err(err) = self.rewind(target) {
                        warn!(error = ?err, "unable to rewind");
                        return;
                    }
                    break;
                }
                Err(err) => {
                    debug!(peer = %remote, number, error = ?err, "rejected synced block");
                    return;
                }
            }
        }
        if self.peer_height() > self.height() {
            self.request_sync(remote);
        }
    }

    fn import_commit(&self, remote: &PublicKey, block: Block) {
        let height = self.height();
        let number = block.number();
        if number <= height {
            return;
        }
        if number > height + 1 {
            self.request_sync(remote);
            return;
        }
        match self.import(block) {
            Ok(block) => self.broadcast(
                Overlay::Consensus,
                Message::Commit(block.as_ref().clone()),
                Some(remote),
            ),
            Err(Error::UnknownParent(_)) => self.request_sync(remote),
            Err(err) => debug!(peer = %remote, number, error = ?err, "rejected commit"),
        }
    }

    /// Append `block` to the chain and notify subscribers.
    fn import(&self, block: Block) -> Result<Arc<Block>, Error> {
        let block = {
            let mut chain = self.chain();
            let block = chain.ledger.import(block)?;
            chain.imported_at = self.context.current();

            // Publish under the chain lock so subscribers observe import order.
            self.inner
                .subscribers
                .lock()
                .unwrap()
                .retain(|subscriber| subscriber.unbounded_send(block.clone()).is_ok());
            block
        };
        self.inner.metrics.blocks_imported.inc();
        let _ = self.inner.head.unbounded_send(());
        debug!(
            number = block.number(),
            hash = %block.hash(),
            transactions = block.transactions.len(),
            "imported block"
        );
        Ok(block)
    }

    fn rewind(&self, height: u64) -> Result<(), Error> {
        {
            let mut chain = self.chain();
            chain.ledger.rewind(height)?;
            chain.imported_at = self.context.current();
        }
        let _ = self.inner.head.unbounded_send(());
        Ok(())
    }

    /// The next round at which this node proposes on top of the current head.
    ///
    /// Rounds that are already due or were `attempted` are skipped.
    fn next_slot(&self, attempted: Option<(u64, u64)>) -> Option<Slot> {
        let genesis = &self.inner.genesis;
        let n = genesis.validators.len() as u64;
        let index = genesis
            .validators
            .iter()
            .position(|account| account.identity == self.inner.identity)? as u64;

        let chain = self.chain();
        let number = chain.ledger.height() + 1;
        let now = self.context.current();
        let mut round = (index + n - number % n) % n;
        loop {
            let due = chain.imported_at + Duration::from_secs(genesis.round_offset(round));
            let fresh = match attempted {
                Some((height, last)) if height == number => round > last,
                _ => true,
            };
            if due >= now && fresh {
                return Some(Slot { number, round, due });
            }
            round += n;
        }
    }

    async fn produce(self, mut head: mpsc::UnboundedReceiver<()>) {
        let mut stop = self.signal();
        let mut attempted = None;
        loop {
            let Some(slot) = self.next_slot(attempted) else {
                debug!("not a validator, not proposing");
                return;
            };
            select! {
                _ = &mut stop => {
                    return;
                },
                changed = head.next() => {
                    if changed.is_none() {
                        return;
                    }

                    // Coalesce head changes that arrived together.
                    while let Ok(Some(())) = head.try_next() {}
                    continue;
                },
                _ = self.context.sleep_until(slot.due) => {},
            }
            attempted = Some((slot.number, slot.round));
            self.propose(slot);
        }
    }

    fn propose(&self, slot: Slot) {
        let peers = self.peer_height();
        let block = {
            let chain = self.chain();
            let height = chain.ledger.height();
            if height + 1 != slot.number {
                return;
            }
            if peers > height {
                debug!(height, peers, "behind peers, not proposing");
                return;
            }
            let time = chain.ledger.head().header.time + self.inner.genesis.round_offset(slot.round);
            chain.ledger.build(self.inner.address, time)
        };
        match self.import(block) {
            Ok(block) => {
                self.inner.metrics.blocks_proposed.inc();
                info!(
                    number = block.number(),
                    round = slot.round,
                    transactions = block.transactions.len(),
                    "proposed block"
                );
                self.broadcast(
                    Overlay::Consensus,
                    Message::Commit(block.as_ref().clone()),
                    None,
                );
            }
            Err(err) => warn!(error = ?err, "unable to import proposal"),
        }
    }
}

impl<E: Spawner + Clock + RuntimeMetrics> Reader for Backend<E> {
    fn current_header(&self) -> Result<Header, chain::Error> {
        self.check()?;
        Ok(self.chain().ledger.head().header.clone())
    }

    fn header_by_hash(&self, hash: &Hash) -> Result<Option<Header>, chain::Error> {
        self.check()?;
        Ok(self.chain().ledger.header_by_hash(hash))
    }

    fn sync_progress(&self) -> Result<SyncProgress, chain::Error> {
        self.check()?;
        let highest = self.peer_height();
        let current = self.height();
        Ok(SyncProgress {
            current,
            highest: highest.max(current),
        })
    }
}

impl<E: Spawner + Clock + RuntimeMetrics> Source for Backend<E> {
    fn subscribe(&self) -> Result<Subscription, chain::Error> {
        let mut subscribers = self.inner.subscribers.lock().unwrap();
        self.check()?;
        let (sender, subscription) = Subscription::new();
        subscribers.push(sender);
        Ok(subscription)
    }
}

impl<E: Spawner + Clock + RuntimeMetrics> Client for Backend<E> {
    fn send_transaction(&self, tx: Transaction) -> Result<Hash, chain::Error> {
        self.check()?;
        let hash = tx.hash();
        let added = self.chain().ledger.add_transaction(tx.clone())?;
        if added {
            debug!(%hash, nonce = tx.nonce, "submitted transaction");
            self.broadcast(Overlay::Execution, Message::Transactions(vec![tx]), None);
        }
        Ok(hash)
    }

    fn pending_nonce(&self, address: &Address) -> Result<u64, chain::Error> {
        self.check()?;
        Ok(self.chain().ledger.pending_nonce(address))
    }

    fn balance(&self, address: &Address) -> Result<u64, chain::Error> {
        self.check()?;
        Ok(self.chain().ledger.balance(address))
    }

    fn receipt(&self, hash: &Hash) -> Result<Option<Receipt>, chain::Error> {
        self.check()?;
        Ok(self.chain().ledger.receipt(hash))
    }

    fn suggest_gas_price(&self) -> Result<u64, chain::Error> {
        self.check()?;
        Ok(self.inner.genesis.min_gas_price)
    }

    fn estimate_gas(&self, from: &Address, _to: &Address, value: u64) -> Result<u64, chain::Error> {
        self.check()?;
        let balance = self.chain().ledger.balance(from);
        if balance < value {
            return Err(chain::Error::InsufficientFunds(balance, value));
        }
        Ok(TRANSFER_GAS)
    }
}
