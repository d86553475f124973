//! Resolve transaction hashes to the blocks that include them.
//!
//! A [Tracker] consumes a node's block [Subscription] in delivery order and
//! records, for every transaction of every block, the first block that included
//! it. Callers block on [Tracker::await_transactions] until a set of hashes has
//! been observed, a [Deadline] fires, or the tracker stops.

use crate::{
    chain::{self, Source, Subscription},
    deadline::{Deadline, Expired},
    types::{Block, Hash},
};
use commonware_macros::select;
use commonware_runtime::{Clock, Spawner};
use futures::channel::oneshot;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};
use thiserror::Error;
use tracing::{debug, trace};

/// Errors that can occur when tracking transactions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("subscription failed: {0}")]
    Subscription(chain::Error),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("canceled")]
    Canceled,
    #[error("tracker stopped")]
    Stopped,
}

struct Waiter {
    outstanding: HashSet<Hash>,
    done: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct State {
    resolved: HashMap<Hash, Arc<Block>>,
    waiters: HashMap<u64, Waiter>,
    next_id: u64,
    stopped: bool,
}

impl State {
    fn process(&mut self, block: Arc<Block>) {
        for hash in block.transaction_hashes() {
            if self.resolved.contains_key(&hash) {
                continue;
            }
            self.resolved.insert(hash, block.clone());
            self.waiters.retain(|_, waiter| {
                waiter.outstanding.remove(&hash);
                if !waiter.outstanding.is_empty() {
                    return true;
                }
                if let Some(done) = waiter.done.take() {
                    let _ = done.send(());
                }
                false
            });
        }
    }

    fn stop(&mut self) {
        self.stopped = true;

        // Dropping the senders wakes every waiter with a cancellation.
        self.waiters.clear();
    }
}

/// Deregisters a waiter when the wait ends for any reason.
struct Registration<'a> {
    state: &'a Mutex<State>,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.state.lock().unwrap().waiters.remove(&self.id);
    }
}

/// Tracks mined transactions for one node.
#[derive(Clone)]
pub struct Tracker<E: Spawner + Clock> {
    context: E,
    state: Arc<Mutex<State>>,
    stop: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl<E: Spawner + Clock> Tracker<E> {
    /// Subscribe to `source` and start recording mined transactions.
    pub fn start(context: E, source: &impl Source) -> Result<Self, Error> {
        let subscription = source.subscribe().map_err(Error::Subscription)?;
        let state = Arc::new(Mutex::new(State::default()));
        let (stop_tx, stop_rx) = oneshot::channel();
        let run = Self::run(subscription, state.clone(), stop_rx);
        context.with_label("tracker").spawn(move |_| run);
        Ok(Self {
            context,
            state,
            stop: Arc::new(Mutex::new(Some(stop_tx))),
        })
    }

    async fn run(
        mut subscription: Subscription,
        state: Arc<Mutex<State>>,
        mut stop: oneshot::Receiver<()>,
    ) {
        loop {
            let block = select! {
                _ = &mut stop => {
                    debug!("tracker stopped");
                    break;
                },
                block = subscription.next() => {
                    match block {
                        Some(block) => block,
                        None => {
                            debug!("block subscription closed");
                            break;
                        }
                    }
                },
            };
            trace!(
                number = block.number(),
                transactions = block.transactions.len(),
                "processing block"
            );
            state.lock().unwrap().process(block);
        }
        subscription.unsubscribe();
        state.lock().unwrap().stop();
    }

    /// Stop consuming blocks and release every waiter with [Error::Stopped].
    ///
    /// Calling this more than once has no further effect.
    pub fn stop(&self) {
        if let Some(stop) = self.stop.lock().unwrap().take() {
            let _ = stop.send(());
        }

        // Mark stopped synchronously so that new waits fail immediately.
        self.state.lock().unwrap().stop();
    }

    /// Whether the tracker still consumes blocks.
    pub fn is_running(&self) -> bool {
        !self.state.lock().unwrap().stopped
    }

    /// Block until every hash in `hashes` has been observed in a mined block.
    ///
    /// Returns immediately if `hashes` is empty or already resolved.
    pub async fn await_transactions(
        &self,
        hashes: &[Hash],
        deadline: &Deadline,
    ) -> Result<(), Error> {
        let (registration, done) = {
            let mut state = self.state.lock().unwrap();
            let outstanding: HashSet<Hash> = hashes
                .iter()
                .filter(|hash| !state.resolved.contains_key(hash))
                .copied()
                .collect();
            if outstanding.is_empty() {
                return Ok(());
            }
            if state.stopped {
                return Err(Error::Stopped);
            }
            let id = state.next_id;
            state.next_id += 1;
            let (done_tx, done_rx) = oneshot::channel();
            state.waiters.insert(
                id,
                Waiter {
                    outstanding,
                    done: Some(done_tx),
                },
            );
            (
                Registration {
                    state: &self.state,
                    id,
                },
                done_rx,
            )
        };

        let result = select! {
            result = done => {
                result.map_err(|_| Error::Stopped)
            },
            expired = deadline.expired(&self.context) => {
                match expired {
                    Expired::Timeout => Err(Error::DeadlineExceeded),
                    Expired::Canceled => Err(Error::Canceled),
                }
            },
        };
        drop(registration);
        result
    }

    /// The block that first included `hash`, if it has been observed.
    pub fn processed_block(&self, hash: &Hash) -> Option<Arc<Block>> {
        self.state.lock().unwrap().resolved.get(hash).cloned()
    }

    #[cfg(test)]
    fn waiters(&self) -> usize {
        self.state.lock().unwrap().waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Address, Transaction, UnsignedTransaction, TRANSFER_GAS};
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, signal::Signaler, Runner};
    use futures::channel::mpsc;
    use p256::ecdsa::SigningKey;
    use rand::{rngs::StdRng, SeedableRng};
    use std::time::Duration;

    struct MockSource {
        senders: Mutex<Vec<mpsc::UnboundedSender<Arc<Block>>>>,
        fail: bool,
    }

    impl MockSource {
        fn new() -> Self {
            Self {
                senders: Mutex::new(Vec::new()),
                fail: false,
            }
        }

        fn publish(&self, block: Block) {
            let block = Arc::new(block);
            for sender in self.senders.lock().unwrap().iter() {
                let _ = sender.unbounded_send(block.clone());
            }
        }

        fn close(&self) {
            self.senders.lock().unwrap().clear();
        }
    }

    impl Source for MockSource {
        fn subscribe(&self) -> Result<Subscription, chain::Error> {
            if self.fail {
                return Err(chain::Error::Stopped);
            }
            let (sender, subscription) = Subscription::new();
            self.senders.lock().unwrap().push(sender);
            Ok(subscription)
        }
    }

    fn transfer(nonce: u64) -> Transaction {
        let key = SigningKey::random(&mut StdRng::seed_from_u64(7));
        UnsignedTransaction {
            chain_id: 1,
            nonce,
            to: Address([1u8; 20]),
            value: 1,
            gas: TRANSFER_GAS,
            gas_price: 1,
        }
        .sign(&key)
    }

    fn block(number: u64, transactions: Vec<Transaction>) -> Block {
        Block::new(number, Hash::default(), number, Address::default(), transactions)
    }

    #[test_traced]
    fn test_subscription_failure() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let source = MockSource {
                senders: Mutex::new(Vec::new()),
                fail: true,
            };
            assert!(matches!(
                Tracker::start(context, &source),
                Err(Error::Subscription(chain::Error::Stopped))
            ));
        });
    }

    #[test_traced]
    fn test_empty_and_resolved_return_immediately() {
        let executor = deterministic::Runner::timed(Duration::from_secs(10));
        executor.start(|context| async move {
            let source = MockSource::new();
            let tracker = Tracker::start(context.clone(), &source).unwrap();
            let start = context.current();
            tracker
                .await_transactions(&[], &Deadline::after(&context, Duration::from_secs(1)))
                .await
                .unwrap();
            assert_eq!(context.current(), start);

            let tx = transfer(0);
            source.publish(block(1, vec![tx.clone()]));
            context.sleep(Duration::from_millis(1)).await;
            let start = context.current();
            tracker
                .await_transactions(
                    &[tx.hash()],
                    &Deadline::after(&context, Duration::from_secs(1)),
                )
                .await
                .unwrap();
            assert_eq!(context.current(), start);
        });
    }

    #[test_traced]
    fn test_await_resolves_across_blocks() {
        let executor = deterministic::Runner::timed(Duration::from_secs(20));
        executor.start(|context| async move {
            let source = MockSource::new();
            let tracker = Tracker::start(context.clone(), &source).unwrap();
            let (a, b) = (transfer(0), transfer(1));
            let hashes = [a.hash(), b.hash()];

            let waiter = {
                let tracker = tracker.clone();
                context.clone().spawn(move |context| async move {
                    tracker
                        .await_transactions(
                            &hashes,
                            &Deadline::after(&context, Duration::from_secs(10)),
                        )
                        .await
                })
            };
            context.sleep(Duration::from_secs(1)).await;
            source.publish(block(1, vec![a.clone()]));
            context.sleep(Duration::from_secs(1)).await;
            assert_eq!(tracker.waiters(), 1);
            source.publish(block(2, vec![b.clone()]));

            assert_eq!(waiter.await.unwrap(), Ok(()));
            assert_eq!(tracker.processed_block(&a.hash()).unwrap().number(), 1);
            assert_eq!(tracker.processed_block(&b.hash()).unwrap().number(), 2);
            assert_eq!(tracker.waiters(), 0);
        });
    }

    #[test_traced]
    fn test_first_resolution_wins() {
        let executor = deterministic::Runner::timed(Duration::from_secs(10));
        executor.start(|context| async move {
            let source = MockSource::new();
            let tracker = Tracker::start(context.clone(), &source).unwrap();
            let tx = transfer(0);
            source.publish(block(3, vec![tx.clone()]));
            source.publish(block(4, vec![tx.clone()]));
            context.sleep(Duration::from_millis(1)).await;
            assert_eq!(tracker.processed_block(&tx.hash()).unwrap().number(), 3);
            assert!(tracker.processed_block(&transfer(9).hash()).is_none());
        });
    }

    #[test_traced]
    fn test_deadline_exceeded_deregisters() {
        let executor = deterministic::Runner::timed(Duration::from_secs(10));
        executor.start(|context| async move {
            let source = MockSource::new();
            let tracker = Tracker::start(context.clone(), &source).unwrap();
            let deadline = Deadline::after(&context, Duration::from_secs(5));
            let result = tracker
                .await_transactions(&[transfer(0).hash()], &deadline)
                .await;
            assert_eq!(result, Err(Error::DeadlineExceeded));
            assert!(context.current() >= deadline.time());
            assert_eq!(tracker.waiters(), 0);
        });
    }

    #[test_traced]
    fn test_canceled() {
        let executor = deterministic::Runner::timed(Duration::from_secs(10));
        executor.start(|context| async move {
            let source = MockSource::new();
            let tracker = Tracker::start(context.clone(), &source).unwrap();
            let (signaler, signal) = Signaler::new();
            let deadline = Deadline::after(&context, Duration::from_secs(60)).with_cancel(signal);
            context.clone().spawn(|context| async move {
                context.sleep(Duration::from_secs(2)).await;
                let _ = signaler.signal(0);
            });
            let result = tracker
                .await_transactions(&[transfer(0).hash()], &deadline)
                .await;
            assert_eq!(result, Err(Error::Canceled));
            assert_eq!(tracker.waiters(), 0);
        });
    }

    #[test_traced]
    fn test_stop_releases_waiters() {
        let executor = deterministic::Runner::timed(Duration::from_secs(10));
        executor.start(|context| async move {
            let source = MockSource::new();
            let tracker = Tracker::start(context.clone(), &source).unwrap();
            let waiter = {
                let tracker = tracker.clone();
                context.clone().spawn(move |context| async move {
                    tracker
                        .await_transactions(
                            &[transfer(0).hash()],
                            &Deadline::after(&context, Duration::from_secs(60)),
                        )
                        .await
                })
            };
            context.sleep(Duration::from_secs(1)).await;
            tracker.stop();
            tracker.stop();
            assert_eq!(waiter.await.unwrap(), Err(Error::Stopped));
            assert!(!tracker.is_running());

            // Resolved hashes stay retrievable, new waits on pending ones fail.
            let result = tracker
                .await_transactions(
                    &[transfer(1).hash()],
                    &Deadline::after(&context, Duration::from_secs(1)),
                )
                .await;
            assert_eq!(result, Err(Error::Stopped));
        });
    }

    #[test_traced]
    fn test_source_closed_stops_tracker() {
        let executor = deterministic::Runner::timed(Duration::from_secs(10));
        executor.start(|context| async move {
            let source = MockSource::new();
            let tracker = Tracker::start(context.clone(), &source).unwrap();
            let tx = transfer(0);
            source.publish(block(1, vec![tx.clone()]));
            source.close();
            context.sleep(Duration::from_millis(1)).await;
            assert!(!tracker.is_running());
            assert!(tracker.processed_block(&tx.hash()).is_some());
            tracker
                .await_transactions(
                    &[tx.hash()],
                    &Deadline::after(&context, Duration::from_secs(1)),
                )
                .await
                .unwrap();
        });
    }

    #[test_traced]
    fn test_stop_unsubscribes() {
        let executor = deterministic::Runner::timed(Duration::from_secs(10));
        executor.start(|context| async move {
            let source = MockSource::new();
            let tracker = Tracker::start(context.clone(), &source).unwrap();
            tracker.stop();
            context.sleep(Duration::from_millis(1)).await;
            let sender = source.senders.lock().unwrap()[0].clone();
            assert!(sender.is_closed());
        });
    }
}
