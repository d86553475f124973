//! Connect simulated nodes over in-memory pipes.
//!
//! Each overlay (execution gossip and consensus gossip) gets its own [Manager] so
//! that connections never cross from one overlay to the other. Nodes [register]
//! a [Peer] handle with both managers and obtain a [Dialer] per overlay. A
//! successful [Dialer::dial] returns one [Endpoint] of a fresh pipe and hands
//! the other to the destination's matching overlay server.
//!
//! A dial to a peer that is unknown or not yet running is retried once after
//! [Config::retry_delay] to tolerate start-up races. Nothing is cached between
//! dials: a peer that was down a moment ago may be up now.
//!
//! [register]: Manager::register

mod manager;
mod metrics;

pub use manager::{Dialer, Manager};

use crate::types::PublicKey;
use commonware_runtime::{
    mocks,
    signal::{Signal, Signaler},
    Clock, Metrics, Spawner,
};
use std::{fmt, time::Duration};
use thiserror::Error;

/// Default delay before re-checking a peer that was not running.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Errors that can occur when dialing a peer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("peer not running: {0}")]
    PeerNotRunning(PublicKey),
}

/// One of the two independent peer-to-peer transports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Overlay {
    /// Transaction gossip and block synchronisation.
    Execution,
    /// Block announcements from proposers.
    Consensus,
}

impl Overlay {
    pub const ALL: [Overlay; 2] = [Overlay::Execution, Overlay::Consensus];

    pub fn as_str(&self) -> &'static str {
        match self {
            Overlay::Execution => "execution",
            Overlay::Consensus => "consensus",
        }
    }
}

impl fmt::Display for Overlay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One end of an in-memory pipe.
pub struct Endpoint {
    pub sink: mocks::Sink,
    pub stream: mocks::Stream,

    /// Resolves (with an error) once the remote end drops its `alive` handle.
    pub closed: Signal,

    /// Dropping this closes the pipe for the remote end.
    pub alive: Signaler,
}

impl Endpoint {
    /// Create both ends of a pipe.
    pub fn pair() -> (Endpoint, Endpoint) {
        let (local_sink, remote_stream) = mocks::Channel::init();
        let (remote_sink, local_stream) = mocks::Channel::init();
        let (local_alive, local_closed) = Signaler::new();
        let (remote_alive, remote_closed) = Signaler::new();
        (
            Endpoint {
                sink: local_sink,
                stream: local_stream,
                closed: remote_closed,
                alive: local_alive,
            },
            Endpoint {
                sink: remote_sink,
                stream: remote_stream,
                closed: local_closed,
                alive: remote_alive,
            },
        )
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint").finish_non_exhaustive()
    }
}

/// A connection handed to an overlay server.
#[derive(Debug)]
pub struct Inbound {
    /// Identity of the dialing node.
    pub remote: PublicKey,
    pub overlay: Overlay,
    pub endpoint: Endpoint,
    /// Hint for how many peers the server should expect on this connection.
    pub peers: usize,
}

/// A node reachable through a [Manager].
pub trait Peer: Send + Sync + 'static {
    /// Whether the node currently accepts connections.
    fn is_running(&self) -> bool;

    /// Hand an inbound connection to the node's server for `inbound.overlay`.
    fn accept(&self, inbound: Inbound);
}

/// Configuration for a [Manager].
#[derive(Clone, Debug)]
pub struct Config {
    /// Delay before re-checking a peer that was absent or not running.
    pub retry_delay: Duration,

    /// Peer-count hint attached to every [Inbound].
    pub peers_hint: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
            peers_hint: 1,
        }
    }
}

/// The pair of managers shared by every node of a cluster.
#[derive(Clone)]
pub struct Fabric<E: Spawner + Clock + Metrics> {
    pub execution: Manager<E>,
    pub consensus: Manager<E>,
}

impl<E: Spawner + Clock + Metrics> Fabric<E> {
    /// Create one [Manager] per [Overlay].
    pub fn new(context: E, cfg: Config) -> Self {
        Self {
            execution: Manager::new(context.clone(), Overlay::Execution, cfg.clone()),
            consensus: Manager::new(context, Overlay::Consensus, cfg),
        }
    }

    pub fn manager(&self, overlay: Overlay) -> &Manager<E> {
        match overlay {
            Overlay::Execution => &self.execution,
            Overlay::Consensus => &self.consensus,
        }
    }

    /// Register `peer` with both overlays.
    pub fn register(&self, identity: PublicKey, peer: std::sync::Arc<dyn Peer>) {
        self.execution.register(identity, peer.clone());
        self.consensus.register(identity, peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner};
    use commonware_stream::utils::codec::{recv_frame, send_frame};
    use futures::{channel::mpsc, StreamExt};
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::SystemTime,
    };

    struct MockPeer {
        running: AtomicBool,
        inbound: mpsc::UnboundedSender<Inbound>,
    }

    impl MockPeer {
        fn new(running: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<Inbound>) {
            let (inbound, receiver) = mpsc::unbounded();
            (
                Arc::new(Self {
                    running: AtomicBool::new(running),
                    inbound,
                }),
                receiver,
            )
        }
    }

    impl Peer for MockPeer {
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn accept(&self, inbound: Inbound) {
            let _ = self.inbound.unbounded_send(inbound);
        }
    }

    fn identity(seed: u8) -> PublicKey {
        let mut key = [seed; 33];
        key[0] = 2;
        PublicKey(key)
    }

    fn elapsed(context: &deterministic::Context, start: SystemTime) -> Duration {
        context.current().duration_since(start).unwrap()
    }

    #[test_traced]
    fn test_dial_unregistered_fails_after_one_retry() {
        let executor = deterministic::Runner::timed(Duration::from_secs(10));
        executor.start(|context| async move {
            let manager = Manager::new(context.clone(), Overlay::Execution, Config::default());
            let dialer = manager.dialer(identity(1));
            for _ in 0..3 {
                let start = context.current();
                let err = dialer.dial(&identity(2)).await.unwrap_err();
                assert_eq!(err, Error::PeerNotRunning(identity(2)));
                let elapsed = elapsed(&context, start);
                assert!(elapsed >= DEFAULT_RETRY_DELAY && elapsed < 2 * DEFAULT_RETRY_DELAY);
            }
            assert!(context.encode().contains("execution_dials"));
        });
    }

    #[test_traced]
    fn test_dial_stopped_peer_fails() {
        let executor = deterministic::Runner::timed(Duration::from_secs(10));
        executor.start(|context| async move {
            let manager = Manager::new(context, Overlay::Execution, Config::default());
            let (peer, _inbound) = MockPeer::new(false);
            manager.register(identity(2), peer);
            let err = manager.dialer(identity(1)).dial(&identity(2)).await;
            assert_eq!(err.unwrap_err(), Error::PeerNotRunning(identity(2)));
        });
    }

    #[test_traced]
    fn test_dial_connects_both_ends() {
        let executor = deterministic::Runner::timed(Duration::from_secs(10));
        executor.start(|context| async move {
            let manager = Manager::new(context.clone(), Overlay::Consensus, Config::default());
            let (peer, mut inbound) = MockPeer::new(true);
            manager.register(identity(2), peer);

            let start = context.current();
            let mut local = manager.dialer(identity(1)).dial(&identity(2)).await.unwrap();
            assert!(elapsed(&context, start) < DEFAULT_RETRY_DELAY);

            let mut remote = inbound.next().await.unwrap();
            assert_eq!(remote.remote, identity(1));
            assert_eq!(remote.overlay, Overlay::Consensus);
            assert_eq!(remote.peers, 1);

            send_frame(&mut local.sink, b"ping", 16).await.unwrap();
            let frame = recv_frame(&mut remote.endpoint.stream, 16).await.unwrap();
            assert_eq!(&frame[..], b"ping");

            send_frame(&mut remote.endpoint.sink, b"pong", 16).await.unwrap();
            let frame = recv_frame(&mut local.stream, 16).await.unwrap();
            assert_eq!(&frame[..], b"pong");
        });
    }

    #[test_traced]
    fn test_dropped_endpoint_closes_remote() {
        let executor = deterministic::Runner::timed(Duration::from_secs(10));
        executor.start(|_| async move {
            let (local, remote) = Endpoint::pair();
            drop(local);
            assert!(remote.closed.await.is_err());
        });
    }

    #[test_traced]
    fn test_dial_succeeds_when_peer_starts_within_retry() {
        let executor = deterministic::Runner::timed(Duration::from_secs(10));
        executor.start(|context| async move {
            let manager = Manager::new(context.clone(), Overlay::Execution, Config::default());
            let (peer, mut inbound) = MockPeer::new(false);
            manager.register(identity(2), peer.clone());

            let dialer = manager.dialer(identity(1));
            let dial = context
                .clone()
                .spawn(|_| async move { dialer.dial(&identity(2)).await });
            context.sleep(DEFAULT_RETRY_DELAY / 2).await;
            peer.running.store(true, Ordering::SeqCst);

            assert!(dial.await.unwrap().is_ok());
            assert_eq!(inbound.next().await.unwrap().remote, identity(1));
        });
    }

    #[test_traced]
    fn test_dial_succeeds_when_peer_registers_within_retry() {
        let executor = deterministic::Runner::timed(Duration::from_secs(10));
        executor.start(|context| async move {
            let manager = Manager::new(context.clone(), Overlay::Execution, Config::default());
            let dialer = manager.dialer(identity(1));
            let dial = context
                .clone()
                .spawn(|_| async move { dialer.dial(&identity(2)).await });
            context.sleep(DEFAULT_RETRY_DELAY / 2).await;

            let (peer, mut inbound) = MockPeer::new(true);
            manager.register(identity(2), peer);
            assert!(dial.await.unwrap().is_ok());
            assert!(inbound.next().await.is_some());
        });
    }

    #[test_traced]
    fn test_overlays_do_not_cross() {
        let executor = deterministic::Runner::timed(Duration::from_secs(10));
        executor.start(|context| async move {
            let fabric = Fabric::new(context, Config::default());
            let (peer, mut inbound) = MockPeer::new(true);
            fabric.register(identity(2), peer);

            fabric
                .consensus
                .dialer(identity(1))
                .dial(&identity(2))
                .await
                .unwrap();
            fabric
                .execution
                .dialer(identity(3))
                .dial(&identity(2))
                .await
                .unwrap();

            let first = inbound.next().await.unwrap();
            let second = inbound.next().await.unwrap();
            let mut seen = vec![(first.overlay, first.remote), (second.overlay, second.remote)];
            seen.sort();
            assert_eq!(
                seen,
                vec![
                    (Overlay::Execution, identity(3)),
                    (Overlay::Consensus, identity(1))
                ]
            );
        });
    }

    #[test_traced]
    fn test_concurrent_dials_get_independent_pipes() {
        let executor = deterministic::Runner::timed(Duration::from_secs(10));
        executor.start(|context| async move {
            let manager = Manager::new(context, Overlay::Execution, Config::default());
            let (peer, mut inbound) = MockPeer::new(true);
            manager.register(identity(9), peer);

            let dials = (1..=4u8).map(|i| {
                let dialer = manager.dialer(identity(i));
                async move { dialer.dial(&identity(9)).await }
            });
            let results = futures::future::join_all(dials).await;
            assert!(results.iter().all(Result::is_ok));

            let mut remotes = Vec::new();
            for _ in 0..4 {
                remotes.push(inbound.next().await.unwrap().remote);
            }
            remotes.sort();
            assert_eq!(remotes, (1..=4u8).map(identity).collect::<Vec<_>>());
        });
    }
}
