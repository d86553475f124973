//! Connections between simulated nodes.

use super::{wire, Backend};
use crate::{
    pipe::{Dialer, Endpoint, Fabric, Inbound, Overlay},
    types::PublicKey,
};
use commonware_macros::select;
use commonware_runtime::{Clock, Handle, Metrics, Spawner};
use futures::{channel::mpsc, StreamExt};
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace, Instrument, Span};

struct Session {
    id: u64,
    sender: mpsc::UnboundedSender<wire::Message>,
    height: u64,
}

/// Open sessions and in-flight dials of one node.
#[derive(Default)]
pub(super) struct Sessions {
    next_id: u64,
    active: HashMap<(Overlay, PublicKey), Session>,
    dialing: HashSet<(Overlay, PublicKey)>,
    closed: bool,
}

impl Sessions {
    /// Track a new session, replacing any older session with the same peer.
    ///
    /// Returns `None` once the node has stopped.
    pub fn register(
        &mut self,
        overlay: Overlay,
        remote: PublicKey,
        sender: mpsc::UnboundedSender<wire::Message>,
    ) -> Option<u64> {
        if self.closed {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.dialing.remove(&(overlay, remote));
        let height = self
            .active
            .get(&(overlay, remote))
            .map(|session| session.height)
            .unwrap_or_default();
        self.active.insert(
            (overlay, remote),
            Session {
                id,
                sender,
                height,
            },
        );
        Some(id)
    }

    pub fn remove(&mut self, overlay: Overlay, remote: &PublicKey, id: u64) {
        let key = (overlay, *remote);
        if self.active.get(&key).map(|session| session.id) == Some(id) {
            self.active.remove(&key);
        }
    }

    /// Record that `remote` has reached `height`.
    pub fn observe(&mut self, overlay: Overlay, remote: &PublicKey, height: u64) {
        if let Some(session) = self.active.get_mut(&(overlay, *remote)) {
            session.height = session.height.max(height);
        }
    }

    /// Highest height reported by any connected peer.
    pub fn highest(&self) -> u64 {
        self.active
            .values()
            .map(|session| session.height)
            .max()
            .unwrap_or_default()
    }

    /// The session with `remote`, or else the session with the highest peer.
    pub fn sync_target(
        &self,
        overlay: Overlay,
        remote: &PublicKey,
    ) -> Option<mpsc::UnboundedSender<wire::Message>> {
        if let Some(session) = self.active.get(&(overlay, *remote)) {
            return Some(session.sender.clone());
        }
        self.active
            .iter()
            .filter(|((kind, _), _)| *kind == overlay)
            .max_by_key(|(_, session)| session.height)
            .map(|(_, session)| session.sender.clone())
    }

    /// Send `message` to every peer on `overlay` except `except`.
    pub fn broadcast(
        &self,
        overlay: Overlay,
        message: &wire::Message,
        except: Option<&PublicKey>,
    ) -> usize {
        let mut sent = 0;
        for ((kind, remote), session) in &self.active {
            if *kind != overlay || Some(remote) == except {
                continue;
            }
            if session.sender.unbounded_send(message.clone()).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    pub fn connected(&self, overlay: Overlay) -> usize {
        self.active.keys().filter(|(kind, _)| *kind == overlay).count()
    }

    /// Reserve a dial to `remote`, returning false if one is not needed.
    pub fn start_dial(&mut self, overlay: Overlay, remote: &PublicKey) -> bool {
        let key = (overlay, *remote);
        if self.closed || self.active.contains_key(&key) || self.dialing.contains(&key) {
            return false;
        }
        self.dialing.insert(key);
        true
    }

    pub fn finish_dial(&mut self, overlay: Overlay, remote: &PublicKey) {
        self.dialing.remove(&(overlay, *remote));
    }

    /// Drop every session and refuse new ones.
    pub fn close(&mut self) {
        self.closed = true;
        self.active.clear();
        self.dialing.clear();
    }
}

/// Serve inbound connections until the node stops.
pub(super) async fn accept<E: Spawner + Clock + Metrics>(
    backend: Backend<E>,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
) {
    let mut stop = backend.signal();
    loop {
        let inbound = select! {
            _ = &mut stop => {
                return;
            },
            inbound = inbound.next() => {
                match inbound {
                    Some(inbound) => inbound,
                    None => return,
                }
            },
        };
        trace!(overlay = %inbound.overlay, peer = %inbound.remote, peers = inbound.peers, "accepted connection");
        let session = run(
            backend.clone(),
            inbound.overlay,
            inbound.remote,
            inbound.endpoint,
        )
        .instrument(Span::current());
        backend
            .context()
            .with_label("session")
            .spawn(move |_| session);
    }
}

/// Dial every other validator that is not connected, on both overlays.
pub(super) async fn connect<E: Spawner + Clock + Metrics>(backend: Backend<E>, fabric: Fabric<E>) {
    let identity = *backend.identity();
    let peers: Vec<PublicKey> = backend
        .genesis()
        .validators
        .iter()
        .map(|account| account.identity)
        .filter(|peer| *peer != identity)
        .collect();
    let dialers: Vec<Dialer<E>> = Overlay::ALL
        .iter()
        .map(|overlay| fabric.manager(*overlay).dialer(identity))
        .collect();
    let redial_interval = backend.config().redial_interval;

    let mut stop = backend.signal();
    loop {
        for dialer in &dialers {
            let overlay = dialer.overlay();
            for peer in &peers {
                if !backend.start_dial(overlay, peer) {
                    continue;
                }
                let session = {
                    let backend = backend.clone();
                    let dialer = dialer.clone();
                    let peer = *peer;
                    async move {
                        match dialer.dial(&peer).await {
                            Ok(endpoint) => run(backend, overlay, peer, endpoint).await,
                            Err(err) => {
                                backend.finish_dial(overlay, &peer);
                                trace!(%overlay, error = ?err, "dial failed");
                            }
                        }
                    }
                    .instrument(Span::current())
                };
                backend.context().with_label("dial").spawn(move |_| session);
            }
        }
        select! {
            _ = &mut stop => {
                return;
            },
            _ = backend.context().sleep(redial_interval) => {},
        }
    }
}

/// Exchange messages with `remote` until either side goes away.
async fn run<E: Spawner + Clock + Metrics>(
    backend: Backend<E>,
    overlay: Overlay,
    remote: PublicKey,
    endpoint: Endpoint,
) {
    let Endpoint {
        mut sink,
        mut stream,
        mut closed,
        alive,
    } = endpoint;
    let (sender, mut receiver) = mpsc::unbounded();
    let Some(id) = backend.register_session(overlay, remote, sender.clone()) else {
        return;
    };
    debug!(%overlay, peer = %remote, "session opened");
    let _ = sender.unbounded_send(backend.status());
    if overlay == Overlay::Execution {
        let pooled = backend.pooled();
        if !pooled.is_empty() {
            let _ = sender.unbounded_send(wire::Message::Transactions(pooled));
        }
    }

    let max_frame_size = backend.config().max_frame_size;

    // Reads are only ever interrupted by stop or close, so writes get their own task.
    let mut stop = backend.signal();
    let writer: Handle<()> = backend.context().with_label("writer").spawn(move |_| {
        async move {
            loop {
                let message = select! {
                    _ = &mut stop => {
                        return;
                    },
                    message = receiver.next() => {
                        match message {
                            Some(message) => message,
                            None => return,
                        }
                    },
                };
                if let Err(err) = wire::send(&mut sink, &message, max_frame_size).await {
                    debug!(error = ?err, "unable to send message");
                    return;
                }
            }
        }
        .instrument(Span::current())
    });

    let mut stop = backend.signal();
    loop {
        let message = select! {
            _ = &mut stop => {
                break;
            },
            _ = &mut closed => {
                debug!(%overlay, peer = %remote, "session closed by peer");
                break;
            },
            message = wire::recv(&mut stream, max_frame_size) => {
                match message {
                    Ok(message) => message,
                    Err(err) => {
                        debug!(%overlay, peer = %remote, error = ?err, "session closed");
                        break;
                    }
                }
            },
        };
        backend.handle(overlay, &remote, message, &sender);
    }
    backend.remove_session(overlay, &remote, id);
    writer.abort();
    drop(alive);
}
