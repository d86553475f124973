use super::{metrics, Config, Endpoint, Error, Inbound, Overlay, Peer};
use crate::types::PublicKey;
use commonware_runtime::{Clock, Metrics, Spawner};
use prometheus_client::metrics::{counter::Counter, family::Family};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};
use tracing::debug;

/// Routes dials between the nodes of one overlay.
#[derive(Clone)]
pub struct Manager<E: Spawner + Clock + Metrics> {
    context: E,
    overlay: Overlay,
    cfg: Config,
    peers: Arc<RwLock<HashMap<PublicKey, Arc<dyn Peer>>>>,
    dials: Family<metrics::Dial, Counter>,
}

impl<E: Spawner + Clock + Metrics> Manager<E> {
    pub fn new(context: E, overlay: Overlay, cfg: Config) -> Self {
        let context = context.with_label(overlay.as_str());
        let dials = Family::<metrics::Dial, Counter>::default();
        context.register("dials", "number of dials by outcome", dials.clone());
        Self {
            context,
            overlay,
            cfg,
            peers: Arc::new(RwLock::new(HashMap::new())),
            dials,
        }
    }

    pub fn overlay(&self) -> Overlay {
        self.overlay
    }

    /// Make `peer` reachable as `identity`, replacing any previous registration.
    pub fn register(&self, identity: PublicKey, peer: Arc<dyn Peer>) {
        self.peers.write().unwrap().insert(identity, peer);
    }

    /// Create a [Dialer] that connects as `me`.
    pub fn dialer(&self, me: PublicKey) -> Dialer<E> {
        Dialer {
            me,
            manager: self.clone(),
        }
    }

    fn running(&self, identity: &PublicKey) -> Option<Arc<dyn Peer>> {
        let peers = self.peers.read().unwrap();
        peers.get(identity).filter(|peer| peer.is_running()).cloned()
    }
}

/// Opens pipes from one node to the other nodes of an overlay.
#[derive(Clone)]
pub struct Dialer<E: Spawner + Clock + Metrics> {
    me: PublicKey,
    manager: Manager<E>,
}

impl<E: Spawner + Clock + Metrics> Dialer<E> {
    pub fn me(&self) -> &PublicKey {
        &self.me
    }

    pub fn overlay(&self) -> Overlay {
        self.manager.overlay
    }

    /// Open a pipe to `destination`.
    ///
    /// If `destination` is unknown or not running, it is checked once more after
    /// [Config::retry_delay] before failing with [Error::PeerNotRunning].
    pub async fn dial(&self, destination: &PublicKey) -> Result<Endpoint, Error> {
        let manager = &self.manager;
        let overlay = manager.overlay;
        let peer = match manager.running(destination) {
            Some(peer) => peer,
            None => {
                manager.dials.get_or_create(&metrics::Dial::retried(overlay)).inc();
                manager.context.sleep(manager.cfg.retry_delay).await;
                match manager.running(destination) {
                    Some(peer) => peer,
                    None => {
                        manager
                            .dials
                            .get_or_create(&metrics::Dial::not_running(overlay))
                            .inc();
                        debug!(%overlay, peer = %destination, "peer not running");
                        return Err(Error::PeerNotRunning(*destination));
                    }
                }
            }
        };

        let (local, remote) = Endpoint::pair();
        let inbound = Inbound {
            remote: self.me,
            overlay,
            endpoint: remote,
            peers: manager.cfg.peers_hint,
        };
        manager
            .context
            .with_label("handoff")
            .spawn(move |_| async move { peer.accept(inbound) });
        manager
            .dials
            .get_or_create(&metrics::Dial::connected(overlay))
            .inc();
        debug!(%overlay, peer = %destination, "dialed peer");
        Ok(local)
    }
}
