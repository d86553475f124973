use crate::pipe::Overlay;
use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Message {
    pub overlay: String,
    pub kind: String,
}

impl Message {
    pub fn new(overlay: Overlay, kind: &str) -> Self {
        Self {
            overlay: overlay.to_string(),
            kind: kind.to_string(),
        }
    }
}

/// Counters of one node, kept across restarts.
#[derive(Clone, Default)]
pub struct Metrics {
    pub blocks_proposed: Counter,
    pub blocks_imported: Counter,
    pub transactions_received: Counter,
    pub messages: Family<Message, Counter>,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        let metrics = Self::default();
        context.register(
            "blocks_proposed",
            "number of blocks proposed",
            metrics.blocks_proposed.clone(),
        );
        context.register(
            "blocks_imported",
            "number of blocks appended to the canonical chain",
            metrics.blocks_imported.clone(),
        );
        context.register(
            "transactions_received",
            "number of transactions received from peers",
            metrics.transactions_received.clone(),
        );
        context.register(
            "messages",
            "number of messages received by overlay and kind",
            metrics.messages.clone(),
        );
        metrics
    }
}
