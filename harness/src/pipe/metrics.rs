use super::Overlay;
use prometheus_client::encoding::EncodeLabelSet;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Dial {
    pub overlay: String,
    pub outcome: String,
}

impl Dial {
    fn new(overlay: Overlay, outcome: &str) -> Self {
        Self {
            overlay: overlay.to_string(),
            outcome: outcome.to_string(),
        }
    }

    pub fn connected(overlay: Overlay) -> Self {
        Self::new(overlay, "connected")
    }

    pub fn retried(overlay: Overlay) -> Self {
        Self::new(overlay, "retried")
    }

    pub fn not_running(overlay: Overlay) -> Self {
        Self::new(overlay, "not_running")
    }
}
