//! Drive and observe in-process validator clusters.
//!
//! A [network::Network] wires a set of [node::Node]s together over two simulated
//! peer-to-peer overlays ([pipe]) and exposes blocking waits on their progress:
//!
//! * [tracker::Tracker] follows the blocks one node mines and resolves waits on
//!   transaction inclusion.
//! * [monitor::Monitor] polls every running node for liveness, block rate, target
//!   height and sync completion.
//!
//! Nodes run [sim::Backend], a small proof-of-authority chain, and can be stopped
//! and restarted while the rest of the cluster keeps mining.

pub mod chain;
pub mod deadline;
pub mod genesis;
pub mod monitor;
pub mod network;
pub mod node;
pub mod pipe;
pub mod sim;
pub mod tracker;
pub mod types;
