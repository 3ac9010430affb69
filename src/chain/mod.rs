//! Stage chains: the registry, forwarding links, and per-stream lifecycle.

pub mod controller;
pub(crate) mod link;
pub(crate) mod registry;
pub mod stage;

pub use controller::StageChain;
pub use stage::{ChannelSource, PacketSource, SourceAttach, Stage, StageKind};
