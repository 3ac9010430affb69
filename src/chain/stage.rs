//! The stage capability contract and attachment seams.

use crate::error::Result;
use crossbeam_channel::Receiver;
use rtp::packet::Packet;
use std::sync::Arc;

/// A packet-processing stage in a chain.
///
/// Stages accept packets through `write_rtp`, emit packets on an ordered
/// output sequence, and shut down through `stop`. Anything satisfying this
/// contract can participate in a chain; the chain never looks inside.
pub trait Stage: Send + Sync {
    /// Stable identifier, unique among the active stages of a chain.
    fn id(&self) -> &str;

    /// Accepts one packet.
    ///
    /// Returns:
    /// - `Ok(())` - accepted
    /// - `Err(ChainError::PipeClosed)` - the stage has stopped accepting
    ///   input; forwarding links treat this as termination
    /// - any other error - a per-packet failure, logged by the link and
    ///   not fatal to it
    fn write_rtp(&self, packet: Packet) -> Result<()>;

    /// A handle onto the stage's output sequence, in emission order.
    ///
    /// The handle is a plain channel receiver: clonable, blocking, and
    /// disconnected (after draining) once the stage stops.
    fn read_rtp(&self) -> Receiver<Packet>;

    /// Shuts the stage down and closes its output sequence.
    ///
    /// Idempotent in intent: a second call has no additional effect.
    fn stop(&self);

    /// Capability query: stages that accept a live external packet source
    /// (rather than receiving packets only through the chain) return
    /// `Some(self)`.
    fn source_attach(&self) -> Option<&dyn SourceAttach> {
        None
    }
}

/// Capability for stages that can be fed directly by an upstream transport.
pub trait SourceAttach {
    /// Binds the source; the stage drains it on its own thread until the
    /// source closes or the stage stops.
    fn attach_source(&self, source: Arc<dyn PacketSource>);
}

/// An opaque upstream packet source handed to `attach_source`.
///
/// The chain forwards the handle verbatim and never interprets it.
pub trait PacketSource: Send + Sync + 'static {
    /// Blocking pull of the next packet; `None` once the source is closed.
    fn read_rtp(&self) -> Option<Packet>;
}

/// A `PacketSource` over a channel receiver.
///
/// The common transport shape, and the test double.
pub struct ChannelSource {
    rx: Receiver<Packet>,
}

impl ChannelSource {
    pub fn new(rx: Receiver<Packet>) -> Self {
        Self { rx }
    }
}

impl PacketSource for ChannelSource {
    fn read_rtp(&self) -> Option<Packet> {
        self.rx.recv().ok()
    }
}

/// The stage kinds a chain can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    JitterBuffer,
    RtpForwarder,
    SampleBuilder,
    WebmSaver,
}

impl StageKind {
    /// Instantiation order for `StageChain::init`.
    ///
    /// The order is fixed, not configurable: jittered input must be
    /// normalized before any stage that depends on temporal or sequence
    /// ordering (forwarding, reassembly, persistence).
    pub const PRIORITY: [StageKind; 4] = [
        StageKind::JitterBuffer,
        StageKind::RtpForwarder,
        StageKind::SampleBuilder,
        StageKind::WebmSaver,
    ];

    /// The type-derived stage identifier.
    pub fn id(self) -> &'static str {
        match self {
            StageKind::JitterBuffer => "JitterBuffer",
            StageKind::RtpForwarder => "RTPForwarder",
            StageKind::SampleBuilder => "SampleBuilder",
            StageKind::WebmSaver => "WebmSaver",
        }
    }
}
