//! rtpchain - composable RTP stage chains for real-time media pipelines
//!
//! One chain per media stream: processing stages (jitter buffer, forwarder,
//! sample builder, persister) strung together in a fixed order, with a
//! dedicated forwarding thread relaying packets between each adjacent pair
//! until the consumer reads the processed stream off the tail.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod chain;
pub mod config;
pub mod error;
pub mod stages;

// Core contract (stage → link → chain)
pub use chain::stage::{ChannelSource, PacketSource, SourceAttach, Stage, StageKind};
pub use chain::StageChain;

// Configuration
pub use config::{
    ChainConfig, JitterBufferConfig, RtpForwarderConfig, SampleBuilderConfig, WebmSaverConfig,
};

// Error handling
pub use error::{ChainError, Result};

// Reference stages
pub use stages::{JitterBuffer, MediaSample, RtpForwarder, SampleBuilder, WebmSaver};
