//! Reference stage implementations for the four chain kinds.

pub mod jitter_buffer;
pub(crate) mod pipe;
pub mod rtp_forwarder;
pub mod sample_builder;
pub mod webm_saver;

pub use jitter_buffer::JitterBuffer;
pub use rtp_forwarder::RtpForwarder;
pub use sample_builder::{MediaSample, SampleBuilder};
pub use webm_saver::WebmSaver;
