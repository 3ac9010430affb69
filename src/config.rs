use crate::chain::stage::StageKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default bound for a stage's output channel.
pub const DEFAULT_STAGE_BUFFER: usize = 100;

/// Root configuration for one stage chain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChainConfig {
    /// Whether the chain is active at all, independent of stage count.
    pub on: bool,
    pub jitter_buffer: JitterBufferConfig,
    pub rtp_forwarder: RtpForwarderConfig,
    pub sample_builder: SampleBuilderConfig,
    pub webm_saver: WebmSaverConfig,
}

/// Jitter buffer stage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JitterBufferConfig {
    pub on: bool,
    /// Maximum out-of-order packets held before force-flushing from the
    /// oldest pending sequence number.
    pub max_late: u16,
    pub buffer: usize,
}

/// RTP forwarder stage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RtpForwarderConfig {
    pub on: bool,
    /// Destination address (`host:port`). Without one the stage is a pure
    /// passthrough.
    pub addr: Option<String>,
    pub buffer: usize,
}

/// Sample builder stage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SampleBuilderConfig {
    pub on: bool,
    pub buffer: usize,
    /// Bound for the assembled-sample channel. Samples are dropped, not
    /// blocked on, when no consumer keeps up.
    pub sample_buffer: usize,
}

/// Persister stage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebmSaverConfig {
    pub on: bool,
    /// Output file path. Without one the stage discards payloads.
    pub path: Option<PathBuf>,
    pub buffer: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            on: true,
            jitter_buffer: JitterBufferConfig::default(),
            rtp_forwarder: RtpForwarderConfig::default(),
            sample_builder: SampleBuilderConfig::default(),
            webm_saver: WebmSaverConfig::default(),
        }
    }
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            on: true,
            max_late: 16,
            buffer: DEFAULT_STAGE_BUFFER,
        }
    }
}

impl Default for RtpForwarderConfig {
    fn default() -> Self {
        Self {
            on: false,
            addr: None,
            buffer: DEFAULT_STAGE_BUFFER,
        }
    }
}

impl Default for SampleBuilderConfig {
    fn default() -> Self {
        Self {
            on: false,
            buffer: DEFAULT_STAGE_BUFFER,
            sample_buffer: 32,
        }
    }
}

impl Default for WebmSaverConfig {
    fn default() -> Self {
        Self {
            on: false,
            path: None,
            buffer: DEFAULT_STAGE_BUFFER,
        }
    }
}

impl ChainConfig {
    /// True if and only if at least one stage kind is enabled.
    ///
    /// Used as a pre-flight check before committing to `StageChain::init`,
    /// and again inside it.
    pub fn validate(&self) -> bool {
        StageKind::PRIORITY
            .iter()
            .any(|kind| self.stage_enabled(*kind))
    }

    /// Whether the given stage kind is switched on.
    pub fn stage_enabled(&self, kind: StageKind) -> bool {
        match kind {
            StageKind::JitterBuffer => self.jitter_buffer.on,
            StageKind::RtpForwarder => self.rtp_forwarder.on,
            StageKind::SampleBuilder => self.sample_builder.on,
            StageKind::WebmSaver => self.webm_saver.on,
        }
    }

    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: ChainConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if the file is
    /// missing. Invalid TOML is still an error.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e) => {
                if e.downcast_ref::<std::io::Error>()
                    .map(|io_err| io_err.kind() == std::io::ErrorKind::NotFound)
                    .unwrap_or(false)
                {
                    Ok(Self::default())
                } else {
                    Err(e)
                }
            }
        }
    }
}
