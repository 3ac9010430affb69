//! Persister stage: appends the stream's payload bytes to disk.

use crate::chain::stage::{Stage, StageKind};
use crate::config::WebmSaverConfig;
use crate::error::{ChainError, Result};
use crate::stages::pipe::Pipe;
use crossbeam_channel::Receiver;
use rtp::packet::Packet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

type Sink = Box<dyn Write + Send>;

/// Passthrough stage that persists each payload to the configured file,
/// or to an injected sink.
///
/// The file opens lazily on the first packet, so construction never
/// fails; open and write failures are per-packet delivery errors. Without
/// a path or sink the stage discards payloads and just relays.
pub struct WebmSaver {
    stream_id: String,
    config: WebmSaverConfig,
    sink: Mutex<Option<Sink>>,
    pipe: Pipe<Packet>,
    stopped: AtomicBool,
}

impl WebmSaver {
    pub fn new(config: WebmSaverConfig, stream_id: &str) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            sink: Mutex::new(None),
            pipe: Pipe::new(config.buffer),
            config,
            stopped: AtomicBool::new(false),
        }
    }

    /// Replaces the lazily opened file with a caller-supplied sink.
    pub fn with_sink(self, sink: Sink) -> Self {
        if let Ok(mut guard) = self.sink.lock() {
            *guard = Some(sink);
        }
        self
    }

    fn persist(&self, payload: &[u8]) -> Result<()> {
        let mut guard = self
            .sink
            .lock()
            .map_err(|_| ChainError::delivery(self.id(), "sink lock poisoned"))?;

        if guard.is_none() {
            let Some(path) = self.config.path.as_ref() else {
                return Ok(());
            };
            let file = File::create(path).map_err(|e| {
                ChainError::delivery(
                    self.id(),
                    format!("stream {}: opening {}: {e}", self.stream_id, path.display()),
                )
            })?;
            log::debug!("WebmSaver {}: writing to {}", self.stream_id, path.display());
            *guard = Some(Box::new(BufWriter::new(file)));
        }

        if let Some(sink) = guard.as_mut() {
            sink.write_all(payload)
                .map_err(|e| ChainError::delivery(self.id(), format!("write: {e}")))?;
        }
        Ok(())
    }
}

impl Stage for WebmSaver {
    fn id(&self) -> &str {
        StageKind::WebmSaver.id()
    }

    fn write_rtp(&self, packet: Packet) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ChainError::PipeClosed);
        }
        let persisted = self.persist(&packet.payload);
        self.pipe.send(packet)?;
        persisted
    }

    fn read_rtp(&self) -> Receiver<Packet> {
        self.pipe.receiver()
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut guard) = self.sink.lock()
            && let Some(mut sink) = guard.take()
            && let Err(e) = sink.flush()
        {
            log::warn!("WebmSaver {}: flush on stop failed: {}", self.stream_id, e);
        }
        self.pipe.close();
    }
}
