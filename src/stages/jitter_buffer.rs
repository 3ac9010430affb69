//! Jitter buffer stage: normalizes packet order before the rest of the
//! chain sees the stream.

use crate::chain::stage::{PacketSource, SourceAttach, Stage, StageKind};
use crate::config::JitterBufferConfig;
use crate::error::{ChainError, Result};
use crate::stages::pipe::Pipe;
use crossbeam_channel::Receiver;
use rtp::packet::Packet;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// True if `a` precedes `b` in serial-number order (RFC 1982 style, so a
/// wrapped sequence counter still compares correctly).
fn seq_before(a: u16, b: u16) -> bool {
    a != b && b.wrapping_sub(a) < 0x8000
}

/// Reorder window state.
struct Reorder {
    /// The sequence number the stage emits next. `None` until the first
    /// packet establishes the replay point.
    next: Option<u16>,
    /// Out-of-order packets waiting for their turn, keyed by sequence.
    pending: BTreeMap<u16, Packet>,
    late_drops: u64,
}

struct Inner {
    stream_id: String,
    config: JitterBufferConfig,
    state: Mutex<Reorder>,
    pipe: Pipe<Packet>,
    stopped: AtomicBool,
}

impl Inner {
    fn write(&self, packet: Packet) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ChainError::PipeClosed);
        }
        for packet in self.reorder(packet) {
            self.pipe.send(packet)?;
        }
        Ok(())
    }

    /// Runs one packet through the reorder window and returns everything
    /// that became deliverable, in sequence order.
    fn reorder(&self, packet: Packet) -> Vec<Packet> {
        let mut ready = Vec::new();
        let Ok(mut state) = self.state.lock() else {
            return ready;
        };

        let seq = packet.header.sequence_number;
        let next = *state.next.get_or_insert(seq);
        if seq_before(seq, next) {
            // Older than the replay point: its slot was already skipped.
            state.late_drops += 1;
            log::debug!(
                "JitterBuffer {}: dropping late packet seq={} (next={})",
                self.stream_id,
                seq,
                next
            );
            return ready;
        }
        state.pending.insert(seq, packet);

        loop {
            let Some(next) = state.next else { break };
            if let Some(packet) = state.pending.remove(&next) {
                ready.push(packet);
                state.next = Some(next.wrapping_add(1));
                continue;
            }
            if state.pending.len() <= self.config.max_late as usize {
                break;
            }
            // Window overflow: give up on the missing slot and resume
            // from the oldest pending sequence number.
            let resume = state
                .pending
                .keys()
                .copied()
                .min_by_key(|k| k.wrapping_sub(next));
            state.next = resume;
        }
        ready
    }
}

/// Reordering stage, first in every chain that enables it.
///
/// Accepts packets either through the chain or from a directly attached
/// packet source (the live-transport path).
pub struct JitterBuffer {
    inner: Arc<Inner>,
}

impl JitterBuffer {
    pub fn new(config: JitterBufferConfig, stream_id: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                stream_id: stream_id.to_string(),
                state: Mutex::new(Reorder {
                    next: None,
                    pending: BTreeMap::new(),
                    late_drops: 0,
                }),
                pipe: Pipe::new(config.buffer),
                config,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Packets dropped for arriving behind the replay point.
    pub fn late_drops(&self) -> u64 {
        self.inner
            .state
            .lock()
            .map(|state| state.late_drops)
            .unwrap_or(0)
    }
}

impl Stage for JitterBuffer {
    fn id(&self) -> &str {
        StageKind::JitterBuffer.id()
    }

    fn write_rtp(&self, packet: Packet) -> Result<()> {
        self.inner.write(packet)
    }

    fn read_rtp(&self) -> Receiver<Packet> {
        self.inner.pipe.receiver()
    }

    fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.pipe.close();
    }

    fn source_attach(&self) -> Option<&dyn SourceAttach> {
        Some(self)
    }
}

impl SourceAttach for JitterBuffer {
    fn attach_source(&self, source: Arc<dyn PacketSource>) {
        let inner = self.inner.clone();
        thread::spawn(move || {
            while let Some(packet) = source.read_rtp() {
                match inner.write(packet) {
                    Ok(()) => {}
                    Err(err) if err.is_pipe_closed() => break,
                    Err(err) => {
                        log::error!("JitterBuffer {}: source write failed: {}", inner.stream_id, err);
                    }
                }
            }
        });
    }
}
