//! Sample builder stage: reassembles payloads that share an RTP timestamp
//! into media samples, while packets continue down the chain unchanged.

use crate::chain::stage::{PacketSource, SourceAttach, Stage, StageKind};
use crate::config::SampleBuilderConfig;
use crate::error::{ChainError, Result};
use crate::stages::pipe::Pipe;
use bytes::{Bytes, BytesMut};
use crossbeam_channel::Receiver;
use rtp::packet::Packet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// A reassembled media unit: every payload sharing one RTP timestamp, in
/// arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSample {
    pub data: Bytes,
    pub timestamp: u32,
    /// How many packets contributed.
    pub packet_count: usize,
}

/// Accumulator for the sample currently being assembled.
struct Assembly {
    current: Option<InProgress>,
}

struct InProgress {
    timestamp: u32,
    data: BytesMut,
    packet_count: usize,
}

struct Inner {
    stream_id: String,
    assembly: Mutex<Assembly>,
    pipe: Pipe<Packet>,
    samples: Pipe<MediaSample>,
    stopped: AtomicBool,
}

impl Inner {
    fn write(&self, packet: Packet) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ChainError::PipeClosed);
        }
        self.assemble(&packet);
        self.pipe.send(packet)
    }

    /// Folds one payload into the current sample, flushing on timestamp
    /// change or on the marker bit.
    fn assemble(&self, packet: &Packet) {
        let Ok(mut assembly) = self.assembly.lock() else {
            return;
        };

        let timestamp = packet.header.timestamp;
        if let Some(current) = assembly.current.as_ref()
            && current.timestamp != timestamp
        {
            let finished = assembly.current.take();
            self.publish(finished);
        }

        let current = assembly.current.get_or_insert_with(|| InProgress {
            timestamp,
            data: BytesMut::new(),
            packet_count: 0,
        });
        current.data.extend_from_slice(&packet.payload);
        current.packet_count += 1;

        if packet.header.marker {
            let finished = assembly.current.take();
            self.publish(finished);
        }
    }

    fn publish(&self, finished: Option<InProgress>) {
        let Some(finished) = finished else { return };
        let sample = MediaSample {
            data: finished.data.freeze(),
            timestamp: finished.timestamp,
            packet_count: finished.packet_count,
        };
        // Samples are a secondary product: a slow consumer costs samples,
        // never chain throughput.
        match self.samples.try_send(sample) {
            Ok(true) | Err(_) => {}
            Ok(false) => {
                log::debug!(
                    "SampleBuilder {}: sample buffer full, dropping",
                    self.stream_id
                );
            }
        }
    }
}

/// Timestamp-grouping reassembly stage.
///
/// Packets pass through untouched; assembled samples are published on a
/// separate sequence read with [`SampleBuilder::read_sample`]. Accepts a
/// directly attached packet source like the jitter buffer does.
pub struct SampleBuilder {
    inner: Arc<Inner>,
}

impl SampleBuilder {
    pub fn new(config: SampleBuilderConfig, stream_id: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                stream_id: stream_id.to_string(),
                assembly: Mutex::new(Assembly { current: None }),
                pipe: Pipe::new(config.buffer),
                samples: Pipe::new(config.sample_buffer),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// A handle onto the assembled-sample sequence.
    pub fn read_sample(&self) -> Receiver<MediaSample> {
        self.inner.samples.receiver()
    }
}

impl Stage for SampleBuilder {
    fn id(&self) -> &str {
        StageKind::SampleBuilder.id()
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
        // Flush the partial sample so the tail of the stream is not lost.
        if let Ok(mut assembly) = self.inner.assembly.lock() {
            let finished = assembly.current.take();
            self.inner.publish(finished);
        }
        self.inner.pipe.close();
        self.inner.samples.close();
    }

    fn source_attach(&self) -> Option<&dyn SourceAttach> {
        Some(self)
    }
}

impl SourceAttach for SampleBuilder {
    fn attach_source(&self, source: Arc<dyn PacketSource>) {
        let inner = self.inner.clone();
        thread::spawn(move || {
            while let Some(packet) = source.read_rtp() {
                match inner.write(packet) {
                    Ok(()) => {}
                    Err(err) if err.is_pipe_closed() => break,
                    Err(err) => {
                        log::error!(
                            "SampleBuilder {}: source write failed: {}",
                            inner.stream_id,
                            err
                        );
                    }
                }
            }
        });
    }
}
