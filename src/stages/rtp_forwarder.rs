//! Forwarder stage: relays the stream to an external destination while
//! passing packets through the chain unchanged.

use crate::chain::stage::{Stage, StageKind};
use crate::config::RtpForwarderConfig;
use crate::error::{ChainError, Result};
use crate::stages::pipe::Pipe;
use crossbeam_channel::Receiver;
use rtp::packet::Packet;
use std::net::UdpSocket;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use util::marshal::Marshal;

/// Passthrough stage that additionally ships each packet to a configured
/// UDP destination, tagged with the stream it belongs to.
///
/// The socket binds lazily on the first packet, so construction never
/// fails; send and marshal failures are per-packet delivery errors.
pub struct RtpForwarder {
    stream_id: String,
    config: RtpForwarderConfig,
    socket: Mutex<Option<UdpSocket>>,
    pipe: Pipe<Packet>,
    stopped: AtomicBool,
}

impl RtpForwarder {
    pub fn new(config: RtpForwarderConfig, stream_id: &str) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            socket: Mutex::new(None),
            pipe: Pipe::new(config.buffer),
            config,
            stopped: AtomicBool::new(false),
        }
    }

    /// Marshals and sends one packet to the configured destination.
    /// A no-op without one.
    fn forward(&self, packet: &Packet) -> Result<()> {
        let Some(addr) = self.config.addr.as_deref() else {
            return Ok(());
        };

        let mut guard = self
            .socket
            .lock()
            .map_err(|_| ChainError::delivery(self.id(), "socket lock poisoned"))?;
        if guard.is_none() {
            let socket = UdpSocket::bind("0.0.0.0:0")
                .and_then(|socket| socket.connect(addr).map(|_| socket))
                .map_err(|e| {
                    ChainError::delivery(
                        self.id(),
                        format!("stream {}: connecting {addr}: {e}", self.stream_id),
                    )
                })?;
            log::debug!(
                "RTPForwarder {}: forwarding to {addr}",
                self.stream_id
            );
            *guard = Some(socket);
        }

        let wire = packet
            .marshal()
            .map_err(|e| ChainError::delivery(self.id(), format!("marshal: {e}")))?;
        match guard.as_ref() {
            Some(socket) => {
                socket
                    .send(&wire)
                    .map_err(|e| ChainError::delivery(self.id(), format!("send to {addr}: {e}")))?;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Stage for RtpForwarder {
    fn id(&self) -> &str {
        StageKind::RtpForwarder.id()
    }

    fn write_rtp(&self, packet: Packet) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ChainError::PipeClosed);
        }
        // Ship to the destination first, then hand downstream either way:
        // a failed send costs the remote copy, never the chain's copy.
        let forwarded = self.forward(&packet);
        self.pipe.send(packet)?;
        forwarded
    }

    fn read_rtp(&self) -> Receiver<Packet> {
        self.pipe.receiver()
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pipe.close();
        if let Ok(mut guard) = self.socket.lock() {
            guard.take();
        }
    }
}
