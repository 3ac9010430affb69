//! Forwarding links: the relay tasks between adjacent stages.

use crate::chain::stage::Stage;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Spawns the relay thread moving packets from `upstream`'s output into
/// `downstream`'s input for the lifetime of the pair.
///
/// The loop blocks on the upstream receiver and preserves emission order
/// exactly; no reordering or batching. It terminates when the upstream
/// output closes, or when the downstream stage reports the closed-pipe
/// condition. Per-packet delivery failures are logged and skipped.
///
/// There is no external cancellation: a link winds down only through its
/// stages stopping.
pub(crate) fn spawn(upstream: &Arc<dyn Stage>, downstream: Arc<dyn Stage>) -> JoinHandle<()> {
    // Take the receiver and identifier up front; the thread must not keep
    // the upstream stage alive, or its output could never close.
    let packets = upstream.read_rtp();
    let upstream_id = upstream.id().to_string();
    thread::spawn(move || {
        for packet in packets.iter() {
            match downstream.write_rtp(packet) {
                Ok(()) => {}
                Err(err) if err.is_pipe_closed() => return,
                Err(err) => {
                    log::error!(
                        "forwarding {} -> {} failed: {}",
                        upstream_id,
                        downstream.id(),
                        err
                    );
                }
            }
        }
    })
}
