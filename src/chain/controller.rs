//! The per-stream stage chain: construction, wiring, mutation, teardown.

use crate::chain::link;
use crate::chain::registry::StageRegistry;
use crate::chain::stage::{PacketSource, Stage, StageKind};
use crate::config::ChainConfig;
use crate::error::{ChainError, Result};
use crate::stages::{JitterBuffer, RtpForwarder, SampleBuilder, WebmSaver};
use crossbeam_channel::Receiver;
use rtp::packet::Packet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// One media stream's chain of processing stages.
///
/// Created empty, populated once by [`init`](StageChain::init), then read
/// from the tail with [`read_rtp`](StageChain::read_rtp) until
/// [`close`](StageChain::close) tears everything down.
pub struct StageChain {
    stream_id: String,
    registry: StageRegistry,
    stopped: AtomicBool,
    config: RwLock<ChainConfig>,
    links: Mutex<Vec<JoinHandle<()>>>,
}

impl StageChain {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            registry: StageRegistry::new(),
            stopped: AtomicBool::new(false),
            config: RwLock::new(ChainConfig::default()),
            links: Mutex::new(Vec::new()),
        }
    }

    /// The media stream this chain belongs to.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Builds the stage sequence from `config` and wires the forwarding
    /// links, bringing the chain to its running state.
    ///
    /// Stages are instantiated in the fixed [`StageKind::PRIORITY`] order,
    /// not the order configuration happens to list them. Links are wired
    /// once, over the sequence as it stands here; later additions are not
    /// connected automatically.
    ///
    /// Fails with [`ChainError::NoStageEnabled`] before constructing
    /// anything if no stage kind is enabled.
    pub fn init(&self, config: &ChainConfig) -> Result<()> {
        if !config.validate() {
            return Err(ChainError::NoStageEnabled);
        }
        *self
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner) = config.clone();

        for kind in StageKind::PRIORITY {
            if !config.stage_enabled(kind) {
                continue;
            }
            log::debug!("chain {}: adding stage {}", self.stream_id, kind.id());
            self.registry.add(self.build_stage(kind, config));
        }

        // Wire one forwarding link per adjacent pair over the snapshot.
        let stages = self.registry.snapshot();
        {
            let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
            for pair in stages.windows(2) {
                links.push(link::spawn(&pair[0], pair[1].clone()));
            }
        }

        // Defense in depth: a validated configuration that still produced
        // no stages is as unusable as an all-off one.
        if self.registry.count() == 0 {
            return Err(ChainError::NoStageEnabled);
        }
        Ok(())
    }

    fn build_stage(&self, kind: StageKind, config: &ChainConfig) -> Arc<dyn Stage> {
        match kind {
            StageKind::JitterBuffer => Arc::new(JitterBuffer::new(
                config.jitter_buffer.clone(),
                &self.stream_id,
            )),
            StageKind::RtpForwarder => Arc::new(RtpForwarder::new(
                config.rtp_forwarder.clone(),
                &self.stream_id,
            )),
            StageKind::SampleBuilder => Arc::new(SampleBuilder::new(
                config.sample_builder.clone(),
                &self.stream_id,
            )),
            StageKind::WebmSaver => {
                Arc::new(WebmSaver::new(config.webm_saver.clone(), &self.stream_id))
            }
        }
    }

    /// Whether configuration marks this chain active at all, independent
    /// of stage count.
    pub fn is_enabled(&self) -> bool {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .on
    }

    /// Hands the external packet source to every stage that can take one
    /// (jitter buffer, sample builder). Stages without the capability are
    /// skipped silently; so is a chain containing none.
    pub fn attach_source(&self, source: Arc<dyn PacketSource>) {
        for stage in self.registry.snapshot() {
            if let Some(attach) = stage.source_attach() {
                log::debug!("chain {}: attaching source to {}", self.stream_id, stage.id());
                attach.attach_source(source.clone());
            }
        }
    }

    /// The next packet off the end of the chain.
    ///
    /// Blocks until one is available. `None` when the chain is stopped,
    /// has no stages, or the final stage's output has terminated.
    pub fn read_rtp(&self) -> Option<Packet> {
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        let last = self.registry.last()?;
        last.read_rtp().recv().ok()
    }

    /// A reader handle onto the final stage's output, for callers that
    /// want timeouts or `select` instead of a plain blocking read.
    pub fn reader(&self) -> Option<Receiver<Packet>> {
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        Some(self.registry.last()?.read_rtp())
    }

    /// Appends a stage to the end of the sequence.
    ///
    /// Stages added after `init` are registered but not wired into the
    /// forwarding topology; wiring is fixed at init time.
    pub fn add_stage(&self, stage: Arc<dyn Stage>) {
        self.registry.add(stage);
    }

    /// First stage with the given identifier; `None` when absent, which
    /// is a normal outcome for optional stages.
    pub fn get_stage(&self, id: &str) -> Option<Arc<dyn Stage>> {
        self.registry.get(id)
    }

    /// Number of stages currently in the sequence.
    pub fn stage_count(&self) -> usize {
        self.registry.count()
    }

    /// Stops and removes every stage with the given identifier; a no-op
    /// for unknown ids.
    ///
    /// Removing a wired stage severs the chain at that point: stopping it
    /// terminates both adjacent forwarding links cleanly, and packets no
    /// longer flow past the gap.
    pub fn remove_stage(&self, id: &str) {
        self.registry.remove(id);
    }

    /// Tears the chain down: stops every stage, empties the sequence, and
    /// reaps the forwarding links. Idempotent; concurrent
    /// [`read_rtp`](StageChain::read_rtp) callers observe termination.
    pub fn close(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("chain {}: closing", self.stream_id);
        self.registry.clear();
        self.join_links();
    }

    /// Joins link threads with a deadline, detaching any that are still
    /// blocked (they exit on their own once their channels unwind).
    fn join_links(&self) {
        let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        let deadline = Instant::now() + Duration::from_secs(1);
        let poll_interval = Duration::from_millis(20);

        loop {
            let mut remaining = Vec::new();
            for handle in links.drain(..) {
                if handle.is_finished() {
                    if handle.join().is_err() {
                        log::warn!("chain {}: forwarding link panicked", self.stream_id);
                    }
                } else {
                    remaining.push(handle);
                }
            }
            *links = remaining;

            if links.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                log::warn!(
                    "chain {}: {} forwarding link(s) still draining at close, detaching",
                    self.stream_id,
                    links.len()
                );
                links.clear();
                break;
            }
            thread::sleep(poll_interval);
        }
    }
}

impl Drop for StageChain {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::stage::ChannelSource;
    use crate::config::JitterBufferConfig;
    use crossbeam_channel::bounded;
    use rtp::header::Header;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn packet(seq: u16) -> Packet {
        Packet {
            header: Header {
                sequence_number: seq,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn all_off() -> ChainConfig {
        ChainConfig {
            jitter_buffer: JitterBufferConfig {
                on: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn enabled(kinds: &[StageKind]) -> ChainConfig {
        let mut config = all_off();
        for kind in kinds {
            match kind {
                StageKind::JitterBuffer => config.jitter_buffer.on = true,
                StageKind::RtpForwarder => config.rtp_forwarder.on = true,
                StageKind::SampleBuilder => config.sample_builder.on = true,
                StageKind::WebmSaver => config.webm_saver.on = true,
            }
        }
        config
    }

    #[test]
    fn test_init_rejects_all_off_config() {
        let chain = StageChain::new("stream-a");
        let err = chain.init(&all_off()).unwrap_err();
        assert!(matches!(err, ChainError::NoStageEnabled));
        assert_eq!(chain.stage_count(), 0);
    }

    #[test]
    fn test_init_counts_match_enabled_kinds() {
        for kinds in [
            vec![StageKind::JitterBuffer],
            vec![StageKind::JitterBuffer, StageKind::WebmSaver],
            StageKind::PRIORITY.to_vec(),
        ] {
            let chain = StageChain::new("stream-a");
            chain.init(&enabled(&kinds)).unwrap();
            assert_eq!(chain.stage_count(), kinds.len());
            chain.close();
        }
    }

    #[test]
    fn test_init_orders_stages_by_priority() {
        // Enable everything; registry order must follow PRIORITY no
        // matter what order the config struct lists fields in.
        let chain = StageChain::new("stream-a");
        chain.init(&enabled(&StageKind::PRIORITY)).unwrap();

        let ids: Vec<String> = chain
            .registry
            .snapshot()
            .iter()
            .map(|s| s.id().to_string())
            .collect();
        assert_eq!(
            ids,
            vec!["JitterBuffer", "RTPForwarder", "SampleBuilder", "WebmSaver"]
        );
        chain.close();
    }

    #[test]
    fn test_init_wires_one_link_per_adjacent_pair() {
        let chain = StageChain::new("stream-a");
        chain.init(&enabled(&StageKind::PRIORITY)).unwrap();
        assert_eq!(chain.links.lock().unwrap().len(), 3);
        chain.close();

        let chain = StageChain::new("stream-b");
        chain.init(&enabled(&[StageKind::JitterBuffer])).unwrap();
        assert_eq!(chain.links.lock().unwrap().len(), 0);
        chain.close();
    }

    #[test]
    fn test_scenario_jitter_and_saver_only() {
        let chain = StageChain::new("stream-a");
        chain
            .init(&enabled(&[StageKind::JitterBuffer, StageKind::WebmSaver]))
            .unwrap();

        assert_eq!(chain.stage_count(), 2);
        assert_eq!(chain.links.lock().unwrap().len(), 1);
        assert!(chain.get_stage("JitterBuffer").is_some());
        assert!(chain.get_stage("RTPForwarder").is_none());
        chain.close();
    }

    #[test]
    fn test_packets_flow_end_to_end_in_order() {
        let chain = StageChain::new("stream-a");
        chain
            .init(&enabled(&[StageKind::JitterBuffer, StageKind::WebmSaver]))
            .unwrap();

        let first = chain.get_stage("JitterBuffer").unwrap();
        for seq in 0..5 {
            first.write_rtp(packet(seq)).unwrap();
        }

        let seqs: Vec<u16> = (0..5)
            .map(|_| chain.read_rtp().unwrap().header.sequence_number)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        chain.close();
    }

    #[test]
    fn test_attach_source_feeds_chain() {
        let chain = StageChain::new("stream-a");
        chain
            .init(&enabled(&[StageKind::JitterBuffer, StageKind::WebmSaver]))
            .unwrap();

        let (tx, rx) = bounded(16);
        chain.attach_source(Arc::new(ChannelSource::new(rx)));

        for seq in 0..3 {
            tx.send(packet(seq)).unwrap();
        }

        let reader = chain.reader().unwrap();
        let seqs: Vec<u16> = (0..3)
            .map(|_| {
                reader
                    .recv_timeout(Duration::from_secs(1))
                    .unwrap()
                    .header
                    .sequence_number
            })
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        chain.close();
    }

    #[test]
    fn test_attach_source_without_capable_stage_is_noop() {
        let chain = StageChain::new("stream-a");
        chain.init(&enabled(&[StageKind::WebmSaver])).unwrap();

        let (_tx, rx) = bounded(1);
        // No jitter buffer or sample builder present; nothing to bind.
        chain.attach_source(Arc::new(ChannelSource::new(rx)));
        chain.close();
    }

    #[test]
    fn test_read_rtp_on_empty_chain_is_none() {
        let chain = StageChain::new("stream-a");
        assert!(chain.read_rtp().is_none());
    }

    #[test]
    fn test_read_rtp_after_close_is_none() {
        let chain = StageChain::new("stream-a");
        chain.init(&enabled(&[StageKind::JitterBuffer])).unwrap();
        chain.close();
        assert!(chain.read_rtp().is_none());
        assert!(chain.reader().is_none());
    }

    #[test]
    fn test_is_enabled_reflects_config_flag() {
        let chain = StageChain::new("stream-a");
        let mut config = enabled(&[StageKind::JitterBuffer]);
        config.on = false;
        chain.init(&config).unwrap();
        assert!(!chain.is_enabled());

        let chain = StageChain::new("stream-b");
        let mut config = enabled(&[StageKind::JitterBuffer]);
        config.on = true;
        chain.init(&config).unwrap();
        assert!(chain.is_enabled());
    }

    /// Countable stage double for lifecycle assertions.
    struct CountingStage {
        id: String,
        pipe: crate::stages::pipe::Pipe<Packet>,
        stops: Arc<AtomicUsize>,
    }

    impl CountingStage {
        fn new(id: &str) -> (Arc<Self>, Arc<AtomicUsize>) {
            let stops = Arc::new(AtomicUsize::new(0));
            (
                Arc::new(Self {
                    id: id.to_string(),
                    pipe: crate::stages::pipe::Pipe::new(4),
                    stops: stops.clone(),
                }),
                stops,
            )
        }
    }

    impl Stage for CountingStage {
        fn id(&self) -> &str {
            &self.id
        }

        fn write_rtp(&self, packet: Packet) -> Result<()> {
            self.pipe.send(packet)
        }

        fn read_rtp(&self) -> Receiver<Packet> {
            self.pipe.receiver()
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.pipe.close();
        }
    }

    #[test]
    fn test_close_stops_each_stage_exactly_once() {
        let chain = StageChain::new("stream-a");
        let (a, a_stops) = CountingStage::new("a");
        let (b, b_stops) = CountingStage::new("b");
        chain.add_stage(a);
        chain.add_stage(b);

        chain.close();
        assert_eq!(a_stops.load(Ordering::SeqCst), 1);
        assert_eq!(b_stops.load(Ordering::SeqCst), 1);
        assert_eq!(chain.stage_count(), 0);
        assert!(chain.read_rtp().is_none());
    }

    #[test]
    fn test_close_twice_has_no_further_effect() {
        let chain = StageChain::new("stream-a");
        let (a, a_stops) = CountingStage::new("a");
        chain.add_stage(a);

        chain.close();
        chain.close();
        assert_eq!(a_stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_stage_stops_it_and_forgets_it() {
        let chain = StageChain::new("stream-a");
        let (a, a_stops) = CountingStage::new("a");
        chain.add_stage(a);

        chain.remove_stage("a");
        assert_eq!(a_stops.load(Ordering::SeqCst), 1);
        assert!(chain.get_stage("a").is_none());

        // Absent id: no effect at all.
        chain.remove_stage("a");
        assert_eq!(a_stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_removing_wired_stage_severs_chain_cleanly() {
        let chain = StageChain::new("stream-a");
        chain.init(&enabled(&StageKind::PRIORITY)).unwrap();

        chain.remove_stage("SampleBuilder");
        assert_eq!(chain.stage_count(), 3);

        // Upstream of the gap still accepts; nothing reaches the tail.
        let first = chain.get_stage("JitterBuffer").unwrap();
        first.write_rtp(packet(0)).unwrap();
        let reader = chain.reader().unwrap();
        assert!(reader.recv_timeout(Duration::from_millis(100)).is_err());
        chain.close();
    }

    #[test]
    fn test_stage_added_after_init_is_inert() {
        let chain = StageChain::new("stream-a");
        chain.init(&enabled(&[StageKind::JitterBuffer])).unwrap();

        let (extra, extra_stops) = CountingStage::new("extra");
        chain.add_stage(extra);
        assert_eq!(chain.stage_count(), 2);

        // Not wired: packets into the first stage never reach it, but the
        // tail read now points at it.
        let first = chain.get_stage("JitterBuffer").unwrap();
        first.write_rtp(packet(0)).unwrap();
        let reader = chain.reader().unwrap();
        assert!(reader.recv_timeout(Duration::from_millis(100)).is_err());

        chain.close();
        assert_eq!(extra_stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_reaps_link_threads() {
        let chain = StageChain::new("stream-a");
        chain.init(&enabled(&StageKind::PRIORITY)).unwrap();
        chain.close();
        assert!(chain.links.lock().unwrap().is_empty());
    }

    #[test]
    fn test_source_attach_capability_is_queryable() {
        let chain = StageChain::new("stream-a");
        chain.init(&enabled(&StageKind::PRIORITY)).unwrap();

        let attachable: Vec<bool> = chain
            .registry
            .snapshot()
            .iter()
            .map(|s| s.source_attach().is_some())
            .collect();
        // jitter buffer and sample builder take sources; the others don't
        assert_eq!(attachable, vec![true, false, true, false]);
        chain.close();
    }
}
