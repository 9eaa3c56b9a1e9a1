//! Proxy main loop: bus consumer → filter → KP → output backend, plus a
//! periodic stats KP.

use crate::bus::{BusConsumer, BusMessage};
use crate::config::ProxyConfig;
use anyhow::{anyhow, Context, Result};
use libtimeseries::backend::{by_name, Registry};
use libtimeseries::{Kp, KpMode};
use log::{info, warn};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const END_OF_PARTITION_TOLERANCE: u32 = 10;
const STATS_KEY_PREFIX: &str = "tsk-proxy";

/// Replaces every `.` with `-` within one stats-key component, so joining
/// components with `.` keeps the resulting key's segment count meaningful.
fn sanitize_stats_component(s: &str) -> String {
    s.replace('.', "-")
}

struct StatsKeys {
    flush_cnt: u32,
    flushed_key_cnt: u32,
    messages_cnt: u32,
    messages_bytes: u32,
}

/// State of the output KP's accumulation window. `None` means nothing has
/// been accumulated yet.
type TimeWindow = Option<u32>;

pub struct Proxy<C: BusConsumer> {
    config: ProxyConfig,
    consumer: C,
    channel: Vec<u8>,

    output_registry: Rc<RefCell<Registry>>,
    output_kp: Kp,
    current_time: TimeWindow,

    stats_registry: Rc<RefCell<Registry>>,
    stats_kp: Kp,
    stats_keys: StatsKeys,
    next_stats_boundary: u64,

    empty_poll_streak: u32,
    shutdown: Arc<AtomicU32>,
}

impl<C: BusConsumer> Proxy<C> {
    pub fn new(config: ProxyConfig, consumer: C, shutdown: Arc<AtomicU32>) -> Result<Self> {
        let output_backend = by_name(&config.timeseries_backend)
            .ok_or_else(|| anyhow!("unknown timeseries-backend {:?}", config.timeseries_backend))?;
        let mut output_registry = Registry::new();
        let output_id = output_backend.id();
        output_registry.register(output_backend);
        output_registry
            .enable_backend(output_id, &config.timeseries_dbats_opts)
            .context("initializing output backend")?;
        let output_registry = Rc::new(RefCell::new(output_registry));
        let output_kp = Kp::create(output_registry.clone(), KpMode::ExplicitEnable);

        let stats_backend = by_name(&config.stats_ts_backend)
            .ok_or_else(|| anyhow!("unknown stats-ts-backend {:?}", config.stats_ts_backend))?;
        let mut stats_registry = Registry::new();
        let stats_id = stats_backend.id();
        stats_registry.register(stats_backend);
        stats_registry
            .enable_backend(stats_id, &config.stats_ts_opts)
            .context("initializing stats backend")?;
        let stats_registry = Rc::new(RefCell::new(stats_registry));
        let mut stats_kp = Kp::create(stats_registry.clone(), KpMode::ResetOnFlush);

        let prefix = sanitize_stats_component(STATS_KEY_PREFIX);
        let group = sanitize_stats_component(&config.kafka_consumer_group);
        let topic_prefix = sanitize_stats_component(&config.kafka_topic_prefix);
        let channel = sanitize_stats_component(&config.kafka_channel);
        let stats_keys = StatsKeys {
            flush_cnt: stats_kp.add_key(&format!("{prefix}.{group}.{topic_prefix}.{channel}.flush_cnt")),
            flushed_key_cnt: stats_kp
                .add_key(&format!("{prefix}.{group}.{topic_prefix}.{channel}.flushed_key_cnt")),
            messages_cnt: stats_kp
                .add_key(&format!("{prefix}.{group}.{topic_prefix}.{channel}.messages_cnt")),
            messages_bytes: stats_kp
                .add_key(&format!("{prefix}.{group}.{topic_prefix}.{channel}.messages_bytes")),
        };

        let next_stats_boundary = align_to_interval(wall_clock_secs(), config.stats_interval);

        Ok(Proxy {
            channel: config.kafka_channel.clone().into_bytes(),
            config,
            consumer,
            output_registry,
            output_kp,
            current_time: None,
            stats_registry,
            stats_kp,
            stats_keys,
            next_stats_boundary,
            empty_poll_streak: 0,
            shutdown,
        })
    }

    /// Runs until shutdown. Returns the process exit code.
    pub fn run(&mut self) -> Result<i32> {
        loop {
            let sigint_count = self.shutdown.load(Ordering::SeqCst);
            if sigint_count >= 3 {
                warn!("third SIGINT received, exiting immediately");
                return Ok(1);
            }

            match self.consumer.poll(Duration::from_secs(1)) {
                Ok(Some(msg)) => {
                    self.empty_poll_streak = 0;
                    if let Err(e) = self.handle_message(&msg) {
                        warn!("dropping message: {e}");
                    }
                }
                Ok(None) => {
                    self.empty_poll_streak += 1;
                    // tolerate a run of empty polls before treating the bus as
                    // drained — a rebalance can leave one partition
                    // transiently dry while others still have data queued.
                    if sigint_count >= 1 && self.empty_poll_streak > END_OF_PARTITION_TOLERANCE {
                        if let Some(t) = self.current_time.take() {
                            self.flush_output(t)?;
                        }
                        info!("drain complete, exiting cleanly");
                        return Ok(0);
                    }
                }
                Err(e) => {
                    warn!("bus poll error: {e}");
                }
            }

            self.maybe_flush_stats()?;
        }
    }

    fn handle_message(&mut self, msg: &BusMessage) -> Result<()> {
        let header = libtimeseries::wire::decode_header(&msg.payload)
            .context("protocol error decoding header")?;
        if header.channel != self.channel {
            return Err(anyhow!(
                "channel mismatch: expected {:?}, got {:?}",
                String::from_utf8_lossy(&self.channel),
                String::from_utf8_lossy(&header.channel)
            ));
        }

        self.maybe_flush(header.time)?;

        let mut offset = header.consumed;
        while offset < msg.payload.len() {
            let pair = libtimeseries::wire::decode_pair(&msg.payload[offset..])
                .context("protocol error decoding pair")?;
            offset += pair.consumed;

            if !self.accepts(&pair.key) {
                continue;
            }
            let id = self.output_kp.add_key(&pair.key);
            self.output_kp.set(id, pair.value)?;
        }

        self.bump_stat(self.stats_keys.messages_cnt, 1)?;
        self.bump_stat(self.stats_keys.messages_bytes, msg.payload.len() as u64)?;
        Ok(())
    }

    /// Adds `delta` to a stats counter. Counters accumulate across
    /// messages within one stats interval and are zeroed by the stats
    /// KP's own reset-on-flush policy.
    fn bump_stat(&mut self, id: u32, delta: u64) -> Result<()> {
        let current = self.stats_kp.get(id)?;
        self.stats_kp.set(id, current + delta)?;
        Ok(())
    }

    fn accepts(&self, key: &str) -> bool {
        self.config.filter_prefix.is_empty()
            || self.config.filter_prefix.iter().any(|f| key.starts_with(f.as_str()))
    }

    /// If the message's time differs from the window currently being
    /// accumulated, flush the window at its own time and adopt the new
    /// one.
    fn maybe_flush(&mut self, msg_time: u32) -> Result<()> {
        match self.current_time {
            Some(t) if t == msg_time => {}
            Some(t) => {
                self.flush_output(t)?;
                self.current_time = Some(msg_time);
            }
            None => self.current_time = Some(msg_time),
        }
        Ok(())
    }

    fn flush_output(&mut self, time: u32) -> Result<()> {
        let flushed_keys = self.output_kp.enabled_size();
        match self.output_kp.flush(time) {
            Ok(()) => {
                self.bump_stat(self.stats_keys.flush_cnt, 1)?;
                self.bump_stat(self.stats_keys.flushed_key_cnt, flushed_keys as u64)?;
                Ok(())
            }
            Err(e) => {
                warn!("output flush failed at t={time}: {e}");
                Err(e.into())
            }
        }
    }

    fn maybe_flush_stats(&mut self) -> Result<()> {
        let now = wall_clock_secs();
        if now < self.next_stats_boundary {
            return Ok(());
        }
        self.stats_kp.flush(self.next_stats_boundary as u32)?;
        self.next_stats_boundary += self.config.stats_interval.max(1);
        Ok(())
    }
}

fn wall_clock_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

fn align_to_interval(now: u64, interval: u64) -> u64 {
    let interval = interval.max(1);
    (now / interval + 1) * interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::test_support::FakeBusConsumer;
    use libtimeseries::wire::{encode_header, encode_pair};

    fn test_config(dir: &std::path::Path) -> ProxyConfig {
        ProxyConfig {
            log_level: 0,
            filter_prefix: Vec::new(),
            timeseries_backend: "ascii".to_string(),
            timeseries_dbats_opts: format!("-f {}", dir.join("out.txt").to_string_lossy()),
            kafka_brokers: "localhost:9092".to_string(),
            kafka_topic_prefix: "tsk-production".to_string(),
            kafka_channel: "main".to_string(),
            kafka_consumer_group: "tsk-proxy".to_string(),
            kafka_offset: "latest".to_string(),
            stats_interval: 60,
            stats_ts_backend: "ascii".to_string(),
            stats_ts_opts: format!("-f {}", dir.join("stats.txt").to_string_lossy()),
        }
    }

    fn frame(time: u32, channel: &str, pairs: &[(&str, u64)]) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        let mut w = encode_header(&mut buf, time, channel.as_bytes()).unwrap();
        for (k, v) in pairs {
            w += encode_pair(&mut buf[w..], k, *v).unwrap();
        }
        buf.truncate(w);
        buf
    }

    #[test]
    fn time_rollover_flushes_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let frames = vec![
            frame(100, "main", &[("a.b", 1)]),
            frame(100, "main", &[("a.c", 2)]),
            frame(101, "main", &[("a.d", 3)]),
        ];
        let consumer = FakeBusConsumer::new(frames);
        let shutdown = Arc::new(AtomicU32::new(1));
        let mut proxy = Proxy::new(config, consumer, shutdown).unwrap();

        // drain the 3 queued frames, then the fake consumer keeps returning
        // None; once the empty-poll streak exceeds the tolerance, shutdown
        // (already signalled) causes a final flush and exit.
        let code = proxy.run().unwrap();
        assert_eq!(code, 0);

        let contents = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        // one flush at t=100 (a.b, a.c) then one at t=101 (a.d) on drain.
        assert!(contents.contains("a.b 1 100"));
        assert!(contents.contains("a.c 2 100"));
        assert!(contents.contains("a.d 3 101"));
    }

    #[test]
    fn truncated_frame_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let consumer = FakeBusConsumer::new(vec![vec![0u8; 10]]);
        let shutdown = Arc::new(AtomicU32::new(1));
        let mut proxy = Proxy::new(config, consumer, shutdown).unwrap();

        let code = proxy.run().unwrap();
        assert_eq!(code, 0);
        assert_eq!(proxy.stats_kp.get(proxy.stats_keys.messages_cnt).unwrap(), 0);
    }

    #[test]
    fn filter_prefix_accepts_matching_keys_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.filter_prefix = vec!["a.".to_string()];
        let consumer = FakeBusConsumer::new(vec![]);
        let shutdown = Arc::new(AtomicU32::new(0));
        let proxy = Proxy::new(config, consumer, shutdown).unwrap();

        assert!(proxy.accepts("a.b"));
        assert!(!proxy.accepts("b.c"));
    }

    #[test]
    fn sanitize_replaces_dots_with_dashes() {
        assert_eq!(sanitize_stats_component("a.b.c"), "a-b-c");
        assert_eq!(sanitize_stats_component("plain"), "plain");
    }
}
