//! Thin bus-consumer abstraction over `rdkafka`'s `BaseConsumer`.
//!
//! The proxy only ever needs "give me the next message's payload, or tell
//! me nothing arrived within the timeout". Hiding that behind a small trait
//! keeps `Proxy`'s main loop (src/proxy.rs) testable without a live broker,
//! the way `cognitod/src/handler/mod.rs`'s `Handler` trait lets the
//! dispatch logic be tested against a fake.

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::message::Message as _;
use std::time::Duration;

/// One polled message: the raw payload plus which partition it came from
/// (used only for logging; ordering guarantees are per-partition, not
/// tracked here).
pub struct BusMessage {
    pub payload: Vec<u8>,
    pub partition: i32,
}

pub trait BusConsumer {
    /// Poll for the next message. `Ok(None)` means nothing arrived within
    /// `timeout` (end-of-partition or genuinely idle); `Err` is a
    /// transport-level error the caller should log and continue past.
    fn poll(&mut self, timeout: Duration) -> Result<Option<BusMessage>, String>;
}

pub struct KafkaBusConsumer {
    inner: BaseConsumer,
}

impl KafkaBusConsumer {
    pub fn connect(brokers: &str, group: &str, topic: &str, offset: &str) -> Result<Self, String> {
        let auto_offset_reset = match offset {
            "earliest" | "latest" => offset,
            other => return Err(format!("unknown offset policy {other:?}")),
        };
        let consumer: BaseConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group)
            .set("auto.offset.reset", auto_offset_reset)
            .set("enable.auto.commit", "true")
            .create()
            .map_err(|e| e.to_string())?;
        consumer.subscribe(&[topic]).map_err(|e| e.to_string())?;
        Ok(KafkaBusConsumer { inner: consumer })
    }
}

impl BusConsumer for KafkaBusConsumer {
    fn poll(&mut self, timeout: Duration) -> Result<Option<BusMessage>, String> {
        match self.inner.poll(timeout) {
            None => Ok(None),
            Some(Ok(msg)) => Ok(Some(BusMessage {
                payload: msg.payload().unwrap_or(&[]).to_vec(),
                partition: msg.partition(),
            })),
            Some(Err(e)) => Err(e.to_string()),
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::collections::VecDeque;

    /// A fake consumer fed a fixed queue of frames, for exercising
    /// `Proxy`'s main loop without a broker.
    pub struct FakeBusConsumer {
        pub queue: VecDeque<Result<BusMessage, String>>,
    }

    impl FakeBusConsumer {
        pub fn new(frames: Vec<Vec<u8>>) -> Self {
            FakeBusConsumer {
                queue: frames
                    .into_iter()
                    .map(|payload| Ok(BusMessage { payload, partition: 0 }))
                    .collect(),
            }
        }
    }

    impl BusConsumer for FakeBusConsumer {
        fn poll(&mut self, _timeout: Duration) -> Result<Option<BusMessage>, String> {
            match self.queue.pop_front() {
                Some(Ok(msg)) => Ok(Some(msg)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        }
    }
}
