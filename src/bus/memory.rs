//! In-process bus for tests and local runs.
//!
//! Polled messages stay "in flight" until committed or nacked. Uncommitted
//! deliveries can be redelivered with [`MemoryBus::redeliver_uncommitted`],
//! which stands in for the broker's ack-wait expiry. Nacked deliveries come
//! back once their delay has passed.

use super::{InboundMessage, InboundQueue, OutboundQueue};
use crate::error::{WorkerError, WorkerResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub topic: String,
    pub key: String,
    pub value: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl SentMessage {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.value).unwrap_or(serde_json::Value::Null)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Default)]
pub struct MemoryBus {
    queue: Mutex<VecDeque<InboundMessage>>,
    delayed: Mutex<Vec<(Instant, InboundMessage)>>,
    in_flight: Mutex<HashMap<String, InboundMessage>>,
    committed: Mutex<Vec<String>>,
    nacked: Mutex<Vec<String>>,
    sent: Mutex<Vec<SentMessage>>,
    arrivals: Notify,
    next_id: AtomicU64,
    fail_sends: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message body; returns its delivery id.
    pub fn push(&self, topic: &str, partition_key: Option<&str>, body: &serde_json::Value) -> String {
        let id = format!("mem-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut message = InboundMessage::new(id.clone(), topic, body.to_string().into_bytes());
        if let Some(key) = partition_key {
            message = message.with_partition_key(key);
        }
        self.push_message(message);
        id
    }

    pub fn push_message(&self, message: InboundMessage) {
        self.queue.lock().push_back(message);
        self.arrivals.notify_one();
    }

    /// Put every in-flight (polled, never committed) delivery back on the
    /// queue. Returns how many were redelivered.
    pub fn redeliver_uncommitted(&self) -> usize {
        let messages: Vec<_> = self.in_flight.lock().drain().map(|(_, m)| m).collect();
        let count = messages.len();
        let mut queue = self.queue.lock();
        for message in messages {
            queue.push_back(message);
        }
        drop(queue);
        if count > 0 {
            self.arrivals.notify_one();
        }
        count
    }

    /// Make every subsequent `send` fail (or succeed again).
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Deliveries waiting to be polled, including nacked ones still delayed.
    pub fn queued(&self) -> usize {
        self.queue.lock().len() + self.delayed.lock().len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn committed(&self) -> Vec<String> {
        self.committed.lock().clone()
    }

    pub fn nacked(&self) -> Vec<String> {
        self.nacked.lock().clone()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, topic: &str) -> Vec<SentMessage> {
        self.sent.lock().iter().filter(|m| m.topic == topic).cloned().collect()
    }

    fn drain(&self, max_messages: usize) -> Vec<InboundMessage> {
        let now = Instant::now();
        let mut queue = self.queue.lock();
        let mut delayed = self.delayed.lock();
        let (ready, waiting): (Vec<_>, Vec<_>) = delayed.drain(..).partition(|(at, _)| *at <= now);
        *delayed = waiting;
        drop(delayed);
        queue.extend(ready.into_iter().map(|(_, m)| m));

        let take = max_messages.min(queue.len());
        let batch: Vec<_> = queue.drain(..take).collect();
        drop(queue);

        let mut in_flight = self.in_flight.lock();
        for message in &batch {
            in_flight.insert(message.delivery_id.clone(), message.clone());
        }
        batch
    }
}

#[async_trait]
impl InboundQueue for MemoryBus {
    async fn poll(&self, max_messages: usize, timeout: Duration) -> WorkerResult<Vec<InboundMessage>> {
        let batch = self.drain(max_messages);
        if !batch.is_empty() {
            return Ok(batch);
        }
        let _ = tokio::time::timeout(timeout, self.arrivals.notified()).await;
        Ok(self.drain(max_messages))
    }

    async fn commit(&self, message: &InboundMessage) -> WorkerResult<()> {
        self.in_flight.lock().remove(&message.delivery_id);
        self.committed.lock().push(message.delivery_id.clone());
        Ok(())
    }

    async fn nack(&self, message: &InboundMessage, delay: Duration) -> WorkerResult<()> {
        let taken = self.in_flight.lock().remove(&message.delivery_id);
        self.nacked.lock().push(message.delivery_id.clone());
        match taken {
            Some(message) if delay.is_zero() => self.push_message(message),
            Some(message) => self.delayed.lock().push((Instant::now() + delay, message)),
            None => {}
        }
        Ok(())
    }
}

#[async_trait]
impl OutboundQueue for MemoryBus {
    async fn send(&self, topic: &str, key: &str, value: Vec<u8>, headers: &[(String, String)]) -> WorkerResult<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(WorkerError::Publish(format!("memory bus refused send to '{}'", topic)));
        }
        self.sent.lock().push(SentMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            value,
            headers: headers.to_vec(),
        });
        Ok(())
    }
}
