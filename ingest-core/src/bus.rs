// ingest-core/src/bus.rs
// Event bus port: durable pub/sub with subject routing, pull
// subscriptions and explicit ack/nak. `NatsBus` (nats.rs) backs it in
// production; `MemoryBus` here backs the test suite.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::Result;

#[async_trait]
pub trait Bus: Send + Sync {
    /// Fire-and-forget publish; durability is the bus's concern, not the
    /// caller's. Errors surface only as local admission failures.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()>;

    /// Create (or re-attach to) a durable pull subscription. Two
    /// subscribers sharing a durable name share one delivery cursor, so
    /// each message reaches at most one of them.
    async fn pull_subscribe(&self, filter: &str, durable: &str) -> Result<Box<dyn PullSub>>;
}

#[async_trait]
pub trait PullSub: Send {
    /// Fetch up to `max_messages`, waiting at most `max_wait` when none
    /// are immediately available.
    async fn fetch(&mut self, max_messages: usize, max_wait: Duration) -> Result<Vec<BusMsg>>;
}

/// One delivered message. Dropping it without `ack` leaves it eligible
/// for redelivery, subject to the backing bus's ack-wait policy.
pub struct BusMsg {
    pub subject: String,
    pub payload: Vec<u8>,
    delivery: Box<dyn Delivery>,
}

#[async_trait]
pub trait Delivery: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nak(&self) -> Result<()>;
}

impl BusMsg {
    pub fn new(subject: String, payload: Vec<u8>, delivery: Box<dyn Delivery>) -> Self {
        Self {
            subject,
            payload,
            delivery,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.delivery.ack().await
    }

    /// Negative-acknowledge: hand the message back for redelivery.
    pub async fn nak(self) -> Result<()> {
        self.delivery.nak().await
    }
}

/// Subject matching with the usual wildcard grammar: `*` matches one
/// token, `>` matches the remainder.
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), _) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(f), Some(s)) if f == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

// ---------------------------------------------------------------------
// In-memory bus
// ---------------------------------------------------------------------

/// In-process bus with JetStream-like semantics: published messages are
/// retained, durable consumers start from the beginning of the retained
/// log, naks requeue for redelivery. Used by the test suite and by local
/// single-process runs.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<MemoryBusInner>,
}

#[derive(Default)]
struct MemoryBusInner {
    log: Mutex<Vec<StoredMsg>>,
    consumers: Mutex<HashMap<String, Arc<ConsumerShared>>>,
}

#[derive(Clone)]
struct StoredMsg {
    subject: String,
    payload: Vec<u8>,
}

struct ConsumerShared {
    filter: String,
    state: Mutex<ConsumerState>,
}

#[derive(Default)]
struct ConsumerState {
    cursor: usize,
    redeliver: VecDeque<usize>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of retained messages matching a filter; test helper.
    pub fn published(&self, filter: &str) -> Vec<Vec<u8>> {
        self.inner
            .log
            .lock()
            .iter()
            .filter(|m| subject_matches(filter, &m.subject))
            .map(|m| m.payload.clone())
            .collect()
    }

    fn consumer(&self, filter: &str, durable: &str) -> Arc<ConsumerShared> {
        let key = format!("{filter}|{durable}");
        let mut consumers = self.inner.consumers.lock();
        Arc::clone(consumers.entry(key).or_insert_with(|| {
            Arc::new(ConsumerShared {
                filter: filter.to_string(),
                state: Mutex::new(ConsumerState::default()),
            })
        }))
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        self.inner.log.lock().push(StoredMsg {
            subject: subject.to_string(),
            payload,
        });
        Ok(())
    }

    async fn pull_subscribe(&self, filter: &str, durable: &str) -> Result<Box<dyn PullSub>> {
        Ok(Box::new(MemoryPullSub {
            bus: self.inner.clone(),
            consumer: self.consumer(filter, durable),
        }))
    }
}

struct MemoryPullSub {
    bus: Arc<MemoryBusInner>,
    consumer: Arc<ConsumerShared>,
}

impl MemoryPullSub {
    /// Pull whatever is immediately available, up to `max`.
    fn drain_available(&self, max: usize) -> Vec<BusMsg> {
        let log = self.bus.log.lock();
        let mut state = self.consumer.state.lock();
        let mut out = Vec::new();

        while out.len() < max {
            if let Some(index) = state.redeliver.pop_front() {
                out.push(self.deliver(&log[index], index));
                continue;
            }
            let Some(msg) = log.get(state.cursor) else {
                break;
            };
            let index = state.cursor;
            state.cursor += 1;
            if subject_matches(&self.consumer.filter, &msg.subject) {
                out.push(self.deliver(msg, index));
            }
        }
        out
    }

    fn deliver(&self, msg: &StoredMsg, index: usize) -> BusMsg {
        BusMsg::new(
            msg.subject.clone(),
            msg.payload.clone(),
            Box::new(MemoryDelivery {
                consumer: Arc::clone(&self.consumer),
                index,
            }),
        )
    }
}

#[async_trait]
impl PullSub for MemoryPullSub {
    async fn fetch(&mut self, max_messages: usize, max_wait: Duration) -> Result<Vec<BusMsg>> {
        let deadline = Instant::now() + max_wait;
        loop {
            let batch = self.drain_available(max_messages);
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

struct MemoryDelivery {
    consumer: Arc<ConsumerShared>,
    index: usize,
}

#[async_trait]
impl Delivery for MemoryDelivery {
    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    async fn nak(&self) -> Result<()> {
        self.consumer.state.lock().redeliver.push_back(self.index);
        Ok(())
    }
}
