// ingest-core/src/sink.rs
// Drains logs.> from the bus into the columnar events table in batches.

use prost::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::{Bus, BusMsg};
use crate::error::Result;
use crate::metrics::IngestMetrics;
use crate::proto::LogEvent;
use crate::store::{EventRow, EventStore};

const FETCH_BATCH: usize = 256;
const FETCH_WAIT: Duration = Duration::from_millis(500);
const DURABLE_NAME: &str = "ingest-sink";

pub struct ColumnarSink {
    bus: Arc<dyn Bus>,
    store: Arc<dyn EventStore>,
    metrics: Arc<IngestMetrics>,
    shutdown: CancellationToken,
}

impl ColumnarSink {
    pub fn new(
        bus: Arc<dyn Bus>,
        store: Arc<dyn EventStore>,
        metrics: Arc<IngestMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            bus,
            store,
            metrics,
            shutdown,
        }
    }

    pub async fn run(&self) -> Result<()> {
        info!("columnar sink started");
        let mut sub = self.bus.pull_subscribe("logs.>", DURABLE_NAME).await?;

        loop {
            let batch = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("columnar sink draining on shutdown");
                    return Ok(());
                }
                fetched = sub.fetch(FETCH_BATCH, FETCH_WAIT) => match fetched {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!("sink fetch failed: {e}");
                        continue;
                    }
                },
            };
            if batch.is_empty() {
                continue;
            }
            self.flush(batch).await;
        }
    }

    /// Insert one fetched batch. Messages are ack'd only after the batch
    /// lands; an insert failure naks everything for redelivery, so the
    /// store sees each event at least once.
    async fn flush(&self, batch: Vec<BusMsg>) {
        let mut rows = Vec::with_capacity(batch.len());
        let mut pending = Vec::with_capacity(batch.len());

        for msg in batch {
            match LogEvent::decode(msg.payload.as_slice()) {
                Ok(event) => {
                    rows.push(EventRow::from_event(&event));
                    pending.push(msg);
                }
                Err(e) => {
                    IngestMetrics::incr(&self.metrics.decode_failures);
                    warn!("undecodable event in sink: {e}");
                    if let Err(e) = msg.nak().await {
                        warn!("sink nak failed: {e}");
                    }
                }
            }
        }
        if rows.is_empty() {
            return;
        }

        let inserted = rows.len() as u64;
        match self.store.insert_events(rows).await {
            Ok(()) => {
                IngestMetrics::add(&self.metrics.rows_inserted, inserted);
                for msg in pending {
                    if let Err(e) = msg.ack().await {
                        warn!("sink ack failed: {e}");
                    }
                }
            }
            Err(e) => {
                IngestMetrics::incr(&self.metrics.insert_failures);
                error!("batch insert failed, naking {} events: {e}", pending.len());
                for msg in pending {
                    if let Err(e) = msg.nak().await {
                        warn!("sink nak failed: {e}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::store::MemoryStore;

    fn event(message: &str) -> LogEvent {
        LogEvent {
            tenant_id: "demo".to_string(),
            host_id: "h1".to_string(),
            ts_unix_ns: 1_700_000_000_000_000_000,
            stream: "system".to_string(),
            message: message.to_string(),
            labels: Default::default(),
        }
    }

    async fn one_cycle(sink: &ColumnarSink, bus: &MemoryBus) {
        let mut sub = bus.pull_subscribe("logs.>", DURABLE_NAME).await.unwrap();
        let batch = sub
            .fetch(FETCH_BATCH, Duration::from_millis(50))
            .await
            .unwrap();
        sink.flush(batch).await;
    }

    #[tokio::test]
    async fn events_land_in_the_store() {
        let bus = MemoryBus::new();
        let store = Arc::new(MemoryStore::new());
        let sink = ColumnarSink::new(
            Arc::new(bus.clone()),
            store.clone(),
            Arc::new(IngestMetrics::new()),
            CancellationToken::new(),
        );

        for i in 0..3 {
            bus.publish(
                "logs.demo.h1",
                event(&format!("message {i}")).encode_to_vec(),
            )
            .await
            .unwrap();
        }
        one_cycle(&sink, &bus).await;

        let rows = store.events();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].tenant_id, "demo");
        assert_eq!(rows[0].message, "message 0");
    }

    #[tokio::test]
    async fn undecodable_messages_are_nakd_and_skipped() {
        let bus = MemoryBus::new();
        let store = Arc::new(MemoryStore::new());
        let sink = ColumnarSink::new(
            Arc::new(bus.clone()),
            store.clone(),
            Arc::new(IngestMetrics::new()),
            CancellationToken::new(),
        );

        bus.publish("logs.demo.h1", b"\xff\xff not protobuf".to_vec())
            .await
            .unwrap();
        bus.publish("logs.demo.h1", event("good").encode_to_vec())
            .await
            .unwrap();
        one_cycle(&sink, &bus).await;

        assert_eq!(store.events().len(), 1);
        assert_eq!(store.events()[0].message, "good");
    }

    #[tokio::test]
    async fn insert_failure_naks_the_whole_batch() {
        let bus = MemoryBus::new();
        let store = Arc::new(MemoryStore::new());
        let sink = ColumnarSink::new(
            Arc::new(bus.clone()),
            store.clone(),
            Arc::new(IngestMetrics::new()),
            CancellationToken::new(),
        );

        bus.publish("logs.demo.h1", event("retried").encode_to_vec())
            .await
            .unwrap();

        store.set_fail_inserts(true);
        one_cycle(&sink, &bus).await;
        assert!(store.events().is_empty());

        // redelivery after the store recovers
        store.set_fail_inserts(false);
        one_cycle(&sink, &bus).await;
        assert_eq!(store.events().len(), 1);
        assert_eq!(store.events()[0].message, "retried");
    }
}
