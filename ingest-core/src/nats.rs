// ingest-core/src/nats.rs
// JetStream-backed implementation of the bus port.

use async_nats::jetstream::{self, consumer::PullConsumer, AckKind};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tracing::info;

use crate::bus::{Bus, BusMsg, Delivery, PullSub};
use crate::error::{IngestError, Result};

const LOG_STREAM: &str = "LOGS";
const COMMAND_STREAM: &str = "COMMANDS";
const ALERT_STREAM: &str = "ALERTS";

pub struct NatsBus {
    jetstream: jetstream::Context,
}

impl NatsBus {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| IngestError::bus("connect", e))?;
        info!("✅ connected to bus at {url}");
        Ok(Self {
            jetstream: jetstream::new(client),
        })
    }

    /// Create the streams the control plane relies on, idempotently.
    pub async fn ensure_streams(&self) -> Result<()> {
        for (name, subject) in [
            (LOG_STREAM, "logs.>"),
            (COMMAND_STREAM, "commands.>"),
            (ALERT_STREAM, "alerts.>"),
        ] {
            self.jetstream
                .get_or_create_stream(jetstream::stream::Config {
                    name: name.to_string(),
                    subjects: vec![subject.to_string()],
                    ..Default::default()
                })
                .await
                .map_err(|e| IngestError::bus("create stream", e))?;
        }
        Ok(())
    }

    fn stream_for(filter: &str) -> Result<&'static str> {
        if filter.starts_with("logs.") {
            Ok(LOG_STREAM)
        } else if filter.starts_with("commands.") {
            Ok(COMMAND_STREAM)
        } else if filter.starts_with("alerts.") {
            Ok(ALERT_STREAM)
        } else {
            Err(IngestError::bus(
                "resolve stream",
                format!("no stream covers subject filter {filter:?}"),
            ))
        }
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        // The first await hands the message to the client; the returned
        // server-ack future is dropped so the caller never waits per event.
        self.jetstream
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| IngestError::bus("publish", e))?;
        Ok(())
    }

    async fn pull_subscribe(&self, filter: &str, durable: &str) -> Result<Box<dyn PullSub>> {
        let stream = self
            .jetstream
            .get_stream(Self::stream_for(filter)?)
            .await
            .map_err(|e| IngestError::bus("get stream", e))?;
        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                durable,
                jetstream::consumer::pull::Config {
                    durable_name: Some(durable.to_string()),
                    filter_subject: filter.to_string(),
                    max_waiting: 128,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| IngestError::bus("create consumer", e))?;
        Ok(Box::new(NatsPullSub { consumer }))
    }
}

struct NatsPullSub {
    consumer: PullConsumer,
}

#[async_trait]
impl PullSub for NatsPullSub {
    async fn fetch(&mut self, max_messages: usize, max_wait: Duration) -> Result<Vec<BusMsg>> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(max_messages)
            .expires(max_wait)
            .messages()
            .await
            .map_err(|e| IngestError::bus("fetch", e))?;

        let mut out = Vec::new();
        while let Some(message) = batch.next().await {
            let message = message.map_err(|e| IngestError::bus("fetch message", e))?;
            out.push(BusMsg::new(
                message.subject.to_string(),
                message.payload.to_vec(),
                Box::new(NatsDelivery { message }),
            ));
        }
        Ok(out)
    }
}

struct NatsDelivery {
    message: jetstream::Message,
}

#[async_trait]
impl Delivery for NatsDelivery {
    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| IngestError::bus("ack", e))
    }

    async fn nak(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| IngestError::bus("nak", e))
    }
}
