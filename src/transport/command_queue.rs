//! C2: delivers inbound command messages from the control plane's AMQP
//! command queue to the manager's dispatch loop.

use crossbeam_channel::{Receiver, Sender};
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Connection, ConnectionProperties};

use crate::error::TransportError;
use crate::wire::MessageProperties;

/// One delivery handed to the dispatch loop: the raw body plus whatever is
/// needed to ack/nack it and the properties the dispatch loop needs to
/// apply the content-type gate (`spec.md` §4.5 step 4) before it even
/// attempts a JSON decode.
pub struct Delivery {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub delivery_tag: u64,
}

/// Abstracts the command-queue transport so the dispatch loop (C5) can be
/// exercised without a real broker (`spec.md` §9 test seam).
pub trait CommandQueueSubscriber: Send {
    /// Blocks the calling thread until connected, then forwards deliveries
    /// onto `tx` until told to stop. Runs on its own thread; errors are
    /// reported back to the supervisor via `tx` going away (hang-up) rather
    /// than a return value, matching a long-lived pika consumer loop.
    fn run(&self, tx: Sender<Delivery>, stop: Receiver<()>) -> Result<(), TransportError>;

    fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;
}

/// The real subscriber, backed by a single `lapin` connection/channel
/// dedicated to the command queue.
pub struct AmqpCommandQueueSubscriber {
    connection_url: String,
    queue: String,
    channel: std::sync::Mutex<Option<lapin::Channel>>,
    runtime: tokio::runtime::Handle,
}

impl AmqpCommandQueueSubscriber {
    pub fn new(connection_url: String, queue: String, runtime: tokio::runtime::Handle) -> Self {
        AmqpCommandQueueSubscriber {
            connection_url,
            queue,
            channel: std::sync::Mutex::new(None),
            runtime,
        }
    }

    fn connect(&self) -> Result<lapin::Channel, TransportError> {
        self.runtime.block_on(async {
            let connection = Connection::connect(&self.connection_url, ConnectionProperties::default())
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))?;
            connection
                .create_channel()
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))
        })
    }
}

impl CommandQueueSubscriber for AmqpCommandQueueSubscriber {
    /// Runs until `stop` fires, reconnecting with bounded exponential
    /// backoff across transport failures (`spec.md` §4.2: "Must reconnect
    /// on transport failure with bounded backoff") rather than ending the
    /// consumer thread the first time the broker connection drops.
    fn run(&self, tx: Sender<Delivery>, stop: Receiver<()>) -> Result<(), TransportError> {
        let mut backoff = std::time::Duration::from_secs(1);
        const MAX_BACKOFF: std::time::Duration = std::time::Duration::from_secs(30);

        loop {
            if stop.try_recv().is_ok() {
                return Ok(());
            }
            match self.run_once(&tx, &stop) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(error = %e, backoff_s = backoff.as_secs(), "command queue connection lost; reconnecting");
                    *self.channel.lock().unwrap() = None;
                    if stop.recv_timeout(backoff).is_ok() {
                        return Ok(());
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.ack_impl(delivery_tag)
    }

    fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.nack_impl(delivery_tag, requeue)
    }
}

impl AmqpCommandQueueSubscriber {
    /// One connect-consume-forward cycle; returns on `stop` (clean exit, via
    /// `Ok`) or on any transport error (reconnect-worthy, via `Err`).
    fn run_once(&self, tx: &Sender<Delivery>, stop: &Receiver<()>) -> Result<(), TransportError> {
        let channel = self.connect()?;
        let consumer = self.runtime.block_on(async {
            channel
                .basic_consume(
                    &self.queue,
                    "mued-command-consumer",
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))
        })?;
        *self.channel.lock().unwrap() = Some(channel);

        let mut consumer = consumer;
        loop {
            if stop.try_recv().is_ok() {
                return Ok(());
            }
            let next = self
                .runtime
                .block_on(async { tokio::time::timeout(std::time::Duration::from_millis(500), consumer_next(&mut consumer)).await });
            let Ok(delivery) = next else {
                continue;
            };
            let Some(delivery) = delivery else {
                return Err(TransportError::Connection("command queue consumer ended".into()));
            };
            let delivery = delivery.map_err(|e| TransportError::Connection(e.to_string()))?;
            let headers = delivery
                .properties
                .headers()
                .as_ref()
                .map(|table| {
                    table
                        .inner()
                        .iter()
                        .filter_map(|(k, v)| match v {
                            AMQPValue::Boolean(b) => Some((k.to_string(), *b)),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default();
            let properties = MessageProperties {
                content_type: delivery
                    .properties
                    .content_type()
                    .as_ref()
                    .map(|s| s.to_string()),
                timestamp: delivery.properties.timestamp().map(|t| t as i64),
                headers,
            };
            if tx
                .send(Delivery {
                    body: delivery.data,
                    properties,
                    delivery_tag: delivery.delivery_tag,
                })
                .is_err()
            {
                return Ok(());
            }
        }
    }

    fn ack_impl(&self, delivery_tag: u64) -> Result<(), TransportError> {
        let guard = self.channel.lock().unwrap();
        let channel = guard.as_ref().ok_or_else(|| TransportError::Publish("not connected".into()))?;
        self.runtime.block_on(async {
            channel
                .basic_ack(delivery_tag, BasicAckOptions::default())
                .await
                .map_err(|e| TransportError::Ack(delivery_tag, e.to_string()))
        })
    }

    fn nack_impl(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let guard = self.channel.lock().unwrap();
        let channel = guard.as_ref().ok_or_else(|| TransportError::Publish("not connected".into()))?;
        self.runtime.block_on(async {
            channel
                .basic_nack(
                    delivery_tag,
                    BasicNackOptions {
                        requeue,
                        ..BasicNackOptions::default()
                    },
                )
                .await
                .map_err(|e| TransportError::Ack(delivery_tag, e.to_string()))
        })
    }
}

async fn consumer_next(
    consumer: &mut lapin::Consumer,
) -> Option<Result<lapin::message::Delivery, lapin::Error>> {
    use futures_util::StreamExt;
    consumer.next().await
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An in-memory subscriber used to drive the dispatch loop in tests
    /// without a broker.
    pub struct FakeCommandQueueSubscriber {
        pub deliveries: std::sync::Mutex<Vec<Delivery>>,
    }

    impl CommandQueueSubscriber for FakeCommandQueueSubscriber {
        fn run(&self, tx: Sender<Delivery>, _stop: Receiver<()>) -> Result<(), TransportError> {
            let mut deliveries = self.deliveries.lock().unwrap();
            for delivery in deliveries.drain(..) {
                let _ = tx.send(delivery);
            }
            Ok(())
        }

        fn ack(&self, _delivery_tag: u64) -> Result<(), TransportError> {
            Ok(())
        }

        fn nack(&self, _delivery_tag: u64, _requeue: bool) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn sample_body() -> Vec<u8> {
        serde_json::json!({
            "command": "cmd_start_endpoint",
            "args": [],
            "kwargs": {"name": "ep1"},
            "globus_effective_identity": "id",
            "globus_identity_set": [{"sub": "id"}],
            "globus_username": "alice",
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn fake_subscriber_forwards_queued_deliveries() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (_stop_tx, stop_rx) = crossbeam_channel::bounded(0);
        let subscriber = FakeCommandQueueSubscriber {
            deliveries: std::sync::Mutex::new(vec![Delivery {
                body: sample_body(),
                properties: MessageProperties {
                    content_type: Some("application/json".into()),
                    timestamp: Some(0),
                    headers: Default::default(),
                },
                delivery_tag: 1,
            }]),
        };
        subscriber.run(tx, stop_rx).unwrap();
        let delivery = rx.recv().unwrap();
        let command: crate::wire::CommandMessage = serde_json::from_slice(&delivery.body).unwrap();
        assert_eq!(command.command.as_deref(), Some("cmd_start_endpoint"));
    }
}
