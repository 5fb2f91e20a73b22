//! C3: publishes heartbeats (and forwarded task results) onto the
//! control-plane's result queue.

use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::{BasicProperties, Connection, ConnectionProperties};

use crate::error::TransportError;

/// Abstracts the publish side of the control-plane link so the heartbeat
/// loop (C3) can be tested without a broker (`spec.md` §9 test seam).
pub trait ResultPublisher: Send + Sync {
    fn publish(&self, routing_key: &str, body: &[u8]) -> Result<(), TransportError>;
}

pub struct AmqpResultPublisher {
    connection_url: String,
    exchange: String,
    channel: std::sync::Mutex<Option<lapin::Channel>>,
    runtime: tokio::runtime::Handle,
}

impl AmqpResultPublisher {
    pub fn new(connection_url: String, exchange: String, runtime: tokio::runtime::Handle) -> Self {
        AmqpResultPublisher {
            connection_url,
            exchange,
            channel: std::sync::Mutex::new(None),
            runtime,
        }
    }

    fn channel(&self) -> Result<(), TransportError> {
        let mut guard = self.channel.lock().unwrap();
        if guard.is_some() {
            return Ok(());
        }
        let channel = self.runtime.block_on(async {
            let connection =
                Connection::connect(&self.connection_url, ConnectionProperties::default())
                    .await
                    .map_err(|e| TransportError::Connection(e.to_string()))?;
            let channel = connection
                .create_channel()
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))?;
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))?;
            Ok::<_, TransportError>(channel)
        })?;
        *guard = Some(channel);
        Ok(())
    }
}

impl ResultPublisher for AmqpResultPublisher {
    fn publish(&self, routing_key: &str, body: &[u8]) -> Result<(), TransportError> {
        self.channel()?;
        let guard = self.channel.lock().unwrap();
        let channel = guard.as_ref().expect("channel populated above");
        self.runtime.block_on(async {
            let confirm = channel
                .basic_publish(
                    &self.exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    body,
                    BasicProperties::default().with_content_type("application/msgpack".into()),
                )
                .await
                .map_err(|e| TransportError::Publish(e.to_string()))?;
            confirm
                .await
                .map_err(|e| TransportError::Publish(e.to_string()))?;
            Ok(())
        })
    }
}

#[cfg(test)]
pub struct FakeResultPublisher {
    pub published: std::sync::Mutex<Vec<(String, Vec<u8>)>>,
}

#[cfg(test)]
impl Default for FakeResultPublisher {
    fn default() -> Self {
        FakeResultPublisher {
            published: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
impl ResultPublisher for FakeResultPublisher {
    fn publish(&self, routing_key: &str, body: &[u8]) -> Result<(), TransportError> {
        self.published
            .lock()
            .unwrap()
            .push((routing_key.to_string(), body.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::EpStatusReport;

    #[test]
    fn fake_publisher_records_heartbeats() {
        let publisher = FakeResultPublisher::default();
        let report = EpStatusReport::new("ep-1", 30);
        publisher.publish("ep-1.heartbeat", &report.pack().unwrap()).unwrap();
        let published = publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "ep-1.heartbeat");
    }
}
