//! NATS client wrapper
//!
//! Mailbox requests and replies are JSON-encoded frame lists
//! (`Vec<String>`), mirroring the platform's multi-frame mailbox
//! protocol. Streams carry single JSON documents.

use crate::error::BusError;
use async_nats::{Client, Message, Subscriber};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Default receive timeout for mailbox requests.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared bus connection. Cheap to clone.
#[derive(Clone)]
pub struct BusClient {
    client: Client,
    name: String,
}

impl BusClient {
    /// Connect to the bus endpoint under the given client name.
    pub async fn connect(url: &str, name: &str) -> Result<Self, BusError> {
        let client = async_nats::ConnectOptions::new()
            .name(name)
            .connect(url)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        debug!(%url, client = %name, "connected to message bus");
        Ok(Self {
            client,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish a JSON document on a subject.
    pub async fn publish_json<T: Serialize>(
        &self,
        subject: impl Into<String>,
        body: &T,
    ) -> Result<(), BusError> {
        let payload =
            serde_json::to_vec(body).map_err(|e| BusError::Malformed(e.to_string()))?;
        self.client
            .publish(subject.into(), payload.into())
            .await
            .map_err(|e| BusError::Communication(e.to_string()))
    }

    /// Subscribe to a subject (streams use `subject.>` wildcards).
    pub async fn subscribe(&self, subject: impl Into<String>) -> Result<Subscriber, BusError> {
        self.client
            .subscribe(subject.into())
            .await
            .map_err(|e| BusError::Communication(e.to_string()))
    }

    /// Frame-based mailbox request with a bounded receive timeout.
    pub async fn request_frames(
        &self,
        mailbox: &str,
        frames: &[String],
        timeout: Duration,
    ) -> Result<Vec<String>, BusError> {
        let payload =
            serde_json::to_vec(frames).map_err(|e| BusError::Malformed(e.to_string()))?;
        let reply = tokio::time::timeout(
            timeout,
            self.client.request(mailbox.to_string(), payload.into()),
        )
        .await
        .map_err(|_| BusError::Timeout)?
        .map_err(|e| BusError::Communication(e.to_string()))?;
        decode_frames(&reply.payload)
    }

    /// Reply to a mailbox request with a JSON document.
    pub async fn respond_json<T: Serialize>(
        &self,
        request: &Message,
        body: &T,
    ) -> Result<(), BusError> {
        let reply = request
            .reply
            .clone()
            .ok_or_else(|| BusError::Malformed("request carries no reply subject".into()))?;
        let payload =
            serde_json::to_vec(body).map_err(|e| BusError::Malformed(e.to_string()))?;
        self.client
            .publish(reply, payload.into())
            .await
            .map_err(|e| BusError::Communication(e.to_string()))
    }
}

/// Decode a JSON frame list from a message payload.
pub fn decode_frames(payload: &[u8]) -> Result<Vec<String>, BusError> {
    serde_json::from_slice(payload).map_err(|e| BusError::Malformed(e.to_string()))
}

/// Decode a JSON document from a message payload.
pub fn decode_json<T: DeserializeOwned>(payload: &[u8]) -> Result<T, BusError> {
    serde_json::from_slice(payload).map_err(|e| BusError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_roundtrip() {
        let frames = vec!["GET".to_string(), "uuid-1".to_string(), "ups".to_string()];
        let payload = serde_json::to_vec(&frames).unwrap();
        assert_eq!(decode_frames(&payload).unwrap(), frames);
    }

    #[test]
    fn garbage_payload_is_malformed() {
        assert!(matches!(
            decode_frames(b"not json"),
            Err(BusError::Malformed(_))
        ));
    }
}
