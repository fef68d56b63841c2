//! Cloud-to-device command delivery.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use reqwest::Url;

/// Best-effort message delivery to one device.
pub trait CommandChannel: Send + Sync {
    fn send(&self, device_id: &str, payload: Vec<u8>) -> impl Future<Output = Result<()>> + Send;
}

/// Posts payloads to `{endpoint}/devices/{device}/messages`.
///
/// The device id is appended as one percent-encoded path segment, so it
/// cannot change the path, query or fragment of the request.
pub struct HttpCommandChannel {
    client: reqwest::Client,
    endpoint: Url,
    headers: HashMap<String, String>,
}

impl HttpCommandChannel {
    pub fn new(endpoint: &str, timeout: Duration, headers: HashMap<String, String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building command channel HTTP client")?;

        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("parsing command endpoint {endpoint:?}"))?;
        if endpoint.cannot_be_a_base() {
            bail!("command endpoint {endpoint} cannot carry a path");
        }

        Ok(Self {
            client,
            endpoint,
            headers,
        })
    }

    fn device_url(&self, device_id: &str) -> Result<Url> {
        // Dot segments would be dropped or resolved rather than encoded.
        if device_id.is_empty() || device_id == "." || device_id == ".." {
            bail!("invalid device id {device_id:?}");
        }

        let mut url = self.endpoint.clone();
        url.set_query(None);
        url.set_fragment(None);
        url.path_segments_mut()
            .map_err(|()| anyhow!("command endpoint {} cannot carry a path", self.endpoint))?
            .pop_if_empty()
            .push("devices")
            .push(device_id)
            .push("messages");
        Ok(url)
    }
}

impl CommandChannel for HttpCommandChannel {
    async fn send(&self, device_id: &str, payload: Vec<u8>) -> Result<()> {
        let mut request = self
            .client
            .post(self.device_url(device_id)?)
            .header("Content-Type", "application/json")
            .body(payload);

        for (k, v) in &self.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let resp = request
            .send()
            .await
            .with_context(|| format!("sending command to device {device_id}"))?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            bail!("command channel unexpected status for device {device_id}: {status}");
        }

        Ok(())
    }
}

/// Records every payload; optionally fails sends to chosen devices.
#[derive(Default)]
pub struct MemoryCommandChannel {
    sent: Mutex<Vec<(String, Vec<u8>)>>,
    unreachable: Mutex<Vec<String>>,
}

impl MemoryCommandChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sends to `device_id` fail.
    pub fn mark_unreachable(&self, device_id: &str) {
        self.unreachable.lock().push(device_id.to_string());
    }

    /// Payloads delivered so far, in send order.
    pub fn sent(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.lock().clone()
    }
}

impl CommandChannel for MemoryCommandChannel {
    async fn send(&self, device_id: &str, payload: Vec<u8>) -> Result<()> {
        if self.unreachable.lock().iter().any(|d| d == device_id) {
            bail!("device {device_id} unreachable");
        }
        self.sent.lock().push((device_id.to_string(), payload));
        Ok(())
    }
}

/// Command channel selected by configuration.
pub enum CommandClient {
    Http(HttpCommandChannel),
    Memory(MemoryCommandChannel),
}

impl CommandChannel for CommandClient {
    async fn send(&self, device_id: &str, payload: Vec<u8>) -> Result<()> {
        match self {
            Self::Http(c) => c.send(device_id, payload).await,
            Self::Memory(c) => c.send(device_id, payload).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_url_trims_trailing_slash() {
        let channel =
            HttpCommandChannel::new("http://hub.local/", Duration::from_secs(1), HashMap::new())
                .unwrap();
        assert_eq!(
            channel.device_url("car-7").unwrap().as_str(),
            "http://hub.local/devices/car-7/messages"
        );
    }

    #[test]
    fn test_device_id_stays_one_path_segment() {
        let channel =
            HttpCommandChannel::new("http://hub/api", Duration::from_secs(1), HashMap::new())
                .unwrap();

        let url = channel.device_url("../../admin/reset?x=#frag").unwrap();
        assert_eq!(url.host_str(), Some("hub"));
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
        let segments: Vec<_> = url.path_segments().unwrap().collect();
        assert_eq!(segments.len(), 4, "{url}");
        assert_eq!(segments[0], "api");
        assert_eq!(segments[1], "devices");
        assert_eq!(segments[3], "messages");
        assert!(!segments[2].contains('/'), "{url}");

        assert!(channel.device_url("..").is_err());
        assert!(channel.device_url("").is_err());
    }

    #[test]
    fn test_rejects_unparseable_endpoint() {
        assert!(HttpCommandChannel::new("not a url", Duration::from_secs(1), HashMap::new()).is_err());
    }

    #[tokio::test]
    async fn test_memory_channel_records_and_fails() {
        let channel = CommandClient::Memory(MemoryCommandChannel::new());
        channel.send("a", b"{}".to_vec()).await.unwrap();

        let CommandClient::Memory(inner) = &channel else {
            unreachable!()
        };
        inner.mark_unreachable("b");
        assert!(channel.send("b", b"{}".to_vec()).await.is_err());
        assert_eq!(inner.sent(), vec![("a".to_string(), b"{}".to_vec())]);
    }
}
