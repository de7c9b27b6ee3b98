//! HTTP renderer control and relay URLs

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use streamtune_core::{
    DeviceController, DeviceId, Error, Result, StreamMetadata, StreamRelay,
};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::settings::{ControllerSettings, RelaySettings};

/// Device addresses shared between the API and the controller.
#[derive(Clone, Default)]
pub struct AddressBook {
    inner: Arc<RwLock<HashMap<DeviceId, (String, u16)>>>,
}

impl AddressBook {
    pub async fn insert(&self, device: DeviceId, host: String, port: u16) {
        self.inner.write().await.insert(device, (host, port));
    }

    pub async fn remove(&self, device: &DeviceId) {
        self.inner.write().await.remove(device);
    }

    pub async fn get(&self, device: &DeviceId) -> Option<(String, u16)> {
        self.inner.read().await.get(device).cloned()
    }
}

/// Controls renderers that expose a small JSON control endpoint.
pub struct HttpDeviceController {
    client: reqwest::Client,
    settings: ControllerSettings,
    addresses: AddressBook,
}

impl HttpDeviceController {
    pub fn new(settings: ControllerSettings, addresses: AddressBook) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.request_timeout_ms))
            .build()
            .map_err(|e| Error::ConfigError(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            settings,
            addresses,
        })
    }

    async fn control(&self, device: &DeviceId, body: serde_json::Value) -> Result<()> {
        let (host, port) = self
            .addresses
            .get(device)
            .await
            .ok_or_else(|| Error::DeviceNotFound(device.to_string()))?;
        let url = format!("http://{}:{}{}", host, port, self.settings.control_path);
        debug!("POST {} {}", url, body);

        self.client
            .post(&url)
            .json(&body)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| Error::DeviceError(format!("{}: {}", device, e)))?;
        Ok(())
    }
}

#[async_trait]
impl DeviceController for HttpDeviceController {
    async fn probe(&self, device: &DeviceId, host: &str, port: u16) -> Result<Duration> {
        let url = format!("http://{}:{}{}", host, port, self.settings.status_path);
        let started = Instant::now();
        self.client
            .get(&url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| Error::DeviceError(format!("{}: {}", device, e)))?;
        Ok(started.elapsed())
    }

    async fn set_volume(&self, device: &DeviceId, volume: u8) -> Result<()> {
        self.control(device, json!({ "action": "volume", "volume": volume }))
            .await
    }

    async fn play(&self, device: &DeviceId, endpoint: &str, metadata: &StreamMetadata) -> Result<()> {
        self.control(
            device,
            json!({ "action": "play", "url": endpoint, "metadata": metadata }),
        )
        .await
    }

    async fn stop(&self, device: &DeviceId) -> Result<()> {
        self.control(device, json!({ "action": "stop" })).await
    }
}

/// Relay endpoints built from a `{device}` URL template.
pub struct RelayUrls {
    template: Option<String>,
}

impl RelayUrls {
    pub fn new(settings: &RelaySettings) -> Self {
        Self {
            template: settings.url_template.clone(),
        }
    }
}

impl StreamRelay for RelayUrls {
    fn endpoint_url(&self, device: &DeviceId) -> Option<String> {
        self.template
            .as_ref()
            .map(|template| template.replace("{device}", device.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_template() {
        let relay = RelayUrls::new(&RelaySettings {
            url_template: Some("http://10.0.0.5:8090/stream/{device}.pcm".to_string()),
        });
        assert_eq!(
            relay.endpoint_url(&"kitchen".into()).as_deref(),
            Some("http://10.0.0.5:8090/stream/kitchen.pcm")
        );
        assert!(RelayUrls::new(&RelaySettings::default())
            .endpoint_url(&"kitchen".into())
            .is_none());
    }

    #[tokio::test]
    async fn test_control_requires_known_address() {
        let controller =
            HttpDeviceController::new(ControllerSettings::default(), AddressBook::default())
                .unwrap();
        assert!(matches!(
            controller.stop(&"ghost".into()).await,
            Err(Error::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_probe_unreachable_is_device_error() {
        let controller =
            HttpDeviceController::new(ControllerSettings::default(), AddressBook::default())
                .unwrap();
        // Port 9 on localhost is not expected to serve HTTP.
        let result = controller.probe(&"lab".into(), "127.0.0.1", 9).await;
        assert!(matches!(result, Err(Error::DeviceError(_))));
    }
}
