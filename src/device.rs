// Device Module - HTTP client for the controller's REST endpoints
use anyhow::{anyhow, bail, Context, Result};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};

use crate::wifi::WifiNetwork;

/// Upper bound for any request that does not set its own timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DeviceClient {
    http: Client,
    host: String,
}

impl DeviceClient {
    /// `host` is `name[:port]` without a scheme
    pub fn new(host: &str, connect_timeout: Duration) -> Result<Self> {
        let host = host.trim().trim_end_matches('/');
        if host.is_empty() {
            bail!("device host is empty");
        }
        let http = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(DeviceClient {
            http,
            host: host.to_string(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.host, path)
    }

    pub fn index_data_url(&self) -> String {
        format!("ws://{}/index_data", self.host)
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Liveness probe: any 2xx within `timeout` counts as reachable
    pub async fn connection_test(&self, timeout: Duration) -> bool {
        match self
            .http
            .get(self.url("/connection_test"))
            .timeout(timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("connection test failed: {}", e);
                false
            }
        }
    }

    /// The device answers slowly while its radio scans, so the caller bounds the wait
    pub async fn available_wifi_networks(&self, timeout: Duration) -> Result<Vec<WifiNetwork>> {
        let response = self
            .http
            .get(self.url("/available_wifi_networks"))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow!("no answer to WiFi scan within {} ms", timeout.as_millis())
                } else {
                    e.into()
                }
            })?;
        let networks = response
            .error_for_status()?
            .json::<Vec<WifiNetwork>>()
            .await
            .context("device returned an unreadable network list")?;
        Ok(networks)
    }

    pub async fn reboot(&self) -> Result<()> {
        info!(host = %self.host, "requesting reboot");
        self.http
            .get(self.url("/reboot"))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Wipe the stored configuration, then reboot into it
    pub async fn factory_reset(&self) -> Result<()> {
        let reset = async {
            self.http
                .get(self.url("/do_factory_reset"))
                .send()
                .await?
                .error_for_status()
        };
        reset
            .await
            .map_err(|e| anyhow!("Failed to perform factory reset! ({})", e))?;
        self.reboot().await
    }

    pub async fn raw_config(&self) -> Result<String> {
        let text = self
            .http
            .get(self.url("/raw_config"))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(text)
    }

    /// Post the settings form; the device stores it and redirects to /reboot
    pub async fn save_config(&self, form: &[(String, String)]) -> Result<()> {
        info!(host = %self.host, fields = form.len(), "saving configuration");
        self.http
            .post(self.url("/save_config"))
            .form(form)
            .send()
            .await?
            .error_for_status()
            .context("device rejected the configuration")?;
        Ok(())
    }
}
