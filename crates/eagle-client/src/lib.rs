use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Configuration options for talking to the Eagle-200 local API.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct EagleConfig {
    /// Host or host:port of the device on the local network.
    pub host: String,
    /// Cloud id printed on the device label; doubles as the basic-auth user.
    pub cloud_id: String,
    /// Install code printed on the device label; doubles as the basic-auth password.
    pub install_code: String,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for EagleConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            cloud_id: String::new(),
            install_code: String::new(),
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("device rejected credentials (http {0})")]
    Auth(u16),
    #[error("http transport error: {0}")]
    Http(reqwest::Error),
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("unexpected http status {0}")]
    Status(u16),
}

/// One authenticated connection to the device's command endpoint.
///
/// The Eagle-200 exposes a single POST endpoint that takes small XML command
/// documents; responses come back as XML bodies which callers hand to the
/// parser crate.
#[derive(Debug)]
pub struct EagleSession {
    config: EagleConfig,
    endpoint: String,
    client: reqwest::Client,
}

const DEVICE_LIST_COMMAND: &str = "<Command><Name>device_list</Name></Command>";

impl EagleSession {
    /// Builds the HTTP client and probes the endpoint with a `device_list`
    /// command so bad credentials surface here rather than mid-loop.
    pub async fn connect(config: EagleConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(ClientError::Http)?;
        let endpoint = format!("http://{}/cgi-bin/post_manager", config.host);
        let session = Self {
            config,
            endpoint,
            client,
        };

        session.device_list().await?;
        Ok(session)
    }

    /// Lists paired sub-devices. Returns the raw XML response body; an empty
    /// device list is a valid response, not an error.
    pub async fn device_list(&self) -> Result<String, ClientError> {
        self.post(DEVICE_LIST_COMMAND.to_string()).await
    }

    /// Queries a single variable of a single component on one device.
    /// Returns the raw XML response body; a well-formed response without the
    /// requested component means "no data right now".
    pub async fn device_query(
        &self,
        hardware_address: &str,
        component: &str,
        variable: &str,
    ) -> Result<String, ClientError> {
        self.post(query_command(hardware_address, component, variable))
            .await
    }

    async fn post(&self, body: String) -> Result<String, ClientError> {
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.config.cloud_id, Some(&self.config.install_code))
            .header("Content-Type", "text/xml")
            .body(body)
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(ClientError::Auth(status.as_u16()));
        }
        if !status.is_success() {
            return Err(ClientError::Status(status.as_u16()));
        }

        let text = response
            .text()
            .await
            .map_err(|err| self.transport_error(err))?;
        debug!(bytes = text.len(), "eagle response received");
        Ok(text)
    }

    fn transport_error(&self, err: reqwest::Error) -> ClientError {
        if err.is_timeout() {
            ClientError::Timeout {
                timeout_ms: self.config.timeout_ms,
            }
        } else {
            ClientError::Http(err)
        }
    }
}

fn query_command(hardware_address: &str, component: &str, variable: &str) -> String {
    format!(
        "<Command><Name>device_query</Name>\
         <DeviceDetails><HardwareAddress>{hardware_address}</HardwareAddress></DeviceDetails>\
         <Components><Component><Name>{component}</Name>\
         <Variables><Variable><Name>{variable}</Name></Variable></Variables></Component></Components>\
         </Command>"
    )
}
