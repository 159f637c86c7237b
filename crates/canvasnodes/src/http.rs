use async_trait::async_trait;
use canvascore::Value;
use canvasruntime::{CapabilityError, CapabilityProvider, CapabilityRequest, CapabilityResponse};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InvokeBody<'a> {
    node_type: &'a str,
    inputs: &'a BTreeMap<String, Value>,
    properties: &'a BTreeMap<String, Value>,
}

#[derive(Deserialize)]
struct InvokeReply {
    #[serde(default)]
    outputs: BTreeMap<String, Value>,
}

/// Capability provider backed by a remote HTTP endpoint.
///
/// Each invocation POSTs `{nodeType, inputs, properties}` as JSON to the
/// configured URL and expects `{"outputs": {...}}` back.
pub struct HttpCapabilityProvider {
    id: String,
    url: String,
    description: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpCapabilityProvider {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            id: id.into(),
            url: url.into(),
            description: String::new(),
            timeout,
            client,
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn map_error(&self, e: reqwest::Error) -> CapabilityError {
        if e.is_timeout() {
            CapabilityError::Timeout {
                ms: self.timeout.as_millis() as u64,
            }
        } else if e.is_connect() {
            CapabilityError::Unavailable(format!("{}: {}", self.url, e))
        } else if e.is_decode() {
            CapabilityError::Failed(format!("malformed response from {}: {}", self.url, e))
        } else {
            CapabilityError::Failed(format!("HTTP request failed: {}", e))
        }
    }
}

#[async_trait]
impl CapabilityProvider for HttpCapabilityProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn invoke(
        &self,
        node_type: &str,
        request: CapabilityRequest,
    ) -> Result<CapabilityResponse, CapabilityError> {
        let body = InvokeBody {
            node_type,
            inputs: &request.inputs,
            properties: &request.properties,
        };
        request.events.info(format!("POST {}", self.url));

        let call = async {
            let response = self
                .client
                .post(&self.url)
                .json(&body)
                .send()
                .await
                .map_err(|e| self.map_error(e))?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(CapabilityError::Failed(format!(
                    "{} returned {}: {}",
                    self.url, status, text
                )));
            }
            response
                .json::<InvokeReply>()
                .await
                .map_err(|e| self.map_error(e))
        };

        let reply = tokio::select! {
            reply = call => reply?,
            _ = request.cancellation.cancelled() => {
                return Err(CapabilityError::Failed("request cancelled".to_string()));
            }
        };

        tracing::debug!(
            "Provider '{}' returned {} output field(s)",
            self.id,
            reply.outputs.len()
        );
        Ok(CapabilityResponse {
            outputs: reply.outputs,
        })
    }
}
