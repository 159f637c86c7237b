use crate::debug::passthrough;
use async_trait::async_trait;
use canvascore::CapabilityContract;
use canvasruntime::{CapabilityError, CapabilityProvider, CapabilityRequest, CapabilityResponse};
use tokio::time::{sleep, Duration};

pub const DELAY_ID: &str = "time.delay";

const DEFAULT_DELAY_MS: u64 = 1000;

/// Waits `delay_ms` then passes its inputs through.
pub struct DelayProvider;

impl DelayProvider {
    pub fn contract() -> CapabilityContract {
        CapabilityContract {
            id: DELAY_ID.to_string(),
            label: "Delay".to_string(),
            description: "Waits for parameters.delay_ms milliseconds, then passes its input on".to_string(),
            inputs: vec!["input".to_string()],
            outputs: vec!["output".to_string()],
        }
    }
}

#[async_trait]
impl CapabilityProvider for DelayProvider {
    fn provider_id(&self) -> &str {
        DELAY_ID
    }

    fn description(&self) -> &str {
        "Delays execution for delay_ms milliseconds"
    }

    async fn invoke(
        &self,
        _node_type: &str,
        request: CapabilityRequest,
    ) -> Result<CapabilityResponse, CapabilityError> {
        let delay_ms = request
            .parameter("delay_ms")
            .and_then(|v| v.coerce_f64())
            .map(|ms| ms.max(0.0) as u64)
            .unwrap_or(DEFAULT_DELAY_MS);

        request.events.info(format!("Delaying for {}ms", delay_ms));

        tokio::select! {
            _ = sleep(Duration::from_millis(delay_ms)) => {}
            _ = request.cancellation.cancelled() => {
                return Err(CapabilityError::Failed("delay cancelled".to_string()));
            }
        }

        Ok(CapabilityResponse {
            outputs: passthrough(&request),
        })
    }
}
