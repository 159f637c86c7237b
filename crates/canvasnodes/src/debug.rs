use async_trait::async_trait;
use canvascore::CapabilityContract;
use canvasruntime::{CapabilityError, CapabilityProvider, CapabilityRequest, CapabilityResponse};

pub const ECHO_ID: &str = "debug.echo";

/// Returns its inputs unchanged and logs them as node events.
pub struct EchoProvider;

impl EchoProvider {
    pub fn contract() -> CapabilityContract {
        CapabilityContract {
            id: ECHO_ID.to_string(),
            label: "Echo".to_string(),
            description: "Returns its inputs as outputs".to_string(),
            inputs: vec!["input".to_string()],
            outputs: vec!["output".to_string()],
        }
    }
}

#[async_trait]
impl CapabilityProvider for EchoProvider {
    fn provider_id(&self) -> &str {
        ECHO_ID
    }

    fn description(&self) -> &str {
        "Returns its inputs as outputs"
    }

    async fn invoke(
        &self,
        _node_type: &str,
        request: CapabilityRequest,
    ) -> Result<CapabilityResponse, CapabilityError> {
        for (port, value) in &request.inputs {
            request.events.info(format!("{}: {}", port, value.to_text()));
        }
        Ok(CapabilityResponse {
            outputs: passthrough(&request),
        })
    }
}

/// Inputs by port name, with `input` also exposed as `output`.
pub(crate) fn passthrough(
    request: &CapabilityRequest,
) -> std::collections::BTreeMap<String, canvascore::Value> {
    let mut outputs = request.inputs.clone();
    if let Some(input) = request.inputs.get("input") {
        outputs.insert("output".to_string(), input.clone());
    }
    outputs
}
