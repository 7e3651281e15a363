//! engine_exchangeCapabilities: reconciles the Engine API methods we serve
//! with the ones the consensus client knows about. Purely advisory; a
//! missing method on either side never drops the connection.

use serde_json::{Value, json};
use tracing::warn;

use crate::{RpcHandler, utils::RpcErr};

/// Engine API methods and whether this node currently serves them.
/// `engine_exchangeCapabilities` itself is excluded by convention.
const ENGINE_CAPABILITIES: [(&str, bool); 14] = [
    ("engine_exchangeTransitionConfigurationV1", true),
    ("engine_forkchoiceUpdatedV1", true),
    ("engine_forkchoiceUpdatedV2", true),
    ("engine_forkchoiceUpdatedV3", true),
    ("engine_newPayloadV1", true),
    ("engine_newPayloadV2", true),
    ("engine_newPayloadV3", true),
    ("engine_newPayloadV4", true),
    ("engine_getPayloadV1", true),
    ("engine_getPayloadV2", true),
    ("engine_getPayloadV3", true),
    ("engine_getPayloadV4", true),
    ("engine_getPayloadBodiesByHashV1", true),
    ("engine_getPayloadBodiesByRangeV1", true),
];

pub fn active_capabilities() -> Vec<&'static str> {
    ENGINE_CAPABILITIES
        .iter()
        .filter(|(_, active)| *active)
        .map(|(method, _)| *method)
        .collect()
}

#[derive(Debug, Clone)]
pub struct ExchangeCapabilitiesRequest {
    pub consensus_capabilities: Vec<String>,
}

impl RpcHandler for ExchangeCapabilitiesRequest {
    fn parse(params: &Option<Vec<Value>>) -> Result<Self, RpcErr> {
        let params = params
            .as_ref()
            .ok_or_else(|| RpcErr::MissingParam("capabilities".to_string()))?;
        let capabilities = params
            .first()
            .ok_or_else(|| RpcErr::MissingParam("capabilities".to_string()))?;
        let consensus_capabilities = serde_json::from_value(capabilities.clone())
            .map_err(|e| RpcErr::BadParams(e.to_string()))?;
        Ok(Self {
            consensus_capabilities,
        })
    }

    fn handle(&self) -> Result<Value, RpcErr> {
        let ours = active_capabilities();
        for method in &ours {
            if !self
                .consensus_capabilities
                .iter()
                .any(|capability| capability == method)
            {
                warn!("Consensus client does not support {method}");
            }
        }
        Ok(json!(ours))
    }
}
