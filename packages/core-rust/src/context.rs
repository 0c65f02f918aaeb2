use serde::{Deserialize, Serialize};

use crate::channel::DataFormat;
use crate::types::Payload;

/// Context handed to an asynchronous invocation and, afterwards, to each of
/// its callbacks. Carries enough to re-create the call on another worker.
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    /// Service that issued the async call.
    pub calling_service: String,
    pub target_service: String,
    /// Correlation id returned to the caller.
    pub cid: String,
    pub payload: Payload,
    pub data_format: Option<DataFormat>,
    /// Services to invoke once the target completes.
    pub callbacks: Vec<String>,
    /// Free-form data forwarded to callbacks unchanged.
    pub extra: serde_json::Map<String, serde_json::Value>,
    pub environment: serde_json::Map<String, serde_json::Value>,
}

/// Environment seen by a callback: who called, what they called and what came back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackEnvironment {
    pub source_service: String,
    pub target_service: String,
    /// Correlation id of the original async invocation.
    pub async_cid: String,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl InvocationContext {
    #[must_use]
    pub fn callback_environment(&self) -> CallbackEnvironment {
        CallbackEnvironment {
            source_service: self.calling_service.clone(),
            target_service: self.target_service.clone(),
            async_cid: self.cid.clone(),
            extra: self.extra.clone(),
        }
    }
}
