use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParleyErrorCode {
    ContentType,
    ProviderAuthMissing,
    ProviderConfig,
    ProviderHttp,
    ProviderTransport,
    ProviderProtocol,
    ToolNotFound,
    ToolExecutionFailed,
    ToolResultEncoding,
    ToolArgumentsInvalid,
    Persistence,
    NotFound,
    InvalidInput,
}

impl ParleyErrorCode {
    /// Tool failures are turned into model-visible tool results; everything
    /// else ends the running turn.
    pub fn is_fatal_for_turn(self) -> bool {
        !matches!(
            self,
            ParleyErrorCode::ToolNotFound
                | ParleyErrorCode::ToolExecutionFailed
                | ParleyErrorCode::ToolResultEncoding
                | ParleyErrorCode::ToolArgumentsInvalid
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParleyError {
    pub code: ParleyErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ParleyError {
    pub fn new(code: ParleyErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ParleyErrorCode::ProviderTransport, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ParleyErrorCode::ProviderProtocol, message)
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::new(ParleyErrorCode::Persistence, message)
    }
}

impl Display for ParleyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for ParleyError {}
