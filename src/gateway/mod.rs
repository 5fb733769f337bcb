//! Outbound SMS delivery.

pub mod transmit;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use transmit::TransmitClient;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Gateway rejected message ({code}): {message}")]
    Rejected { code: String, message: String },
    #[error("Gateway returned {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("Gateway call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Invalid response from gateway: {0}")]
    InvalidResponse(String),
    #[error("Circuit breaker open - SMS gateway unavailable")]
    CircuitBreakerOpen,
}

impl GatewayError {
    /// Transport failures, timeouts and 5xx answers, as opposed to the
    /// provider refusing this particular message.
    pub fn is_upstream_unavailable(&self) -> bool {
        matches!(
            self,
            GatewayError::Request(_)
                | GatewayError::Upstream { .. }
                | GatewayError::Timeout(_)
                | GatewayError::CircuitBreakerOpen
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendRequest {
    pub body: String,
    pub to: String,
    /// Sender id. The client may drop it if the provider rejects it.
    pub from: Option<String>,
    pub delivery_callback: Option<String>,
    pub reply_callback: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub gateway_message_id: String,
}

#[async_trait]
pub trait SmsGateway: Send + Sync {
    async fn send(&self, request: &SendRequest) -> Result<SendReceipt, GatewayError>;
}
