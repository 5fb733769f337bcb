use crate::gateway::{GatewayError, SendReceipt, SendRequest, SmsGateway};
use async_trait::async_trait;
use failsafe::futures::CircuitBreaker;
use failsafe::{backoff, failure_policy, Config, Error as FailsafeError, StateMachine};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const BAD_CALLER_ID: &str = "BAD_CALLER_ID";

#[derive(Debug, Deserialize)]
struct SendResponse {
    message_id: Option<serde_json::Value>,
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    #[serde(default)]
    description: String,
}

/// Form-encoded client for the TransmitSMS `send-sms.json` API.
pub struct TransmitClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    circuit_breaker: StateMachine<failure_policy::ConsecutiveFailures<backoff::Exponential>, ()>,
}

impl TransmitClient {
    pub fn new(base_url: String, api_key: String, api_secret: String) -> Self {
        Self::with_circuit_breaker_config(
            base_url,
            api_key,
            api_secret,
            5,
            Duration::from_secs(60),
            Duration::from_secs(30),
        )
    }

    pub fn with_circuit_breaker_config(
        base_url: String,
        api_key: String,
        api_secret: String,
        failure_threshold: u32,
        reset_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();

        let backoff = backoff::exponential(Duration::from_secs(10), reset_timeout);
        let policy = failure_policy::consecutive_failures(failure_threshold, backoff);
        let circuit_breaker = Config::new().failure_policy(policy).build();

        TransmitClient {
            client,
            base_url,
            api_key,
            api_secret,
            circuit_breaker,
        }
    }

    async fn post(&self, form: Vec<(&'static str, String)>) -> Result<SendReceipt, GatewayError> {
        let url = format!("{}/send-sms.json", self.base_url.trim_end_matches('/'));
        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let api_secret = self.api_secret.clone();

        // Only outages trip the breaker; a refused message says nothing about
        // the provider's health.
        let result = self
            .circuit_breaker
            .call_with(
                |e: &GatewayError| e.is_upstream_unavailable(),
                async move {
                    let response = client
                        .post(&url)
                        .basic_auth(api_key, Some(api_secret))
                        .form(&form)
                        .send()
                        .await?;
                    let status = response.status().as_u16();
                    let body = response.text().await?;
                    parse_send_response(status, &body)
                },
            )
            .await;

        match result {
            Ok(receipt) => Ok(receipt),
            Err(FailsafeError::Rejected) => Err(GatewayError::CircuitBreakerOpen),
            Err(FailsafeError::Inner(e)) => Err(e),
        }
    }
}

fn build_form(request: &SendRequest, include_sender: bool) -> Vec<(&'static str, String)> {
    let mut form = vec![("message", request.body.clone()), ("to", request.to.clone())];
    if include_sender {
        if let Some(from) = &request.from {
            form.push(("from", from.clone()));
        }
    }
    if let Some(url) = &request.delivery_callback {
        form.push(("dlr_callback", url.clone()));
    }
    if let Some(url) = &request.reply_callback {
        form.push(("reply_callback", url.clone()));
    }
    form
}

fn parse_send_response(status: u16, body: &str) -> Result<SendReceipt, GatewayError> {
    if status >= 500 {
        return Err(GatewayError::Upstream {
            status,
            body: body.to_string(),
        });
    }

    let parsed = serde_json::from_str::<SendResponse>(body).ok();
    let error = parsed
        .as_ref()
        .and_then(|p| p.error.as_ref())
        .filter(|e| e.code != "SUCCESS");

    if !(200..300).contains(&status) || error.is_some() {
        let (code, message) = match error {
            Some(e) => (e.code.clone(), e.description.clone()),
            None => (status.to_string(), body.to_string()),
        };
        return Err(GatewayError::Rejected { code, message });
    }

    let gateway_message_id = parsed
        .and_then(|p| p.message_id)
        .and_then(|id| match id {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .ok_or_else(|| GatewayError::InvalidResponse(format!("missing message_id in {}", body)))?;

    Ok(SendReceipt { gateway_message_id })
}

#[async_trait]
impl SmsGateway for TransmitClient {
    async fn send(&self, request: &SendRequest) -> Result<SendReceipt, GatewayError> {
        debug!(to = %request.to, "Sending SMS");
        match self.post(build_form(request, true)).await {
            Err(GatewayError::Rejected { code, .. })
                if code == BAD_CALLER_ID && request.from.is_some() =>
            {
                warn!(to = %request.to, "Sender id rejected, retrying without it");
                self.post(build_form(request, false)).await
            }
            other => other,
        }
    }
}

impl Clone for TransmitClient {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            api_secret: self.api_secret.clone(),
            circuit_breaker: self.circuit_breaker.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn request() -> SendRequest {
        SendRequest {
            body: "hello".to_string(),
            to: "61412345678".to_string(),
            from: Some("61400000001".to_string()),
            delivery_callback: Some("https://example.test/dlr".to_string()),
            reply_callback: None,
        }
    }

    #[test]
    fn test_parse_success_with_numeric_id() {
        let receipt = parse_send_response(
            200,
            r#"{"message_id": 123456, "error": {"code": "SUCCESS", "description": "OK"}}"#,
        )
        .unwrap();
        assert_eq!(receipt.gateway_message_id, "123456");
    }

    #[test]
    fn test_parse_rejection() {
        let err = parse_send_response(
            400,
            r#"{"error": {"code": "BAD_CALLER_ID", "description": "Caller ID not valid"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { ref code, .. } if code == "BAD_CALLER_ID"));
    }

    #[test]
    fn test_parse_server_error_is_upstream() {
        let err = parse_send_response(502, "bad gateway").unwrap_err();
        assert!(err.is_upstream_unavailable());
    }

    #[test]
    fn test_parse_missing_id() {
        let err = parse_send_response(200, r#"{"error": {"code": "SUCCESS"}}"#).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidResponse(_)));
    }

    #[test]
    fn test_form_omits_sender_on_fallback() {
        let form = build_form(&request(), false);
        assert!(form.iter().all(|(k, _)| *k != "from"));
        assert!(form.iter().any(|(k, v)| *k == "dlr_callback" && v == "https://example.test/dlr"));
    }

    #[tokio::test]
    async fn test_send_with_mock() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/send-sms.json")
            .match_header("authorization", Matcher::Regex("^Basic ".into()))
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("to".into(), "61412345678".into()),
                Matcher::UrlEncoded("from".into(), "61400000001".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"message_id": 987, "error": {"code": "SUCCESS", "description": "OK"}}"#)
            .create_async()
            .await;

        let client = TransmitClient::new(server.url(), "key".into(), "secret".into());
        let receipt = client.send(&request()).await.unwrap();

        assert_eq!(receipt.gateway_message_id, "987");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_bad_caller_id_retries_without_sender() {
        let mut server = mockito::Server::new_async().await;
        let rejected = server
            .mock("POST", "/send-sms.json")
            .match_body(Matcher::UrlEncoded("from".into(), "61400000001".into()))
            .with_status(400)
            .with_body(r#"{"error": {"code": "BAD_CALLER_ID", "description": "Caller ID not valid"}}"#)
            .expect(1)
            .create_async()
            .await;
        let fallback = server
            .mock("POST", "/send-sms.json")
            .match_body(Matcher::Exact("message=hello&to=61412345678".into()))
            .with_status(200)
            .with_body(r#"{"message_id": "abc-1", "error": {"code": "SUCCESS"}}"#)
            .expect(1)
            .create_async()
            .await;

        let request = SendRequest {
            delivery_callback: None,
            ..request()
        };
        let client = TransmitClient::new(server.url(), "key".into(), "secret".into());
        let receipt = client.send(&request).await.unwrap();

        assert_eq!(receipt.gateway_message_id, "abc-1");
        rejected.assert_async().await;
        fallback.assert_async().await;
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_after_outages() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/send-sms.json")
            .with_status(503)
            .create_async()
            .await;

        let client = TransmitClient::with_circuit_breaker_config(
            server.url(),
            "key".into(),
            "secret".into(),
            2,
            Duration::from_secs(60),
            Duration::from_secs(5),
        );

        for _ in 0..2 {
            let err = client.send(&request()).await.unwrap_err();
            assert!(matches!(err, GatewayError::Upstream { status: 503, .. }));
        }
        let err = client.send(&request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::CircuitBreakerOpen));
    }

    #[tokio::test]
    async fn test_rejections_do_not_open_breaker() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/send-sms.json")
            .with_status(400)
            .with_body(r#"{"error": {"code": "BAD_NUMBER", "description": "invalid"}}"#)
            .create_async()
            .await;

        let client = TransmitClient::with_circuit_breaker_config(
            server.url(),
            "key".into(),
            "secret".into(),
            1,
            Duration::from_secs(60),
            Duration::from_secs(5),
        );
        for _ in 0..3 {
            let err = client.send(&request()).await.unwrap_err();
            assert!(matches!(err, GatewayError::Rejected { .. }));
        }
    }
}
