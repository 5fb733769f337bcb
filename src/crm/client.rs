use crate::crm::{crm_status, CrmError, CrmSink, LedgerMirror, MirrorSnapshot};
use crate::domain::{Message, MessageStatus};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

const API_VERSION: &str = "2021-04-15";

/// HTTP client for the CRM's conversations and custom-object APIs.
#[derive(Clone)]
pub struct CrmClient {
    client: Client,
    base_url: String,
    access_token: String,
    location_id: String,
    object_key: String,
}

impl CrmClient {
    pub fn new(base_url: String, access_token: String, location_id: String, object_key: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        CrmClient {
            client,
            base_url,
            access_token,
            location_id,
            object_key,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .bearer_auth(&self.access_token)
            .header("Accept", "application/json")
            .header("Version", API_VERSION)
    }

    async fn check(response: Response) -> Result<(), CrmError> {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(CrmError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CrmError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CrmSink for CrmClient {
    async fn update_message_status(
        &self,
        crm_message_id: &str,
        status: MessageStatus,
    ) -> Result<(), CrmError> {
        let url = self.url(&format!("/conversations/messages/{}/status", crm_message_id));
        let status = crm_status(status);
        debug!(crm_message_id, status, "Updating CRM message status");

        let response = self
            .authorized(self.client.put(&url))
            .json(&json!({ "status": status }))
            .send()
            .await?;
        Self::check(response).await
    }

    async fn push_inbound(&self, message: &Message) -> Result<(), CrmError> {
        let conversation_id = message
            .crm_conversation_id
            .as_deref()
            .ok_or_else(|| CrmError::MissingContext(message.id.to_string()))?;
        let url = self.url("/conversations/messages/inbound");

        let response = self
            .authorized(self.client.post(&url))
            .json(&json!({
                "type": "SMS",
                "conversationId": conversation_id,
                "contactId": message.crm_contact_id,
                "message": message.body,
                "direction": "inbound",
            }))
            .send()
            .await?;
        Self::check(response).await
    }
}

#[async_trait]
impl LedgerMirror for CrmClient {
    async fn push_counters(
        &self,
        external_ref: &str,
        snapshot: &MirrorSnapshot,
    ) -> Result<(), CrmError> {
        let url = self.url(&format!(
            "/objects/{}/records/{}?locationId={}",
            self.object_key, external_ref, self.location_id
        ));

        let response = self
            .authorized(self.client.put(&url))
            .json(&json!({ "properties": snapshot.to_properties() }))
            .send()
            .await?;
        Self::check(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Direction, NewMessage};
    use bigdecimal::BigDecimal;
    use mockito::Matcher;
    use std::str::FromStr;
    use uuid::Uuid;

    fn client(url: String) -> CrmClient {
        CrmClient::new(url, "token".into(), "loc-main".into(), "custom_objects.sms_credits".into())
    }

    #[tokio::test]
    async fn test_update_status_maps_failed_to_pending() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/conversations/messages/crm-1/status")
            .match_header("authorization", "Bearer token")
            .match_header("version", API_VERSION)
            .match_body(Matcher::Json(json!({ "status": "pending" })))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        client(server.url())
            .update_message_status("crm-1", MessageStatus::Failed)
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_too_many_requests_is_rate_limited() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("PUT", "/conversations/messages/crm-2/status")
            .with_status(429)
            .create_async()
            .await;

        let err = client(server.url())
            .update_message_status("crm-2", MessageStatus::Delivered)
            .await
            .unwrap_err();
        assert!(matches!(err, CrmError::RateLimited));
    }

    #[tokio::test]
    async fn test_push_inbound() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/conversations/messages/inbound")
            .match_body(Matcher::PartialJson(json!({
                "conversationId": "conv-9",
                "message": "reply text",
                "type": "SMS",
            })))
            .with_status(201)
            .with_body("{}")
            .create_async()
            .await;

        let mut message = Message::new(
            NewMessage {
                account_id: Uuid::new_v4(),
                body: "reply text".into(),
                crm_conversation_id: Some("conv-9".into()),
                ..Default::default()
            },
            Direction::Inbound,
            MessageStatus::Queued,
        );
        message.crm_contact_id = Some("contact-1".into());

        client(server.url()).push_inbound(&message).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_push_inbound_without_conversation() {
        let message = Message::new(NewMessage::default(), Direction::Inbound, MessageStatus::Queued);
        let err = client("http://127.0.0.1:9".into())
            .push_inbound(&message)
            .await
            .unwrap_err();
        assert!(matches!(err, CrmError::MissingContext(_)));
    }

    #[tokio::test]
    async fn test_push_counters() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/objects/custom_objects.sms_credits/records/rec-1")
            .match_query(Matcher::UrlEncoded("locationId".into(), "loc-main".into()))
            .match_body(Matcher::PartialJson(json!({
                "properties": { "seg_remaining": 4, "seg_used": 1 }
            })))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let snapshot = MirrorSnapshot {
            remaining_credits: BigDecimal::from_str("0.08").unwrap(),
            segments_remaining: 4,
            spent_total: BigDecimal::from_str("0.02").unwrap(),
            segments_used: 1,
            outbound_rate: BigDecimal::from_str("0.02").unwrap(),
        };
        client(server.url()).push_counters("rec-1", &snapshot).await.unwrap();
        mock.assert_async().await;
    }
}
