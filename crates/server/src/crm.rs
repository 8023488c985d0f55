//! Lead access over the CRM service REST API.
//!
//! The gateway is the production `LeadStore`: `update_lead` nodes become `PUT /api/leads/{id}`
//! and `send_message` nodes become `POST /api/messages/send`. Every request carries the
//! configured API key as a bearer token.

use std::time::Duration;

use async_trait::async_trait;
use leadflow_core::config::CrmConfig;
use leadflow_core::domain::lead::{Lead, LeadId, LeadUpdate, Message, MessageId};
use leadflow_db::repositories::{LeadStore, RepositoryError};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Clone)]
pub struct HttpCrmGateway {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest<'a> {
    lead_id: &'a str,
    content: &'a str,
    message_type: &'a str,
}

#[derive(Deserialize)]
struct SentMessage {
    #[serde(default)]
    id: Option<String>,
}

impl HttpCrmGateway {
    pub fn new(
        base_url: &str,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, RepositoryError> {
        let client = Client::builder().timeout(timeout).build().map_err(|error| {
            RepositoryError::Integration(format!("failed to build crm http client: {error}"))
        })?;

        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string(), api_key })
    }

    /// Returns `Ok(None)` when the CRM integration is disabled.
    pub fn from_config(config: &CrmConfig) -> Result<Option<Self>, RepositoryError> {
        if !config.enabled {
            return Ok(None);
        }
        let base_url = config.base_url.as_deref().ok_or_else(|| {
            RepositoryError::Integration("crm.base_url is not configured".to_string())
        })?;

        Self::new(base_url, config.api_key.clone(), Duration::from_secs(config.timeout_secs))
            .map(Some)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {}", key.expose_secret())),
            None => request,
        }
    }

    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Response, RepositoryError> {
        self.authorized(request).send().await.map_err(|error| {
            warn!(
                event_name = "crm.request.failed",
                operation,
                error = %error,
                "crm request could not be sent"
            );
            RepositoryError::Integration(format!("crm {operation} request failed: {error}"))
        })
    }
}

fn unexpected_status(operation: &str, status: StatusCode) -> RepositoryError {
    RepositoryError::Integration(format!("crm {operation} returned {status}"))
}

async fn decode<T: for<'de> Deserialize<'de>>(
    operation: &str,
    response: Response,
) -> Result<T, RepositoryError> {
    response
        .json::<T>()
        .await
        .map_err(|error| RepositoryError::Decode(format!("crm {operation} response: {error}")))
}

#[async_trait]
impl LeadStore for HttpCrmGateway {
    async fn find_lead(&self, id: &LeadId) -> Result<Option<Lead>, RepositoryError> {
        let request = self.client.get(self.url(&format!("/api/leads/{}", id.0)));
        let response = self.send("get_lead", request).await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => decode("get_lead", response).await.map(Some),
            status => Err(unexpected_status("get_lead", status)),
        }
    }

    async fn update_lead(&self, id: &LeadId, update: &LeadUpdate) -> Result<Lead, RepositoryError> {
        let request = self.client.put(self.url(&format!("/api/leads/{}", id.0))).json(update);
        let response = self.send("update_lead", request).await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(RepositoryError::NotFound(format!("lead `{}`", id.0))),
            status if status.is_success() => {
                let lead = decode("update_lead", response).await?;
                info!(event_name = "crm.lead.updated", lead_id = %id, "lead updated in crm");
                Ok(lead)
            }
            status => Err(unexpected_status("update_lead", status)),
        }
    }

    async fn send_message(&self, mut message: Message) -> Result<Message, RepositoryError> {
        let body = SendMessageRequest {
            lead_id: &message.lead_id.0,
            content: &message.content,
            message_type: &message.message_type,
        };
        let request = self.client.post(self.url("/api/messages/send")).json(&body);
        let response = self.send("send_message", request).await?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                Err(RepositoryError::NotFound(format!("lead `{}`", message.lead_id.0)))
            }
            status if status.is_success() => {
                let sent: SentMessage = decode("send_message", response).await?;
                if let Some(id) = sent.id {
                    message.id = MessageId(id);
                }
                info!(
                    event_name = "crm.message.sent",
                    lead_id = %message.lead_id,
                    message_id = %message.id.0,
                    "message sent through crm"
                );
                Ok(message)
            }
            status => Err(unexpected_status("send_message", status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::{
        extract::{Path, State},
        http::{HeaderMap, StatusCode},
        routing::{get, post},
        Json, Router,
    };
    use leadflow_core::config::CrmConfig;
    use leadflow_core::domain::lead::{Lead, LeadId, LeadUpdate, Message};
    use leadflow_db::repositories::{LeadStore, RepositoryError};
    use secrecy::SecretString;
    use serde_json::{json, Value};

    use super::HttpCrmGateway;

    #[derive(Clone, Default)]
    struct Recorded {
        requests: Arc<Mutex<Vec<(String, Option<String>, Value)>>>,
    }

    impl Recorded {
        fn push(&self, route: &str, headers: &HeaderMap, body: Value) {
            let auth = headers
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            self.requests.lock().expect("lock").push((route.to_string(), auth, body));
        }

        fn all(&self) -> Vec<(String, Option<String>, Value)> {
            self.requests.lock().expect("lock").clone()
        }
    }

    fn lead_json(id: &str, status: &str) -> Value {
        json!({
            "id": id,
            "name": "Ada",
            "status": status,
            "fields": {},
            "updatedAt": "2026-01-05T10:00:00Z"
        })
    }

    async fn mock_crm(recorded: Recorded) -> String {
        let router = Router::new()
            .route(
                "/api/leads/{id}",
                get(|Path(id): Path<String>| async move {
                    if id == "lead-1" {
                        Ok(Json(lead_json(&id, "NEW")))
                    } else {
                        Err(StatusCode::NOT_FOUND)
                    }
                })
                .put(
                    |State(recorded): State<Recorded>,
                     Path(id): Path<String>,
                     headers: HeaderMap,
                     Json(body): Json<Value>| async move {
                        recorded.push("update", &headers, body.clone());
                        match id.as_str() {
                            "lead-1" => {
                                let status = body["status"].as_str().unwrap_or("NEW").to_string();
                                Ok(Json(lead_json(&id, &status)))
                            }
                            "broken" => Err(StatusCode::INTERNAL_SERVER_ERROR),
                            _ => Err(StatusCode::NOT_FOUND),
                        }
                    },
                ),
            )
            .route(
                "/api/messages/send",
                post(
                    |State(recorded): State<Recorded>,
                     headers: HeaderMap,
                     Json(body): Json<Value>| async move {
                        recorded.push("send", &headers, body);
                        Json(json!({ "id": "crm-msg-7", "status": "SENT" }))
                    },
                ),
            )
            .with_state(recorded);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("address");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{address}")
    }

    fn gateway(base_url: &str) -> HttpCrmGateway {
        HttpCrmGateway::new(
            base_url,
            Some(SecretString::from("crm-secret".to_string())),
            Duration::from_secs(5),
        )
        .expect("gateway")
    }

    #[tokio::test]
    async fn find_lead_maps_missing_leads_to_none() {
        let base_url = mock_crm(Recorded::default()).await;
        let crm = gateway(&base_url);

        let lead = crm.find_lead(&LeadId("lead-1".to_string())).await.expect("find");
        assert_eq!(lead.map(|lead| lead.name), Some("Ada".to_string()));

        let missing = crm.find_lead(&LeadId("nobody".to_string())).await.expect("find");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn update_lead_sends_the_partial_update_with_bearer_auth() {
        let recorded = Recorded::default();
        let base_url = mock_crm(recorded.clone()).await;
        let crm = gateway(&base_url);

        let mut update =
            LeadUpdate { status: Some("QUALIFIED".to_string()), ..LeadUpdate::default() };
        update.fields.insert("segment".to_string(), json!("enterprise"));
        let lead: Lead =
            crm.update_lead(&LeadId("lead-1".to_string()), &update).await.expect("update");

        assert_eq!(lead.status, "QUALIFIED");
        let requests = recorded.all();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].1.as_deref(), Some("Bearer crm-secret"));
        assert_eq!(requests[0].2, json!({ "status": "QUALIFIED", "segment": "enterprise" }));
    }

    #[tokio::test]
    async fn update_lead_errors_are_classified() {
        let base_url = mock_crm(Recorded::default()).await;
        let crm = gateway(&base_url);

        let missing = crm
            .update_lead(&LeadId("nobody".to_string()), &LeadUpdate::default())
            .await
            .expect_err("missing");
        assert!(matches!(missing, RepositoryError::NotFound(_)));

        let broken = crm
            .update_lead(&LeadId("broken".to_string()), &LeadUpdate::default())
            .await
            .expect_err("server error");
        assert!(matches!(broken, RepositoryError::Integration(ref message) if message.contains("500")));
    }

    #[tokio::test]
    async fn send_message_adopts_the_crm_message_id() {
        let recorded = Recorded::default();
        let base_url = mock_crm(recorded.clone()).await;
        let crm = gateway(&base_url);

        let sent = crm
            .send_message(Message::outbound(LeadId("lead-1".to_string()), "Hello Ada", "EMAIL"))
            .await
            .expect("send");

        assert_eq!(sent.id.0, "crm-msg-7");
        let requests = recorded.all();
        assert_eq!(
            requests[0].2,
            json!({ "leadId": "lead-1", "content": "Hello Ada", "messageType": "EMAIL" })
        );
    }

    #[tokio::test]
    async fn unreachable_crm_is_an_integration_error() {
        let crm = gateway("http://127.0.0.1:1");

        let error = crm.find_lead(&LeadId("lead-1".to_string())).await.expect_err("unreachable");
        assert!(matches!(error, RepositoryError::Integration(_)));
    }

    #[test]
    fn disabled_config_yields_no_gateway() {
        let config = CrmConfig { enabled: false, base_url: None, api_key: None, timeout_secs: 10 };
        assert!(HttpCrmGateway::from_config(&config).expect("config").is_none());
    }
}
