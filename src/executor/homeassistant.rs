//! Home Assistant `ServiceHandler` (§4.H): a REST client over Home
//! Assistant's `/api/` surface. Grounded on the HTTP-client shape of the
//! teacher's `ai/providers/openai_compatible.rs` — a `reqwest::Client`
//! built once at construction with a fixed timeout and bearer
//! authentication, generalized from chat completions to service calls
//! and state queries.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;

use crate::error::GatewayError;

use super::ServiceHandler;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct HomeAssistantConfig {
    /// Base URL of the Home Assistant instance, e.g. `http://homeassistant.local:8123`.
    pub base_url: String,
    /// Long-lived access token.
    pub access_token: String,
}

pub struct HomeAssistantService {
    client: Client,
    base_url: String,
    access_token: String,
}

impl HomeAssistantService {
    pub fn new(config: HomeAssistantConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn string_arg(args: &BTreeMap<String, Value>, key: &str) -> Result<String, GatewayError> {
        match args.get(key) {
            Some(Value::String(s)) => Ok(s.clone()),
            _ => Err(GatewayError::Execution(format!("missing or non-string argument: {key}"))),
        }
    }

    async fn call_service(&self, args: &BTreeMap<String, Value>) -> Result<Value, GatewayError> {
        let domain = Self::string_arg(args, "domain")?;
        let service = Self::string_arg(args, "service")?;
        let mut payload = serde_json::Map::new();
        if let Some(entity_id) = args.get("entity_id") {
            payload.insert("entity_id".to_string(), entity_id.clone());
        }
        let response = self
            .client
            .post(self.url(&format!("/api/services/{domain}/{service}")))
            .bearer_auth(&self.access_token)
            .json(&Value::Object(payload))
            .send()
            .await
            .map_err(|e| GatewayError::Execution(format!("home assistant request failed: {e}")))?;
        Self::parse_response(response).await
    }

    async fn get_state(&self, args: &BTreeMap<String, Value>) -> Result<Value, GatewayError> {
        let entity_id = Self::string_arg(args, "entity_id")?;
        let response = self
            .client
            .get(self.url(&format!("/api/states/{entity_id}")))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| GatewayError::Execution(format!("home assistant request failed: {e}")))?;
        Self::parse_response(response).await
    }

    async fn get_states(&self) -> Result<Value, GatewayError> {
        let response = self
            .client
            .get(self.url("/api/states"))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| GatewayError::Execution(format!("home assistant request failed: {e}")))?;
        Self::parse_response(response).await
    }

    async fn fire_event(&self, args: &BTreeMap<String, Value>) -> Result<Value, GatewayError> {
        let event_type = Self::string_arg(args, "event_type")?;
        let body = args.get("event_data").cloned().unwrap_or(Value::Object(Default::default()));
        let response = self
            .client
            .post(self.url(&format!("/api/events/{event_type}")))
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Execution(format!("home assistant request failed: {e}")))?;
        Self::parse_response(response).await
    }

    async fn parse_response(response: reqwest::Response) -> Result<Value, GatewayError> {
        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::CREATED {
            response
                .json::<Value>()
                .await
                .or_else(|_| Ok(Value::Null))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(GatewayError::Execution(format!("home assistant returned {status}: {body}")))
        }
    }
}

#[async_trait]
impl ServiceHandler for HomeAssistantService {
    async fn execute(&self, tool: &str, args: &BTreeMap<String, Value>) -> Result<Value, GatewayError> {
        match tool {
            "ha_call_service" => self.call_service(args).await,
            "ha_get_state" => self.get_state(args).await,
            "ha_get_states" => self.get_states().await,
            "ha_fire_event" => self.fire_event(args).await,
            other => Err(GatewayError::Execution(format!("unsupported home assistant tool: {other}"))),
        }
    }

    async fn health_check(&self) -> bool {
        self.client
            .get(self.url("/api/"))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_trailing_slash_from_base_url() {
        let service = HomeAssistantService::new(HomeAssistantConfig {
            base_url: "http://homeassistant.local:8123/".to_string(),
            access_token: "token".to_string(),
        })
        .unwrap();
        assert_eq!(service.url("/api/states"), "http://homeassistant.local:8123/api/states");
    }

    #[test]
    fn string_arg_rejects_missing_key() {
        let args: BTreeMap<String, Value> = BTreeMap::new();
        let result = HomeAssistantService::string_arg(&args, "entity_id");
        assert!(result.is_err());
    }

    #[test]
    fn string_arg_rejects_non_string_value() {
        let mut args = BTreeMap::new();
        args.insert("entity_id".to_string(), serde_json::json!(42));
        let result = HomeAssistantService::string_arg(&args, "entity_id");
        assert!(result.is_err());
    }
}
