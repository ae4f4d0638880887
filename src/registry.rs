//! Topic registry: the universe of realtime tables
//!
//! The list of valid tables is not hardcoded; it is fetched once from the
//! schema endpoint that sits next to the realtime endpoint.

use reqwest::Client as HttpClient;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Path of the schema document describing the realtime API
pub const SCHEMA_PATH: &str = "/api/v1/schema/websocketHelp";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebsocketHelp {
    subscription_subjects: SubscriptionSubjects,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionSubjects {
    #[serde(default)]
    public: Vec<String>,
    #[serde(default)]
    authentication_required: Vec<String>,
}

/// Derive the schema URL from a realtime endpoint
///
/// `wss://ws.bitmex.com/realtime` becomes
/// `https://ws.bitmex.com/api/v1/schema/websocketHelp`.
pub fn schema_url(ws_endpoint: &str) -> String {
    let http = if let Some(rest) = ws_endpoint.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = ws_endpoint.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        ws_endpoint.to_string()
    };
    let base = http.split('?').next().unwrap_or_default().trim_end_matches('/');
    let base = base.strip_suffix("/realtime").unwrap_or(base);
    format!("{base}{SCHEMA_PATH}")
}

/// Valid table names, partitioned by authentication requirement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicRegistry {
    public: Vec<String>,
    private: Vec<String>,
    all: Vec<String>,
}

impl TopicRegistry {
    /// Build a registry from its public and private table lists
    pub fn new(public: Vec<String>, private: Vec<String>) -> Self {
        let mut all: Vec<String> = Vec::with_capacity(public.len() + private.len());
        for table in public.iter().chain(private.iter()) {
            if !all.contains(table) {
                all.push(table.clone());
            }
        }
        Self {
            public,
            private,
            all,
        }
    }

    /// Fetch the registry from a schema endpoint
    ///
    /// Failure here is fatal for the client; the caller does not retry.
    pub async fn fetch(http: &HttpClient, url: &str) -> Result<Self> {
        let response = http.get(url).send().await.map_err(Error::Http)?;

        let status = response.status();
        let body = response.text().await.map_err(Error::Http)?;

        if !status.is_success() {
            return Err(Error::Api(format!("HTTP {} - {}", status.as_u16(), body)));
        }

        let help: WebsocketHelp = serde_json::from_str(&body).map_err(|e| {
            if let Ok(error_obj) = serde_json::from_str::<serde_json::Value>(&body) {
                if let Some(error_msg) = error_obj.get("error").and_then(|v| v.as_str()) {
                    return Error::Api(error_msg.to_string());
                }
            }
            Error::Json(e)
        })?;

        let registry = Self::new(
            help.subscription_subjects.public,
            help.subscription_subjects.authentication_required,
        );
        tracing::debug!(
            public = registry.public.len(),
            private = registry.private.len(),
            "Fetched realtime table registry"
        );
        Ok(registry)
    }

    /// Tables available without authentication
    pub fn public(&self) -> &[String] {
        &self.public
    }

    /// Tables that require authentication
    pub fn private(&self) -> &[String] {
        &self.private
    }

    /// Every known table (public first)
    pub fn all(&self) -> &[String] {
        &self.all
    }

    pub fn contains(&self, table: &str) -> bool {
        self.all.iter().any(|t| t == table)
    }

    /// Tables a client at the given authentication level may subscribe to
    pub fn tables_for(&self, authenticated: bool) -> &[String] {
        if authenticated {
            &self.all
        } else {
            &self.public
        }
    }

    /// Fail with a descriptive error when `table` is not in the registry
    pub fn ensure_known(&self, table: &str) -> Result<()> {
        if self.contains(table) {
            Ok(())
        } else {
            Err(Error::UnknownTable {
                table: table.to_string(),
                available: self.all.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    fn sample_registry() -> TopicRegistry {
        TopicRegistry::new(
            vec!["trade".to_string(), "quote".to_string(), "chat".to_string()],
            vec!["order".to_string(), "wallet".to_string()],
        )
    }

    #[test]
    fn test_schema_url() {
        assert_eq!(
            schema_url("wss://ws.bitmex.com/realtime"),
            "https://ws.bitmex.com/api/v1/schema/websocketHelp"
        );
        assert_eq!(
            schema_url("ws://localhost:4444/realtime/"),
            "http://localhost:4444/api/v1/schema/websocketHelp"
        );
        assert_eq!(
            schema_url("wss://ws.testnet.bitmex.com/realtime?heartbeat=true"),
            "https://ws.testnet.bitmex.com/api/v1/schema/websocketHelp"
        );
    }

    #[test]
    fn test_all_is_union() {
        let registry = TopicRegistry::new(
            vec!["trade".to_string(), "quote".to_string()],
            vec!["quote".to_string(), "order".to_string()],
        );
        assert_eq!(registry.all(), ["trade", "quote", "order"]);
    }

    #[test]
    fn test_tables_for() {
        let registry = sample_registry();
        assert_eq!(registry.tables_for(false), registry.public());
        assert_eq!(registry.tables_for(true), registry.all());
        assert_eq!(registry.tables_for(true).len(), 5);
    }

    #[test]
    fn test_ensure_known() {
        let registry = sample_registry();
        assert!(registry.ensure_known("order").is_ok());

        let err = registry.ensure_known("trades").unwrap_err();
        match &err {
            Error::UnknownTable { table, available } => {
                assert_eq!(table, "trades");
                assert_eq!(available.len(), 5);
            }
            other => panic!("Expected UnknownTable, got {other:?}"),
        }
        assert!(err.to_string().contains("trades"));
        assert!(err.to_string().contains("trade,quote,chat,order,wallet"));
    }

    #[tokio::test]
    async fn test_fetch_registry() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", SCHEMA_PATH)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "info": "See https://www.bitmex.com/app/wsAPI",
                    "ops": ["authKeyExpires", "subscribe", "unsubscribe"],
                    "subscriptionSubjects": {
                        "authenticationRequired": ["execution", "order", "position", "wallet"],
                        "public": ["announcement", "chat", "instrument", "quote", "trade"]
                    }
                }"#,
            )
            .create_async()
            .await;

        let url = format!("{}{}", server.url(), SCHEMA_PATH);
        let registry = TopicRegistry::fetch(&HttpClient::new(), &url).await.unwrap();

        assert_eq!(registry.public().len(), 5);
        assert_eq!(registry.private(), ["execution", "order", "position", "wallet"]);
        assert_eq!(registry.all().len(), 9);
        assert!(registry.contains("instrument"));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_registry_http_error() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", SCHEMA_PATH)
            .with_status(503)
            .with_body("unavailable")
            .create_async()
            .await;

        let url = format!("{}{}", server.url(), SCHEMA_PATH);
        let err = TopicRegistry::fetch(&HttpClient::new(), &url)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Api(_)));
        assert!(err.to_string().contains("503"));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_registry_error_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", SCHEMA_PATH)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error": "schema disabled"}"#)
            .create_async()
            .await;

        let url = format!("{}{}", server.url(), SCHEMA_PATH);
        let err = TopicRegistry::fetch(&HttpClient::new(), &url)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "API error: schema disabled");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_registry_invalid_json() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", SCHEMA_PATH)
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let url = format!("{}{}", server.url(), SCHEMA_PATH);
        let err = TopicRegistry::fetch(&HttpClient::new(), &url)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Json(_)));
    }
}
