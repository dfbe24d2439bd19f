//! HTTP transport for the recommendation oracle

use super::{Oracle, OracleRequest};
use crate::config::OracleConfig;
use crate::error::OracleError;
use async_trait::async_trait;
use reqwest::Client;
use url::Url;

const RECOMMENDATIONS_PATH: &str = "v1/recommendations";

/// POSTs requests to `<endpoint>/v1/recommendations`
pub struct HttpOracle {
    client: Client,
    url: Url,
    api_key: Option<String>,
    timeout_ms: u64,
}

impl HttpOracle {
    pub fn new(config: &OracleConfig) -> Result<Self, OracleError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| OracleError::Transport(e.to_string()))?;

        let mut base = Url::parse(&config.endpoint)
            .map_err(|e| OracleError::Transport(format!("invalid endpoint: {}", e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let url = base
            .join(RECOMMENDATIONS_PATH)
            .map_err(|e| OracleError::Transport(format!("invalid endpoint: {}", e)))?;

        Ok(Self {
            client,
            url,
            api_key: config.api_key.clone(),
            timeout_ms: config.timeout_ms,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Oracle for HttpOracle {
    async fn query(&self, request: &OracleRequest) -> Result<serde_json::Value, OracleError> {
        let mut builder = self.client.post(self.url.clone()).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                OracleError::Timeout(self.timeout_ms)
            } else {
                OracleError::Transport(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(OracleError::Status { status, body });
        }

        response
            .json()
            .await
            .map_err(|e| OracleError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WorkloadIdentity;

    fn request() -> OracleRequest {
        OracleRequest::new(WorkloadIdentity::new("shop", "checkout", "node-1"), &[], &[], 20)
    }

    fn config(endpoint: String, api_key: Option<&str>) -> OracleConfig {
        OracleConfig {
            endpoint,
            api_key: api_key.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_url_keeps_endpoint_path() {
        let oracle = HttpOracle::new(&config("http://oracle:9090/api".to_string(), None)).unwrap();
        assert_eq!(oracle.url().as_str(), "http://oracle:9090/api/v1/recommendations");

        let oracle = HttpOracle::new(&config("http://oracle:9090".to_string(), None)).unwrap();
        assert_eq!(oracle.url().as_str(), "http://oracle:9090/v1/recommendations");
    }

    #[tokio::test]
    async fn test_query_posts_json_with_bearer_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/recommendations")
            .match_header("authorization", "Bearer secret")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "workload": {"namespace": "shop", "name": "checkout"}
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"action":"no_action","confidence":0.2}"#)
            .create_async()
            .await;

        let oracle = HttpOracle::new(&config(server.url(), Some("secret"))).unwrap();
        let reply = oracle.query(&request()).await.unwrap();

        assert_eq!(reply["action"], "no_action");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_success_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/recommendations")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let oracle = HttpOracle::new(&config(server.url(), None)).unwrap();
        let err = oracle.query(&request()).await.unwrap_err();
        assert!(matches!(err, OracleError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_non_json_body_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/recommendations")
            .with_status(200)
            .with_body("<html>oops</html>")
            .create_async()
            .await;

        let oracle = HttpOracle::new(&config(server.url(), None)).unwrap();
        let err = oracle.query(&request()).await.unwrap_err();
        assert!(matches!(err, OracleError::Malformed(_)));
    }
}
