//! Turns user credentials and a workspace id into a validated [`Connection`]
//! via the workspace control plane's HTTP API.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::connection::Connection;
use crate::error::{Error, Result};

/// The public Codespaces-style control-plane base URL the GitHub CLI targets
/// by default.
pub const DEFAULT_DISCOVERY_BASE_URL: &str = "https://api.github.com/vscs_internal";

/// Resolves a workspace id into a [`Connection`].
///
/// The core consumes discovery only through this trait; any implementation
/// satisfying it is acceptable, including a test double.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn resolve(&self, workspace_id: &str) -> Result<Connection>;
}

#[derive(Debug, Deserialize)]
struct WorkspaceInfoResponse {
    relay_endpoint: String,
    relay_sas: String,
}

#[derive(Debug, Deserialize)]
struct JoinWorkspaceResponse {
    session_id: String,
    session_token: String,
}

/// An [`Discovery`] implementation backed by two HTTP round trips against a
/// workspace control plane: one to fetch the relay endpoint and SAS, one to
/// join the workspace and obtain a session id and token.
pub struct HttpDiscovery {
    client: reqwest::Client,
    base_url: String,
    user_token: String,
}

impl HttpDiscovery {
    /// Build a discovery client against [`DEFAULT_DISCOVERY_BASE_URL`].
    pub fn new(user_token: impl Into<String>) -> Self {
        Self::with_base_url(user_token, DEFAULT_DISCOVERY_BASE_URL)
    }

    /// Build a discovery client against a custom control-plane base URL
    /// (used in tests, or against an enterprise deployment).
    pub fn with_base_url(user_token: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            user_token: user_token.into(),
        }
    }
}

#[async_trait]
impl Discovery for HttpDiscovery {
    async fn resolve(&self, workspace_id: &str) -> Result<Connection> {
        debug!(%workspace_id, "resolving workspace via discovery");

        let info_url = format!("{}/workspaces/{workspace_id}", self.base_url);
        let info_response = self
            .client
            .get(&info_url)
            .bearer_auth(&self.user_token)
            .send()
            .await
            .map_err(|e| Error::Discovery {
                reason: e.to_string(),
                status: None,
            })?;

        if !info_response.status().is_success() {
            return Err(Error::Discovery {
                reason: format!("GET {info_url} failed"),
                status: Some(info_response.status().as_u16()),
            });
        }

        let info: WorkspaceInfoResponse =
            info_response.json().await.map_err(|e| Error::Discovery {
                reason: format!("malformed workspace info response: {e}"),
                status: None,
            })?;

        let join_url = format!("{}/workspaces/{workspace_id}/join", self.base_url);
        let join_response = self
            .client
            .post(&join_url)
            .bearer_auth(&self.user_token)
            .send()
            .await
            .map_err(|e| Error::Discovery {
                reason: e.to_string(),
                status: None,
            })?;

        if !join_response.status().is_success() {
            return Err(Error::Discovery {
                reason: format!("POST {join_url} failed"),
                status: Some(join_response.status().as_u16()),
            });
        }

        let join: JoinWorkspaceResponse =
            join_response.json().await.map_err(|e| Error::Discovery {
                reason: format!("malformed join response: {e}"),
                status: None,
            })?;

        Connection::new(
            join.session_id,
            join.session_token,
            info.relay_sas,
            info.relay_endpoint,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn resolve_fails_with_http_status_on_non_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/workspaces/ws1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let discovery = HttpDiscovery::with_base_url("token", server.uri());
        let err = discovery.resolve("ws1").await.unwrap_err();
        match err {
            Error::Discovery { status, .. } => assert_eq!(status, Some(404)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolve_succeeds_and_yields_validated_connection() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/workspaces/ws1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "relay_endpoint": "sb://host.servicebus.windows.net/abc/",
                "relay_sas": "sastoken"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/workspaces/ws1/join"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "session_id": "sess-1",
                "session_token": "tok-1"
            })))
            .mount(&server)
            .await;

        let discovery = HttpDiscovery::with_base_url("token", server.uri());
        let conn = discovery.resolve("ws1").await.unwrap();
        assert_eq!(conn.session_id(), "sess-1");
        assert_eq!(conn.relay_sas(), "sastoken");
    }

    #[tokio::test]
    async fn resolve_fails_on_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/workspaces/ws1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let discovery = HttpDiscovery::with_base_url("token", server.uri());
        let err = discovery.resolve("ws1").await.unwrap_err();
        match err {
            Error::Discovery { status, reason } => {
                assert_eq!(status, None);
                assert!(reason.contains("malformed"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
