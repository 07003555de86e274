//! HTTP client for a single opencode server instance.
//!
//! One client per project directory, pointed at the loopback port its
//! supervisor picked. The client carries no request timeout: the event
//! stream idles for as long as the session does.

use crate::agent::types::{
    AgentEvent, MessageWithParts, Project, PromptPart, ProviderList, Session,
};
use crate::error::AgentError;
use eventsource_stream::Eventsource;
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use serde_json::json;

/// User reply to a pending permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionReply {
    Once,
    Always,
    Reject,
}

#[derive(Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    base_url: String,
}

impl AgentClient {
    pub fn new(port: u16) -> Self {
        Self::with_base_url(format!("http://127.0.0.1:{port}"))
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        // No total timeout: prompt submissions and the SSE stream can idle
        // for minutes while the agent works.
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("reqwest client construction is infallible with static config");
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, AgentError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(AgentError::Api {
            status: status.as_u16(),
            body,
        })
    }

    /// `GET /global/health`, the readiness probe used by the supervisor.
    pub async fn health(&self) -> Result<(), AgentError> {
        let response = self.http.get(self.url("/global/health")).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Register a provider API key with the agent.
    pub async fn set_auth(&self, provider_id: &str, key: &str) -> Result<(), AgentError> {
        let response = self
            .http
            .put(self.url(&format!("/auth/{provider_id}")))
            .json(&json!({"type": "api", "key": key}))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn create_session(&self, title: Option<&str>) -> Result<Session, AgentError> {
        let mut body = serde_json::Map::new();
        if let Some(title) = title {
            body.insert("title".into(), json!(title));
        }
        let response = self
            .http
            .post(self.url("/session"))
            .json(&body)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session, AgentError> {
        let response = self
            .http
            .get(self.url(&format!("/session/{session_id}")))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AgentError::SessionNotFound(session_id.to_owned()));
        }
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>, AgentError> {
        let response = self.http.get(self.url("/session")).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn messages(&self, session_id: &str) -> Result<Vec<MessageWithParts>, AgentError> {
        let response = self
            .http
            .get(self.url(&format!("/session/{session_id}/message")))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Submit a prompt. Returns once the agent has finished the turn.
    pub async fn prompt(
        &self,
        session_id: &str,
        parts: Vec<PromptPart>,
        system: Option<String>,
    ) -> Result<(), AgentError> {
        let mut body = serde_json::Map::new();
        body.insert("parts".into(), serde_json::to_value(parts).unwrap_or_default());
        if let Some(system) = system {
            body.insert("system".into(), json!(system));
        }
        let response = self
            .http
            .post(self.url(&format!("/session/{session_id}/message")))
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Run a slash command (`/name args`) inside the session.
    pub async fn command(
        &self,
        session_id: &str,
        command: &str,
        arguments: &str,
    ) -> Result<(), AgentError> {
        let response = self
            .http
            .post(self.url(&format!("/session/{session_id}/command")))
            .json(&json!({"command": command, "arguments": arguments}))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn abort(&self, session_id: &str) -> Result<(), AgentError> {
        let response = self
            .http
            .post(self.url(&format!("/session/{session_id}/abort")))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Share the session; returns the public URL.
    pub async fn share(&self, session_id: &str) -> Result<Option<String>, AgentError> {
        let response = self
            .http
            .post(self.url(&format!("/session/{session_id}/share")))
            .send()
            .await?;
        let session: Session = Self::check(response).await?.json().await?;
        Ok(session.share.map(|share| share.url))
    }

    pub async fn reply_permission(
        &self,
        session_id: &str,
        permission_id: &str,
        reply: PermissionReply,
    ) -> Result<(), AgentError> {
        let response = self
            .http
            .post(self.url(&format!(
                "/session/{session_id}/permissions/{permission_id}"
            )))
            .json(&json!({"response": reply}))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn providers(&self) -> Result<ProviderList, AgentError> {
        let response = self.http.get(self.url("/config/providers")).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn projects(&self) -> Result<Vec<Project>, AgentError> {
        let response = self.http.get(self.url("/project")).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Fuzzy file search under the project directory.
    pub async fn find_files(&self, query: &str) -> Result<Vec<String>, AgentError> {
        let response = self
            .http
            .get(self.url("/find/file"))
            .query(&[("query", query)])
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Subscribe to the server's event stream.
    ///
    /// Unparseable events are skipped: the stream carries many event types
    /// the bridge does not consume, and a newer server must not break us.
    pub async fn events(
        &self,
    ) -> Result<impl Stream<Item = AgentEvent> + Send + Unpin, AgentError> {
        let response = self.http.get(self.url("/event")).send().await?;
        let response = Self::check(response).await?;

        let stream = response
            .bytes_stream()
            .eventsource()
            .filter_map(|item| async move {
                match item {
                    Ok(event) => match serde_json::from_str::<AgentEvent>(&event.data) {
                        Ok(parsed) => Some(parsed),
                        Err(error) => {
                            tracing::trace!(%error, data = %event.data, "skipping unparseable event");
                            None
                        }
                    },
                    Err(error) => {
                        tracing::debug!(%error, "event stream transport error");
                        None
                    }
                }
            });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt as _;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn health_succeeds_on_200() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/global/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"healthy": true})))
            .mount(&server)
            .await;

        let client = AgentClient::with_base_url(server.uri());
        client.health().await.unwrap();
    }

    #[tokio::test]
    async fn get_session_maps_404_to_session_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/session/ses_missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = AgentClient::with_base_url(server.uri());
        let error = client.get_session("ses_missing").await.unwrap_err();
        assert!(matches!(error, AgentError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn permission_reply_sends_scope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session/ses_1/permissions/perm_1"))
            .and(body_json(serde_json::json!({"response": "always"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!(true)))
            .mount(&server)
            .await;

        let client = AgentClient::with_base_url(server.uri());
        client
            .reply_permission("ses_1", "perm_1", PermissionReply::Always)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn events_stream_parses_and_skips_unknown() {
        let sse = concat!(
            "data: {\"type\":\"session.idle\",\"properties\":{\"sessionID\":\"ses_1\"}}\n\n",
            "data: not json at all\n\n",
            "data: {\"type\":\"message.part.updated\",\"properties\":{\"part\":{\"id\":\"prt_1\",\"messageID\":\"m\",\"sessionID\":\"ses_1\",\"type\":\"text\",\"text\":\"hi\"}}}\n\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/event"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse),
            )
            .mount(&server)
            .await;

        let client = AgentClient::with_base_url(server.uri());
        let mut stream = client.events().await.unwrap();

        let first = stream.next().await.unwrap();
        assert!(matches!(first, AgentEvent::SessionIdle { .. }));
        let second = stream.next().await.unwrap();
        assert!(matches!(second, AgentEvent::PartUpdated { .. }));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn api_errors_carry_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session/ses_1/abort"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = AgentClient::with_base_url(server.uri());
        match client.abort("ses_1").await.unwrap_err() {
            AgentError::Api { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }
}
