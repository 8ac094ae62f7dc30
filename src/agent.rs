//! # Agent Module
//!
//! Talks to a RAGFlow agent that turns a research question into a comma
//! separated keyword list.
//!
//! Two calls per question:
//! 1. open a conversation session
//! 2. stream a completion for that session and keep the whole transcript
//!
//! The transcript is then handed to [`crate::stream`] for answer extraction.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::envelope::{self, ApiResult};
use crate::stream::{LineBuffer, StreamError, Transcript, DATA_MARKER};

const CONNECT_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// ERRORS
// =============================================================================
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP error ({0}): {1}")]
    Status(u16, String),

    #[error("RAGFlow error ({code}): {message}")]
    Api { code: i64, message: String },

    #[error("No session id in response: {0}")]
    MissingSessionId(String),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

// =============================================================================
// KEYWORD SOURCE
// =============================================================================
/// Anything that can turn a research question into search keywords.
///
/// `Ok(None)` means the source answered but produced no keywords.
#[async_trait]
pub trait KeywordSource: Send + Sync {
    async fn keywords(&self, query: &str) -> anyhow::Result<Option<Vec<String>>>;
}

// =============================================================================
// WIRE TYPES
// =============================================================================
#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    id: &'a str,
    session_id: &'a str,
    question: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct SessionData {
    id: String,
}

// =============================================================================
// AGENT CLIENT
// =============================================================================
pub struct AgentClient {
    client: Client,
    base_url: String,
    api_key: String,
    agent_id: String,
    user_id: String,
}

impl AgentClient {
    pub fn new(config: &Config) -> Result<Self, AgentError> {
        // The agent may stream progress events for minutes, so the limit is on
        // silence between reads rather than on the whole response.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .read_timeout(Duration::from_secs(config.stream_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.ragflow_root().to_string(),
            api_key: config.ragflow_api_key.clone(),
            agent_id: config.keyword_agent_id.clone(),
            user_id: config.session_user_id.clone(),
        })
    }

    fn agent_url(&self, endpoint: &str) -> String {
        format!(
            "{}/api/v1/agents/{}/{}",
            self.base_url, self.agent_id, endpoint
        )
    }

    /// Create a new conversation session and return its id.
    ///
    /// Depending on the RAGFlow version the answer is either a JSON envelope
    /// (`{"code":0,"data":{"id":...}}`) or a short SSE stream whose events
    /// carry a `session_id`. Both are accepted.
    pub async fn open_session(&self) -> Result<String, AgentError> {
        info!(agent_id = %self.agent_id, "Creating agent session");

        let response = self
            .client
            .post(self.agent_url("sessions"))
            .bearer_auth(&self.api_key)
            .query(&[("user_id", self.user_id.as_str())])
            .json(&serde_json::json!({}))
            .send()
            .await?;

        let status = response.status();
        let is_event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));
        let body = response.text().await?;

        if !status.is_success() {
            return Err(AgentError::Status(status.as_u16(), body));
        }

        let session_id = if is_event_stream || body.trim_start().starts_with(DATA_MARKER) {
            session_id_from_events(&body)
        } else {
            match envelope::decode::<SessionData>(&body) {
                ApiResult::Success(data) => Some(data.id),
                ApiResult::Error { code, message } => {
                    return Err(AgentError::Api { code, message })
                }
                ApiResult::Malformed(reason) => {
                    debug!(reason = %reason, "Session response did not match envelope");
                    None
                }
            }
        };

        match session_id {
            Some(id) if !id.is_empty() => {
                info!(session_id = %id, "Obtained session id");
                Ok(id)
            }
            _ => Err(AgentError::MissingSessionId(body)),
        }
    }

    /// Ask `question` within `session_id`, returning the full event transcript.
    ///
    /// The body is read chunk by chunk until the server closes the stream.
    /// If the connection breaks (or goes quiet past the read timeout) after
    /// some lines arrived, those lines are kept and the half-received line is
    /// dropped. A failure before any line arrives is returned as an error.
    pub async fn stream_answer(
        &self,
        session_id: &str,
        question: &str,
    ) -> Result<Transcript, AgentError> {
        info!(session_id = %session_id, "Sending question, streaming response");

        let request = CompletionRequest {
            id: &self.agent_id,
            session_id,
            question,
            stream: true,
        };

        let mut response = self
            .client
            .post(self.agent_url("completions"))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Status(status.as_u16(), body));
        }

        let mut buffer = LineBuffer::new();
        let mut transcript = Transcript::new();
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    for line in buffer.push(&chunk) {
                        transcript.push_line(line);
                    }
                }
                Ok(None) => {
                    if let Some(rest) = buffer.finish() {
                        transcript.push_line(rest);
                    }
                    break;
                }
                Err(e) if transcript.is_empty() => return Err(e.into()),
                Err(e) => {
                    warn!(
                        error = %e,
                        lines = transcript.len(),
                        "Agent stream interrupted, keeping partial transcript"
                    );
                    break;
                }
            }
        }

        info!(lines = transcript.len(), "Stream finished");
        Ok(transcript)
    }
}

#[async_trait]
impl KeywordSource for AgentClient {
    async fn keywords(&self, query: &str) -> anyhow::Result<Option<Vec<String>>> {
        let session_id = self.open_session().await?;
        let transcript = self.stream_answer(&session_id, query).await?;
        let keywords = transcript.keywords().map_err(AgentError::from)?;
        Ok(keywords)
    }
}

/// Pull the first session id out of an SSE session response.
///
/// The id may sit at the top level of the event or inside its `data` object.
fn session_id_from_events(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct SessionEvent {
        session_id: Option<String>,
        data: Option<SessionEventData>,
    }

    #[derive(Deserialize)]
    struct SessionEventData {
        session_id: Option<String>,
    }

    body.lines()
        .filter_map(|line| line.strip_prefix(DATA_MARKER))
        .filter_map(|payload| serde_json::from_str::<SessionEvent>(payload.trim()).ok())
        .find_map(|event| {
            event
                .session_id
                .or_else(|| event.data.and_then(|d| d.session_id))
        })
}


/// HTTP tests against a mocked RAGFlow server
#[cfg(test)]
mod http_tests {
    use super::*;
    use crate::config::tests::config_for;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn agent_for(server: &MockServer) -> (AgentClient, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(&server.uri(), dir.path());
        (AgentClient::new(&config).unwrap(), dir)
    }

    async fn mount_session(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/api/v1/agents/agent-1/sessions"))
            .and(header("Authorization", "Bearer rf-key"))
            .and(query_param("user_id", "research_assistant_user"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"code": 0, "data": {"id": "sess-42"}})),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_open_session_json() {
        let server = MockServer::start().await;
        mount_session(&server).await;

        let (agent, _dir) = agent_for(&server);
        assert_eq!(agent.open_session().await.unwrap(), "sess-42");
    }

    #[tokio::test]
    async fn test_open_session_event_stream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agents/agent-1/sessions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "data: {\"code\":0,\"data\":{\"session_id\":\"sse-7\"}}\n\n",
                "text/event-stream",
            ))
            .mount(&server)
            .await;

        let (agent, _dir) = agent_for(&server);
        assert_eq!(agent.open_session().await.unwrap(), "sse-7");
    }

    #[tokio::test]
    async fn test_open_session_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agents/agent-1/sessions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"code": 109, "message": "Authentication error"})),
            )
            .mount(&server)
            .await;

        let (agent, _dir) = agent_for(&server);
        let err = agent.open_session().await.unwrap_err();
        assert!(matches!(err, AgentError::Api { code: 109, .. }));
    }

    #[tokio::test]
    async fn test_open_session_missing_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agents/agent-1/sessions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"code": 0, "data": {}})),
            )
            .mount(&server)
            .await;

        let (agent, _dir) = agent_for(&server);
        let err = agent.open_session().await.unwrap_err();
        assert!(matches!(err, AgentError::MissingSessionId(_)));
    }

    #[tokio::test]
    async fn test_keywords_end_to_end() {
        let server = MockServer::start().await;
        mount_session(&server).await;

        let body = concat!(
            "data: {\"code\":0,\"data\":{\"answer\":\"Agent is running...\",\"session_id\":\"sess-42\"}}\n\n",
            "data: {\"code\":0,\"data\":{\"answer\":\"llm, tokamak , fusion\",\"session_id\":\"sess-42\"}}\n\n",
            "data: {\"code\":0,\"data\":true}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/v1/agents/agent-1/completions"))
            .and(body_partial_json(serde_json::json!({
                "id": "agent-1",
                "session_id": "sess-42",
                "question": "fusion and LLMs",
                "stream": true
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let (agent, _dir) = agent_for(&server);
        let keywords = agent.keywords("fusion and LLMs").await.unwrap();
        assert_eq!(
            keywords,
            Some(vec![
                "llm".to_string(),
                "tokamak".to_string(),
                "fusion".to_string()
            ])
        );
    }

    #[tokio::test]
    async fn test_stream_answer_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agents/agent-1/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let (agent, _dir) = agent_for(&server);
        let err = agent.stream_answer("s", "q").await.unwrap_err();
        assert!(matches!(err, AgentError::Status(500, _)));
    }

    // -------------------------------------------------------------------------
    // Raw socket server for streams that wiremock cannot pace
    // -------------------------------------------------------------------------
    const CHUNKED_HEAD: &str = "HTTP/1.1 200 OK\r\n\
        Content-Type: text/event-stream\r\n\
        Transfer-Encoding: chunked\r\n\
        Connection: close\r\n\r\n";

    fn event(answer: &str) -> String {
        format!(
            "data: {{\"code\":0,\"data\":{{\"answer\":\"{}\",\"session_id\":\"s1\"}}}}\n\n",
            answer
        )
    }

    fn http_chunk(payload: &str) -> String {
        format!("{:x}\r\n{}\r\n", payload.len(), payload)
    }

    /// Consume one request (headers plus `Content-Length` body).
    async fn read_request(socket: &mut TcpStream) {
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            request.extend_from_slice(&buf[..n]);

            if let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&request[..end]).to_lowercase();
                let length = head
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if request.len() >= end + 4 + length {
                    return;
                }
            }
        }
    }

    /// Answer a single connection by writing `parts` with `gap` after each,
    /// then closing the socket. Returns the server's base URL.
    async fn serve_paced(parts: Vec<String>, gap: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("http://{}", listener.local_addr().unwrap());

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            for part in parts {
                if socket.write_all(part.as_bytes()).await.is_err() {
                    return;
                }
                let _ = socket.flush().await;
                tokio::time::sleep(gap).await;
            }
            let _ = socket.shutdown().await;
        });

        uri
    }

    fn agent_at(uri: &str, stream_timeout_secs: u64) -> (AgentClient, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_for(uri, dir.path());
        config.stream_timeout_secs = stream_timeout_secs;
        (AgentClient::new(&config).unwrap(), dir)
    }

    #[tokio::test]
    async fn test_slow_stream_outlives_read_timeout() {
        // Seven events 400 ms apart: ~2.8 s in total against a 1 s read timeout
        let mut parts = vec![CHUNKED_HEAD.to_string()];
        for _ in 0..6 {
            parts.push(http_chunk(&event("Agent is running...")));
        }
        parts.push(http_chunk(&event("llm, fusion")));
        parts.push("0\r\n\r\n".to_string());

        let uri = serve_paced(parts, Duration::from_millis(400)).await;
        let (agent, _dir) = agent_at(&uri, 1);

        let transcript = agent.stream_answer("s1", "q").await.unwrap();
        assert_eq!(transcript.len(), 7);
        assert_eq!(
            transcript.keywords().unwrap(),
            Some(vec!["llm".to_string(), "fusion".to_string()])
        );
    }

    #[tokio::test]
    async fn test_interrupted_stream_keeps_received_lines() {
        // Promise far more body than is sent, then hang up mid-line
        let body = format!(
            "{}{}data: {{\"code\":0,\"da",
            event("Agent is running..."),
            event("tokamak, plasma")
        );
        let parts = vec![
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/event-stream\r\n\
             Content-Length: 100000\r\n\r\n"
                .to_string(),
            body,
        ];

        let uri = serve_paced(parts, Duration::ZERO).await;
        let (agent, _dir) = agent_at(&uri, 5);

        let transcript = agent.stream_answer("s1", "q").await.unwrap();
        assert_eq!(transcript.len(), 2);
        assert_eq!(
            transcript.keywords().unwrap(),
            Some(vec!["tokamak".to_string(), "plasma".to_string()])
        );
    }

    #[tokio::test]
    async fn test_interrupted_stream_without_lines_is_error() {
        let parts = vec![
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/event-stream\r\n\
             Content-Length: 100000\r\n\r\n"
                .to_string(),
            "data: {\"co".to_string(),
        ];

        let uri = serve_paced(parts, Duration::ZERO).await;
        let (agent, _dir) = agent_at(&uri, 5);

        let err = agent.stream_answer("s1", "q").await.unwrap_err();
        assert!(matches!(err, AgentError::Network(_)));
    }

    #[tokio::test]
    async fn test_keywords_bare_error_body() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agents/agent-1/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("{\"code\":102,\"message\":\"Agent not found!\"}"),
            )
            .mount(&server)
            .await;

        let (agent, _dir) = agent_for(&server);
        let err = agent.keywords("q").await.unwrap_err();
        let err = err.downcast::<AgentError>().unwrap();
        assert!(matches!(err, AgentError::Stream(StreamError::Agent(ref m)) if m == "Agent not found!"));
    }
}
