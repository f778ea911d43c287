//! MCP transports
//!
//! - `StdioTransport`: child process speaking newline-delimited JSON
//! - `HttpTransport`: JSON-RPC over HTTP POST; replies are queued for `receive`

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

/// Message pipe to one MCP server
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn send(&self, message: &str) -> Result<()>;

    /// Next JSON message from the server
    async fn receive(&self) -> Result<String>;

    async fn is_alive(&self) -> bool;
}

fn mask_secret(key: &str, value: &str) -> String {
    let upper = key.to_ascii_uppercase();
    if upper.contains("KEY") || upper.contains("TOKEN") || upper.contains("SECRET") {
        let head: String = value.chars().take(4).collect();
        format!("{}...", head)
    } else {
        value.to_string()
    }
}

/// Stdio transport for local MCP servers
pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
    child: Mutex<Child>,
}

impl StdioTransport {
    /// Spawn an MCP server process
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        working_dir: &Path,
    ) -> Result<Self> {
        info!("Spawning MCP server: {} {:?}", command, args);
        for (k, v) in env {
            debug!("  env {}={}", k, mask_secret(k, v));
        }

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .current_dir(working_dir)
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                anyhow!("Command not found: {}. Is it installed and in PATH?", command)
            } else {
                anyhow!("Failed to spawn {}: {}", command, e)
            }
        })?;

        let stdin = child.stdin.take().ok_or_else(|| anyhow!("No stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("No stdout"))?;

        Ok(Self {
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            child: Mutex::new(child),
        })
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send(&self, message: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(message.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        debug!("Sent: {}", message);
        Ok(())
    }

    async fn receive(&self) -> Result<String> {
        let mut stdout = self.stdout.lock().await;

        loop {
            let mut line = String::new();
            let bytes = stdout.read_line(&mut line).await?;

            if bytes == 0 {
                let mut child = self.child.lock().await;
                return match child.try_wait() {
                    Ok(Some(status)) => Err(anyhow!("MCP server exited with {}", status)),
                    Ok(None) => Err(anyhow!("MCP server closed stdout unexpectedly")),
                    Err(e) => Err(anyhow!("Error checking MCP server status: {}", e)),
                };
            }

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('{') {
                debug!("Received: {}", line);
                return Ok(line.to_string());
            }

            // Servers sometimes log to stdout
            debug!("Skipping non-JSON line: {}", line);
        }
    }

    async fn is_alive(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }
}

const SESSION_HEADER: &str = "mcp-session-id";

/// HTTP transport for remote MCP servers
pub struct HttpTransport {
    http: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
    session_id: Mutex<Option<String>>,
    inbox_tx: mpsc::UnboundedSender<String>,
    inbox_rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, headers: HashMap<String, String>) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            headers,
            session_id: Mutex::new(None),
            inbox_tx,
            inbox_rx: Mutex::new(inbox_rx),
        }
    }
}

/// JSON payloads in a response body, plain or `text/event-stream`
fn extract_messages(body: &str, event_stream: bool) -> Vec<String> {
    if !event_stream {
        let trimmed = body.trim();
        return if trimmed.is_empty() {
            Vec::new()
        } else {
            vec![trimmed.to_string()]
        };
    }
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.trim().to_string())
        .filter(|data| data.starts_with('{'))
        .collect()
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn send(&self, message: &str) -> Result<()> {
        let mut request = self
            .http
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .body(message.to_string());
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(session) = self.session_id.lock().await.as_ref() {
            request = request.header(SESSION_HEADER, session.as_str());
        }

        debug!("POST {}: {}", self.url, message);
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("MCP HTTP {}: {}", status, body));
        }

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().await = Some(session.to_string());
        }
        let event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let body = response.text().await?;
        for message in extract_messages(&body, event_stream) {
            debug!("Received: {}", message);
            self.inbox_tx
                .send(message)
                .map_err(|_| anyhow!("MCP HTTP inbox closed"))?;
        }
        Ok(())
    }

    async fn receive(&self) -> Result<String> {
        self.inbox_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| anyhow!("MCP HTTP transport closed"))
    }

    async fn is_alive(&self) -> bool {
        !self.inbox_tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    #[test]
    fn event_stream_bodies_yield_data_lines() {
        let body = "event: message\ndata: {\"id\":1}\n\ndata: ping\n";
        assert_eq!(extract_messages(body, true), vec!["{\"id\":1}"]);
        assert_eq!(extract_messages("  {\"id\":2}\n", false), vec!["{\"id\":2}"]);
        assert!(extract_messages("", false).is_empty());
    }

    #[test]
    fn secrets_are_masked() {
        assert_eq!(mask_secret("API_KEY", "sk-abcdef"), "sk-a...");
        assert_eq!(mask_secret("REGION", "eu"), "eu");
    }

    #[tokio::test]
    async fn http_reply_is_queued_for_receive() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/mcp")
            .match_header("x-api-key", "k")
            .match_header("accept", "application/json, text/event-stream")
            .match_body(Matcher::PartialJson(json!({"method": "tools/list"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#)
            .create_async()
            .await;
        let transport = HttpTransport::new(
            format!("{}/mcp", server.url()),
            HashMap::from([("X-Api-Key".to_string(), "k".to_string())]),
        );
        transport
            .send(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#)
            .await
            .unwrap();
        let reply = transport.receive().await.unwrap();
        assert!(reply.contains("\"id\":1"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn session_id_is_echoed_on_later_requests() {
        let mut server = Server::new_async().await;
        let init = server
            .mock("POST", "/mcp")
            .match_header(SESSION_HEADER, Matcher::Missing)
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_header(SESSION_HEADER, "s-1")
            .with_body("event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\n")
            .create_async()
            .await;
        let list = server
            .mock("POST", "/mcp")
            .match_header(SESSION_HEADER, "s-1")
            .with_status(202)
            .create_async()
            .await;
        let transport = HttpTransport::new(format!("{}/mcp", server.url()), HashMap::new());

        transport
            .send(r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#)
            .await
            .unwrap();
        assert!(transport.receive().await.unwrap().contains("\"result\""));
        transport
            .send(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await
            .unwrap();
        init.assert_async().await;
        list.assert_async().await;
    }

    #[tokio::test]
    async fn http_error_status_fails_send() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/mcp")
            .with_status(401)
            .with_body("unauthorized")
            .create_async()
            .await;
        let transport = HttpTransport::new(format!("{}/mcp", server.url()), HashMap::new());
        let err = transport.send("{}").await.unwrap_err();
        assert!(err.to_string().contains("unauthorized"));
    }
}
