//! Inbound webhook HTTP surface for the Cloud API adapter.
//!
//! A deliberately small HTTP/1.1 listener: one verification handshake (GET)
//! and one delivery endpoint (POST), both resolved against the channel
//! manager's registry. No web framework; the surface is two routes.
//!
//! Responses follow the provider contract: deliveries are acknowledged with
//! `200 {"success":true}` once accepted for processing, verification
//! mismatches get 403, and a missing adapter gets 404 ("channel not ready").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::WebhookConfig;
use crate::error::{OmniError, Result};

use super::cloud::CloudApiAdapter;
use super::manager::ChannelManager;

/// Maximum allowed request body size (1 MB).
const MAX_BODY_SIZE: usize = 1_048_576;

/// Maximum allowed header section size (8 KB).
const MAX_HEADER_SIZE: usize = 8_192;

/// Per-connection read timeout.
const READ_TIMEOUT_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// HTTP plumbing
// ---------------------------------------------------------------------------

struct ParsedHttpRequest {
    method: String,
    path: String,
    query: String,
    headers: Vec<(String, String)>,
    body: String,
}

/// Parse a raw HTTP request into structured parts.
fn parse_http_request(raw: &[u8]) -> Result<ParsedHttpRequest> {
    let raw_str = std::str::from_utf8(raw)
        .map_err(|_| OmniError::Channel("invalid UTF-8 in HTTP request".to_string()))?;

    let (header_section, body) = match raw_str.find("\r\n\r\n") {
        Some(pos) => (&raw_str[..pos], raw_str[pos + 4..].to_string()),
        None => (raw_str, String::new()),
    };

    let mut lines = header_section.lines();
    let request_line = lines
        .next()
        .ok_or_else(|| OmniError::Channel("empty HTTP request".to_string()))?;

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| OmniError::Channel("missing HTTP method".to_string()))?
        .to_uppercase();
    let full_path = parts
        .next()
        .ok_or_else(|| OmniError::Channel("missing HTTP path".to_string()))?
        .to_string();

    let (path, query) = match full_path.find('?') {
        Some(pos) => (
            full_path[..pos].to_string(),
            full_path[pos + 1..].to_string(),
        ),
        None => (full_path, String::new()),
    };

    let mut headers = Vec::new();
    for line in lines {
        if let Some(colon_pos) = line.find(':') {
            headers.push((
                line[..colon_pos].trim().to_string(),
                line[colon_pos + 1..].trim().to_string(),
            ));
        }
    }

    Ok(ParsedHttpRequest {
        method,
        path,
        query,
        headers,
        body,
    })
}

/// Extract a query parameter value by name.
fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then_some(value)
    })
}

/// Extract `Content-Length` from headers.
fn content_length(headers: &[(String, String)]) -> usize {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0)
}

/// Find the byte offset of the `\r\n\r\n` header/body separator.
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Render a full HTTP/1.1 response.
fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

fn json_response(status: &str, body: &str) -> String {
    http_response(status, "application/json", body)
}

// ---------------------------------------------------------------------------
// WebhookServer
// ---------------------------------------------------------------------------

/// Webhook HTTP listener routing provider callbacks to the registered Cloud
/// API adapter.
pub struct WebhookServer {
    config: WebhookConfig,
    manager: Arc<ChannelManager>,
    running: Arc<AtomicBool>,
    shutdown_tx: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl WebhookServer {
    /// Creates a new webhook server over the given manager.
    pub fn new(config: WebhookConfig, manager: Arc<ChannelManager>) -> Self {
        Self {
            config,
            manager,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx: Mutex::new(None),
        }
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Returns the bound address (useful when the configured port is 0).
    pub async fn start(&self) -> Result<std::net::SocketAddr> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(OmniError::Channel("webhook server already running".to_string()));
        }

        let bind_addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            self.running.store(false, Ordering::SeqCst);
            OmniError::Channel(format!("failed to bind webhook listener on {bind_addr}: {e}"))
        })?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, path = %self.config.path, "webhook listener started");

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        *self.shutdown_tx.lock().await = Some(shutdown_tx);

        let config = self.config.clone();
        let manager = Arc::clone(&self.manager);
        let running = Arc::clone(&self.running);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, addr)) => {
                                debug!(%addr, "webhook connection accepted");
                                let cfg = config.clone();
                                let mgr = Arc::clone(&manager);
                                tokio::spawn(async move {
                                    handle_connection(stream, &cfg, &mgr).await;
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "failed to accept webhook connection");
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("webhook listener shutdown signal received");
                        break;
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
            info!("webhook listener stopped");
        });

        Ok(local_addr)
    }

    /// Stop accepting connections. In-flight request handling completes.
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
    }

    /// Whether the listener is accepting connections.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Handle a single webhook connection end to end.
async fn handle_connection(
    mut stream: tokio::net::TcpStream,
    config: &WebhookConfig,
    manager: &ChannelManager,
) {
    let mut buf = vec![0u8; MAX_HEADER_SIZE + MAX_BODY_SIZE];
    let mut total_read = 0usize;

    loop {
        if total_read >= buf.len() {
            let resp = http_response("413 Payload Too Large", "application/json", "");
            let _ = stream.write_all(resp.as_bytes()).await;
            return;
        }

        match tokio::time::timeout(
            std::time::Duration::from_secs(READ_TIMEOUT_SECS),
            stream.read(&mut buf[total_read..]),
        )
        .await
        {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                total_read += n;
                if let Some(header_end) = find_header_end(&buf[..total_read]) {
                    if let Ok(req) = parse_http_request(&buf[..total_read]) {
                        let body_received = total_read - header_end - 4;
                        if body_received >= content_length(&req.headers) {
                            break;
                        }
                    } else {
                        break;
                    }
                }
            }
            Ok(Err(e)) => {
                debug!(error = %e, "webhook connection read error");
                return;
            }
            Err(_) => break,
        }
    }

    if total_read == 0 {
        return;
    }

    let request = match parse_http_request(&buf[..total_read]) {
        Ok(req) => req,
        Err(e) => {
            debug!(error = %e, "failed to parse webhook HTTP request");
            let resp = json_response("400 Bad Request", r#"{"error":"Malformed request"}"#);
            let _ = stream.write_all(resp.as_bytes()).await;
            return;
        }
    };

    let response = route_request(&request, config, manager).await;
    let _ = stream.write_all(response.as_bytes()).await;
}

/// Resolve a parsed request to a response.
async fn route_request(
    request: &ParsedHttpRequest,
    config: &WebhookConfig,
    manager: &ChannelManager,
) -> String {
    if request.path != config.path {
        return json_response("404 Not Found", r#"{"error":"Not found"}"#);
    }

    match request.method.as_str() {
        "GET" => handle_verification(&request.query, config, manager).await,
        "POST" => handle_delivery(&request.body, config, manager).await,
        _ => json_response("405 Method Not Allowed", r#"{"error":"Method not allowed"}"#),
    }
}

/// GET: webhook verification handshake.
async fn handle_verification(
    query: &str,
    config: &WebhookConfig,
    manager: &ChannelManager,
) -> String {
    let mode = query_param(query, "hub.mode");
    let token = query_param(query, "hub.verify_token");
    let challenge = query_param(query, "hub.challenge");

    let (mode, token, challenge) = match (mode, token, challenge) {
        (Some(m), Some(t), Some(c)) => (m, t, c),
        _ => {
            return json_response("400 Bad Request", r#"{"error":"Missing required parameters"}"#);
        }
    };

    if let Some(adapter) = manager.get_adapter(config.channel_id).await {
        if let Some(cloud) = adapter.as_any().downcast_ref::<CloudApiAdapter>() {
            if let Some(echo) = cloud.verify_webhook(mode, token, challenge) {
                info!(channel_id = config.channel_id, "webhook verification successful");
                return http_response("200 OK", "text/plain", &echo);
            }
        }
    }

    warn!(channel_id = config.channel_id, "webhook verification failed");
    json_response("403 Forbidden", r#"{"error":"Verification failed"}"#)
}

/// POST: provider delivery batch.
async fn handle_delivery(body: &str, config: &WebhookConfig, manager: &ChannelManager) -> String {
    let payload: serde_json::Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "webhook delivery body is not valid JSON");
            return json_response(
                "500 Internal Server Error",
                r#"{"error":"Internal server error"}"#,
            );
        }
    };

    let adapter = match manager.get_adapter(config.channel_id).await {
        Some(a) => a,
        None => {
            warn!(channel_id = config.channel_id, "no adapter registered for webhook channel");
            return json_response("404 Not Found", r#"{"error":"Adapter not found"}"#);
        }
    };

    match adapter.as_any().downcast_ref::<CloudApiAdapter>() {
        Some(cloud) => {
            cloud.handle_webhook(&payload).await;
            json_response("200 OK", r#"{"success":true}"#)
        }
        None => {
            warn!(channel_id = config.channel_id, "webhook channel adapter is not cloud-based");
            json_response("404 Not Found", r#"{"error":"Adapter not found"}"#)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
