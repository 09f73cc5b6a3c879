//! HTTP API Server
//!
//! Lightweight HTTP/1.1 server for the transfer API. Uses tokio for async I/O
//! without a web framework: one task per connection, one request per
//! connection.
//!
//! ## Running the Server
//!
//! ```bash
//! # Start API server on the default port
//! s3mirror serve
//!
//! # With custom bind address and a bearer token
//! s3mirror serve --bind 0.0.0.0 --port 8000 --api-key secret
//! ```

use crate::api::handlers::*;
use crate::api::models::*;
use crate::config::ApiServerConfig;
use crate::error::{MirrorError, Result};
use crate::mirror::MirrorService;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Longest accepted request line or header line
const MAX_LINE_LENGTH: usize = 8 * 1024;

/// Maximum number of request headers
const MAX_HEADERS: usize = 100;

/// A response ready to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Content type
    pub content_type: &'static str,
    /// Body
    pub body: String,
}

impl HttpResponse {
    /// JSON response
    pub fn json<T: Serialize>(status: u16, data: &T) -> Self {
        match serde_json::to_string(data) {
            Ok(body) => Self {
                status,
                content_type: "application/json",
                body,
            },
            Err(e) => Self::error(500, ApiError::internal_error(e.to_string())),
        }
    }

    /// Error response with an [`ApiError`] body
    pub fn error(status: u16, error: ApiError) -> Self {
        let body = serde_json::to_string(&error).unwrap_or_else(|_| {
            r#"{"code":"INTERNAL_ERROR","message":"unserializable error","details":null}"#.to_string()
        });
        Self {
            status,
            content_type: "application/json",
            body,
        }
    }

    /// Response for a failed handler
    pub fn from_error(err: &MirrorError) -> Self {
        Self::error(status_for(err), ApiError::from(err))
    }

    fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: String::new(),
        }
    }
}

/// Parsed request
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    /// Method
    pub method: String,
    /// Path without query string
    pub path: String,
    /// Lower-cased header names with values
    pub headers: Vec<(String, String)>,
    /// Body, if any
    pub body: Option<String>,
}

impl HttpRequest {
    /// First value of a header (name is lower-case)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// API HTTP Server
pub struct ApiServer {
    /// Configuration
    config: ApiServerConfig,
    /// Shared application state
    state: Arc<AppState>,
    /// Shutdown signal
    shutdown: CancellationToken,
}

impl ApiServer {
    /// Create a new API server over `service`
    pub fn new(config: ApiServerConfig, service: MirrorService) -> Self {
        Self {
            config,
            state: Arc::new(AppState::new(service)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the accept loop when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.config.bind, self.config.port);
        TcpListener::bind(&addr)
            .await
            .map_err(|e| MirrorError::connection(&addr, e.to_string()))
    }

    /// Serve connections from `listener` until shut down
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local = listener
            .local_addr()
            .map_err(|e| MirrorError::connection(&self.config.bind, e.to_string()))?;
        tracing::info!(address = %local, auth = self.config.api_key.is_some(), "API server listening on http://{}", local);

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = self.shutdown.cancelled() => break,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let state = Arc::clone(&self.state);
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, &state, &config).await {
                            tracing::debug!(peer = %peer, "connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("accept error: {}", e);
                }
            }
        }

        tracing::info!("API server shutting down");
        Ok(())
    }
}

/// Handle a single HTTP connection
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: &AppState,
    config: &ApiServerConfig,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let response = match read_request(&mut reader, config).await {
        Ok(request) => {
            tracing::debug!(peer = %peer, method = %request.method, path = %request.path, "request");
            dispatch(state, config, request).await
        }
        Err(response) => response,
    };

    let bytes = encode_response(&response, config);
    write_half
        .write_all(&bytes)
        .await
        .map_err(|e| MirrorError::connection(peer.to_string(), e.to_string()))?;
    write_half
        .flush()
        .await
        .map_err(|e| MirrorError::connection(peer.to_string(), e.to_string()))?;
    Ok(())
}

/// Read one request. On a malformed request returns the response to send.
async fn read_request<R>(reader: &mut BufReader<R>, config: &ApiServerConfig) -> std::result::Result<HttpRequest, HttpResponse>
where
    R: AsyncRead + Unpin,
{
    let bad_request = |message: &str| HttpResponse::error(400, ApiError::bad_request(message));

    let request_line = read_line(reader).await.ok_or_else(|| bad_request("Bad Request"))?;
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(bad_request("Bad Request"));
    }
    let method = parts[0].to_string();
    let (path, _query) = parts[1].split_once('?').unwrap_or((parts[1], ""));
    let path = path.to_string();

    let mut headers: Vec<(String, String)> = Vec::new();
    let mut content_length = 0usize;
    loop {
        let line = read_line(reader).await.ok_or_else(|| bad_request("Bad Request"))?;
        if line.is_empty() {
            break;
        }
        if headers.len() >= MAX_HEADERS {
            return Err(bad_request("Too many headers"));
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_lowercase();
            let value = value.trim().to_string();
            if key == "content-length" {
                content_length = value
                    .parse()
                    .map_err(|_| bad_request("Invalid Content-Length"))?;
            }
            headers.push((key, value));
        }
    }

    if content_length > config.max_body_size {
        return Err(HttpResponse::error(
            413,
            ApiError {
                code: "PAYLOAD_TOO_LARGE".to_string(),
                message: format!("Body exceeds {} bytes", config.max_body_size),
                details: None,
            },
        ));
    }

    let body = if content_length > 0 {
        let mut body = vec![0u8; content_length];
        reader
            .read_exact(&mut body)
            .await
            .map_err(|_| bad_request("Truncated body"))?;
        Some(String::from_utf8_lossy(&body).to_string())
    } else {
        None
    };

    Ok(HttpRequest {
        method,
        path,
        headers,
        body,
    })
}

async fn read_line<R>(reader: &mut BufReader<R>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    let mut limited = (&mut *reader).take(MAX_LINE_LENGTH as u64);
    match limited.read_line(&mut line).await {
        Ok(0) => None,
        Ok(_) if !line.ends_with('\n') => None,
        Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
        Err(_) => None,
    }
}

/// Authenticate and route a parsed request
pub async fn dispatch(state: &AppState, config: &ApiServerConfig, request: HttpRequest) -> HttpResponse {
    // Handle CORS preflight
    if request.method == "OPTIONS" {
        return HttpResponse::empty(204);
    }

    // Check API key if configured
    if let Some(ref api_key) = config.api_key {
        let expected = format!("Bearer {}", api_key);
        if request.header("authorization") != Some(expected.as_str()) && request.path != "/health" {
            return HttpResponse::error(
                401,
                ApiError {
                    code: "UNAUTHORIZED".to_string(),
                    message: "Unauthorized".to_string(),
                    details: None,
                },
            );
        }
    }

    route_request(state, &request).await
}

/// Route HTTP request to appropriate handler
async fn route_request(state: &AppState, request: &HttpRequest) -> HttpResponse {
    let method = request.method.as_str();
    let path = request.path.as_str();

    match (method, path) {
        ("POST", "/start_transfer") => {
            let body = match &request.body {
                Some(body) => body,
                None => return HttpResponse::error(400, ApiError::bad_request("Request body required")),
            };
            let parsed = match serde_json::from_str::<StartTransferRequest>(body) {
                Ok(parsed) => parsed,
                Err(e) => return HttpResponse::error(400, ApiError::bad_request(e.to_string())),
            };
            match handle_start_transfer(state, parsed).await {
                Ok(response) => HttpResponse::json(200, &response),
                Err(e) => HttpResponse::from_error(&e),
            }
        }

        ("GET", path) if path.starts_with("/transfer_status/") => {
            let job_handle = urlencoding_decode(&path["/transfer_status/".len()..]);
            match handle_transfer_status(state, &job_handle).await {
                Ok(status) => HttpResponse::json(200, &status),
                Err(e) => HttpResponse::from_error(&e),
            }
        }

        ("POST", path) if path.starts_with("/cancel/") => {
            let job_handle = urlencoding_decode(&path["/cancel/".len()..]);
            match handle_cancel(state, &job_handle).await {
                Ok(response) => HttpResponse::json(200, &response),
                Err(e) => HttpResponse::from_error(&e),
            }
        }

        ("GET", "/health") => HttpResponse::json(200, &handle_health(state)),

        (_, "/start_transfer" | "/health") => {
            HttpResponse::error(405, ApiError::bad_request("Method not allowed"))
        }
        (_, path) if path.starts_with("/transfer_status/") || path.starts_with("/cancel/") => {
            HttpResponse::error(405, ApiError::bad_request("Method not allowed"))
        }

        // Not found
        _ => HttpResponse::error(404, ApiError::not_found("Not found")),
    }
}

/// Simple URL decoding
fn urlencoding_decode(s: &str) -> String {
    let mut bytes = Vec::with_capacity(s.len());
    let raw = s.as_bytes();
    let mut i = 0;

    while i < raw.len() {
        match raw[i] {
            b'%' if i + 2 < raw.len() => {
                let hex = std::str::from_utf8(&raw[i + 1..i + 3]).unwrap_or("");
                match u8::from_str_radix(hex, 16) {
                    Ok(byte) => {
                        bytes.push(byte);
                        i += 3;
                    }
                    Err(_) => {
                        bytes.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                bytes.push(b' ');
                i += 1;
            }
            other => {
                bytes.push(other);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&bytes).to_string()
}

/// Serialize a response with status line and headers
fn encode_response(response: &HttpResponse, config: &ApiServerConfig) -> Vec<u8> {
    let status_text = match response.status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "Unknown",
    };

    let mut head = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n",
        response.status,
        status_text,
        response.content_type,
        response.body.len(),
    );

    if config.cors_enabled {
        head.push_str("Access-Control-Allow-Origin: *\r\n");
        head.push_str("Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n");
        head.push_str("Access-Control-Allow-Headers: Content-Type, Authorization\r\n");
        if response.status == 204 {
            head.push_str("Access-Control-Max-Age: 86400\r\n");
        }
    }

    head.push_str("\r\n");
    let mut bytes = head.into_bytes();
    bytes.extend_from_slice(response.body.as_bytes());
    bytes
}
