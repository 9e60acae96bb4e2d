//! Minimal HTTP/1.1 framing over TCP.
//!
//! Every protocol exchange is one `POST` with a base64 body answered by one
//! response. Connections stay open while both sides send
//! `Connection: keep-alive`. The session id rides in a `Session` header.
//!
//! ```text
//! POST / HTTP/1.1\r\n
//! Session: 3f9a...\r\n
//! Connection: keep-alive\r\n
//! Content-Length: 812\r\n
//! \r\n
//! <base64(encrypt(json(packet)))>
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use demonsaw_files::MAX_CHUNK_SIZE;

use crate::error::{Error, Result};
use crate::message::sealed_size;

/// Largest accepted body: one sealed packet carrying a maximum chunk.
pub const MAX_BODY_SIZE: usize = sealed_size(MAX_CHUNK_SIZE as usize);

/// Largest accepted start or header line.
pub const MAX_LINE_SIZE: usize = 8 * 1024;

/// Most headers accepted per message.
pub const MAX_HEADERS: usize = 64;

/// Header carrying the session id.
pub const SESSION_HEADER: &str = "Session";

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpStatus {
    /// No response (timeout)
    None,
    /// 200
    Ok,
    /// 400
    BadRequest,
    /// 401
    Unauthorized,
    /// 404
    NotFound,
    /// 405
    MethodNotAllowed,
    /// 500
    InternalError,
    /// 501
    NotImplemented,
    /// 503
    ServiceUnavailable,
    /// Any other code
    Other(u16),
}

impl HttpStatus {
    /// Numeric code (0 for [`HttpStatus::None`]).
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            Self::None => 0,
            Self::Ok => 200,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::InternalError => 500,
            Self::NotImplemented => 501,
            Self::ServiceUnavailable => 503,
            Self::Other(code) => *code,
        }
    }

    /// Classify a numeric code.
    #[must_use]
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => Self::None,
            200 => Self::Ok,
            400 => Self::BadRequest,
            401 => Self::Unauthorized,
            404 => Self::NotFound,
            405 => Self::MethodNotAllowed,
            500 => Self::InternalError,
            501 => Self::NotImplemented,
            503 => Self::ServiceUnavailable,
            other => Self::Other(other),
        }
    }

    /// Reason phrase.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Ok => "OK",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::NotFound => "Not Found",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::InternalError => "Internal Server Error",
            Self::NotImplemented => "Not Implemented",
            Self::ServiceUnavailable => "Service Unavailable",
            Self::Other(_) => "Unknown",
        }
    }

    /// Whether this is 200.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Whether retrying the same request later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::None | Self::ServiceUnavailable | Self::BadRequest | Self::InternalError
        )
    }
}

impl fmt::Display for HttpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// A parsed request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method (`POST`, `GET`, ...)
    pub method: String,
    /// Request target
    pub path: String,
    /// Session id header
    pub session: Option<String>,
    /// Whether the connection stays open afterwards
    pub keep_alive: bool,
    /// Body
    pub body: String,
}

impl HttpRequest {
    /// A keep-alive `POST /` carrying `body`.
    #[must_use]
    pub fn post(session: Option<String>, body: String) -> Self {
        Self {
            method: "POST".to_string(),
            path: "/".to_string(),
            session,
            keep_alive: true,
            body,
        }
    }
}

/// A parsed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status
    pub status: HttpStatus,
    /// Session id header
    pub session: Option<String>,
    /// Whether the connection stays open afterwards
    pub keep_alive: bool,
    /// Body
    pub body: String,
}

impl HttpResponse {
    /// `200 OK` with a body.
    #[must_use]
    pub fn ok(session: Option<String>, body: String) -> Self {
        Self {
            status: HttpStatus::Ok,
            session,
            keep_alive: true,
            body,
        }
    }

    /// Empty response with `status`.
    #[must_use]
    pub fn status(status: HttpStatus) -> Self {
        Self {
            status,
            session: None,
            keep_alive: true,
            body: String::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Head {
    start: String,
    session: Option<String>,
    keep_alive: Option<bool>,
    content_length: usize,
}

/// Request/response socket with per-operation timeouts.
#[derive(Debug)]
pub struct HttpSocket {
    stream: BufReader<TcpStream>,
    timeout: Duration,
    peer: Option<SocketAddr>,
}

impl HttpSocket {
    /// Connect to `address:port`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the connection is not established within
    /// `limit`, or [`Error::Io`] if it is refused.
    pub async fn open(address: &str, port: u16, limit: Duration) -> Result<Self> {
        let stream = timeout(limit, TcpStream::connect((address, port)))
            .await
            .map_err(|_| Error::timeout("connect"))??;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream, limit))
    }

    /// Wrap an accepted stream.
    #[must_use]
    pub fn from_stream(stream: TcpStream, limit: Duration) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            stream: BufReader::new(stream),
            timeout: limit,
            peer,
        }
    }

    /// Set the timeout applied to each read or write.
    pub fn set_timeout(&mut self, limit: Duration) {
        self.timeout = limit;
    }

    /// Current timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Remote address.
    #[must_use]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Give up the underlying stream (tunnel hand-off).
    #[must_use]
    pub fn into_stream(self) -> TcpStream {
        self.stream.into_inner()
    }

    async fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let read = (&mut self.stream)
            .take(MAX_LINE_SIZE as u64)
            .read_line(&mut line)
            .await?;
        if read == 0 {
            return Ok(None);
        }
        if !line.ends_with('\n') {
            return Err(Error::protocol("header line too long"));
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }

    async fn read_head(&mut self) -> Result<Option<Head>> {
        let Some(start) = self.read_line().await? else {
            return Ok(None);
        };
        if start.is_empty() {
            return Err(Error::protocol("empty start line"));
        }

        let mut head = Head {
            start,
            ..Head::default()
        };
        for _ in 0..=MAX_HEADERS {
            let line = self
                .read_line()
                .await?
                .ok_or(Error::transport("connection closed mid-header"))?;
            if line.is_empty() {
                return Ok(Some(head));
            }
            let (name, value) = line
                .split_once(':')
                .ok_or(Error::protocol("malformed header"))?;
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "content-length" => {
                    head.content_length = value
                        .parse()
                        .map_err(|_| Error::protocol("invalid content length"))?;
                    if head.content_length > MAX_BODY_SIZE {
                        return Err(Error::protocol("body too large"));
                    }
                }
                "connection" => head.keep_alive = Some(!value.eq_ignore_ascii_case("close")),
                "session" if !value.is_empty() => head.session = Some(value.to_string()),
                _ => {}
            }
        }
        Err(Error::protocol("too many headers"))
    }

    async fn read_body(&mut self, len: usize) -> Result<String> {
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await?;
        String::from_utf8(body).map_err(|_| Error::protocol("body is not text"))
    }

    /// Read one request. `first` bounds the wait for the start line; the
    /// socket timeout bounds the rest. Returns `None` on a clean close.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`], [`Error::Io`], or [`Error::Protocol`] for
    /// malformed framing.
    pub async fn read_request_within(&mut self, first: Duration) -> Result<Option<HttpRequest>> {
        let limit = self.timeout;
        let Some(head) = timeout(first, self.read_head())
            .await
            .map_err(|_| Error::timeout("request"))??
        else {
            return Ok(None);
        };

        let mut parts = head.start.split_whitespace();
        let (Some(method), Some(path), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::protocol("malformed request line"));
        };
        if !version.starts_with("HTTP/1.") {
            return Err(Error::protocol("unsupported HTTP version"));
        }
        let keep_alive = head.keep_alive.unwrap_or(version == "HTTP/1.1");
        let (method, path) = (method.to_string(), path.to_string());

        let body = timeout(limit, self.read_body(head.content_length))
            .await
            .map_err(|_| Error::timeout("request body"))??;
        Ok(Some(HttpRequest {
            method,
            path,
            session: head.session,
            keep_alive,
            body,
        }))
    }

    /// Read one request under the socket timeout.
    ///
    /// # Errors
    ///
    /// See [`HttpSocket::read_request_within`].
    pub async fn read_request(&mut self) -> Result<Option<HttpRequest>> {
        let limit = self.timeout;
        self.read_request_within(limit).await
    }

    /// Read one response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the peer closed the connection,
    /// [`Error::Timeout`], or [`Error::Protocol`] for malformed framing.
    pub async fn read_response(&mut self) -> Result<HttpResponse> {
        let limit = self.timeout;
        let head = timeout(limit, self.read_head())
            .await
            .map_err(|_| Error::timeout("response"))??
            .ok_or(Error::transport("connection closed"))?;

        let mut parts = head.start.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/1.") {
            return Err(Error::protocol("malformed status line"));
        }
        let code: u16 = parts
            .next()
            .and_then(|code| code.parse().ok())
            .ok_or(Error::protocol("malformed status code"))?;
        let keep_alive = head.keep_alive.unwrap_or(version == "HTTP/1.1");

        let body = timeout(limit, self.read_body(head.content_length))
            .await
            .map_err(|_| Error::timeout("response body"))??;
        Ok(HttpResponse {
            status: HttpStatus::from_code(code),
            session: head.session,
            keep_alive,
            body,
        })
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let limit = self.timeout;
        let stream = self.stream.get_mut();
        timeout(limit, async {
            stream.write_all(bytes).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| Error::timeout("write"))??;
        Ok(())
    }

    /// Send a request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] or [`Error::Io`].
    pub async fn write_request(&mut self, request: &HttpRequest) -> Result<()> {
        let mut out = format!("{} {} HTTP/1.1\r\n", request.method, request.path);
        if let Some(session) = &request.session {
            out.push_str(&format!("{SESSION_HEADER}: {session}\r\n"));
        }
        out.push_str(connection_header(request.keep_alive));
        out.push_str(&format!("Content-Length: {}\r\n\r\n", request.body.len()));
        out.push_str(&request.body);
        self.write_raw(out.as_bytes()).await
    }

    /// Send a response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] or [`Error::Io`].
    pub async fn write_response(&mut self, response: &HttpResponse) -> Result<()> {
        let mut out = format!(
            "HTTP/1.1 {} {}\r\n",
            response.status.code(),
            response.status.reason()
        );
        if let Some(session) = &response.session {
            out.push_str(&format!("{SESSION_HEADER}: {session}\r\n"));
        }
        out.push_str(connection_header(response.keep_alive));
        out.push_str(&format!("Content-Length: {}\r\n\r\n", response.body.len()));
        out.push_str(&response.body);
        self.write_raw(out.as_bytes()).await
    }

    /// Send an empty response with `status`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] or [`Error::Io`].
    pub async fn write_status(&mut self, status: HttpStatus) -> Result<()> {
        self.write_response(&HttpResponse::status(status)).await
    }

    /// Shut the write half down; errors are ignored.
    pub async fn close(&mut self) {
        let _ = self.stream.get_mut().shutdown().await;
    }
}

fn connection_header(keep_alive: bool) -> &'static str {
    if keep_alive {
        "Connection: keep-alive\r\n"
    } else {
        "Connection: close\r\n"
    }
}
