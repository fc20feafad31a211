//! STOMP 1.2 over WebSocket: the real-time greenhouse channel
//!
//! The server pushes sensor updates to `/queue/greenhouse/{userId}` and
//! accepts subscribe/unsubscribe intents on `/app/subscribe` and
//! `/app/unsubscribe`.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::SensorUpdate;
use crate::error::{error_codes, ErrorResponse};
use crate::id_generator::IdGenerator;
use crate::validators::{validate_greenhouse_id, ValidationError};

pub const STOMP_VERSION: &str = "1.2";
pub const SUBSCRIBE_DESTINATION: &str = "/app/subscribe";
pub const UNSUBSCRIBE_DESTINATION: &str = "/app/unsubscribe";
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_BUFFER: usize = 64;

/// Per-user queue the server pushes updates to
pub fn user_queue(user_id: &str) -> String {
    format!("/queue/greenhouse/{}", user_id)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is missing its NUL terminator")]
    MissingTerminator,

    #[error("frame has no command")]
    EmptyCommand,

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("malformed header line: {0}")]
    MalformedHeader(String),

    #[error("invalid header escape: {0}")]
    InvalidEscape(String),

    #[error("invalid content-length: {0}")]
    InvalidContentLength(String),

    #[error("unexpected data after frame")]
    TrailingData,
}

/// A single STOMP frame
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header; repeated headers keep the first occurrence
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// CONNECT and CONNECTED frames carry their headers unescaped
    fn escapes_headers(command: &str) -> bool {
        command != "CONNECT" && command != "CONNECTED"
    }

    pub fn encode(&self) -> String {
        let escape = Self::escapes_headers(&self.command);
        let mut out = String::with_capacity(self.command.len() + self.body.len() + 64);
        out.push_str(&self.command);
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Decode at most one frame; heart-beat EOLs around it are ignored
    pub fn decode(input: &str) -> Result<Option<Frame>, FrameError> {
        let mut frames = Self::decode_all(input)?;
        match frames.len() {
            0 => Ok(None),
            1 => Ok(frames.pop()),
            _ => Err(FrameError::TrailingData),
        }
    }

    /// Decode every frame in a WebSocket message
    pub fn decode_all(input: &str) -> Result<Vec<Frame>, FrameError> {
        let mut frames = Vec::new();
        let mut pos = skip_eols(input, 0);
        while pos < input.len() {
            let (frame, used) = parse_frame(&input[pos..])?;
            frames.push(frame);
            pos = skip_eols(input, pos + used);
        }
        Ok(frames)
    }
}

fn skip_eols(input: &str, mut pos: usize) -> usize {
    let bytes = input.as_bytes();
    while pos < bytes.len() {
        match bytes[pos] {
            b'\n' => pos += 1,
            b'\r' if bytes.get(pos + 1) == Some(&b'\n') => pos += 2,
            _ => break,
        }
    }
    pos
}

/// Next line starting at `pos`, without its EOL, plus the position after it
fn read_line(input: &str, pos: usize) -> Option<(&str, usize)> {
    let end = input[pos..].find('\n')? + pos;
    let line = input[pos..end].strip_suffix('\r').unwrap_or(&input[pos..end]);
    Some((line, end + 1))
}

fn parse_frame(input: &str) -> Result<(Frame, usize), FrameError> {
    let (command, mut pos) = read_line(input, 0).ok_or(FrameError::MissingTerminator)?;
    if command.is_empty() {
        return Err(FrameError::EmptyCommand);
    }
    if !command.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(FrameError::InvalidCommand(command.to_string()));
    }
    let unescape = Frame::escapes_headers(command);

    let mut headers = Vec::new();
    loop {
        let (line, next) = read_line(input, pos).ok_or(FrameError::MissingTerminator)?;
        pos = next;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        if unescape {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .map(|(_, value)| {
            value
                .trim()
                .parse::<usize>()
                .map_err(|_| FrameError::InvalidContentLength(value.clone()))
        })
        .transpose()?;

    let body_end = match content_length {
        Some(len) => {
            let end = pos.checked_add(len).unwrap_or(usize::MAX);
            if end >= input.len() || !input.is_char_boundary(end) {
                return Err(FrameError::MissingTerminator);
            }
            if input.as_bytes()[end] != 0 {
                return Err(FrameError::InvalidContentLength(len.to_string()));
            }
            end
        }
        None => input[pos..].find('\0').ok_or(FrameError::MissingTerminator)? + pos,
    };

    let frame = Frame {
        command: command.to_string(),
        headers,
        body: input[pos..body_end].to_string(),
    };
    Ok((frame, body_end + 1))
}

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(value: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(value.to_string())),
        }
    }
    Ok(out)
}

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("WebSocket connect failed: {0}")]
    Connect(String),

    #[error("WebSocket transport error: {0}")]
    Transport(String),

    #[error("Broker rejected the session: {0}")]
    Rejected(String),

    #[error("Timed out waiting for CONNECTED")]
    Timeout,

    #[error("Connection closed")]
    Closed,

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl SocketError {
    pub fn code(&self) -> &'static str {
        match self {
            SocketError::Validation(_) => error_codes::INVALID_VALUE,
            SocketError::Rejected(_) => error_codes::UNAUTHORIZED,
            _ => error_codes::SOCKET_ERROR,
        }
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.code(), self.to_string())
    }
}

impl From<SocketError> for ErrorResponse {
    fn from(err: SocketError) -> Self {
        err.to_error_response()
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SocketError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SocketError::Transport(err.to_string())
    }
}

/// Something the server pushed
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Update(SensorUpdate),
    Message(Value),
    Error(String),
    Closed,
}

impl SocketEvent {
    fn from_frame(frame: &Frame) -> Option<SocketEvent> {
        match frame.command.as_str() {
            "MESSAGE" => Some(match serde_json::from_str::<SensorUpdate>(&frame.body) {
                Ok(update) => SocketEvent::Update(update),
                Err(_) => SocketEvent::Message(
                    serde_json::from_str(&frame.body)
                        .unwrap_or_else(|_| Value::String(frame.body.clone())),
                ),
            }),
            "ERROR" => Some(SocketEvent::Error(
                frame
                    .get_header("message")
                    .map(str::to_string)
                    .unwrap_or_else(|| frame.body.clone()),
            )),
            "RECEIPT" => None,
            other => {
                debug!(command = other, "Ignoring server frame");
                None
            }
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A connected STOMP session subscribed to the user's queue
pub struct SocketSession {
    sink: Mutex<SplitSink<WsStream, Message>>,
    events: mpsc::Receiver<SocketEvent>,
    cancel: CancellationToken,
    reader: Option<JoinHandle<()>>,
    user_id: String,
    subscription_id: String,
}

impl SocketSession {
    pub async fn connect(
        url: &str,
        token: &str,
        user_id: &str,
        ids: &dyn IdGenerator,
    ) -> Result<Self, SocketError> {
        if user_id.trim().is_empty() {
            return Err(ValidationError::new("user_id", "User id is required").into());
        }
        let host = Url::parse(url)
            .map_err(|e| SocketError::Connect(format!("{}: {}", url, e)))?
            .host_str()
            .unwrap_or("localhost")
            .to_string();

        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| SocketError::Connect(format!("{}: {}", url, e)))?;
        let (mut sink, mut stream) = ws.split();

        let connect = Frame::new("CONNECT")
            .header("accept-version", STOMP_VERSION)
            .header("host", host)
            .header("heart-beat", "0,0")
            .header("Authorization", format!("Bearer {}", token));
        sink.send(Message::Text(connect.encode())).await?;

        tokio::time::timeout(CONNECT_TIMEOUT, await_connected(&mut stream))
            .await
            .map_err(|_| SocketError::Timeout)??;

        let subscription_id = ids.next_id();
        let destination = user_queue(user_id);
        let subscribe = Frame::new("SUBSCRIBE")
            .header("id", subscription_id.clone())
            .header("destination", destination.clone())
            .header("ack", "auto");
        sink.send(Message::Text(subscribe.encode())).await?;
        info!(user_id = %user_id, destination = %destination, "STOMP session connected");

        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let reader = tokio::spawn(read_loop(stream, tx, cancel.clone()));

        Ok(Self {
            sink: Mutex::new(sink),
            events,
            cancel,
            reader: Some(reader),
            user_id: user_id.to_string(),
            subscription_id,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Next pushed event; `None` once the reader has stopped and the buffer is drained
    pub async fn next_event(&mut self) -> Option<SocketEvent> {
        self.events.recv().await
    }

    pub async fn subscribe_greenhouses(&self, greenhouse_ids: &[String]) -> Result<(), SocketError> {
        self.send_intent(SUBSCRIBE_DESTINATION, greenhouse_ids).await
    }

    pub async fn unsubscribe_greenhouses(
        &self,
        greenhouse_ids: &[String],
    ) -> Result<(), SocketError> {
        self.send_intent(UNSUBSCRIBE_DESTINATION, greenhouse_ids).await
    }

    async fn send_intent(&self, destination: &str, greenhouse_ids: &[String]) -> Result<(), SocketError> {
        for id in greenhouse_ids {
            validate_greenhouse_id(id)?;
        }
        let body = json!({
            "userId": self.user_id,
            "greenhouseIds": greenhouse_ids,
        })
        .to_string();
        let frame = Frame::new("SEND")
            .header("destination", destination)
            .header("content-type", "application/json")
            .header("content-length", body.len().to_string())
            .body(body);
        self.send(frame).await?;
        debug!(destination = %destination, count = greenhouse_ids.len(), "Sent greenhouse intent");
        Ok(())
    }

    async fn send(&self, frame: Frame) -> Result<(), SocketError> {
        if self.cancel.is_cancelled() {
            return Err(SocketError::Closed);
        }
        self.sink
            .lock()
            .await
            .send(Message::Text(frame.encode()))
            .await?;
        Ok(())
    }

    /// Send DISCONNECT, close the socket and stop the reader
    pub async fn disconnect(mut self) -> Result<(), SocketError> {
        let result = self.send(Frame::new("DISCONNECT")).await;
        let _ = self.sink.lock().await.close().await;
        self.cancel.cancel();
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
        info!(user_id = %self.user_id, "STOMP session disconnected");
        result
    }
}

impl Drop for SocketSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn await_connected(stream: &mut SplitStream<WsStream>) -> Result<(), SocketError> {
    while let Some(message) = stream.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Message::Close(_) => return Err(SocketError::Closed),
            _ => continue,
        };
        for frame in Frame::decode_all(&text)? {
            match frame.command.as_str() {
                "CONNECTED" => return Ok(()),
                "ERROR" => {
                    let reason = frame
                        .get_header("message")
                        .map(str::to_string)
                        .unwrap_or(frame.body);
                    return Err(SocketError::Rejected(reason));
                }
                other => debug!(command = other, "Frame before CONNECTED ignored"),
            }
        }
    }
    Err(SocketError::Closed)
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    tx: mpsc::Sender<SocketEvent>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = stream.next() => message,
        };

        let text = match message {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
            Some(Ok(Message::Close(_))) | None => {
                let _ = tx.send(SocketEvent::Closed).await;
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(error = %e, "WebSocket read failed");
                let _ = tx.send(SocketEvent::Error(e.to_string())).await;
                let _ = tx.send(SocketEvent::Closed).await;
                break;
            }
        };

        let frames = match Frame::decode_all(&text) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable STOMP frame");
                continue;
            }
        };
        for frame in frames {
            if let Some(event) = SocketEvent::from_frame(&frame) {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    }
}
