//! WebSocket transport using tokio-tungstenite.

use crate::channel::transport::{Frame, FrameSink, FrameStream, SocketTransport};
use crate::error::{CoachError, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Real socket transport for `ws://` and `wss://` endpoints.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SocketTransport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        let (socket, response) = connect_async(url)
            .await
            .map_err(|e| CoachError::Connection {
                message: format!("Failed to connect to {}: {}", url, e),
            })?;
        tracing::debug!(url, status = %response.status(), "websocket connected");

        let (writer, reader) = socket.split();
        Ok((
            Box::new(WebSocketSink { writer }),
            Box::new(WebSocketReader { reader }),
        ))
    }
}

struct WebSocketSink {
    writer: SplitSink<Socket, Message>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.writer
            .send(Message::text(text))
            .await
            .map_err(|e| CoachError::Connection {
                message: format!("Failed to send frame: {}", e),
            })
    }

    async fn close(&mut self) -> Result<()> {
        self.writer
            .send(Message::Close(None))
            .await
            .map_err(|e| CoachError::Connection {
                message: format!("Failed to close socket: {}", e),
            })
    }
}

struct WebSocketReader {
    reader: SplitStream<Socket>,
}

#[async_trait]
impl FrameStream for WebSocketReader {
    async fn next_frame(&mut self) -> Result<Frame> {
        loop {
            match self.reader.next().await {
                Some(Ok(message)) => {
                    if let Some(frame) = frame_from_message(message) {
                        return Ok(frame);
                    }
                }
                Some(Err(e)) => {
                    return Err(CoachError::Connection {
                        message: format!("WebSocket error: {}", e),
                    });
                }
                None => {
                    return Err(CoachError::Connection {
                        message: "WebSocket stream ended without close frame".to_string(),
                    });
                }
            }
        }
    }
}

/// Map a websocket message to a channel frame. Only text and close frames
/// carry session events; binary, ping and pong yield `None`.
fn frame_from_message(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        Message::Close(frame) => {
            tracing::debug!(?frame, "server closed websocket");
            Some(Frame::Closed)
        }
        Message::Binary(bytes) => {
            tracing::debug!(len = bytes.len(), "ignoring binary frame");
            None
        }
        // Ping/pong are answered by tungstenite on the next write.
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_frames_are_ignored_even_when_utf8() {
        let json = r#"{"type":"patient_response","message":"hi"}"#;
        assert_eq!(frame_from_message(Message::Binary(json.as_bytes().to_vec().into())), None);
        assert_eq!(frame_from_message(Message::Ping(Vec::new().into())), None);
    }

    #[test]
    fn text_and_close_frames_are_delivered() {
        assert_eq!(
            frame_from_message(Message::Text("{}".into())),
            Some(Frame::Text("{}".to_string()))
        );
        assert_eq!(frame_from_message(Message::Close(None)), Some(Frame::Closed));
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_connection_error() {
        // Port 9 (discard) is almost never listening on loopback.
        let result = WebSocketTransport::new().connect("ws://127.0.0.1:9/ws/1").await;
        match result {
            Err(CoachError::Connection { message }) => {
                assert!(message.contains("127.0.0.1:9"));
            }
            Err(other) => panic!("Expected Connection error, got: {:?}", other),
            Ok(_) => panic!("Expected Connection error, got a connection"),
        }
    }

    #[tokio::test]
    async fn invalid_url_is_connection_error() {
        let result = WebSocketTransport::new().connect("not a url").await;
        assert!(matches!(result, Err(CoachError::Connection { .. })));
    }
}
