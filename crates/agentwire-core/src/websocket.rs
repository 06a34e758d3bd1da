//! WebSocket connector
//!
//! Opens the agent connection with tokio-tungstenite and adapts the socket to
//! the [`Frame`] sink/stream pair. The access token travels as a bearer
//! `Authorization` header on the upgrade request. Ping/pong is answered by
//! tungstenite itself and never surfaces as a frame.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info};

use crate::transport::{Connection, Connector, Frame, TransportError};

/// [`Connector`] backed by a real WebSocket
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str, access_token: &str) -> Result<Connection, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::InvalidConfig(format!("{url}: {e}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {access_token}"))
            .map_err(|e| TransportError::InvalidConfig(format!("access token: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws, response) = connect_async(request)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        info!("WebSocket connected to {} ({})", url, response.status());

        let (write, read) = ws.split();

        let sink = write
            .sink_map_err(|e| TransportError::WebSocket(e.to_string()))
            .with(|frame: Frame| future::ready(Ok::<_, TransportError>(into_message(frame))));

        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(Frame::Text(text))),
                Ok(Message::Binary(data)) => Some(Ok(Frame::Binary(Bytes::from(data)))),
                Ok(Message::Close(frame)) => {
                    debug!("WebSocket close received: {:?}", frame);
                    None
                }
                Ok(_) => None,
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => None,
                Err(e) => Some(Err(TransportError::WebSocket(e.to_string()))),
            })
        });

        Ok(Connection {
            sink: Box::pin(sink),
            stream: stream.boxed(),
        })
    }
}

fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(data) => Message::Binary(data.to_vec()),
    }
}
