//! [`Connector`] over a real WebSocket.

use std::time::Duration;

use {
    async_trait::async_trait,
    futures::{SinkExt, Stream, StreamExt},
    llamadash_config::ClientConfig,
    llamadash_protocol::{Broadcast, Frame},
    tokio::sync::mpsc,
    tokio_tungstenite::{connect_async, tungstenite::Message},
    tracing::{debug, warn},
};

use crate::{
    Error, Result,
    transport::{
        Connector, LinkEvent, SERVER_DISCONNECT, Session, TRANSPORT_CLOSE, TRANSPORT_ERROR,
    },
};

type WsItem = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>;

/// Opens one socket per [`Connector::open`]: upgrade, wait for the
/// `connection:open` hello, then pump frames on two tasks.
pub struct WsConnector {
    url: String,
    handshake_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, handshake_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            handshake_timeout,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.url.clone(), config.handshake_timeout())
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self) -> Result<Session> {
        let timed_out = || Error::Connect(format!("handshake with {} timed out", self.url));

        let (socket, _) = tokio::time::timeout(self.handshake_timeout, connect_async(&self.url))
            .await
            .map_err(|_| timed_out())??;
        let (mut sink, mut stream) = socket.split();
        let id = tokio::time::timeout(self.handshake_timeout, hello(&mut stream))
            .await
            .map_err(|_| timed_out())??;
        debug!(url = %self.url, conn_id = %id, "socket open");

        let (outbound, mut outgoing) = mpsc::unbounded_channel::<Frame>();
        tokio::spawn(async move {
            while let Some(frame) = outgoing.recv().await {
                let text = match frame.to_text() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(event = %frame.event, error = %e, "unserializable frame dropped");
                        continue;
                    },
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    debug!(error = %e, "socket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let (incoming, inbound) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => match Frame::from_text(text.as_str()) {
                        Ok(frame) => {
                            if incoming.send(LinkEvent::Frame(frame)).is_err() {
                                return;
                            }
                        },
                        Err(e) => warn!(error = %e, "malformed frame dropped"),
                    },
                    Some(Ok(Message::Close(_))) => break SERVER_DISCONNECT,
                    Some(Ok(_)) => {},
                    Some(Err(e)) => {
                        debug!(error = %e, "socket read failed");
                        break TRANSPORT_ERROR;
                    },
                    None => break TRANSPORT_CLOSE,
                }
            };
            let _ = incoming.send(LinkEvent::Closed(reason.to_string()));
        });

        Ok(Session {
            id,
            outbound,
            inbound,
        })
    }
}

/// Read until the server's hello and return the connection id it assigns.
async fn hello(stream: &mut (impl Stream<Item = WsItem> + Unpin)) -> Result<String> {
    while let Some(message) = stream.next().await {
        let Message::Text(text) = message? else {
            continue;
        };
        let frame = Frame::from_text(text.as_str())?;
        match Broadcast::from_frame(&frame) {
            Some(Ok(Broadcast::ConnectionOpen { client_id })) => return Ok(client_id),
            _ => warn!(event = %frame.event, "frame before hello dropped"),
        }
    }
    Err(Error::Connect("socket closed before hello".into()))
}
