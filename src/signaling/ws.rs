use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::ReconnectPolicy;
use crate::signaling::Envelope;
use crate::{MeshError, RoomHandle};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The relay's websocket endpoint for one room.
///
/// Outbound envelopes are read from the room's signal channel and written as text frames.
/// Inbound text frames are decoded and delivered to the room. When the signal channel closes
/// (the room left) the socket is closed with code 1000 and `run` returns.
pub struct WsSignaling {
    url: String,
    policy: ReconnectPolicy,
    handle: RoomHandle,
    outbound: mpsc::UnboundedReceiver<Envelope>,
}

impl WsSignaling {
    /// `base` is e.g. `ws://localhost:8000`
    pub fn new(
        base: &str,
        room: &str,
        policy: ReconnectPolicy,
        handle: RoomHandle,
        outbound: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        Self {
            url: format!("{}/ws/video/{}/", base.trim_end_matches('/'), room),
            policy,
            handle,
            outbound,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns `Ok` after a normal close, otherwise the error that ended the channel for good.
    pub async fn run(mut self) -> Result<(), MeshError> {
        let mut attempt = 0;
        loop {
            let err = match connect_async(self.url.as_str()).await {
                Ok((socket, _)) => {
                    log::info!("signaling channel connected to {}", &self.url);
                    attempt = 0;
                    if self.handle.channel_opened().is_err() {
                        return Ok(());
                    }
                    match self.pump(socket).await {
                        Ok(()) => return Ok(()),
                        Err(e) => e,
                    }
                }
                Err(e) => MeshError::ChannelClosedAbnormally(e.to_string()),
            };

            if !err.is_retryable() {
                if err == MeshError::ChannelClosedNormally {
                    log::info!("signaling channel closed by relay");
                    return Ok(());
                }
                log::warn!("signaling channel: {}", err);
                return Err(err);
            }
            if !self.policy.should_retry(attempt) {
                log::warn!("giving up on signaling channel after {} attempts: {}", attempt, err);
                return Err(err);
            }
            let delay = self.policy.backoff(attempt);
            attempt += 1;
            log::warn!("{}. reconnecting in {:?}", err, delay);
            tokio::time::sleep(delay).await;
        }
    }

    async fn pump(&mut self, socket: Socket) -> Result<(), MeshError> {
        let (mut write, mut read) = socket.split();
        loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => match self.handle.deliver_json(&text) {
                        Ok(()) => {}
                        Err(MeshError::Stopped) => return Ok(()),
                        Err(e) => log::debug!("dropping frame: {}", e),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.into_owned()))
                            .unwrap_or((1005, String::new()));
                        return Err(MeshError::from_close_code(code, &reason));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(MeshError::ChannelClosedAbnormally(e.to_string())),
                    None => return Err(MeshError::ChannelClosedAbnormally("stream ended".into())),
                },
                opt = self.outbound.recv() => match opt {
                    Some(envelope) => {
                        let text = match envelope.to_json() {
                            Ok(text) => text,
                            Err(e) => {
                                log::error!("failed to encode envelope: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::Text(text)).await {
                            return Err(MeshError::ChannelClosedAbnormally(e.to_string()));
                        }
                    }
                    None => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "leaving".into(),
                        };
                        if let Err(e) = write.send(Message::Close(Some(frame))).await {
                            log::debug!("failed to close signaling channel: {}", e);
                        }
                        return Ok(());
                    }
                }
            }
        }
    }
}
