// Copyright 2023 Heyka, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::error::ProtocolError,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};

use super::{SocketError, SocketResult};

type WebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Wire frame of the realtime broker, JSON text both ways.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug)]
pub enum SocketEvent {
    /// First frame of every connection, carries the broker-assigned id.
    Welcome { socket_id: String },
    Event { name: String, data: Value },
    /// Transport is gone, no more events will follow.
    Disconnected,
}

#[derive(Debug)]
enum InternalMessage {
    Frame { frame: Frame, response_chn: oneshot::Sender<SocketResult<()>> },
    Pong { ping_data: Vec<u8> },
    Close,
}

/// SocketStream holds the WebSocket connection.
///
/// It is replaced by [super::SocketClient] at each reconnection and never tries to
/// reconnect on its own.
#[derive(Debug)]
pub(super) struct SocketStream {
    internal_tx: mpsc::Sender<InternalMessage>,
    read_handle: JoinHandle<()>,
    write_handle: JoinHandle<()>,
}

impl SocketStream {
    pub async fn connect(
        url: url::Url,
        emitter: mpsc::UnboundedSender<SocketEvent>,
    ) -> SocketResult<Self> {
        log::info!("connecting to {}", url);

        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (ws_writer, ws_reader) = ws_stream.split();

        let (internal_tx, internal_rx) = mpsc::channel::<InternalMessage>(8);
        let write_handle = tokio::spawn(Self::write_task(internal_rx, ws_writer));
        let read_handle = tokio::spawn(Self::read_task(internal_tx.clone(), ws_reader, emitter));

        Ok(Self { internal_tx, read_handle, write_handle })
    }

    /// Close the websocket.
    /// It sends a CloseFrame to the server before closing.
    pub async fn close(self) {
        let _ = self.internal_tx.send(InternalMessage::Close).await;
        let _ = self.write_handle.await;
        self.read_handle.abort();
        let _ = self.read_handle.await;
    }

    /// Send a frame to the websocket.
    /// It also waits for the message to be sent.
    pub async fn send(&self, frame: Frame) -> SocketResult<()> {
        let (send, recv) = oneshot::channel();
        let msg = InternalMessage::Frame { frame, response_chn: send };
        let _ = self.internal_tx.send(msg).await;
        recv.await.map_err(|_| SocketError::SendError)?
    }

    /// This task is used to send messages to the websocket.
    /// It is also responsible for closing the connection.
    async fn write_task(
        mut internal_rx: mpsc::Receiver<InternalMessage>,
        mut ws_writer: SplitSink<WebSocket, Message>,
    ) {
        while let Some(msg) = internal_rx.recv().await {
            match msg {
                InternalMessage::Frame { frame, response_chn } => {
                    let data = match serde_json::to_string(&frame) {
                        Ok(data) => data,
                        Err(err) => {
                            let _ = response_chn.send(Err(err.into()));
                            continue;
                        }
                    };

                    if let Err(err) = ws_writer.send(Message::Text(data)).await {
                        let _ = response_chn.send(Err(err.into()));
                        break;
                    }

                    let _ = response_chn.send(Ok(()));
                }
                InternalMessage::Pong { ping_data } => {
                    if let Err(err) = ws_writer.send(Message::Pong(ping_data)).await {
                        log::error!("failed to send pong message: {:?}", err);
                    }
                }
                InternalMessage::Close => break,
            }
        }

        let _ = ws_writer.close().await;
    }

    /// This task is used to read incoming frames from the websocket
    /// and dispatch them through the emitter.
    ///
    /// It can also send messages to the write task ( Used e.g. answer to pings )
    async fn read_task(
        internal_tx: mpsc::Sender<InternalMessage>,
        mut ws_reader: SplitStream<WebSocket>,
        emitter: mpsc::UnboundedSender<SocketEvent>,
    ) {
        while let Some(msg) = ws_reader.next().await {
            match msg {
                Ok(Message::Text(data)) => match serde_json::from_str::<Frame>(&data) {
                    Ok(frame) => {
                        let _ = emitter.send(Self::translate(frame));
                    }
                    Err(err) => {
                        log::error!("failed to decode frame: {} ({})", err, data);
                    }
                },
                Ok(Message::Ping(data)) => {
                    let _ = internal_tx.send(InternalMessage::Pong { ping_data: data }).await;
                    continue;
                }
                Ok(Message::Close(close)) => {
                    log::debug!("server closed the connection: {:?}", close);
                    break;
                }
                Ok(Message::Frame(_)) => {}
                Err(WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)) => {
                    break; // Ignore
                }
                _ => {
                    log::error!("unhandled websocket message {:?}", msg);
                    break;
                }
            }
        }

        let _ = internal_tx.send(InternalMessage::Close).await;
        let _ = emitter.send(SocketEvent::Disconnected);
    }

    fn translate(frame: Frame) -> SocketEvent {
        if frame.event == "welcome" {
            let socket_id = frame
                .data
                .get("socketId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            SocketEvent::Welcome { socket_id }
        } else {
            SocketEvent::Event { name: frame.event, data: frame.data }
        }
    }
}
