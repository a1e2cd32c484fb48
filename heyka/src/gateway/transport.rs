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

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use super::{GatewayError, GatewayResult};

/// SDP blob exchanged during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: "offer".to_owned(), sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: "answer".to_owned(), sdp: sdp.into() }
    }
}

/// Handle to a local or remote media stream owned by the media stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    AudioBridge,
    VideoRoom,
}

/// Lifecycle every plugin attachment walks through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Attaching,
    Joined,
    Negotiating,
    Configured,
    Detached,
}

/// What the local peer connection should capture when building an offer.
#[derive(Debug, Clone, Default)]
pub struct OfferOptions {
    pub audio: bool,
    pub video: bool,
    /// Renegotiate the audio track in place, e.g. after a device switch.
    pub replace_audio: bool,
    pub device_id: Option<String>,
}

/// Room-level requests understood by the SFU plugins.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "request", rename_all = "lowercase")]
pub enum RoomRequest {
    Join {
        room: u64,
        display: String,
        token: String,
        /// Remote feed to subscribe to; publishers join without one.
        #[serde(skip_serializing_if = "Option::is_none")]
        feed: Option<String>,
    },
    Configure {
        #[serde(skip_serializing_if = "Option::is_none")]
        muted: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        prebuffer: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        bitrate: Option<u32>,
    },
    Start,
    Unpublish,
    Leave,
}

impl RoomRequest {
    pub const fn configure() -> Self {
        RoomRequest::Configure { muted: None, prebuffer: None, bitrate: None }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublisherInfo {
    pub id: String,
    pub display: String,
}

/// Room-level answers and notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Joined { id: String },
    Publishers(Vec<PublisherInfo>),
    PublisherJoined(PublisherInfo),
    PublisherLeft { id: String },
    Attached { feed: String },
    Configured,
    Other(serde_json::Value),
}

/// Everything a plugin attachment can report back.
#[derive(Debug, Clone)]
pub enum PluginEvent {
    WebrtcState { up: bool, reason: Option<String> },
    MediaState { active: bool },
    /// Voice-activity verdict for one room member.
    Speaking { id: String, active: bool },
    SlowLink { uplink: bool },
    Message { data: RoomEvent, jsep: Option<SessionDescription> },
    LocalStream(MediaStream),
    RemoteStream(MediaStream),
    Cleanup,
    Detached,
}

pub type PluginEvents = mpsc::UnboundedReceiver<PluginEvent>;

#[derive(Debug)]
pub enum PluginRequest {
    CreateOffer {
        options: OfferOptions,
        response_chn: oneshot::Sender<GatewayResult<SessionDescription>>,
    },
    CreateAnswer {
        jsep: SessionDescription,
        response_chn: oneshot::Sender<GatewayResult<SessionDescription>>,
    },
    Send {
        body: RoomRequest,
        jsep: Option<SessionDescription>,
        response_chn: oneshot::Sender<GatewayResult<()>>,
    },
    HandleRemoteJsep {
        jsep: SessionDescription,
        response_chn: oneshot::Sender<GatewayResult<()>>,
    },
    Detach {
        response_chn: oneshot::Sender<()>,
    },
}

/// Command handle to one plugin attachment.
///
/// Requests travel over an internal channel to whatever task owns the real
/// plugin; each carries a oneshot the owner answers on.
#[derive(Debug, Clone)]
pub struct PluginHandle {
    request_tx: mpsc::Sender<PluginRequest>,
}

impl PluginHandle {
    pub fn new(request_tx: mpsc::Sender<PluginRequest>) -> Self {
        Self { request_tx }
    }

    pub async fn create_offer(&self, options: OfferOptions) -> GatewayResult<SessionDescription> {
        let (tx, rx) = oneshot::channel();
        self.request(PluginRequest::CreateOffer { options, response_chn: tx }).await?;
        rx.await.map_err(|_| GatewayError::Detached)?
    }

    pub async fn create_answer(
        &self,
        jsep: SessionDescription,
    ) -> GatewayResult<SessionDescription> {
        let (tx, rx) = oneshot::channel();
        self.request(PluginRequest::CreateAnswer { jsep, response_chn: tx }).await?;
        rx.await.map_err(|_| GatewayError::Detached)?
    }

    pub async fn send(
        &self,
        body: RoomRequest,
        jsep: Option<SessionDescription>,
    ) -> GatewayResult<()> {
        let (tx, rx) = oneshot::channel();
        self.request(PluginRequest::Send { body, jsep, response_chn: tx }).await?;
        rx.await.map_err(|_| GatewayError::Detached)?
    }

    pub async fn handle_remote_jsep(&self, jsep: SessionDescription) -> GatewayResult<()> {
        let (tx, rx) = oneshot::channel();
        self.request(PluginRequest::HandleRemoteJsep { jsep, response_chn: tx }).await?;
        rx.await.map_err(|_| GatewayError::Detached)?
    }

    /// Tells the owner to tear the attachment down and waits for it.
    pub async fn detach(&self) {
        let (tx, rx) = oneshot::channel();
        if self.request(PluginRequest::Detach { response_chn: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn request(&self, request: PluginRequest) -> GatewayResult<()> {
        self.request_tx.send(request).await.map_err(|_| GatewayError::Detached)
    }
}

/// The SFU gateway collaborator: owns the session transport and the real
/// peer connections, hands out plugin attachments.
#[async_trait::async_trait]
pub trait GatewayTransport: Send + Sync + 'static {
    async fn connect(&self) -> GatewayResult<()>;
    fn is_connected(&self) -> bool;
    async fn attach(&self, kind: PluginKind) -> GatewayResult<(PluginHandle, PluginEvents)>;
    async fn destroy(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_requests_serialize_like_the_gateway_expects() {
        let join = RoomRequest::Join {
            room: 42,
            display: "user-1".into(),
            token: "channel-token".into(),
            feed: None,
        };
        assert_eq!(
            serde_json::to_value(&join).unwrap(),
            serde_json::json!({
                "request": "join",
                "room": 42,
                "display": "user-1",
                "token": "channel-token",
            })
        );

        let configure =
            RoomRequest::Configure { muted: Some(true), prebuffer: None, bitrate: None };
        assert_eq!(
            serde_json::to_value(&configure).unwrap(),
            serde_json::json!({ "request": "configure", "muted": true })
        );
    }

    #[tokio::test]
    async fn handle_reports_detached_when_the_owner_is_gone() {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        drop(rx);
        let handle = PluginHandle::new(tx);

        let result = handle.create_offer(OfferOptions::default()).await;
        assert!(matches!(result, Err(GatewayError::Detached)));
    }
}
