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

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use heyka_api::error_handler::ErrorHandler;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    transport::{
        GatewayTransport, MediaStream, OfferOptions, PluginEvent, PluginEvents, PluginHandle,
        PluginKind, PluginState, RoomEvent, RoomRequest,
    },
    GatewayError, GatewayResult,
};

#[derive(Debug, Clone)]
pub struct AudioRoomParams {
    pub room: u64,
    pub token: String,
    pub display: String,
    pub microphone_device_id: Option<String>,
    pub initially_muted: bool,
}

#[derive(Debug, Clone)]
pub enum AudioRoomEvent {
    /// The mixed room audio is flowing (or stopped flowing).
    MediaState { active: bool },
    /// A room member started or stopped speaking.
    Speaking { id: String, active: bool },
    RemoteStream(MediaStream),
    SlowLink { uplink: bool },
}

pub type AudioRoomEvents = mpsc::UnboundedReceiver<AudioRoomEvent>;

/// One audiobridge attachment: joins the channel's audio room, negotiates
/// the microphone track and keeps it configurable (mute, device, jitter
/// prebuffer).
pub struct AudioRoom {
    inner: Arc<AudioRoomInner>,
}

struct AudioRoomInner {
    handle: PluginHandle,
    params: AudioRoomParams,
    device_id: Mutex<Option<String>>,
    state: Mutex<PluginState>,
    detached: AtomicBool,
    emitter: mpsc::UnboundedSender<AudioRoomEvent>,
    errors: ErrorHandler,
}

impl AudioRoom {
    pub(super) async fn attach(
        transport: &dyn GatewayTransport,
        params: AudioRoomParams,
        errors: ErrorHandler,
    ) -> GatewayResult<(Self, AudioRoomEvents)> {
        let (handle, plugin_events) = transport.attach(PluginKind::AudioBridge).await?;
        let (emitter, events) = mpsc::unbounded_channel();

        let inner = Arc::new(AudioRoomInner {
            handle,
            device_id: Mutex::new(params.microphone_device_id.clone()),
            params,
            state: Mutex::new(PluginState::Attaching),
            detached: AtomicBool::new(false),
            emitter,
            errors,
        });

        tokio::spawn(AudioRoomInner::plugin_task(inner.clone(), plugin_events));

        inner
            .handle
            .send(
                RoomRequest::Join {
                    room: inner.params.room,
                    display: inner.params.display.clone(),
                    token: inner.params.token.clone(),
                    feed: None,
                },
                None,
            )
            .await?;

        Ok((Self { inner }, events))
    }

    pub fn state(&self) -> PluginState {
        *self.inner.state.lock()
    }

    pub async fn set_muting(&self, muted: bool) -> GatewayResult<()> {
        self.inner.ensure_attached()?;
        self.inner
            .handle
            .send(
                RoomRequest::Configure { muted: Some(muted), prebuffer: None, bitrate: None },
                None,
            )
            .await
    }

    /// Adjusts the gateway-side jitter buffer for our audio.
    pub async fn set_prebuffer(&self, prebuffer: u32) -> GatewayResult<()> {
        self.inner.ensure_attached()?;
        self.inner
            .handle
            .send(
                RoomRequest::Configure { muted: None, prebuffer: Some(prebuffer), bitrate: None },
                None,
            )
            .await
    }

    /// Switches the microphone by renegotiating the audio track in place.
    pub async fn set_microphone_device(&self, device_id: String) -> GatewayResult<()> {
        self.inner.ensure_attached()?;
        *self.inner.device_id.lock() = Some(device_id.clone());

        let jsep = self
            .inner
            .handle
            .create_offer(OfferOptions {
                audio: true,
                replace_audio: true,
                device_id: Some(device_id),
                ..Default::default()
            })
            .await?;
        *self.inner.state.lock() = PluginState::Negotiating;
        self.inner.handle.send(RoomRequest::configure(), Some(jsep)).await
    }

    /// Leaves the room and releases the attachment. Idempotent.
    pub async fn detach(&self) {
        if self.inner.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.inner.state.lock() = PluginState::Detached;
        self.inner.handle.detach().await;
    }
}

impl AudioRoomInner {
    fn ensure_attached(&self) -> GatewayResult<()> {
        if self.detached.load(Ordering::Acquire) {
            return Err(GatewayError::Detached);
        }
        Ok(())
    }

    async fn plugin_task(inner: Arc<Self>, mut events: PluginEvents) {
        while let Some(event) = events.recv().await {
            // Callbacks of a detached plugin must not touch anything.
            if inner.detached.load(Ordering::Acquire) {
                break;
            }

            match event {
                PluginEvent::Message { data: RoomEvent::Joined { id }, jsep: None } => {
                    log::debug!("joined audio room as {}", id);
                    *inner.state.lock() = PluginState::Joined;
                    if let Err(err) = inner.negotiate().await {
                        inner.errors.handle(&err);
                    }
                }
                PluginEvent::Message { jsep: Some(jsep), .. } => {
                    match inner.handle.handle_remote_jsep(jsep).await {
                        Ok(()) => *inner.state.lock() = PluginState::Configured,
                        Err(err) => inner.errors.handle(&err),
                    }
                }
                PluginEvent::MediaState { active } => {
                    let _ = inner.emitter.send(AudioRoomEvent::MediaState { active });
                }
                PluginEvent::Speaking { id, active } => {
                    let _ = inner.emitter.send(AudioRoomEvent::Speaking { id, active });
                }
                PluginEvent::RemoteStream(stream) => {
                    let _ = inner.emitter.send(AudioRoomEvent::RemoteStream(stream));
                }
                PluginEvent::SlowLink { uplink } => {
                    let _ = inner.emitter.send(AudioRoomEvent::SlowLink { uplink });
                }
                PluginEvent::Detached => {
                    inner.detached.store(true, Ordering::Release);
                    *inner.state.lock() = PluginState::Detached;
                    break;
                }
                other => log::debug!("unhandled audio room event: {:?}", other),
            }
        }
    }

    async fn negotiate(&self) -> GatewayResult<()> {
        *self.state.lock() = PluginState::Negotiating;
        let device_id = self.device_id.lock().clone();
        let jsep = self
            .handle
            .create_offer(OfferOptions { audio: true, device_id, ..Default::default() })
            .await?;

        self.handle
            .send(
                RoomRequest::Configure {
                    muted: Some(self.params.initially_muted),
                    prebuffer: None,
                    bitrate: None,
                },
                Some(jsep),
            )
            .await
    }
}
