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

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use heyka_api::error_handler::ErrorHandler;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex},
    time::timeout,
};

pub mod audio_room;
pub mod transport;
pub mod video_room;

#[cfg(test)]
pub(crate) mod testing;

use crate::connection::supervisor::{ConnectionSupervisor, StatusUpdate};
use audio_room::{AudioRoom, AudioRoomEvent, AudioRoomParams};
use transport::{GatewayTransport, MediaStream, PublisherInfo};
use video_room::{
    VideoPublisher, VideoPublisherEvent, VideoRoomParams, VideoSubscriber, VideoSubscriberEvent,
};

pub use video_room::VideoSource;

/// How long a video subscription may reasonably take. Exceeding it is
/// logged, not cancelled: a stream that arrives late is still a stream.
pub const REQUEST_VIDEOSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

pub const CAMERA_BITRATE: u32 = 256_000;
pub const SCREEN_BITRATE: u32 = 768_000;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Coarse classification of gateway connection failures, drives which
/// recovery the app attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorKind {
    ServerDown,
    AuthenticationError,
    Unknown,
}

/// Maps the gateway's textual failure causes onto [GatewayErrorKind].
pub fn classify_cause(cause: &str) -> GatewayErrorKind {
    if cause.contains("Connect to Janus error") || cause.contains("Lost connection to the server")
    {
        GatewayErrorKind::ServerDown
    } else if cause.contains("Unauthorized request") {
        GatewayErrorKind::AuthenticationError
    } else {
        GatewayErrorKind::Unknown
    }
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("gateway connection failed ({kind:?}): {cause}")]
    Connection { kind: GatewayErrorKind, cause: String },
    #[error("plugin is detached")]
    Detached,
    #[error("not connected to the gateway")]
    NotConnected,
    #[error("negotiation failed: {0}")]
    Negotiation(String),
}

/// Per-channel parameters for a media session.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub audio_room_id: u64,
    pub video_room_id: u64,
    pub channel_token: String,
    pub user_id: String,
    pub microphone_device_id: Option<String>,
    pub initially_muted: bool,
}

#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// Both the audio and the video room are up; the channel join is
    /// complete from the media point of view.
    ChannelJoined,
    RemoteAudioStream(MediaStream),
    AudioStreamActive(bool),
    Speaking { id: String, active: bool },
    AudioSlowLink { uplink: bool },
    VideoSlowLink { uplink: bool },
    VideoPublishers(Vec<PublisherInfo>),
    VideoPublisherJoined(PublisherInfo),
    VideoPublisherLeft { id: String },
    LocalVideoStream(MediaStream),
    SuccessVideoPublishing,
    WebrtcCleanup,
    Destroyed,
}

pub type GatewayEvents = mpsc::UnboundedReceiver<GatewayEvent>;

/// Facade over the SFU for one channel: the audiobridge attachment, the
/// video publisher and one video subscriber per watched remote.
pub struct MediaGateway<T: GatewayTransport> {
    inner: Arc<GatewayInner<T>>,
}

impl<T: GatewayTransport> Clone for MediaGateway<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

struct GatewayInner<T> {
    transport: T,
    config: GatewayConfig,
    supervisor: Option<ConnectionSupervisor>,
    errors: ErrorHandler,
    emitter: mpsc::UnboundedSender<GatewayEvent>,

    audio: AsyncMutex<Option<AudioRoom>>,
    publisher: AsyncMutex<Option<VideoPublisher>>,
    subscribers: AsyncMutex<HashMap<String, VideoSubscriber>>,

    audio_ready: AtomicBool,
    video_ready: AtomicBool,
    joined_emitted: AtomicBool,
    local_video: AtomicBool,
    video_source: Mutex<Option<VideoSource>>,
}

impl<T: GatewayTransport> MediaGateway<T> {
    pub fn new(
        transport: T,
        config: GatewayConfig,
        supervisor: Option<ConnectionSupervisor>,
        errors: ErrorHandler,
    ) -> (Self, GatewayEvents) {
        let (emitter, events) = mpsc::unbounded_channel();
        let inner = Arc::new(GatewayInner {
            transport,
            config,
            supervisor,
            errors,
            emitter,
            audio: AsyncMutex::new(None),
            publisher: AsyncMutex::new(None),
            subscribers: AsyncMutex::new(HashMap::new()),
            audio_ready: AtomicBool::new(false),
            video_ready: AtomicBool::new(false),
            joined_emitted: AtomicBool::new(false),
            local_video: AtomicBool::new(false),
            video_source: Mutex::new(None),
        });
        (Self { inner }, events)
    }

    /// Connects the transport and attaches the channel's audio and video
    /// rooms. [GatewayEvent::ChannelJoined] follows once both report ready,
    /// in whatever order the gateway answers.
    pub async fn join(&self) -> GatewayResult<()> {
        let inner = &self.inner;

        if !inner.transport.is_connected() {
            if let Err(err) = inner.transport.connect().await {
                inner.report_health(false);
                return Err(err);
            }
            inner.report_health(true);
        }

        let (audio, audio_events) = AudioRoom::attach(
            &inner.transport,
            AudioRoomParams {
                room: inner.config.audio_room_id,
                token: inner.config.channel_token.clone(),
                display: inner.config.user_id.clone(),
                microphone_device_id: inner.config.microphone_device_id.clone(),
                initially_muted: inner.config.initially_muted,
            },
            inner.errors.clone(),
        )
        .await?;
        *inner.audio.lock().await = Some(audio);
        tokio::spawn(GatewayInner::forward_audio(inner.clone(), audio_events));

        let (publisher, publisher_events) = VideoPublisher::attach(
            &inner.transport,
            VideoRoomParams {
                room: inner.config.video_room_id,
                token: inner.config.channel_token.clone(),
                display: inner.config.user_id.clone(),
            },
            inner.errors.clone(),
        )
        .await?;
        *inner.publisher.lock().await = Some(publisher);
        tokio::spawn(GatewayInner::forward_publisher(inner.clone(), publisher_events));

        Ok(())
    }

    /// Mutes or unmutes the microphone. No-op outside a call.
    pub async fn set_muting(&self, muted: bool) -> GatewayResult<()> {
        match self.inner.audio.lock().await.as_ref() {
            Some(audio) => audio.set_muting(muted).await,
            None => Ok(()),
        }
    }

    /// Applies a new jitter prebuffer to our audio. No-op outside a call.
    pub async fn set_audio_prebuffer(&self, prebuffer: u32) -> GatewayResult<()> {
        match self.inner.audio.lock().await.as_ref() {
            Some(audio) => audio.set_prebuffer(prebuffer).await,
            None => Ok(()),
        }
    }

    /// Switches the active microphone device. No-op outside a call.
    pub async fn set_microphone_device(&self, device_id: String) -> GatewayResult<()> {
        match self.inner.audio.lock().await.as_ref() {
            Some(audio) => audio.set_microphone_device(device_id).await,
            None => Ok(()),
        }
    }

    /// Publishes a local video track, camera at 256 kbit/s, everything
    /// else (screen captures, prepared streams) at 768 kbit/s.
    pub async fn publish_video_stream(&self, source: VideoSource) -> GatewayResult<()> {
        let bitrate = match &source {
            VideoSource::Camera { .. } => CAMERA_BITRATE,
            _ => SCREEN_BITRATE,
        };

        let publisher = self.inner.publisher.lock().await;
        let publisher = publisher.as_ref().ok_or(GatewayError::NotConnected)?;
        publisher.publish(&source, bitrate).await?;

        self.inner.local_video.store(true, Ordering::Release);
        *self.inner.video_source.lock() = Some(source);
        Ok(())
    }

    /// Withdraws our video publication. No-op when nothing is published.
    pub async fn unpublish_video_stream(&self) -> GatewayResult<()> {
        if !self.inner.local_video.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.video_source.lock().take();

        match self.inner.publisher.lock().await.as_ref() {
            Some(publisher) => publisher.unpublish().await,
            None => Ok(()),
        }
    }

    pub fn is_publishing_video(&self) -> bool {
        self.inner.local_video.load(Ordering::Acquire)
    }

    /// Subscribes to a remote publisher's video and resolves with its
    /// stream. Slow negotiations are logged after
    /// [REQUEST_VIDEOSTREAM_TIMEOUT] but keep going.
    pub async fn request_video_stream(&self, remote_id: &str) -> GatewayResult<MediaStream> {
        if !self.inner.transport.is_connected() {
            return Err(GatewayError::NotConnected);
        }

        let (subscriber, mut events) = VideoSubscriber::attach(
            &self.inner.transport,
            VideoRoomParams {
                room: self.inner.config.video_room_id,
                token: self.inner.config.channel_token.clone(),
                display: self.inner.config.user_id.clone(),
            },
            remote_id.to_owned(),
            self.inner.errors.clone(),
        )
        .await?;
        self.inner.subscribers.lock().await.insert(remote_id.to_owned(), subscriber);

        let wait_for_stream = async {
            while let Some(event) = events.recv().await {
                if let VideoSubscriberEvent::RemoteStream(stream) = event {
                    return Some(stream);
                }
            }
            None
        };
        tokio::pin!(wait_for_stream);

        let stream = match timeout(REQUEST_VIDEOSTREAM_TIMEOUT, &mut wait_for_stream).await {
            Ok(stream) => stream,
            Err(_) => {
                log::error!("video stream from {} is taking too long", remote_id);
                wait_for_stream.await
            }
        };

        stream.ok_or_else(|| {
            GatewayError::Negotiation(format!("subscription to {} closed early", remote_id))
        })
    }

    /// Detaches the subscription to one remote. No-op if there is none.
    pub async fn stop_receiving_video_stream(&self, remote_id: &str) {
        if let Some(subscriber) = self.inner.subscribers.lock().await.remove(remote_id) {
            subscriber.detach().await;
        }
    }

    /// Leaves the channel: detaches every plugin and destroys the session.
    /// Idempotent, a second call finds nothing connected.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        if !inner.transport.is_connected() {
            return;
        }

        if let Some(audio) = inner.audio.lock().await.take() {
            audio.detach().await;
        }
        if let Some(publisher) = inner.publisher.lock().await.take() {
            publisher.detach().await;
        }
        for (_, subscriber) in inner.subscribers.lock().await.drain() {
            subscriber.detach().await;
        }

        inner.transport.destroy().await;

        inner.audio_ready.store(false, Ordering::Release);
        inner.video_ready.store(false, Ordering::Release);
        inner.joined_emitted.store(false, Ordering::Release);
        inner.local_video.store(false, Ordering::Release);
        inner.video_source.lock().take();

        inner.report_health(false);
        let _ = inner.emitter.send(GatewayEvent::Destroyed);
    }

    /// Spawns a task applying audio-quality verdicts to the session.
    pub fn apply_quality_events(&self, mut events: crate::quality::QualityEvents) {
        let gateway = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let crate::quality::QualityEvent::Prebuffer(prebuffer) = event {
                    if let Err(err) = gateway.set_audio_prebuffer(prebuffer).await {
                        log::debug!("failed to apply prebuffer {}: {}", prebuffer, err);
                    }
                }
            }
        });
    }
}

impl<T: GatewayTransport> GatewayInner<T> {
    fn report_health(&self, up: bool) {
        if let Some(supervisor) = &self.supervisor {
            supervisor.update(StatusUpdate::Gateway(up));
        }
    }

    fn maybe_channel_joined(&self) {
        if self.audio_ready.load(Ordering::Acquire)
            && self.video_ready.load(Ordering::Acquire)
            && !self.joined_emitted.swap(true, Ordering::AcqRel)
        {
            log::info!("channel fully joined");
            let _ = self.emitter.send(GatewayEvent::ChannelJoined);
        }
    }

    async fn forward_audio(
        inner: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<AudioRoomEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                AudioRoomEvent::MediaState { active } => {
                    let _ = inner.emitter.send(GatewayEvent::AudioStreamActive(active));
                    if active {
                        inner.audio_ready.store(true, Ordering::Release);
                        inner.maybe_channel_joined();
                    }
                }
                AudioRoomEvent::Speaking { id, active } => {
                    let _ = inner.emitter.send(GatewayEvent::Speaking { id, active });
                }
                AudioRoomEvent::RemoteStream(stream) => {
                    let _ = inner.emitter.send(GatewayEvent::RemoteAudioStream(stream));
                }
                AudioRoomEvent::SlowLink { uplink } => {
                    let _ = inner.emitter.send(GatewayEvent::AudioSlowLink { uplink });
                }
            }
        }
    }

    async fn forward_publisher(
        inner: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<VideoPublisherEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                VideoPublisherEvent::Publishers(publishers) => {
                    let _ = inner.emitter.send(GatewayEvent::VideoPublishers(publishers));
                    inner.video_ready.store(true, Ordering::Release);
                    inner.maybe_channel_joined();
                }
                VideoPublisherEvent::PublisherJoined(publisher) => {
                    let _ = inner.emitter.send(GatewayEvent::VideoPublisherJoined(publisher));
                }
                VideoPublisherEvent::PublisherLeft { id } => {
                    let _ = inner.emitter.send(GatewayEvent::VideoPublisherLeft { id });
                }
                VideoPublisherEvent::LocalStream(stream) => {
                    let _ = inner.emitter.send(GatewayEvent::LocalVideoStream(stream));
                }
                VideoPublisherEvent::Published => {
                    let _ = inner.emitter.send(GatewayEvent::SuccessVideoPublishing);
                }
                VideoPublisherEvent::SlowLink { uplink } => {
                    let _ = inner.emitter.send(GatewayEvent::VideoSlowLink { uplink });
                }
                VideoPublisherEvent::Cleanup => {
                    inner.local_video.store(false, Ordering::Release);
                    let _ = inner.emitter.send(GatewayEvent::WebrtcCleanup);
                }
            }
        }
    }
}
