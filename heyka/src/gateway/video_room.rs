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
        PluginKind, PluginState, PublisherInfo, RoomEvent, RoomRequest,
    },
    GatewayError, GatewayResult,
};

/// What the local video track is captured from.
#[derive(Debug, Clone)]
pub enum VideoSource {
    Camera { device_id: Option<String> },
    Screen { source_id: String },
    /// A stream the caller already captured.
    Stream(MediaStream),
}

#[derive(Debug, Clone)]
pub struct VideoRoomParams {
    pub room: u64,
    pub token: String,
    pub display: String,
}

#[derive(Debug, Clone)]
pub enum VideoPublisherEvent {
    /// Initial list of everyone already publishing in the room.
    Publishers(Vec<PublisherInfo>),
    PublisherJoined(PublisherInfo),
    PublisherLeft { id: String },
    LocalStream(MediaStream),
    /// Our own publication finished negotiating.
    Published,
    SlowLink { uplink: bool },
    Cleanup,
}

pub type VideoPublisherEvents = mpsc::UnboundedReceiver<VideoPublisherEvent>;

/// Publisher attachment to the channel's video room. Joins eagerly so the
/// publisher list flows, publishes a local track only on demand.
pub struct VideoPublisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    handle: PluginHandle,
    state: Mutex<PluginState>,
    detached: AtomicBool,
    emitter: mpsc::UnboundedSender<VideoPublisherEvent>,
    errors: ErrorHandler,
}

impl VideoPublisher {
    pub(super) async fn attach(
        transport: &dyn GatewayTransport,
        params: VideoRoomParams,
        errors: ErrorHandler,
    ) -> GatewayResult<(Self, VideoPublisherEvents)> {
        let (handle, plugin_events) = transport.attach(PluginKind::VideoRoom).await?;
        let (emitter, events) = mpsc::unbounded_channel();

        let inner = Arc::new(PublisherInner {
            handle,
            state: Mutex::new(PluginState::Attaching),
            detached: AtomicBool::new(false),
            emitter,
            errors,
        });
        tokio::spawn(PublisherInner::plugin_task(inner.clone(), plugin_events));

        inner
            .handle
            .send(
                RoomRequest::Join {
                    room: params.room,
                    display: params.display,
                    token: params.token,
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

    /// Negotiates a local video track into the room.
    pub async fn publish(&self, source: &VideoSource, bitrate: u32) -> GatewayResult<()> {
        self.inner.ensure_attached()?;

        let device_id = match source {
            VideoSource::Camera { device_id } => device_id.clone(),
            VideoSource::Screen { source_id } => Some(source_id.clone()),
            VideoSource::Stream(stream) => Some(stream.id.clone()),
        };

        let jsep = self
            .inner
            .handle
            .create_offer(OfferOptions { video: true, device_id, ..Default::default() })
            .await?;
        *self.inner.state.lock() = PluginState::Negotiating;
        self.inner
            .handle
            .send(
                RoomRequest::Configure { muted: None, prebuffer: None, bitrate: Some(bitrate) },
                Some(jsep),
            )
            .await
    }

    pub async fn unpublish(&self) -> GatewayResult<()> {
        self.inner.ensure_attached()?;
        self.inner.handle.send(RoomRequest::Unpublish, None).await?;
        *self.inner.state.lock() = PluginState::Joined;
        Ok(())
    }

    pub async fn detach(&self) {
        if self.inner.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.inner.state.lock() = PluginState::Detached;
        self.inner.handle.detach().await;
    }
}

impl PublisherInner {
    fn ensure_attached(&self) -> GatewayResult<()> {
        if self.detached.load(Ordering::Acquire) {
            return Err(GatewayError::Detached);
        }
        Ok(())
    }

    async fn plugin_task(inner: Arc<Self>, mut events: PluginEvents) {
        while let Some(event) = events.recv().await {
            if inner.detached.load(Ordering::Acquire) {
                break;
            }

            match event {
                PluginEvent::Message { data, jsep } => {
                    if let Some(jsep) = jsep {
                        match inner.handle.handle_remote_jsep(jsep).await {
                            Ok(()) => {
                                *inner.state.lock() = PluginState::Configured;
                                let _ = inner.emitter.send(VideoPublisherEvent::Published);
                            }
                            Err(err) => inner.errors.handle(&err),
                        }
                    }

                    match data {
                        RoomEvent::Joined { id } => {
                            log::debug!("joined video room as {}", id);
                            *inner.state.lock() = PluginState::Joined;
                        }
                        RoomEvent::Publishers(publishers) => {
                            let _ =
                                inner.emitter.send(VideoPublisherEvent::Publishers(publishers));
                        }
                        RoomEvent::PublisherJoined(publisher) => {
                            let _ = inner
                                .emitter
                                .send(VideoPublisherEvent::PublisherJoined(publisher));
                        }
                        RoomEvent::PublisherLeft { id } => {
                            let _ = inner.emitter.send(VideoPublisherEvent::PublisherLeft { id });
                        }
                        _ => {}
                    }
                }
                PluginEvent::LocalStream(stream) => {
                    let _ = inner.emitter.send(VideoPublisherEvent::LocalStream(stream));
                }
                PluginEvent::SlowLink { uplink } => {
                    let _ = inner.emitter.send(VideoPublisherEvent::SlowLink { uplink });
                }
                PluginEvent::Cleanup => {
                    let _ = inner.emitter.send(VideoPublisherEvent::Cleanup);
                }
                PluginEvent::Detached => {
                    inner.detached.store(true, Ordering::Release);
                    *inner.state.lock() = PluginState::Detached;
                    break;
                }
                other => log::debug!("unhandled video room event: {:?}", other),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum VideoSubscriberEvent {
    RemoteStream(MediaStream),
    SlowLink { uplink: bool },
}

pub type VideoSubscriberEvents = mpsc::UnboundedReceiver<VideoSubscriberEvent>;

/// Subscriber attachment to one remote publisher's feed. The gateway sends
/// the offer; we answer and start the flow.
pub struct VideoSubscriber {
    inner: Arc<SubscriberInner>,
}

struct SubscriberInner {
    handle: PluginHandle,
    state: Mutex<PluginState>,
    detached: AtomicBool,
    emitter: mpsc::UnboundedSender<VideoSubscriberEvent>,
    errors: ErrorHandler,
}

impl VideoSubscriber {
    pub(super) async fn attach(
        transport: &dyn GatewayTransport,
        params: VideoRoomParams,
        feed: String,
        errors: ErrorHandler,
    ) -> GatewayResult<(Self, VideoSubscriberEvents)> {
        let (handle, plugin_events) = transport.attach(PluginKind::VideoRoom).await?;
        let (emitter, events) = mpsc::unbounded_channel();

        let inner = Arc::new(SubscriberInner {
            handle,
            state: Mutex::new(PluginState::Attaching),
            detached: AtomicBool::new(false),
            emitter,
            errors,
        });
        tokio::spawn(SubscriberInner::plugin_task(inner.clone(), plugin_events));

        inner
            .handle
            .send(
                RoomRequest::Join {
                    room: params.room,
                    display: params.display,
                    token: params.token,
                    feed: Some(feed),
                },
                None,
            )
            .await?;

        Ok((Self { inner }, events))
    }

    pub fn state(&self) -> PluginState {
        *self.inner.state.lock()
    }

    pub async fn detach(&self) {
        if self.inner.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.inner.state.lock() = PluginState::Detached;
        self.inner.handle.detach().await;
    }
}

impl SubscriberInner {
    async fn plugin_task(inner: Arc<Self>, mut events: PluginEvents) {
        while let Some(event) = events.recv().await {
            if inner.detached.load(Ordering::Acquire) {
                break;
            }

            match event {
                PluginEvent::Message { jsep: Some(offer), .. } => {
                    if let Err(err) = inner.answer(offer).await {
                        inner.errors.handle(&err);
                    }
                }
                PluginEvent::Message { data: RoomEvent::Attached { feed }, jsep: None } => {
                    log::debug!("attached to remote feed {}", feed);
                    *inner.state.lock() = PluginState::Joined;
                }
                PluginEvent::RemoteStream(stream) => {
                    *inner.state.lock() = PluginState::Configured;
                    let _ = inner.emitter.send(VideoSubscriberEvent::RemoteStream(stream));
                }
                PluginEvent::SlowLink { uplink } => {
                    let _ = inner.emitter.send(VideoSubscriberEvent::SlowLink { uplink });
                }
                PluginEvent::Detached => {
                    inner.detached.store(true, Ordering::Release);
                    *inner.state.lock() = PluginState::Detached;
                    break;
                }
                other => log::debug!("unhandled video subscriber event: {:?}", other),
            }
        }
    }

    async fn answer(&self, offer: super::transport::SessionDescription) -> GatewayResult<()> {
        *self.state.lock() = PluginState::Negotiating;
        let answer = self.handle.create_answer(offer).await?;
        self.handle.send(RoomRequest::Start, Some(answer)).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::testing::MockTransport;
    use super::*;

    fn params() -> VideoRoomParams {
        VideoRoomParams { room: 200, token: "channel-token".into(), display: "user-1".into() }
    }

    async fn next<T>(events: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn publisher_receives_the_room_roster() {
        let transport = MockTransport::new().with_publishers(vec![PublisherInfo {
            id: "remote-1".into(),
            display: "user-2".into(),
        }]);
        transport.connect().await.unwrap();

        let (_publisher, mut events) =
            VideoPublisher::attach(&transport, params(), ErrorHandler::new()).await.unwrap();

        loop {
            if let VideoPublisherEvent::Publishers(publishers) = next(&mut events).await {
                assert_eq!(publishers.len(), 1);
                assert_eq!(publishers[0].id, "remote-1");
                break;
            }
        }
    }

    #[tokio::test]
    async fn publish_negotiates_with_the_requested_bitrate() {
        let transport = MockTransport::new();
        transport.connect().await.unwrap();
        let (publisher, mut events) =
            VideoPublisher::attach(&transport, params(), ErrorHandler::new()).await.unwrap();

        publisher
            .publish(&VideoSource::Camera { device_id: Some("cam-1".into()) }, 256_000)
            .await
            .unwrap();

        loop {
            match next(&mut events).await {
                VideoPublisherEvent::Published => break,
                VideoPublisherEvent::LocalStream(stream) => {
                    assert!(!stream.id.is_empty());
                }
                _ => {}
            }
        }

        let configures = transport.requests_of("configure");
        assert_eq!(configures.last().unwrap()["bitrate"], 256_000);
        assert_eq!(publisher.state(), PluginState::Configured);
    }

    #[tokio::test]
    async fn unpublish_returns_to_joined() {
        let transport = MockTransport::new();
        transport.connect().await.unwrap();
        let (publisher, mut events) =
            VideoPublisher::attach(&transport, params(), ErrorHandler::new()).await.unwrap();

        publisher.publish(&VideoSource::Camera { device_id: None }, 256_000).await.unwrap();
        loop {
            if matches!(next(&mut events).await, VideoPublisherEvent::Published) {
                break;
            }
        }

        publisher.unpublish().await.unwrap();
        assert_eq!(publisher.state(), PluginState::Joined);
        assert_eq!(transport.requests_of("unpublish").len(), 1);
    }

    #[tokio::test]
    async fn subscriber_answers_the_offer_and_gets_the_stream() {
        let transport = MockTransport::new();
        transport.connect().await.unwrap();

        let (subscriber, mut events) = VideoSubscriber::attach(
            &transport,
            params(),
            "remote-1".into(),
            ErrorHandler::new(),
        )
        .await
        .unwrap();

        loop {
            if let VideoSubscriberEvent::RemoteStream(stream) = next(&mut events).await {
                assert_eq!(stream.id, "stream-remote-1");
                break;
            }
        }
        assert_eq!(subscriber.state(), PluginState::Configured);
        assert_eq!(transport.requests_of("start").len(), 1);

        subscriber.detach().await;
        assert_eq!(subscriber.state(), PluginState::Detached);
    }
}
