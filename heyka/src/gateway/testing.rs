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

//! Scripted stand-in for the SFU gateway used by the plugin and facade
//! tests. It answers requests the way the real gateway does: join acks,
//! offers answered, subscriptions fed with a stream named after the feed.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{
    classify_cause,
    transport::{
        GatewayTransport, MediaStream, PluginEvent, PluginEvents, PluginHandle, PluginKind,
        PluginRequest, PublisherInfo, RoomEvent, RoomRequest, SessionDescription,
    },
    GatewayError, GatewayResult,
};

#[derive(Clone)]
pub(crate) struct MockTransport {
    shared: Arc<Shared>,
}

struct Shared {
    connected: AtomicBool,
    destroys: AtomicUsize,
    fail_connect: Option<String>,
    publishers: Vec<PublisherInfo>,
    audio_media_delay: Duration,
    publishers_delay: Duration,
    requests: Mutex<Vec<Value>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                connected: AtomicBool::new(false),
                destroys: AtomicUsize::new(0),
                fail_connect: None,
                publishers: Vec::new(),
                audio_media_delay: Duration::ZERO,
                publishers_delay: Duration::ZERO,
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    fn edit(mut self, edit: impl FnOnce(&mut Shared)) -> Self {
        let shared = Arc::get_mut(&mut self.shared).expect("configure before attaching");
        edit(shared);
        self
    }

    pub fn with_publishers(self, publishers: Vec<PublisherInfo>) -> Self {
        self.edit(|shared| shared.publishers = publishers)
    }

    pub fn with_audio_media_delay(self, delay: Duration) -> Self {
        self.edit(|shared| shared.audio_media_delay = delay)
    }

    pub fn with_publishers_delay(self, delay: Duration) -> Self {
        self.edit(|shared| shared.publishers_delay = delay)
    }

    pub fn failing_with(self, cause: &str) -> Self {
        let cause = cause.to_owned();
        self.edit(|shared| shared.fail_connect = Some(cause))
    }

    /// All bodies sent so far whose `request` field matches `name`.
    pub fn requests_of(&self, name: &str) -> Vec<Value> {
        self.shared
            .requests
            .lock()
            .iter()
            .filter(|request| request["request"] == name)
            .cloned()
            .collect()
    }

    pub fn destroy_count(&self) -> usize {
        self.shared.destroys.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl GatewayTransport for MockTransport {
    async fn connect(&self) -> GatewayResult<()> {
        if let Some(cause) = &self.shared.fail_connect {
            return Err(GatewayError::Connection {
                kind: classify_cause(cause),
                cause: cause.clone(),
            });
        }
        self.shared.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn attach(&self, kind: PluginKind) -> GatewayResult<(PluginHandle, PluginEvents)> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }

        let (request_tx, request_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = self.shared.clone();

        match kind {
            PluginKind::AudioBridge => {
                tokio::spawn(audio_plugin(shared, request_rx, event_tx));
            }
            PluginKind::VideoRoom => {
                tokio::spawn(video_plugin(shared, request_rx, event_tx));
            }
        }

        Ok((PluginHandle::new(request_tx), event_rx))
    }

    async fn destroy(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.destroys.fetch_add(1, Ordering::SeqCst);
    }
}

fn record(shared: &Shared, body: &RoomRequest) {
    if let Ok(value) = serde_json::to_value(body) {
        shared.requests.lock().push(value);
    }
}

async fn audio_plugin(
    shared: Arc<Shared>,
    mut requests: mpsc::Receiver<PluginRequest>,
    events: mpsc::UnboundedSender<PluginEvent>,
) {
    while let Some(request) = requests.recv().await {
        match request {
            PluginRequest::Send { body, jsep, response_chn } => {
                record(&shared, &body);
                let _ = response_chn.send(Ok(()));

                match body {
                    RoomRequest::Join { .. } => {
                        let _ = events.send(PluginEvent::Message {
                            data: RoomEvent::Joined { id: "local".into() },
                            jsep: None,
                        });
                    }
                    RoomRequest::Configure { .. } if jsep.is_some() => {
                        let _ = events.send(PluginEvent::Message {
                            data: RoomEvent::Configured,
                            jsep: Some(SessionDescription::answer("audio-answer")),
                        });
                    }
                    _ => {}
                }
            }
            PluginRequest::CreateOffer { response_chn, .. } => {
                let _ = response_chn.send(Ok(SessionDescription::offer("audio-offer")));
            }
            PluginRequest::CreateAnswer { response_chn, .. } => {
                let _ = response_chn.send(Ok(SessionDescription::answer("audio-answer")));
            }
            PluginRequest::HandleRemoteJsep { response_chn, .. } => {
                let _ = response_chn.send(Ok(()));

                let events = events.clone();
                let delay = shared.audio_media_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(PluginEvent::MediaState { active: true });
                    let _ = events
                        .send(PluginEvent::RemoteStream(MediaStream { id: "audio-mix".into() }));
                    let _ = events
                        .send(PluginEvent::Speaking { id: "remote-1".into(), active: true });
                    let _ = events
                        .send(PluginEvent::Speaking { id: "remote-1".into(), active: false });
                });
            }
            PluginRequest::Detach { response_chn } => {
                let _ = events.send(PluginEvent::Detached);
                let _ = response_chn.send(());
                break;
            }
        }
    }
}

async fn video_plugin(
    shared: Arc<Shared>,
    mut requests: mpsc::Receiver<PluginRequest>,
    events: mpsc::UnboundedSender<PluginEvent>,
) {
    let mut subscribed_feed: Option<String> = None;

    while let Some(request) = requests.recv().await {
        match request {
            PluginRequest::Send { body, jsep, response_chn } => {
                record(&shared, &body);
                let _ = response_chn.send(Ok(()));

                match body {
                    RoomRequest::Join { feed: Some(feed), .. } => {
                        subscribed_feed = Some(feed.clone());
                        let _ = events.send(PluginEvent::Message {
                            data: RoomEvent::Attached { feed },
                            jsep: Some(SessionDescription::offer("remote-offer")),
                        });
                    }
                    RoomRequest::Join { .. } => {
                        let _ = events.send(PluginEvent::Message {
                            data: RoomEvent::Joined { id: "local".into() },
                            jsep: None,
                        });

                        let events = events.clone();
                        let publishers = shared.publishers.clone();
                        let delay = shared.publishers_delay;
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = events.send(PluginEvent::Message {
                                data: RoomEvent::Publishers(publishers),
                                jsep: None,
                            });
                        });
                    }
                    RoomRequest::Configure { .. } if jsep.is_some() => {
                        let _ = events.send(PluginEvent::Message {
                            data: RoomEvent::Configured,
                            jsep: Some(SessionDescription::answer("video-answer")),
                        });
                    }
                    RoomRequest::Start if jsep.is_some() => {
                        let id =
                            format!("stream-{}", subscribed_feed.clone().unwrap_or_default());
                        let _ = events.send(PluginEvent::RemoteStream(MediaStream { id }));
                    }
                    _ => {}
                }
            }
            PluginRequest::CreateOffer { response_chn, .. } => {
                let _ =
                    events.send(PluginEvent::LocalStream(MediaStream { id: "local-video".into() }));
                let _ = response_chn.send(Ok(SessionDescription::offer("video-offer")));
            }
            PluginRequest::CreateAnswer { response_chn, .. } => {
                let _ = response_chn.send(Ok(SessionDescription::answer("subscriber-answer")));
            }
            PluginRequest::HandleRemoteJsep { response_chn, .. } => {
                let _ = response_chn.send(Ok(()));
            }
            PluginRequest::Detach { response_chn } => {
                let _ = events.send(PluginEvent::Detached);
                let _ = response_chn.send(());
                break;
            }
        }
    }
}
