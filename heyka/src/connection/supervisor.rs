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

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::monitor::{NetworkEvent, NetworkEvents};

/// Merged health of everything the client depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub internet: bool,
    pub socket: bool,
    pub api: bool,
    pub gateway: bool,
    pub visible: bool,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        // Optimistic until the first probe answers, nothing else is up yet.
        Self { internet: true, socket: false, api: false, gateway: false, visible: true }
    }
}

/// The single entrypoint every component reports its health through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    Internet(bool),
    Socket(bool),
    Api(bool),
    Gateway(bool),
    /// Whether connectivity problems should be surfaced to the user.
    Visible(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// Fired exactly once per offline-to-online transition. Downstream
    /// recovery (socket reconnect, buffered call replay) keys on this.
    InternetReconnected,
    StatusChanged(ConnectionStatus),
}

pub type SupervisorEvents = mpsc::UnboundedReceiver<SupervisorEvent>;

/// Aggregates component health into one online/offline verdict.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    status: Mutex<ConnectionStatus>,
    // Raised while offline so the next online edge fires a reconnect.
    trying_to_reconnect: Mutex<bool>,
    online_tx: watch::Sender<bool>,
    emitter: mpsc::UnboundedSender<SupervisorEvent>,
}

impl ConnectionSupervisor {
    pub fn new() -> (Self, SupervisorEvents) {
        let (emitter, events) = mpsc::unbounded_channel();
        let (online_tx, _) = watch::channel(true);
        let inner = Arc::new(SupervisorInner {
            status: Mutex::new(ConnectionStatus::default()),
            trying_to_reconnect: Mutex::new(false),
            online_tx,
            emitter,
        });
        (Self { inner }, events)
    }

    pub fn update(&self, update: StatusUpdate) {
        let inner = &self.inner;
        let mut reconnected = false;

        let (previous, current) = {
            let mut status = inner.status.lock();
            let previous = *status;
            match update {
                StatusUpdate::Internet(state) => {
                    status.internet = state;
                    let mut trying = inner.trying_to_reconnect.lock();
                    if !state {
                        *trying = true;
                    } else if *trying {
                        *trying = false;
                        reconnected = true;
                    }
                }
                StatusUpdate::Socket(state) => status.socket = state,
                StatusUpdate::Api(state) => status.api = state,
                StatusUpdate::Gateway(state) => status.gateway = state,
                StatusUpdate::Visible(state) => status.visible = state,
            }
            (previous, *status)
        };

        if let StatusUpdate::Internet(state) = update {
            inner.online_tx.send_replace(state);
        }
        if reconnected {
            log::info!("internet reconnected");
            let _ = inner.emitter.send(SupervisorEvent::InternetReconnected);
        }
        if previous != current {
            let _ = inner.emitter.send(SupervisorEvent::StatusChanged(current));
        }
    }

    /// Forwards a network monitor verdict into the merged status.
    pub fn handle_network_event(&self, event: &NetworkEvent) {
        if let NetworkEvent::InternetState(state) = event {
            self.update(StatusUpdate::Internet(*state));
        }
    }

    /// Spawns a task feeding monitor events into this supervisor.
    pub fn watch_network(&self, mut events: NetworkEvents) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                supervisor.handle_network_event(&event);
            }
        });
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.lock()
    }

    pub fn is_online(&self) -> bool {
        *self.inner.online_tx.borrow()
    }

    /// Resolves once the internet is reachable.
    ///
    /// All concurrent callers observe the same transition; nobody starts a
    /// probe of their own.
    pub async fn wait_until_online(&self) {
        let mut online = self.inner.online_tx.subscribe();
        // wait_for checks the current value first, so an already-online
        // supervisor resolves immediately.
        let _ = online.wait_for(|online| *online).await;
    }

    /// Back to the post-login baseline, e.g. after a workspace switch.
    pub fn reset(&self) {
        self.update(StatusUpdate::Visible(true));
        self.update(StatusUpdate::Api(false));
        self.update(StatusUpdate::Socket(false));
    }
}
