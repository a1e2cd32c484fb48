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
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

/// How long the server holds the hanging GET open while we are online.
pub const LONG_POLLING_TIMEOUT: Duration = Duration::from_millis(25_000);
/// Server-side wait for recovery probes, answer immediately.
pub const PROBE_TIMEOUT: Duration = Duration::ZERO;
/// Client-side bound on a recovery probe round trip.
pub const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_millis(2_000);

pub const RECONNECT_DELAY_BASE_MS: f64 = 1_000.0;
pub const RECONNECT_DELAY_FACTOR: f64 = 1.05;
pub const RECONNECT_DELAY_MAX_MS: u64 = 30_000;
pub const RECONNECT_MAX_ATTEMPTS: u32 = 100;

#[derive(Error, Debug)]
#[error("connectivity probe failed: {0}")]
pub struct ProbeError(pub String);

/// Something that can ask the backend "am I reachable" and report the
/// caller's external IP. Implemented by the REST client's long-poll
/// endpoint.
#[async_trait::async_trait]
pub trait ConnectivityProbe: Send + Sync + 'static {
    async fn poll(
        &self,
        wait: Duration,
        request_timeout: Option<Duration>,
    ) -> Result<String, ProbeError>;
}

#[async_trait::async_trait]
impl ConnectivityProbe for heyka_api::http_client::RestClient {
    async fn poll(
        &self,
        wait: Duration,
        request_timeout: Option<Duration>,
    ) -> Result<String, ProbeError> {
        self.long_poll(wait, request_timeout).await.map_err(|err| ProbeError(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// Edge-triggered, never repeats the previous value.
    InternetState(bool),
    /// The external IP reported by the backend changed, e.g. the machine
    /// hopped networks without ever observing an offline window.
    IpChanged { old: String, new: String },
}

pub type NetworkEvents = mpsc::UnboundedReceiver<NetworkEvent>;

/// Backoff before the next recovery probe.
///
/// Grows gently (5% per attempt) so short blips retry almost immediately,
/// while a long outage settles at one probe every 30 seconds.
pub fn reconnect_delay(attempts: u32) -> Duration {
    let attempts = attempts.min(RECONNECT_MAX_ATTEMPTS);
    let delay = (RECONNECT_DELAY_BASE_MS * RECONNECT_DELAY_FACTOR.powi(attempts as i32)).round();
    Duration::from_millis((delay as u64).min(RECONNECT_DELAY_MAX_MS))
}

/// Watches internet reachability with a hanging GET against the backend.
///
/// While online one request is always parked on the server; the moment it
/// fails the monitor flips offline and switches to quick probes with
/// exponential backoff.
pub struct NetworkMonitor<P: ConnectivityProbe> {
    inner: Arc<MonitorInner<P>>,
}

struct MonitorInner<P> {
    probe: P,
    active: AtomicBool,
    attempts: AtomicU32,
    state: Mutex<Option<bool>>,
    client_ip: Mutex<Option<String>>,
    emitter: mpsc::UnboundedSender<NetworkEvent>,
}

impl<P: ConnectivityProbe> NetworkMonitor<P> {
    pub fn new(probe: P) -> (Self, NetworkEvents) {
        let (emitter, events) = mpsc::unbounded_channel();
        let inner = Arc::new(MonitorInner {
            probe,
            active: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            state: Mutex::new(None),
            client_ip: Mutex::new(None),
            emitter,
        });
        (Self { inner }, events)
    }

    /// Starts the watch loop. No-op if it is already running.
    pub fn watch(&self) {
        if self
            .inner
            .active
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            MonitorInner::run(inner).await;
        });
    }

    /// Asks the watch loop to stop after its current request.
    pub fn stop_watch(&self) {
        self.inner.active.store(false, Ordering::Release);
        self.inner.attempts.store(0, Ordering::Release);
    }

    /// `None` until the first probe answered.
    pub fn is_online(&self) -> Option<bool> {
        *self.inner.state.lock()
    }

    pub fn client_ip(&self) -> Option<String> {
        self.inner.client_ip.lock().clone()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::Acquire)
    }
}

impl<P: ConnectivityProbe> MonitorInner<P> {
    async fn run(inner: Arc<Self>) {
        log::info!("network monitor started");

        while inner.active.load(Ordering::Acquire) {
            let state = *inner.state.lock();
            match state {
                None => {
                    // Assume online until the first quick probe says otherwise.
                    inner.update_state(true);
                    inner.poll_once(PROBE_TIMEOUT, Some(PROBE_REQUEST_TIMEOUT)).await;
                }
                Some(true) => {
                    inner.poll_once(LONG_POLLING_TIMEOUT, None).await;
                }
                Some(false) => {
                    let attempts = inner.bump_attempts();
                    if !inner.poll_once(PROBE_TIMEOUT, Some(PROBE_REQUEST_TIMEOUT)).await {
                        let delay = reconnect_delay(attempts);
                        log::debug!(
                            "still offline after {} attempts, next probe in {:?}",
                            attempts,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        inner.attempts.store(0, Ordering::Release);
                        // Let the network settle before parking a long poll
                        // on it again.
                        tokio::time::sleep(PROBE_REQUEST_TIMEOUT).await;
                    }
                }
            }
        }

        log::info!("network monitor stopped");
    }

    async fn poll_once(&self, wait: Duration, request_timeout: Option<Duration>) -> bool {
        match self.probe.poll(wait, request_timeout).await {
            Ok(ip) => {
                self.update_state(true);
                self.update_ip(ip);
                true
            }
            Err(err) => {
                log::debug!("{}", err);
                self.update_state(false);
                false
            }
        }
    }

    fn bump_attempts(&self) -> u32 {
        let attempts = self.attempts.load(Ordering::Acquire);
        if attempts < RECONNECT_MAX_ATTEMPTS {
            self.attempts.store(attempts + 1, Ordering::Release);
            attempts + 1
        } else {
            attempts
        }
    }

    fn update_state(&self, online: bool) {
        let mut state = self.state.lock();
        if *state != Some(online) {
            log::info!("internet state changed: {}", online);
            let _ = self.emitter.send(NetworkEvent::InternetState(online));
        }
        *state = Some(online);
    }

    fn update_ip(&self, ip: String) {
        let mut client_ip = self.client_ip.lock();
        if let Some(old) = client_ip.as_ref() {
            if *old != ip {
                log::info!("client ip changed: {} -> {}", old, ip);
                let _ = self
                    .emitter
                    .send(NetworkEvent::IpChanged { old: old.clone(), new: ip.clone() });
            }
        }
        *client_ip = Some(ip);
    }
}
