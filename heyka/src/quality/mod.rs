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

use std::{collections::VecDeque, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};

pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(1_000);
pub const RTT_WINDOW_LENGTH: usize = 30;

pub const PREBUFFER_MIN: u32 = 8;
pub const PREBUFFER_MAX: u32 = 50;
/// Milliseconds of RTT spread per prebuffer unit.
pub const PREBUFFER_STEP_MS: u32 = 20;
pub const PREBUFFER_GOOD_MAX: u32 = 16;
pub const PREBUFFER_BAD_MAX: u32 = 32;

/// Perceived call quality, derived from the RTT spread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioStatus {
    Good,
    Bad,
    Awful,
    Delays,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrebufferState {
    pub prebuffer: u32,
    pub status: AudioStatus,
}

impl Default for PrebufferState {
    fn default() -> Self {
        Self { prebuffer: PREBUFFER_MIN, status: AudioStatus::Good }
    }
}

/// One round-trip measurement for an audio SSRC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttSample {
    pub ssrc: u32,
    pub rtt_ms: u32,
}

/// Sliding window over the worst RTT of each sampling tick.
#[derive(Debug, Default)]
pub struct RttWindow {
    samples: VecDeque<u32>,
}

impl RttWindow {
    pub fn new() -> Self {
        Self { samples: VecDeque::with_capacity(RTT_WINDOW_LENGTH) }
    }

    pub fn push(&mut self, rtt_ms: u32) {
        if self.samples.len() == RTT_WINDOW_LENGTH {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt_ms);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    fn spread(&self) -> Option<u32> {
        let max = self.samples.iter().max()?;
        let min = self.samples.iter().min()?;
        Some(max - min)
    }
}

/// Derives the jitter prebuffer from the RTT spread in the window.
///
/// The spread (not the absolute RTT) is what matters: a stable 300 ms link
/// plays fine with a small buffer, a jittery 50 ms one does not.
pub fn compute_prebuffer(window: &RttWindow) -> PrebufferState {
    let Some(spread) = window.spread() else {
        return PrebufferState::default();
    };

    let raw = ((spread as f64) / PREBUFFER_STEP_MS as f64).round() as u32;
    if raw < PREBUFFER_MIN {
        PrebufferState { prebuffer: PREBUFFER_MIN, status: AudioStatus::Good }
    } else if raw <= PREBUFFER_GOOD_MAX {
        PrebufferState { prebuffer: raw, status: AudioStatus::Good }
    } else if raw <= PREBUFFER_BAD_MAX {
        PrebufferState { prebuffer: raw, status: AudioStatus::Bad }
    } else if raw <= PREBUFFER_MAX {
        PrebufferState { prebuffer: raw, status: AudioStatus::Awful }
    } else {
        PrebufferState { prebuffer: PREBUFFER_MAX, status: AudioStatus::Delays }
    }
}

/// Source of RTT measurements, normally the stats of the audio peer
/// connection. Only SSRC-tagged reports belong here.
#[async_trait::async_trait]
pub trait SessionStats: Send + Sync + 'static {
    async fn rtt_samples(&self) -> Vec<RttSample>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityEvent {
    /// New prebuffer value to configure on the gateway.
    Prebuffer(u32),
    /// Quality verdict for the UI. Only re-evaluated when the prebuffer
    /// itself moved.
    Status(AudioStatus),
}

pub type QualityEvents = mpsc::UnboundedReceiver<QualityEvent>;

/// Samples the session RTT once a second and adapts the jitter prebuffer.
///
/// Emissions are edge-triggered: a tick that lands on the same prebuffer
/// stays silent.
pub struct AudioQualityController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    stats: Mutex<Option<Arc<dyn SessionStats>>>,
    window: Mutex<RttWindow>,
    last: Mutex<PrebufferState>,
    task: Mutex<Option<JoinHandle<()>>>,
    emitter: mpsc::UnboundedSender<QualityEvent>,
}

impl AudioQualityController {
    pub fn new(stats: Arc<dyn SessionStats>) -> (Self, QualityEvents) {
        let (emitter, events) = mpsc::unbounded_channel();
        let inner = Arc::new(ControllerInner {
            stats: Mutex::new(Some(stats)),
            window: Mutex::new(RttWindow::new()),
            last: Mutex::new(PrebufferState::default()),
            task: Mutex::new(None),
            emitter,
        });
        (Self { inner }, events)
    }

    /// Starts the sampling loop. No-op if it is already running.
    pub fn init(&self) {
        let mut task = self.inner.task.lock();
        if task.is_some() {
            return;
        }

        let inner = self.inner.clone();
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(SAMPLE_INTERVAL).await;

                let stats = inner.stats.lock().clone();
                let Some(stats) = stats else { break };

                let batch = stats.rtt_samples().await;
                if let Some(worst) = batch.iter().map(|sample| sample.rtt_ms).max() {
                    inner.window.lock().push(worst);
                }
                inner.process();
            }
        }));
    }

    pub fn last_state(&self) -> PrebufferState {
        *self.inner.last.lock()
    }

    /// Stops sampling and drops the stats source. Idempotent, must run at
    /// session teardown so no timer outlives the call.
    pub fn destroy(&self) {
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        self.inner.stats.lock().take();
        self.inner.window.lock().clear();
    }
}

impl Drop for AudioQualityController {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl ControllerInner {
    fn process(&self) {
        let next = {
            let window = self.window.lock();
            if window.is_empty() {
                return;
            }
            compute_prebuffer(&window)
        };

        let mut last = self.last.lock();
        if next.prebuffer != last.prebuffer {
            let _ = self.emitter.send(QualityEvent::Prebuffer(next.prebuffer));
            if next.status != last.status {
                let _ = self.emitter.send(QualityEvent::Status(next.status));
            }
            *last = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_of(samples: &[u32]) -> RttWindow {
        let mut window = RttWindow::new();
        for sample in samples {
            window.push(*sample);
        }
        window
    }

    #[test]
    fn small_spread_keeps_the_minimum_prebuffer() {
        assert_eq!(compute_prebuffer(&window_of(&[100, 100, 120])), PrebufferState::default());
    }

    #[test]
    fn empty_window_is_the_baseline() {
        assert_eq!(compute_prebuffer(&RttWindow::new()), PrebufferState::default());
    }

    #[test]
    fn spread_maps_to_prebuffer_and_status() {
        // 320 ms spread -> 16 units, still good.
        assert_eq!(
            compute_prebuffer(&window_of(&[100, 420])),
            PrebufferState { prebuffer: 16, status: AudioStatus::Good }
        );
        // 400 ms -> 20 units, bad.
        assert_eq!(
            compute_prebuffer(&window_of(&[100, 500])),
            PrebufferState { prebuffer: 20, status: AudioStatus::Bad }
        );
        // 760 ms -> 38 units, awful.
        assert_eq!(
            compute_prebuffer(&window_of(&[100, 860])),
            PrebufferState { prebuffer: 38, status: AudioStatus::Awful }
        );
        // 1200 ms -> clamped to 50, delays.
        assert_eq!(
            compute_prebuffer(&window_of(&[100, 1300])),
            PrebufferState { prebuffer: 50, status: AudioStatus::Delays }
        );
    }

    #[test]
    fn window_keeps_the_latest_thirty() {
        let mut window = RttWindow::new();
        for rtt in 0..40u32 {
            window.push(rtt);
        }
        assert_eq!(window.len(), RTT_WINDOW_LENGTH);
        // The early small values were evicted, the spread shrank with them.
        assert_eq!(window.spread(), Some(29));
    }

    struct ScriptedStats {
        batches: Mutex<VecDeque<Vec<RttSample>>>,
    }

    impl ScriptedStats {
        fn new(batches: Vec<Vec<u32>>) -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(
                    batches
                        .into_iter()
                        .map(|batch| {
                            batch
                                .into_iter()
                                .enumerate()
                                .map(|(i, rtt_ms)| RttSample { ssrc: i as u32, rtt_ms })
                                .collect()
                        })
                        .collect(),
                ),
            })
        }
    }

    #[async_trait::async_trait]
    impl SessionStats for ScriptedStats {
        async fn rtt_samples(&self) -> Vec<RttSample> {
            self.batches.lock().pop_front().unwrap_or_default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn emits_only_on_prebuffer_changes() {
        let stats = ScriptedStats::new(vec![
            vec![100],      // spread 0 -> baseline, same as initial state
            vec![500, 120], // worst 500, spread 400 -> 20, Bad
            vec![500],      // unchanged -> silent
        ]);
        let (controller, mut events) = AudioQualityController::new(stats);
        controller.init();

        assert_eq!(events.recv().await, Some(QualityEvent::Prebuffer(20)));
        assert_eq!(events.recv().await, Some(QualityEvent::Status(AudioStatus::Bad)));

        // Let a few more silent ticks pass.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(events.try_recv().is_err());

        assert_eq!(
            controller.last_state(),
            PrebufferState { prebuffer: 20, status: AudioStatus::Bad }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn status_rides_along_with_the_prebuffer() {
        // Jumps straight from baseline to delays in one tick.
        let stats = ScriptedStats::new(vec![vec![100], vec![2_000]]);
        let (controller, mut events) = AudioQualityController::new(stats);
        controller.init();

        assert_eq!(events.recv().await, Some(QualityEvent::Prebuffer(50)));
        assert_eq!(events.recv().await, Some(QualityEvent::Status(AudioStatus::Delays)));
        controller.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_is_idempotent_and_stops_sampling() {
        let stats = ScriptedStats::new(vec![vec![100], vec![500], vec![900]]);
        let (controller, mut events) = AudioQualityController::new(stats.clone());
        controller.init();

        assert_eq!(events.recv().await, Some(QualityEvent::Prebuffer(20)));
        assert_eq!(events.recv().await, Some(QualityEvent::Status(AudioStatus::Bad)));

        controller.destroy();
        controller.destroy();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(events.try_recv().is_err());
        // The third batch was never sampled.
        assert_eq!(stats.batches.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn init_twice_runs_one_loop() {
        let stats = ScriptedStats::new(vec![vec![100], vec![500]]);
        let (controller, mut events) = AudioQualityController::new(stats);
        controller.init();
        controller.init();

        assert_eq!(events.recv().await, Some(QualityEvent::Prebuffer(20)));
        assert_eq!(events.recv().await, Some(QualityEvent::Status(AudioStatus::Bad)));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(events.try_recv().is_err());
        controller.destroy();
    }
}
