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
use tokio::sync::mpsc;

/// Funnel for errors raised by background tasks that have no caller to
/// propagate to (token refresh, event dispatch, buffered call replay).
///
/// Every error is logged. A single subscriber may additionally receive the
/// error descriptions, e.g. to surface them in the UI.
#[derive(Clone, Default)]
pub struct ErrorHandler {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    subscriber: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the current subscriber, if any.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.subscriber.lock() = Some(tx);
        rx
    }

    pub fn handle<E: std::fmt::Display>(&self, err: &E) {
        let description = err.to_string();
        log::error!("{}", description);

        let mut subscriber = self.inner.subscriber.lock();
        if let Some(tx) = subscriber.as_ref() {
            if tx.send(description).is_err() {
                *subscriber = None;
            }
        }
    }
}
