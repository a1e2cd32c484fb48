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

use std::{collections::HashMap, time::Duration};

use parking_lot::Mutex;
use tokio::time::Instant;

/// Per-call-name rate limiter. A call inside its minimum interval is
/// rejected outright, not queued.
#[derive(Default)]
pub struct Throttle {
    last_call: Mutex<HashMap<&'static str, Instant>>,
}

impl Throttle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&self, name: &'static str, min_interval: Duration) -> bool {
        let now = Instant::now();
        let mut last_call = self.last_call.lock();
        match last_call.get(name) {
            Some(last) if now.duration_since(*last) < min_interval => false,
            _ => {
                last_call.insert(name, now);
                true
            }
        }
    }
}
