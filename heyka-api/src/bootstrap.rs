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

/// Shared flag raised while the initial bootstrap sequence (workspace list,
/// authorization, first socket connect) is running.
///
/// Recovery paths consult it before triggering a socket reconnect: kicking
/// off a reconnect in the middle of bootstrap would race the very connect
/// the bootstrap is about to perform.
#[derive(Clone, Default)]
pub struct Bootstrap {
    active: Arc<AtomicBool>,
}

impl Bootstrap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_in_progress(&self, state: bool) {
        self.active.store(state, Ordering::Release);
    }

    pub fn in_progress(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_is_shared_between_clones() {
        let bootstrap = Bootstrap::new();
        let clone = bootstrap.clone();

        assert!(!clone.in_progress());
        bootstrap.set_in_progress(true);
        assert!(clone.in_progress());
        bootstrap.set_in_progress(false);
        assert!(!clone.in_progress());
    }
}
