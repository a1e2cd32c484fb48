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

use std::{future::Future, sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use heyka_api::{
    error_handler::ErrorHandler,
    http_client::{messages, ApiError, ApiResult},
    tokens::TokenStore,
};
use parking_lot::Mutex;

use super::throttle::Throttle;
use crate::connection::supervisor::{ConnectionSupervisor, StatusUpdate};

/// Per-call behavior of the middleware pipeline.
#[derive(Debug, Clone, Copy)]
pub struct CallOptions {
    pub name: &'static str,
    /// Buffered and replayed after an outage instead of being lost.
    pub important: bool,
    /// Skips the token freshness check, e.g. for the calls that mint tokens.
    pub ignore_tokens: bool,
    /// Minimum interval between two invocations of this call.
    pub throttle: Option<Duration>,
}

impl CallOptions {
    pub const fn new(name: &'static str) -> Self {
        Self { name, important: false, ignore_tokens: false, throttle: None }
    }

    pub const fn important(mut self) -> Self {
        self.important = true;
        self
    }

    pub const fn ignore_tokens(mut self) -> Self {
        self.ignore_tokens = true;
        self
    }

    pub const fn throttled(mut self, min_interval: Duration) -> Self {
        self.throttle = Some(min_interval);
        self
    }
}

/// The session operations the middleware may trigger while recovering from
/// a failed call.
#[async_trait::async_trait]
pub trait SessionControl: Send + Sync + 'static {
    fn bootstrap_in_progress(&self) -> bool;
    async fn reconnect_socket(&self) -> ApiResult<()>;
}

type BufferedCall = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct BufferEntry {
    name: &'static str,
    call: BufferedCall,
}

/// Pipeline every REST call of the client goes through:
/// throttle, offline gate, token freshness, the call itself, then one
/// recovery retry for the failures the backend lets us repair.
pub struct ApiMiddleware<S: SessionControl> {
    inner: Arc<MiddlewareInner<S>>,
}

impl<S: SessionControl> Clone for ApiMiddleware<S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

struct MiddlewareInner<S> {
    supervisor: ConnectionSupervisor,
    tokens: TokenStore,
    session: Arc<S>,
    throttle: Throttle,
    buffer: Mutex<Vec<BufferEntry>>,
    errors: ErrorHandler,
}

impl<S: SessionControl> ApiMiddleware<S> {
    pub fn new(
        supervisor: ConnectionSupervisor,
        tokens: TokenStore,
        session: Arc<S>,
        errors: ErrorHandler,
    ) -> Self {
        Self {
            inner: Arc::new(MiddlewareInner {
                supervisor,
                tokens,
                session,
                throttle: Throttle::new(),
                buffer: Mutex::new(Vec::new()),
                errors,
            }),
        }
    }

    pub async fn call<F, Fut, T>(&self, opts: CallOptions, f: F) -> ApiResult<T>
    where
        F: Fn() -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ApiResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let inner = &self.inner;

        if let Some(min_interval) = opts.throttle {
            if !inner.throttle.allow(opts.name, min_interval) {
                return Err(ApiError::Throttled(opts.name.to_owned()));
            }
        }

        if !inner.supervisor.is_online() {
            if opts.important {
                self.buffer_call(opts.name, f);
            }
            return Err(ApiError::Offline(opts.name.to_owned()));
        }

        if !opts.ignore_tokens {
            inner.tokens.check_and_refresh().await;
        }

        match f().await {
            Ok(value) => {
                inner.supervisor.update(StatusUpdate::Api(true));
                Ok(value)
            }
            Err(err) => self.handle_call_error(opts, f, err).await,
        }
    }

    async fn handle_call_error<F, Fut, T>(
        &self,
        opts: CallOptions,
        f: F,
        err: ApiError,
    ) -> ApiResult<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ApiResult<T>> + Send + 'static,
    {
        let inner = &self.inner;

        match err.server_message() {
            Some(messages::ACCESS_TOKEN_EXPIRED) => {
                log::debug!("`{}` failed on an expired token, refreshing", opts.name);
                inner.tokens.update_tokens().await;

                // Retried exactly once, a second expiry is a real failure.
                let retried = f().await;
                if let Err(err) = &retried {
                    inner.errors.handle(err);
                }
                retried
            }
            Some(messages::SOCKET_NOT_FOUND) | Some(messages::UNKNOWN_CONNECTION) => {
                if inner.session.bootstrap_in_progress() {
                    return Err(ApiError::InitialInProgress);
                }
                log::debug!("`{}` failed on a dead socket, reconnecting", opts.name);
                inner.session.reconnect_socket().await?;

                let retried = f().await;
                if let Err(err) = &retried {
                    inner.errors.handle(err);
                }
                retried
            }
            _ => {
                if matches!(err, ApiError::Transport(_) | ApiError::Timeout) {
                    inner.supervisor.update(StatusUpdate::Api(false));
                }
                inner.errors.handle(&err);
                Err(err)
            }
        }
    }

    /// Remembers an important call for replay. Re-buffering a call that is
    /// already waiting replaces it in place, its position in the replay
    /// order is kept.
    fn buffer_call<F, Fut, T>(&self, name: &'static str, f: F)
    where
        F: Fn() -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ApiResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let errors = self.inner.errors.clone();
        let call: BufferedCall = Box::new(move || {
            let f = f.clone();
            let errors = errors.clone();
            Box::pin(async move {
                if let Err(err) = f().await {
                    errors.handle(&err);
                }
            })
        });

        log::info!("buffering important call `{}` until back online", name);
        let mut buffer = self.inner.buffer.lock();
        match buffer.iter_mut().find(|entry| entry.name == name) {
            Some(entry) => entry.call = call,
            None => buffer.push(BufferEntry { name, call }),
        }
    }

    /// Replays the buffered calls in their buffering order. Each entry is
    /// removed before it runs; a failed replay is not re-queued.
    pub async fn flush(&self) {
        let inner = &self.inner;
        loop {
            if !inner.supervisor.is_online() {
                // Went offline again mid-replay, keep the rest for later.
                return;
            }

            let entry = {
                let mut buffer = inner.buffer.lock();
                if buffer.is_empty() {
                    return;
                }
                buffer.remove(0)
            };

            log::info!("replaying buffered call `{}`", entry.name);
            inner.tokens.check_and_refresh().await;
            (entry.call)().await;
        }
    }

    /// Spawns a task replaying the buffer on every internet-reconnected
    /// edge the supervisor reports.
    pub fn flush_on_reconnect(
        &self,
        mut events: crate::connection::supervisor::SupervisorEvents,
    ) {
        let middleware = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if event == crate::connection::supervisor::SupervisorEvent::InternetReconnected {
                    middleware.flush().await;
                }
            }
        });
    }

    pub fn buffered_calls(&self) -> Vec<&'static str> {
        self.inner.buffer.lock().iter().map(|entry| entry.name).collect()
    }
}
