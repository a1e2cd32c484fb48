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
    path::PathBuf,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    error_handler::ErrorHandler,
    http_client::{ApiResult, AuthHeader, RestClient},
};

/// Tokens are refreshed this long before their server-side expiry so a
/// request minted right at the boundary still carries a valid token.
pub const EXPIRY_SKEW_MS: i64 = 60_000;

const ACCESS_TOKEN_KEY: &str = "accessToken";
const ACCESS_TOKEN_EXPIRED_AT_KEY: &str = "accessTokenExpiredAt";
const REFRESH_TOKEN_KEY: &str = "refreshToken";
const REFRESH_TOKEN_EXPIRED_AT_KEY: &str = "refreshTokenExpiredAt";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    /// Unix milliseconds.
    pub access_token_expired_at: i64,
    pub refresh_token: String,
    pub refresh_token_expired_at: i64,
}

/// Persistent key/value store the tokens survive restarts in.
pub trait TokenStorage: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<String>;
    /// `None` removes the key.
    fn set(&self, key: &str, value: Option<&str>);
    fn has(&self, key: &str) -> bool;
}

#[derive(Default)]
pub struct MemoryTokenStorage {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryTokenStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStorage for MemoryTokenStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: Option<&str>) {
        let mut values = self.values.lock();
        match value {
            Some(value) => values.insert(key.to_owned(), value.to_owned()),
            None => values.remove(key),
        };
    }

    fn has(&self, key: &str) -> bool {
        self.values.lock().contains_key(key)
    }
}

/// JSON file storage. Writes synchronously on every change, the token pair
/// must not outlive the process state it belongs to.
pub struct FileTokenStorage {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl FileTokenStorage {
    pub fn open(path: PathBuf) -> std::io::Result<Self> {
        let values = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err),
        };
        Ok(Self { path, values: Mutex::new(values) })
    }

    fn persist(&self, values: &HashMap<String, String>) {
        match serde_json::to_vec_pretty(values) {
            Ok(bytes) => {
                if let Err(err) = std::fs::write(&self.path, bytes) {
                    log::error!("failed to persist tokens to {:?}: {}", self.path, err);
                }
            }
            Err(err) => log::error!("failed to serialize token storage: {}", err),
        }
    }
}

impl TokenStorage for FileTokenStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: Option<&str>) {
        let mut values = self.values.lock();
        match value {
            Some(value) => values.insert(key.to_owned(), value.to_owned()),
            None => values.remove(key),
        };
        self.persist(&values);
    }

    fn has(&self, key: &str) -> bool {
        self.values.lock().contains_key(key)
    }
}

/// Source of fresh token pairs, normally the REST backend.
#[async_trait::async_trait]
pub trait TokenRefresher: Send + Sync + 'static {
    async fn refresh(&self, access_token: &str, refresh_token: &str) -> ApiResult<TokenPair>;
}

#[async_trait::async_trait]
impl TokenRefresher for RestClient {
    async fn refresh(&self, access_token: &str, refresh_token: &str) -> ApiResult<TokenPair> {
        self.refresh_token(access_token, refresh_token).await
    }
}

#[derive(Default)]
struct State {
    tokens: Option<TokenPair>,
    prepared: bool,
    refresh: Option<Shared<BoxFuture<'static, ()>>>,
}

/// Holds the current token pair and keeps the shared auth header in sync
/// with it.
///
/// Refreshes are single-flight: concurrent callers that find the access
/// token expired all await one in-flight refresh instead of racing the
/// backend with duplicates.
#[derive(Clone)]
pub struct TokenStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    refresher: Arc<dyn TokenRefresher>,
    storage: Arc<dyn TokenStorage>,
    auth_header: AuthHeader,
    errors: ErrorHandler,
    state: Mutex<State>,
}

impl TokenStore {
    pub fn new(
        refresher: Arc<dyn TokenRefresher>,
        storage: Arc<dyn TokenStorage>,
        auth_header: AuthHeader,
        errors: ErrorHandler,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                refresher,
                storage,
                auth_header,
                errors,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Current access token, refreshed first if it is about to expire.
    ///
    /// `None` means the store holds no tokens (not signed in) or the refresh
    /// failed; the failure itself went to the error handler.
    pub async fn access_token(&self) -> Option<String> {
        self.check_and_refresh().await;
        self.inner.state.lock().tokens.as_ref().map(|pair| pair.access_token.clone())
    }

    /// Refreshes the tokens if the access token expires within the skew.
    pub async fn check_and_refresh(&self) {
        self.inner.prepare();

        let expired = {
            let state = self.inner.state.lock();
            match state.tokens.as_ref() {
                Some(pair) => is_expired(pair),
                None => return,
            }
        };

        if expired {
            self.update_tokens().await;
        }
    }

    /// Unconditionally refreshes the tokens.
    ///
    /// If a refresh is already in flight the call awaits it instead of
    /// starting another one.
    pub async fn update_tokens(&self) {
        let refresh = {
            let mut state = self.inner.state.lock();
            match state.refresh.as_ref() {
                Some(refresh) => refresh.clone(),
                None => {
                    let inner = self.inner.clone();
                    let refresh = async move {
                        inner.do_refresh().await;
                        inner.state.lock().refresh = None;
                    }
                    .boxed()
                    .shared();
                    state.refresh = Some(refresh.clone());
                    refresh
                }
            }
        };

        refresh.await;
    }

    pub fn set_tokens(&self, pair: TokenPair) {
        self.inner.set_tokens(pair);
    }

    pub fn clear_tokens(&self) {
        let storage = &self.inner.storage;
        storage.set(ACCESS_TOKEN_KEY, None);
        storage.set(ACCESS_TOKEN_EXPIRED_AT_KEY, None);
        storage.set(REFRESH_TOKEN_KEY, None);
        storage.set(REFRESH_TOKEN_EXPIRED_AT_KEY, None);

        *self.inner.auth_header.write() = None;
        self.inner.state.lock().tokens = None;
    }

    pub fn is_token_expired(&self) -> bool {
        self.inner.prepare();
        self.inner.state.lock().tokens.as_ref().map(is_expired).unwrap_or(true)
    }
}

impl StoreInner {
    /// Loads tokens persisted by a previous run. Runs at most once per
    /// process, lazily on first use.
    fn prepare(&self) {
        let mut state = self.state.lock();
        if state.prepared {
            return;
        }

        if !self.storage.has(ACCESS_TOKEN_KEY) {
            // Signed out; nothing will appear in storage behind our back.
            state.prepared = true;
            return;
        }

        let pair = (|| {
            Some(TokenPair {
                access_token: self.storage.get(ACCESS_TOKEN_KEY)?,
                access_token_expired_at: self
                    .storage
                    .get(ACCESS_TOKEN_EXPIRED_AT_KEY)?
                    .parse()
                    .ok()?,
                refresh_token: self.storage.get(REFRESH_TOKEN_KEY)?,
                refresh_token_expired_at: self
                    .storage
                    .get(REFRESH_TOKEN_EXPIRED_AT_KEY)?
                    .parse()
                    .ok()?,
            })
        })();

        if let Some(pair) = pair {
            *self.auth_header.write() = Some(pair.access_token.clone());
            state.tokens = Some(pair);
            state.prepared = true;
        }
    }

    fn set_tokens(&self, pair: TokenPair) {
        self.storage.set(ACCESS_TOKEN_KEY, Some(&pair.access_token));
        self.storage
            .set(ACCESS_TOKEN_EXPIRED_AT_KEY, Some(&pair.access_token_expired_at.to_string()));
        self.storage.set(REFRESH_TOKEN_KEY, Some(&pair.refresh_token));
        self.storage
            .set(REFRESH_TOKEN_EXPIRED_AT_KEY, Some(&pair.refresh_token_expired_at.to_string()));

        *self.auth_header.write() = Some(pair.access_token.clone());

        let mut state = self.state.lock();
        state.tokens = Some(pair);
        state.prepared = true;
    }

    async fn do_refresh(&self) {
        let current = {
            let state = self.state.lock();
            state
                .tokens
                .as_ref()
                .map(|pair| (pair.access_token.clone(), pair.refresh_token.clone()))
        };

        let Some((access_token, refresh_token)) = current else {
            log::warn!("token refresh requested but no tokens are stored");
            return;
        };

        match self.refresher.refresh(&access_token, &refresh_token).await {
            Ok(pair) => {
                log::debug!("tokens refreshed, access token expires at {}", pair.access_token_expired_at);
                self.set_tokens(pair);
            }
            Err(err) => self.errors.handle(&err),
        }
    }
}

fn is_expired(pair: &TokenPair) -> bool {
    now_ms() > pair.access_token_expired_at - EXPIRY_SKEW_MS
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}
