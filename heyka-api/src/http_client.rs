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

use std::{sync::Arc, time::Duration};

use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::tokens::TokenPair;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Backend error messages the recovery paths key on.
pub mod messages {
    pub const ACCESS_TOKEN_EXPIRED: &str = "Access token is expired";
    pub const SOCKET_NOT_FOUND: &str = "Socket not found";
    pub const UNKNOWN_CONNECTION: &str = "Unknow socket connection";
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("can't call `{0}` while offline")]
    Offline(String),
    #[error("call `{0}` was throttled")]
    Throttled(String),
    #[error("initial bootstrap is in progress")]
    InitialInProgress,
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server responded with {status}: {message}")]
    Server { status: u16, message: String },
    #[error("request timed out")]
    Timeout,
}

impl ApiError {
    /// Message of a structured backend error response, if this is one.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            ApiError::Server { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// Bearer token shared between the REST client and the token store.
///
/// The store writes it on every refresh, the client reads it per request, so
/// no call ever goes out with a header the store already replaced.
pub type AuthHeader = Arc<RwLock<Option<String>>>;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Thin typed client for the Heyka REST backend.
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    auth_header: AuthHeader,
}

impl RestClient {
    pub fn new(base_url: &str, auth_header: AuthHeader) -> ApiResult<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_owned(), auth_header })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth_header.read().as_deref() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        let builder = self
            .apply_auth(self.http.get(self.endpoint(path)))
            .timeout(DEFAULT_REQUEST_TIMEOUT);
        Self::handle_response(builder.send().await.map_err(classify)?).await
    }

    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> ApiResult<T> {
        let builder = self
            .apply_auth(self.http.post(self.endpoint(path)))
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .json(body);
        Self::handle_response(builder.send().await.map_err(classify)?).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        let builder = self
            .apply_auth(self.http.delete(self.endpoint(path)))
            .timeout(DEFAULT_REQUEST_TIMEOUT);
        Self::handle_response(builder.send().await.map_err(classify)?).await
    }

    /// Hanging GET against the connectivity probe endpoint.
    ///
    /// `wait` is how long the server should hold the request open before
    /// answering. `request_timeout` bounds the whole round trip client-side
    /// and is only used for quick probes (`wait` of zero).
    ///
    /// Returns the caller's external IP as reported by the server.
    pub async fn long_poll(
        &self,
        wait: Duration,
        request_timeout: Option<Duration>,
    ) -> ApiResult<String> {
        #[derive(Deserialize)]
        struct PollResponse {
            ip: String,
        }

        let mut builder = self
            .http
            .get(self.endpoint("/long-poll"))
            .query(&[("timeout", wait.as_millis().to_string())]);
        if let Some(timeout) = request_timeout {
            builder = builder.timeout(timeout);
        }

        let body: PollResponse = Self::handle_response(builder.send().await.map_err(classify)?).await?;
        Ok(body.ip)
    }

    /// Exchanges the current token pair for a fresh one.
    pub async fn refresh_token(
        &self,
        access_token: &str,
        refresh_token: &str,
    ) -> ApiResult<TokenPair> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct RefreshRequest<'a> {
            access_token: &'a str,
            refresh_token: &'a str,
        }

        let builder = self
            .http
            .post(self.endpoint("/refresh-token"))
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .json(&RefreshRequest { access_token, refresh_token });
        Self::handle_response(builder.send().await.map_err(classify)?).await
    }

    async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> ApiResult<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await.map_err(classify)?);
        }

        // The backend wraps errors as `{ "message": "..." }`, but proxies in
        // front of it answer with plain text.
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.message,
            Err(_) => status.canonical_reason().unwrap_or("unknown error").to_owned(),
        };

        Err(ApiError::Server { status: status.as_u16(), message })
    }
}

fn classify(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout
    } else {
        ApiError::Transport(err)
    }
}
