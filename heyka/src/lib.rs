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

//! Connectivity and adaptive media-quality core of the Heyka client.
//!
//! The crate ties four loops together:
//! - [`connection::monitor::NetworkMonitor`] probes the backend and decides
//!   whether the machine is online,
//! - [`connection::supervisor::ConnectionSupervisor`] merges that with the
//!   health of the socket, the REST api and the media gateway,
//! - [`api::middleware::ApiMiddleware`] gates every REST call on that merged
//!   state and replays important calls after an outage,
//! - [`gateway::MediaGateway`] drives the SFU plugins of an active call and
//!   [`quality::AudioQualityController`] adapts their jitter prebuffer to
//!   the measured round-trip times.

pub mod api;
pub mod connection;
pub mod gateway;
pub mod prelude;
pub mod quality;

pub use heyka_api;
