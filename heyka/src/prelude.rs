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

pub use crate::api::middleware::{ApiMiddleware, CallOptions, SessionControl};
pub use crate::connection::monitor::{ConnectivityProbe, NetworkEvent, NetworkMonitor};
pub use crate::connection::supervisor::{
    ConnectionStatus, ConnectionSupervisor, StatusUpdate, SupervisorEvent,
};
pub use crate::gateway::{
    transport::{GatewayTransport, PluginEvent, PluginHandle, PluginKind},
    GatewayConfig, GatewayError, GatewayErrorKind, GatewayEvent, MediaGateway, VideoSource,
};
pub use crate::quality::{AudioQualityController, AudioStatus, QualityEvent, SessionStats};
pub use heyka_api::{
    bootstrap::Bootstrap,
    error_handler::ErrorHandler,
    http_client::{ApiError, ApiResult, RestClient},
    socket::{AuthContext, ChannelEvent, SocketClient},
    tokens::{TokenPair, TokenStore},
};
