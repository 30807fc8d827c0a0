// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 OpenVPN Auth Bridge Contributors

// OpenVPN Auth Bridge - Daemon Library
// Management interface client and the authorizer seam used by the binary

pub mod authorizer;
pub mod config;
pub mod management;

pub use authorizer::{AuthTicket, Authorizer, PendingAuth, RejectAuthorizer};
pub use config::{DaemonConfig, OpenVpnConfig};
pub use management::{ManagementClient, ManagementError};
