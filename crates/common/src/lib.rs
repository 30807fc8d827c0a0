// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 OpenVPN Auth Bridge Contributors

// OpenVPN Auth Bridge - Common Library
// Shared types for the management client and its embedders

pub mod error;
pub mod network;
pub mod secret;
pub mod types;

pub use error::{Error, Result};
pub use network::{format_host_port, ManagementAddr};
pub use secret::Secret;
pub use types::{ClientIdentifier, CommonNameMode, COMMON_NAME_OMIT_VALUE};
