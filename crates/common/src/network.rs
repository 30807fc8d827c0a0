// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 OpenVPN Auth Bridge Contributors

// Management interface address parsing

use std::fmt;
use std::path::PathBuf;

use url::Url;

use crate::error::{Error, Result};

/// Where the OpenVPN management interface listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagementAddr {
    /// Stream socket, `tcp://host:port`
    Tcp(String),
    /// Local domain socket, `unix:///path/to/socket`
    Unix(PathBuf),
}

impl ManagementAddr {
    /// Parse a management address URL.
    ///
    /// Only `tcp` and `unix` are accepted; every other scheme yields
    /// [`Error::UnknownProtocol`].
    pub fn parse(addr: &str) -> Result<Self> {
        let url = Url::parse(addr).map_err(|e| Error::InvalidAddress(format!("{}: {}", addr, e)))?;

        match url.scheme() {
            "tcp" => {
                let host = url
                    .host_str()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| Error::InvalidAddress(format!("{}: missing host", addr)))?;
                let port = url
                    .port()
                    .ok_or_else(|| Error::InvalidAddress(format!("{}: missing port", addr)))?;
                Ok(ManagementAddr::Tcp(format_host_port(host, port)))
            }
            "unix" => {
                let path = url.path();
                if path.is_empty() || path == "/" {
                    return Err(Error::InvalidAddress(format!("{}: missing socket path", addr)));
                }
                Ok(ManagementAddr::Unix(PathBuf::from(path)))
            }
            other => Err(Error::UnknownProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for ManagementAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagementAddr::Tcp(host_port) => write!(f, "tcp://{}", host_port),
            ManagementAddr::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Join host and port, bracketing bare IPv6 literals
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
