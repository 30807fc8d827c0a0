// Common types for the OpenVPN auth bridge

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Placeholder sent instead of a common name in `omit` mode
pub const COMMON_NAME_OMIT_VALUE: &str = "-";

/// Addresses one client session on the management interface.
///
/// OpenVPN assigns the connection id (`cid`) per client and the key id
/// (`kid`) per authentication round; approve and deny commands need both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientIdentifier {
    pub cid: u64,
    pub kid: u64,
}

impl ClientIdentifier {
    pub fn new(cid: u64, kid: u64) -> Self {
        Self { cid, kid }
    }
}

impl fmt::Display for ClientIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cid {}, kid {}", self.cid, self.kid)
    }
}

/// How client common names appear in outbound management commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CommonNameMode {
    /// Send the common name as reported by OpenVPN
    #[default]
    Plain,
    /// Replace the common name with [`COMMON_NAME_OMIT_VALUE`]
    Omit,
}

impl CommonNameMode {
    /// Apply the mode to a common name
    pub fn transform(self, common_name: &str) -> String {
        match self {
            CommonNameMode::Plain => common_name.to_string(),
            CommonNameMode::Omit => COMMON_NAME_OMIT_VALUE.to_string(),
        }
    }
}

impl fmt::Display for CommonNameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommonNameMode::Plain => write!(f, "plain"),
            CommonNameMode::Omit => write!(f, "omit"),
        }
    }
}

impl FromStr for CommonNameMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" => Ok(CommonNameMode::Plain),
            "omit" => Ok(CommonNameMode::Omit),
            other => Err(Error::InvalidCommonNameMode(other.to_string())),
        }
    }
}

impl TryFrom<String> for CommonNameMode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CommonNameMode> for String {
    fn from(mode: CommonNameMode) -> Self {
        mode.to_string()
    }
}
