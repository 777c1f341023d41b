//! Common types used across BFH components.

use crate::errors::{BfhError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// CPU architecture of a build engine pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Amd64,
    Arm64,
}

impl Architecture {
    /// Every supported architecture, in publication order.
    pub const ALL: [Architecture; 2] = [Architecture::Amd64, Architecture::Arm64];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
        }
    }

    /// OCI platform string, e.g. `linux/arm64`.
    pub fn platform(&self) -> String {
        format!("linux/{}", self.as_str())
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = BfhError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "amd64" | "x86_64" => Ok(Self::Amd64),
            "arm64" | "aarch64" => Ok(Self::Arm64),
            other => Err(BfhError::InvalidArgument(format!(
                "unsupported architecture '{other}' (expected amd64 or arm64)"
            ))),
        }
    }
}

/// Inclusive range of local TCP ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPortRange")]
pub struct PortRange {
    start: u16,
    end: u16,
}

#[derive(Deserialize)]
struct RawPortRange {
    start: u16,
    end: u16,
}

impl TryFrom<RawPortRange> for PortRange {
    type Error = BfhError;

    fn try_from(raw: RawPortRange) -> Result<Self> {
        Self::new(raw.start, raw.end)
    }
}

impl PortRange {
    pub const DEFAULT_START: u16 = 30000;
    pub const DEFAULT_END: u16 = 32767;

    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start == 0 {
            return Err(BfhError::InvalidArgument(
                "port range must start at 1 or above".to_string(),
            ));
        }
        if start > end {
            return Err(BfhError::InvalidArgument(format!(
                "port range start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: Self::DEFAULT_START,
            end: Self::DEFAULT_END,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// A running build engine instance reachable inside the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEndpoint {
    /// Instance (pod) name.
    pub instance: String,
    /// `host:port` address without protocol prefix.
    pub address: String,
}

impl BuildEndpoint {
    /// Address with the `tcp://` scheme expected by build clients.
    pub fn url(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

/// SSH gateway resolved from the local connection cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BastionEndpoint {
    pub name: String,
    pub domain: String,
    pub port: u16,
}
