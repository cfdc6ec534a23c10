//! Shared API type definitions
//!
//! This crate contains the types shared between the metagpu device plugin
//! daemon and its clients: the visibility levels a caller can hold and the
//! claims carried by the caller's signed token.

use core::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

pub mod token;

/// Metadata key carrying the caller's token on every management RPC.
pub const AUTHORIZATION_METADATA_KEY: &str = "authorization";

/// Scheme prefix expected in front of the token.
pub const BEARER_PREFIX: &str = "Bearer ";

/// Scope of process data a caller may see or act on.
///
/// Levels are ordered from the narrowest to the broadest, each one seeing
/// everything the level below it sees.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    derive_more::Display,
)]
pub enum VisibilityLevel {
    /// Same-workload self inspection only
    #[serde(rename = "l2", alias = "process")]
    #[display("process")]
    Process,
    /// Processes of an explicitly named pod
    #[serde(rename = "l1", alias = "container")]
    #[display("container")]
    Container,
    /// Every process on the node
    #[serde(rename = "l0", alias = "device")]
    #[display("device")]
    Device,
}

impl VisibilityLevel {
    /// Wire identifier used inside tokens.
    pub const fn claim_value(self) -> &'static str {
        match self {
            Self::Process => "l2",
            Self::Container => "l1",
            Self::Device => "l0",
        }
    }
}

impl FromStr for VisibilityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "l2" | "process" => Ok(Self::Process),
            "l1" | "container" => Ok(Self::Container),
            "l0" | "device" => Ok(Self::Device),
            other => Err(format!(
                "unknown visibility level '{other}', expected one of l0/device, l1/container, l2/process"
            )),
        }
    }
}

/// Payload of the token presented by management API callers.
///
/// ```json
/// {
///   "visibilityLevel": "l1",
///   "podId": "my-pod",
///   "sub": "operator",
///   "exp": 1751311081
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibilityClaims {
    pub visibility_level: VisibilityLevel,
    /// Pod the token was issued for, binds process level callers to it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Expiration as seconds since the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

impl VisibilityClaims {
    pub fn new(visibility_level: VisibilityLevel) -> Self {
        Self {
            visibility_level,
            pod_id: None,
            sub: None,
            exp: None,
        }
    }
}

/// Share of unallocated metagpus in percent, rounded down; 0 without any.
pub fn free_percent(total: u32, allocated: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    let free = u64::from(total.saturating_sub(allocated));
    (free * 100 / u64::from(total)) as u32
}
