use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub mod error;

pub use error::{Result, SpotError};

// --- Enums ---

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpotRequestState {
    Open,
    Closed,
    Failed,
    Cancelled,
    Active,
}

impl SpotRequestState {
    pub const ALL: [SpotRequestState; 5] = [
        SpotRequestState::Open,
        SpotRequestState::Closed,
        SpotRequestState::Failed,
        SpotRequestState::Cancelled,
        SpotRequestState::Active,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SpotRequestState::Open => "open",
            SpotRequestState::Closed => "closed",
            SpotRequestState::Failed => "failed",
            SpotRequestState::Cancelled => "cancelled",
            SpotRequestState::Active => "active",
        }
    }

    /// Wire tokens are matched exactly; anything else is an error, never a default.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(SpotRequestState::Open),
            "closed" => Ok(SpotRequestState::Closed),
            "failed" => Ok(SpotRequestState::Failed),
            "cancelled" => Ok(SpotRequestState::Cancelled),
            "active" => Ok(SpotRequestState::Active),
            other => Err(SpotError::UnknownState(other.to_string())),
        }
    }
}

impl fmt::Display for SpotRequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Launch specification pieces ---

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct EbsBlockDevice {
    pub snapshot_id: Option<String>,
    pub volume_size: Option<i64>,
    pub delete_on_termination: Option<bool>,
    pub volume_type: Option<String>,
    pub iops: Option<i64>,
    pub encrypted: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct BlockDeviceMapping {
    pub device_name: Option<String>,
    pub virtual_name: Option<String>,
    pub ebs: Option<EbsBlockDevice>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct SecurityGroupRef {
    pub group_id: Option<String>,
    pub group_name: Option<String>,
}

/// Provider-specific fields carried next to the core record shape.
///
/// `attributes` holds whatever node-level attributes were present in the
/// launch specification; the two derived entries are always populated (possibly
/// empty).
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ExtraAttributes {
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub block_device_mapping: Vec<BlockDeviceMapping>,
    pub groups: Vec<SecurityGroupRef>,
}

impl ExtraAttributes {
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.attributes.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(|v| v.as_str())
    }
}

// --- Session attribution ---

/// Identifies the driver session that produced a record. It does not own the
/// driver or its connection.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SessionRef {
    pub session_id: Uuid,
    pub provider: String,
    pub region: String,
}

impl SessionRef {
    pub fn new(provider: &str, region: &str) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            provider: provider.to_string(),
            region: region.to_string(),
        }
    }
}

// --- Entities ---

/// One outstanding or resolved bid for spot capacity, as last reported by the
/// provider. Re-query to observe a newer state.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SpotRequest {
    pub id: String,
    pub instance_id: Option<String>, // set once the request is ACTIVE
    pub spot_price: Option<String>,
    pub state: SpotRequestState,
    pub status: Option<String>,
    pub message: Option<String>,
    pub availability_zone_group: Option<String>,
    pub extra: ExtraAttributes,
    pub driver: SessionRef,
}

impl SpotRequest {
    pub fn is_open(&self) -> bool {
        self.state == SpotRequestState::Open
    }

    pub fn is_fulfilled(&self) -> bool {
        self.state == SpotRequestState::Active
            && self.instance_id.as_deref().map_or(false, |s| !s.is_empty())
    }
}

impl fmt::Display for SpotRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<EC2SpotRequest: id={}>", self.id)
    }
}
