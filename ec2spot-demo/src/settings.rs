use std::time::Duration;

pub const DEFAULT_REGION: &str = "ap-southeast-2";
pub const DEFAULT_IMAGE_ID: &str = "ami-f195f1cb";
pub const DEFAULT_SIZE_ID: &str = "t1.micro";
pub const DEFAULT_SPOT_PRICE: &str = "0.08";
pub const DEFAULT_SECURITY_GROUPS: &str = "default,ssh";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub access_id: String,
    pub secret_key: String,
}

impl Credentials {
    /// First four characters of the access id, for logs.
    pub fn masked_access_id(&self) -> String {
        let visible: String = self.access_id.chars().take(4).collect();
        format!("{}****", visible)
    }
}

#[derive(Clone, Debug)]
pub struct DemoSettings {
    pub credentials: Option<Credentials>,
    pub connection: String,
    pub region: String,
    pub image_id: String,
    pub size_id: String,
    pub spot_price: String,
    pub key_name: Option<String>,
    pub security_groups: Vec<String>,
    pub poll_interval: Duration,
    pub mock_fulfil_after: u32,
}

impl DemoSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };

        // Both values are required; one without the other counts as missing.
        let credentials = match (get("ACCESSID"), get("SECRETKEY")) {
            (Some(access_id), Some(secret_key)) => Some(Credentials {
                access_id,
                secret_key,
            }),
            _ => None,
        };

        Self {
            credentials,
            connection: get("EC2SPOT_CONNECTION").unwrap_or_else(|| "mock".to_string()),
            region: get("EC2SPOT_REGION").unwrap_or_else(|| DEFAULT_REGION.to_string()),
            image_id: get("EC2SPOT_IMAGE_ID").unwrap_or_else(|| DEFAULT_IMAGE_ID.to_string()),
            size_id: get("EC2SPOT_SIZE_ID").unwrap_or_else(|| DEFAULT_SIZE_ID.to_string()),
            spot_price: get("EC2SPOT_SPOT_PRICE").unwrap_or_else(|| DEFAULT_SPOT_PRICE.to_string()),
            key_name: get("EC2SPOT_KEYPAIR"),
            security_groups: parse_list(
                get("EC2SPOT_SECURITY_GROUPS").as_deref().unwrap_or(DEFAULT_SECURITY_GROUPS),
            ),
            poll_interval: Duration::from_secs(
                get("EC2SPOT_POLL_SECONDS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
            mock_fulfil_after: get("EC2SPOT_MOCK_FULFIL_AFTER")
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
        }
    }
}

/// Comma-separated list, trimmed, empty entries dropped.
fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}
