use ec2spot_common::{Result, SpotError};

/// A region the spot driver can be constructed for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub code: &'static str,
    pub name: &'static str,
}

pub const SUPPORTED_REGIONS: &[Region] = &[
    Region { code: "us-east-1", name: "Amazon EC2 (us-east-1)" },
    Region { code: "us-west-1", name: "Amazon EC2 (us-west-1)" },
    Region { code: "us-west-2", name: "Amazon EC2 (us-west-2)" },
    Region { code: "eu-west-1", name: "Amazon EC2 (eu-west-1)" },
    Region { code: "ap-southeast-1", name: "Amazon EC2 (ap-southeast-1)" },
    Region { code: "ap-southeast-2", name: "Amazon EC2 (ap-southeast-2)" },
    Region { code: "ap-northeast-1", name: "Amazon EC2 (ap-northeast-1)" },
    Region { code: "sa-east-1", name: "Amazon EC2 (sa-east-1)" },
];

pub const DEFAULT_REGION: &str = "us-east-1";

impl Region {
    pub fn from_code(code: &str) -> Result<Region> {
        let code = code.trim();
        SUPPORTED_REGIONS
            .iter()
            .copied()
            .find(|r| r.code.eq_ignore_ascii_case(code))
            .ok_or_else(|| SpotError::InvalidParameter(format!("Unsupported region: {}", code)))
    }
}
