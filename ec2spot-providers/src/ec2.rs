//! Routines shared by EC2 drivers: query-parameter helpers, response field
//! extraction and key-pair resolution.

use crate::xml::XmlElement;
use crate::Ec2Connection;
use base64::Engine as _;
use ec2spot_common::{BlockDeviceMapping, EbsBlockDevice, Result, SecurityGroupRef, SpotError};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Flat wire parameters of one query API call. Ordered so that identical
/// inputs always serialize identically.
pub type QueryParams = BTreeMap<String, String>;

/// Provider-side filters: filter name to accepted values.
pub type Filters = BTreeMap<String, Vec<String>>;

pub const ARN_PREFIX: &str = "arn:aws:iam:";

// -----------------------------------------------------------------------------
// Request side
// -----------------------------------------------------------------------------

/// `key.1`, `key.2`, ... for a repeatable parameter.
pub fn pathlist(key: &str, values: &[String]) -> QueryParams {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| (format!("{}.{}", key, i + 1), v.clone()))
        .collect()
}

pub fn build_filters(filters: &Filters) -> QueryParams {
    let mut params = QueryParams::new();
    for (filter_idx, (name, values)) in filters.iter().enumerate() {
        let n = filter_idx + 1;
        params.insert(format!("Filter.{}.Name", n), name.clone());
        for (value_idx, value) in values.iter().enumerate() {
            params.insert(format!("Filter.{}.Value.{}", n, value_idx + 1), value.clone());
        }
    }
    params
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EbsSpec {
    pub snapshot_id: Option<String>,
    pub volume_size: Option<u32>,
    pub delete_on_termination: Option<bool>,
    pub volume_type: Option<String>,
    pub iops: Option<u32>,
    pub encrypted: Option<bool>,
}

/// Block device mapping as sent when launching an instance.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BlockDeviceMappingSpec {
    pub device_name: String,
    pub virtual_name: Option<String>,
    #[serde(default)]
    pub no_device: bool,
    pub ebs: Option<EbsSpec>,
}

pub fn block_device_mapping_params(mappings: &[BlockDeviceMappingSpec]) -> QueryParams {
    let mut params = QueryParams::new();
    for (idx, mapping) in mappings.iter().enumerate() {
        let prefix = format!("BlockDeviceMapping.{}", idx + 1);
        params.insert(format!("{}.DeviceName", prefix), mapping.device_name.clone());
        if let Some(virtual_name) = &mapping.virtual_name {
            params.insert(format!("{}.VirtualName", prefix), virtual_name.clone());
        }
        if mapping.no_device {
            params.insert(format!("{}.NoDevice", prefix), String::new());
        }
        let Some(ebs) = &mapping.ebs else { continue };
        let mut put = |field: &str, value: String| {
            params.insert(format!("{}.Ebs.{}", prefix, field), value);
        };
        if let Some(v) = &ebs.snapshot_id {
            put("SnapshotId", v.clone());
        }
        if let Some(v) = ebs.volume_size {
            put("VolumeSize", v.to_string());
        }
        if let Some(v) = ebs.delete_on_termination {
            put("DeleteOnTermination", v.to_string());
        }
        if let Some(v) = &ebs.volume_type {
            put("VolumeType", v.clone());
        }
        if let Some(v) = ebs.iops {
            put("Iops", v.to_string());
        }
        if let Some(v) = ebs.encrypted {
            put("Encrypted", v.to_string());
        }
    }
    params
}

// -----------------------------------------------------------------------------
// Response side
// -----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Str,
    Int,
    Bool,
}

pub struct ExtraAttribute {
    pub name: &'static str,
    pub path: &'static str,
    pub kind: ValueKind,
}

const fn attr(name: &'static str, path: &'static str, kind: ValueKind) -> ExtraAttribute {
    ExtraAttribute { name, path, kind }
}

/// Node attributes, looked up relative to an instance or a launch specification.
pub const NODE_EXTRA_ATTRIBUTES: &[ExtraAttribute] = &[
    attr("availability", "placement/availabilityZone", ValueKind::Str),
    attr("architecture", "architecture", ValueKind::Str),
    attr("client_token", "clientToken", ValueKind::Str),
    attr("dns_name", "dnsName", ValueKind::Str),
    attr("ebs_optimized", "ebsOptimized", ValueKind::Bool),
    attr("hypervisor", "hypervisor", ValueKind::Str),
    attr("iam_profile", "iamInstanceProfile/arn", ValueKind::Str),
    attr("iam_profile_name", "iamInstanceProfile/name", ValueKind::Str),
    attr("image_id", "imageId", ValueKind::Str),
    attr("instance_id", "instanceId", ValueKind::Str),
    attr("instance_lifecycle", "instanceLifecycle", ValueKind::Str),
    attr("instance_tenancy", "placement/tenancy", ValueKind::Str),
    attr("instance_type", "instanceType", ValueKind::Str),
    attr("kernel_id", "kernelId", ValueKind::Str),
    attr("key_name", "keyName", ValueKind::Str),
    attr("launch_index", "amiLaunchIndex", ValueKind::Int),
    attr("launch_time", "launchTime", ValueKind::Str),
    attr("monitoring", "monitoring/enabled", ValueKind::Bool),
    attr("platform", "platform", ValueKind::Str),
    attr("private_dns", "privateDnsName", ValueKind::Str),
    attr("ramdisk_id", "ramdiskId", ValueKind::Str),
    attr("root_device_name", "rootDeviceName", ValueKind::Str),
    attr("root_device_type", "rootDeviceType", ValueKind::Str),
    attr("subnet_id", "subnetId", ValueKind::Str),
    attr("vpc_id", "vpcId", ValueKind::Str),
];

fn convert(name: &str, raw: &str, kind: ValueKind) -> Result<serde_json::Value> {
    match kind {
        ValueKind::Str => Ok(serde_json::Value::String(raw.to_string())),
        ValueKind::Int => raw
            .parse::<i64>()
            .map(serde_json::Value::from)
            .map_err(|_| SpotError::InvalidType(format!("{}: expected integer, got {:?}", name, raw))),
        ValueKind::Bool => parse_bool(raw)
            .map(serde_json::Value::Bool)
            .ok_or_else(|| SpotError::InvalidType(format!("{}: expected boolean, got {:?}", name, raw))),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// Attributes present under `element`; missing ones are simply left out.
pub fn extra_attributes(
    element: &XmlElement,
    table: &[ExtraAttribute],
) -> Result<BTreeMap<String, serde_json::Value>> {
    let mut extra = BTreeMap::new();
    for a in table {
        if let Some(raw) = element.find_text(a.path) {
            extra.insert(a.name.to_string(), convert(a.name, raw, a.kind)?);
        }
    }
    Ok(extra)
}

fn opt_int(element: &XmlElement, path: &str) -> Result<Option<i64>> {
    element
        .find_text(path)
        .map(|raw| {
            raw.parse::<i64>()
                .map_err(|_| SpotError::InvalidType(format!("{}: expected integer, got {:?}", path, raw)))
        })
        .transpose()
}

fn opt_bool(element: &XmlElement, path: &str) -> Result<Option<bool>> {
    element
        .find_text(path)
        .map(|raw| {
            parse_bool(raw)
                .ok_or_else(|| SpotError::InvalidType(format!("{}: expected boolean, got {:?}", path, raw)))
        })
        .transpose()
}

fn opt_text(element: &XmlElement, path: &str) -> Option<String> {
    element.find_text(path).map(|s| s.to_string())
}

pub fn device_mappings(element: &XmlElement) -> Result<Vec<BlockDeviceMapping>> {
    element
        .find_all("blockDeviceMapping/item")
        .into_iter()
        .map(|item| {
            let ebs = match item.child("ebs") {
                Some(ebs) => Some(EbsBlockDevice {
                    snapshot_id: opt_text(ebs, "snapshotId"),
                    volume_size: opt_int(ebs, "volumeSize")?,
                    delete_on_termination: opt_bool(ebs, "deleteOnTermination")?,
                    volume_type: opt_text(ebs, "volumeType"),
                    iops: opt_int(ebs, "iops")?,
                    encrypted: opt_bool(ebs, "encrypted")?,
                }),
                None => None,
            };
            Ok(BlockDeviceMapping {
                device_name: opt_text(item, "deviceName"),
                virtual_name: opt_text(item, "virtualName"),
                ebs,
            })
        })
        .collect()
}

pub fn security_groups(element: &XmlElement) -> Vec<SecurityGroupRef> {
    element
        .find_all("groupSet/item")
        .into_iter()
        .map(|item| SecurityGroupRef {
            group_id: opt_text(item, "groupId"),
            group_name: opt_text(item, "groupName"),
        })
        .collect()
}

// -----------------------------------------------------------------------------
// Key pairs
// -----------------------------------------------------------------------------

/// Key-pair name derived from an OpenSSH public key: `<comment>-<sha256 prefix>`.
pub fn key_pair_name(public_key: &str) -> Result<String> {
    let mut parts = public_key.split_whitespace();
    let (Some(_key_type), Some(blob)) = (parts.next(), parts.next()) else {
        return Err(SpotError::InvalidParameter(
            "public key must be in OpenSSH format: <type> <base64> [comment]".to_string(),
        ));
    };
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(blob)
        .map_err(|e| SpotError::InvalidParameter(format!("public key is not valid base64: {}", e)))?;
    let digest = Sha256::digest(&decoded);
    let fingerprint: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    let comment = parts
        .next()
        .map(|c| {
            c.chars()
                .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
                .collect::<String>()
        })
        .unwrap_or_else(|| "unnamed".to_string());
    Ok(format!("{}-{}", comment, fingerprint))
}

/// Returns the name of the key pair holding `public_key`, importing it first
/// when the provider does not know it yet.
///
/// Lookup goes by the derived name from [`key_pair_name`], not by the
/// provider's key fingerprint. A key already imported under another name is
/// not found and gets imported again under the derived one.
pub async fn find_or_import_key_pair(conn: &dyn Ec2Connection, public_key: &str) -> Result<String> {
    let key_name = key_pair_name(public_key)?;

    let mut params = QueryParams::new();
    params.insert("Action".to_string(), "DescribeKeyPairs".to_string());
    params.extend(build_filters(&Filters::from([(
        "key-name".to_string(),
        vec![key_name.clone()],
    )])));
    let root = conn.request(&params).await?;
    if let Some(existing) = root.find_text("keySet/item/keyName") {
        tracing::debug!("Reusing key pair {}", existing);
        return Ok(existing.to_string());
    }

    let mut params = QueryParams::new();
    params.insert("Action".to_string(), "ImportKeyPair".to_string());
    params.insert("KeyName".to_string(), key_name.clone());
    params.insert(
        "PublicKeyMaterial".to_string(),
        base64::engine::general_purpose::STANDARD.encode(public_key.trim()),
    );
    let root = conn.request(&params).await?;
    let imported = root
        .find_text("keyName")
        .ok_or_else(|| SpotError::MissingElement("keyName".to_string()))?;
    tracing::info!("Imported key pair {}", imported);
    Ok(imported.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pathlist_is_one_based() {
        let p = pathlist("SpotInstanceRequestId", &["a".to_string(), "b".to_string()]);
        assert_eq!(p.len(), 2);
        assert_eq!(p["SpotInstanceRequestId.1"], "a");
        assert_eq!(p["SpotInstanceRequestId.2"], "b");
        assert!(pathlist("X", &[]).is_empty());
    }

    #[test]
    fn filters_are_indexed_by_name_and_value() {
        let filters = Filters::from([
            ("state".to_string(), vec!["open".to_string(), "active".to_string()]),
            ("type".to_string(), vec!["one-time".to_string()]),
        ]);
        let p = build_filters(&filters);
        assert_eq!(p["Filter.1.Name"], "state");
        assert_eq!(p["Filter.1.Value.1"], "open");
        assert_eq!(p["Filter.1.Value.2"], "active");
        assert_eq!(p["Filter.2.Name"], "type");
        assert_eq!(p["Filter.2.Value.1"], "one-time");
        assert_eq!(p.len(), 5);
    }

    #[test]
    fn block_device_params() {
        let p = block_device_mapping_params(&[
            BlockDeviceMappingSpec {
                device_name: "/dev/sda1".to_string(),
                ebs: Some(EbsSpec {
                    volume_size: Some(20),
                    delete_on_termination: Some(true),
                    volume_type: Some("gp2".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            BlockDeviceMappingSpec {
                device_name: "/dev/sdb".to_string(),
                virtual_name: Some("ephemeral0".to_string()),
                ..Default::default()
            },
            BlockDeviceMappingSpec {
                device_name: "/dev/sdc".to_string(),
                no_device: true,
                ..Default::default()
            },
        ]);
        assert_eq!(p["BlockDeviceMapping.1.DeviceName"], "/dev/sda1");
        assert_eq!(p["BlockDeviceMapping.1.Ebs.VolumeSize"], "20");
        assert_eq!(p["BlockDeviceMapping.1.Ebs.DeleteOnTermination"], "true");
        assert_eq!(p["BlockDeviceMapping.1.Ebs.VolumeType"], "gp2");
        assert_eq!(p["BlockDeviceMapping.2.VirtualName"], "ephemeral0");
        assert_eq!(p["BlockDeviceMapping.3.NoDevice"], "");
        assert_eq!(p["BlockDeviceMapping.3.DeviceName"], "/dev/sdc");
        assert_eq!(p.len(), 8);
    }

    #[test]
    fn extracts_typed_attributes() {
        let el = XmlElement::parse(
            "<launchSpecification><imageId>ami-1</imageId><amiLaunchIndex>2</amiLaunchIndex>\
             <monitoring><enabled>false</enabled></monitoring><placement><availabilityZone>ap-southeast-2a</availabilityZone></placement>\
             <ebsOptimized>true</ebsOptimized></launchSpecification>",
        )
        .unwrap();
        let extra = extra_attributes(&el, NODE_EXTRA_ATTRIBUTES).unwrap();
        assert_eq!(extra["image_id"], "ami-1");
        assert_eq!(extra["launch_index"], 2);
        assert_eq!(extra["monitoring"], false);
        assert_eq!(extra["ebs_optimized"], true);
        assert_eq!(extra["availability"], "ap-southeast-2a");
        assert!(!extra.contains_key("key_name"));
    }

    #[test]
    fn bad_typed_attribute_fails() {
        let el = XmlElement::parse("<x><amiLaunchIndex>two</amiLaunchIndex></x>").unwrap();
        assert!(matches!(
            extra_attributes(&el, NODE_EXTRA_ATTRIBUTES),
            Err(SpotError::InvalidType(_))
        ));
    }

    #[test]
    fn parses_device_mappings_and_groups() {
        let el = XmlElement::parse(
            "<ls><groupSet><item><groupId>sg-1</groupId><groupName>default</groupName></item>\
             <item><groupId>sg-2</groupId></item></groupSet>\
             <blockDeviceMapping><item><deviceName>/dev/sda1</deviceName><ebs><volumeSize>8</volumeSize>\
             <deleteOnTermination>true</deleteOnTermination></ebs></item>\
             <item><deviceName>/dev/sdb</deviceName><virtualName>ephemeral0</virtualName></item></blockDeviceMapping></ls>",
        )
        .unwrap();
        let groups = security_groups(&el);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].group_name.as_deref(), Some("default"));
        assert_eq!(groups[1].group_name, None);

        let mappings = device_mappings(&el).unwrap();
        assert_eq!(mappings.len(), 2);
        let ebs = mappings[0].ebs.as_ref().unwrap();
        assert_eq!(ebs.volume_size, Some(8));
        assert_eq!(ebs.delete_on_termination, Some(true));
        assert!(mappings[1].ebs.is_none());
        assert_eq!(mappings[1].virtual_name.as_deref(), Some("ephemeral0"));
    }

    #[test]
    fn key_pair_name_is_stable() {
        let key = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIJ7bSk0HJUd0wqYHGnQzmJx5GI2Dc0L1sGjdqOMGRRrw ops@host";
        let a = key_pair_name(key).unwrap();
        let b = key_pair_name(key).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("ops_host-"));
        assert_eq!(a.len(), "ops_host-".len() + 16);
        assert!(matches!(key_pair_name("not-a-key"), Err(SpotError::InvalidParameter(_))));
        assert!(matches!(key_pair_name("ssh-rsa !!!"), Err(SpotError::InvalidParameter(_))));
    }
}
