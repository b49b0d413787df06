//! EC2 spot instance requests: create, list and cancel.
//!
//! API reference:
//! <http://docs.aws.amazon.com/AWSEC2/latest/APIReference/ApiReference-query-RequestSpotInstances.html>

use crate::ec2::{self, BlockDeviceMappingSpec, Filters, QueryParams, ARN_PREFIX};
use crate::region::Region;
use crate::xml::XmlElement;
use crate::{Ec2Connection, PROVIDER_EC2_SPOT};
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use ec2spot_common::{ExtraAttributes, Result, SessionRef, SpotError, SpotRequest, SpotRequestState};
use serde::Deserialize;
use std::sync::Arc;

const LAUNCH_SPEC: &str = "LaunchSpecification";
const SPOT_REQUEST_ITEMS: &str = "spotInstanceRequestSet/item";

// --- Options ---

/// One group or an ordered list of groups.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SecurityGroups {
    One(String),
    Many(Vec<String>),
}

impl SecurityGroups {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            SecurityGroups::One(g) => vec![g.clone()],
            SecurityGroups::Many(gs) => gs.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct NodeAuthSshKey {
    pub pubkey: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AvailabilityZone {
    pub name: String,
    pub region_name: String,
    pub zone_state: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct NodeLocation {
    pub id: String,
    pub name: String,
    pub availability_zone: Option<AvailabilityZone>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpotRequestType {
    OneTime,
    Persistent,
}

impl SpotRequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpotRequestType::OneTime => "one-time",
            SpotRequestType::Persistent => "persistent",
        }
    }
}

/// How an IAM instance profile is referenced on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IamProfileRef<'a> {
    Arn(&'a str),
    Name(&'a str),
}

impl<'a> IamProfileRef<'a> {
    pub fn classify(profile: &'a str) -> Self {
        if profile.starts_with(ARN_PREFIX) {
            IamProfileRef::Arn(profile)
        } else {
            IamProfileRef::Name(profile)
        }
    }
}

/// Inputs of a spot instance request. `image_id`, `size_id` and `spot_price`
/// are required; everything else is sent only when set.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SpotRequestOptions {
    pub image_id: String,
    pub size_id: String,
    pub spot_price: String,
    pub instance_count: Option<u32>,
    #[serde(rename = "type")]
    pub request_type: Option<SpotRequestType>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub launch_group: Option<String>,
    pub availability_zone_group: Option<String>,
    pub location: Option<NodeLocation>,
    pub key_name: Option<String>,
    pub auth: Option<NodeAuthSshKey>,
    pub user_data: Option<String>,
    pub security_groups: Option<SecurityGroups>,
    /// Legacy alias of `security_groups`; the two cannot be combined.
    pub security_group: Option<SecurityGroups>,
    pub block_device_mappings: Option<Vec<BlockDeviceMappingSpec>>,
    pub iam_profile: Option<String>,
    pub ebs_optimized: Option<bool>,
    pub subnet_id: Option<String>,
    pub monitoring: Option<bool>,
}

impl SpotRequestOptions {
    pub fn new(image_id: &str, size_id: &str, spot_price: &str) -> Self {
        Self {
            image_id: image_id.to_string(),
            size_id: size_id.to_string(),
            spot_price: spot_price.to_string(),
            ..Default::default()
        }
    }

    /// Reads options from a loosely typed document (config file, CLI JSON).
    /// Wrongly typed values, e.g. a numeric `iam_profile`, fail with
    /// [`SpotError::InvalidType`].
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| SpotError::InvalidType(e.to_string()))
    }
}

// --- Driver ---

/// EC2 driver with spot request support, bound to one region.
pub struct SpotDriver {
    connection: Arc<dyn Ec2Connection>,
    region: Region,
    session: SessionRef,
}

impl SpotDriver {
    pub fn new(connection: Arc<dyn Ec2Connection>, region: Region) -> Self {
        Self {
            connection,
            region,
            session: SessionRef::new(PROVIDER_EC2_SPOT, region.code),
        }
    }

    pub fn name(&self) -> &'static str {
        self.region.name
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn session(&self) -> &SessionRef {
        &self.session
    }

    async fn request(&self, params: &QueryParams) -> Result<XmlElement> {
        tracing::debug!(
            "EC2 {} ({} params) region={}",
            params.get("Action").map(String::as_str).unwrap_or("?"),
            params.len(),
            self.region.code
        );
        let root = self.connection.request(params).await?;
        if let Some(err) = root.provider_error() {
            tracing::error!("EC2 request failed: {}", err);
            return Err(err);
        }
        Ok(root)
    }

    /// Parameters of a `RequestSpotInstances` call.
    ///
    /// Pure: no network access. When `opts.auth` is set the key name is left
    /// out; [`SpotDriver::request_spot_instances`] resolves it.
    pub fn build_request_params(&self, opts: &SpotRequestOptions) -> Result<QueryParams> {
        if opts.security_groups.is_some() && opts.security_group.is_some() {
            return Err(SpotError::Configuration(
                "security_groups and security_group are aliases, supply only one".to_string(),
            ));
        }
        if opts.key_name.is_some() && opts.auth.is_some() {
            return Err(SpotError::Configuration(
                "Cannot specify auth and key_name together".to_string(),
            ));
        }

        let mut params = QueryParams::new();
        let mut put = |key: &str, value: String| {
            params.insert(key.to_string(), value);
        };
        let ls = |field: &str| format!("{}.{}", LAUNCH_SPEC, field);

        put("Action", "RequestSpotInstances".to_string());
        put("SpotPrice", opts.spot_price.clone());
        put(&ls("ImageId"), opts.image_id.clone());
        put(&ls("InstanceType"), opts.size_id.clone());
        put("InstanceCount", opts.instance_count.unwrap_or(1).to_string());

        if let Some(t) = opts.request_type {
            put("Type", t.as_str().to_string());
        }
        if let Some(from) = opts.valid_from {
            put("ValidFrom", from.to_rfc3339_opts(SecondsFormat::Secs, true));
        }
        if let Some(until) = opts.valid_until {
            put("ValidUntil", until.to_rfc3339_opts(SecondsFormat::Secs, true));
        }
        if let Some(group) = &opts.launch_group {
            put("LaunchGroup", group.clone());
        }
        if let Some(group) = &opts.availability_zone_group {
            put("AvailabilityZoneGroup", group.clone());
        }

        if let Some(zone) = opts.location.as_ref().and_then(|l| l.availability_zone.as_ref()) {
            if zone.region_name != self.region.code {
                return Err(SpotError::InvalidParameter(format!(
                    "Invalid availability zone: {}",
                    zone.name
                )));
            }
            put(&ls("Placement.AvailabilityZone"), zone.name.clone());
        }

        if let Some(key_name) = &opts.key_name {
            put(&ls("KeyName"), key_name.clone());
        }

        if let Some(user_data) = &opts.user_data {
            put(
                &ls("UserData"),
                base64::engine::general_purpose::STANDARD.encode(user_data.as_bytes()),
            );
        }

        let groups = opts
            .security_groups
            .as_ref()
            .or(opts.security_group.as_ref())
            .map(SecurityGroups::to_vec)
            .unwrap_or_default();
        for (idx, group) in groups.into_iter().enumerate() {
            put(&ls(&format!("SecurityGroup.{}", idx + 1)), group);
        }

        if let Some(mappings) = &opts.block_device_mappings {
            for (key, value) in ec2::block_device_mapping_params(mappings) {
                put(&ls(&key), value);
            }
        }

        if let Some(profile) = opts.iam_profile.as_deref().filter(|p| !p.is_empty()) {
            match IamProfileRef::classify(profile) {
                IamProfileRef::Arn(arn) => put(&ls("IamInstanceProfile.Arn"), arn.to_string()),
                IamProfileRef::Name(name) => put(&ls("IamInstanceProfile.Name"), name.to_string()),
            }
        }

        if let Some(ebs_optimized) = opts.ebs_optimized {
            put(&ls("EbsOptimized"), ebs_optimized.to_string());
        }
        if let Some(subnet) = &opts.subnet_id {
            put(&ls("SubnetId"), subnet.clone());
        }
        if let Some(monitoring) = opts.monitoring {
            put(&ls("Monitoring.Enabled"), monitoring.to_string());
        }

        Ok(params)
    }

    /// Places a spot request and returns one record per requested instance.
    pub async fn request_spot_instances(&self, opts: &SpotRequestOptions) -> Result<Vec<SpotRequest>> {
        let mut params = self.build_request_params(opts)?;
        if let Some(auth) = &opts.auth {
            let key_name = ec2::find_or_import_key_pair(self.connection.as_ref(), &auth.pubkey).await?;
            params.insert(format!("{}.KeyName", LAUNCH_SPEC), key_name);
        }

        let root = self.request(&params).await?;
        let spots = self.to_spot_requests(&root)?;
        for spot in &spots {
            tracing::info!(
                "Spot request {} created: state={} price={}",
                spot.id,
                spot.state,
                spot.spot_price.as_deref().unwrap_or("?")
            );
        }
        Ok(spots)
    }

    /// Lists spot requests, narrowed by ids and/or provider-side filters.
    pub async fn list_spot_requests(
        &self,
        spot_request_ids: Option<&[String]>,
        filters: Option<&Filters>,
    ) -> Result<Vec<SpotRequest>> {
        let mut params = QueryParams::new();
        params.insert("Action".to_string(), "DescribeSpotInstanceRequests".to_string());
        if let Some(ids) = spot_request_ids.filter(|ids| !ids.is_empty()) {
            params.extend(ec2::pathlist("SpotInstanceRequestId", ids));
        }
        if let Some(filters) = filters.filter(|f| !f.is_empty()) {
            params.extend(ec2::build_filters(filters));
        }

        let root = self.request(&params).await?;
        self.to_spot_requests(&root)
    }

    /// Cancels `spot_request`. Returns true only when the provider reports the
    /// request as cancelled; any other resulting state yields false.
    pub async fn cancel_spot_instance_request(&self, spot_request: &SpotRequest) -> Result<bool> {
        let mut params = QueryParams::new();
        params.insert("Action".to_string(), "CancelSpotInstanceRequests".to_string());
        params.extend(ec2::pathlist(
            "SpotInstanceRequestId",
            std::slice::from_ref(&spot_request.id),
        ));

        let root = self.request(&params).await?;
        let token = root
            .find(&format!("{}/state", SPOT_REQUEST_ITEMS))
            .map(|el| el.text.trim())
            .ok_or_else(|| SpotError::MissingElement(format!("{}/state", SPOT_REQUEST_ITEMS)))?;
        let state = SpotRequestState::parse(token)?;

        if state == SpotRequestState::Cancelled {
            tracing::info!("Spot request {} cancelled", spot_request.id);
            Ok(true)
        } else {
            tracing::warn!("Spot request {} not cancelled: state={}", spot_request.id, state);
            Ok(false)
        }
    }

    /// One record per `spotInstanceRequestSet/item`, in document order.
    pub fn to_spot_requests(&self, root: &XmlElement) -> Result<Vec<SpotRequest>> {
        root.find_all(SPOT_REQUEST_ITEMS)
            .into_iter()
            .map(|el| self.to_spot_request(el))
            .collect()
    }

    pub fn to_spot_request(&self, element: &XmlElement) -> Result<SpotRequest> {
        let text = |path: &str| element.find_text(path).map(|s| s.to_string());

        let id = text("spotInstanceRequestId")
            .ok_or_else(|| SpotError::MissingElement("spotInstanceRequestId".to_string()))?;
        let state_token = element
            .find("state")
            .map(|el| el.text.trim())
            .ok_or_else(|| SpotError::MissingElement(format!("state of spot request {}", id)))?;
        let state = SpotRequestState::parse(state_token)?;

        let launch_spec = element
            .find("launchSpecification")
            .ok_or_else(|| SpotError::MissingElement(format!("launchSpecification of spot request {}", id)))?;

        let extra = ExtraAttributes {
            attributes: ec2::extra_attributes(launch_spec, ec2::NODE_EXTRA_ATTRIBUTES)?,
            block_device_mapping: ec2::device_mappings(launch_spec)?,
            groups: ec2::security_groups(launch_spec),
        };

        Ok(SpotRequest {
            id,
            instance_id: text("instanceId"),
            spot_price: text("spotPrice"),
            state,
            status: text("status/code"),
            message: text("status/message"),
            availability_zone_group: text("availabilityZoneGroup"),
            extra,
            driver: self.session.clone(),
        })
    }
}
