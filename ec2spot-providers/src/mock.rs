use crate::ec2::QueryParams;
use crate::xml::XmlElement;
use crate::Ec2Connection;
use async_trait::async_trait;
use ec2spot_common::{Result, SpotError, SpotRequestState};
use std::collections::BTreeMap;
use std::sync::Mutex;

const XMLNS: &str = "http://ec2.amazonaws.com/doc/2013-10-15/";

#[derive(Clone, Debug)]
struct MockSpotRequest {
    id: String,
    spot_price: String,
    state: SpotRequestState,
    status: String,
    message: String,
    instance_id: Option<String>,
    polls: u32,
    launch: QueryParams, // LaunchSpecification.* params, prefix stripped
    availability_zone_group: Option<String>,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    requests: BTreeMap<String, MockSpotRequest>,
    key_pairs: BTreeMap<String, String>,
    sent: Vec<QueryParams>,
}

/// In-memory EC2 endpoint for the spot request actions.
///
/// Open requests are fulfilled after `fulfil_after` describe calls have
/// observed them. Every parameter map received is recorded.
pub struct MockEc2Connection {
    state: Mutex<MockState>,
    fulfil_after: u32,
}

impl Default for MockEc2Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEc2Connection {
    pub fn new() -> Self {
        Self::with_fulfil_after(2)
    }

    pub fn with_fulfil_after(fulfil_after: u32) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            fulfil_after,
        }
    }

    pub fn sent(&self) -> Vec<QueryParams> {
        self.lock().map(|s| s.sent.clone()).unwrap_or_default()
    }

    pub fn key_pair_names(&self) -> Vec<String> {
        self.lock()
            .map(|s| s.key_pairs.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MockState>> {
        self.state
            .lock()
            .map_err(|_| SpotError::Transport("mock state poisoned".to_string()))
    }

    fn handle(&self, params: &QueryParams) -> Result<String> {
        let mut state = self.lock()?;
        state.sent.push(params.clone());

        let action = params.get("Action").map(String::as_str).unwrap_or_default();
        match action {
            "RequestSpotInstances" => Ok(self.request_spot_instances(&mut state, params)),
            "DescribeSpotInstanceRequests" => Ok(self.describe(&mut state, params)),
            "CancelSpotInstanceRequests" => Ok(self.cancel(&mut state, params)),
            "DescribeKeyPairs" => Ok(describe_key_pairs(&state, params)),
            "ImportKeyPair" => Ok(import_key_pair(&mut state, params)),
            other => Ok(error_document(
                "InvalidAction",
                &format!("The action {} is not valid for this web service.", other),
            )),
        }
    }

    fn request_spot_instances(&self, state: &mut MockState, params: &QueryParams) -> String {
        let count: u32 = params
            .get("InstanceCount")
            .and_then(|c| c.parse().ok())
            .unwrap_or(1);
        let launch: QueryParams = params
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix("LaunchSpecification.")
                    .map(|field| (field.to_string(), v.clone()))
            })
            .collect();

        let mut items = String::new();
        for _ in 0..count {
            state.next_id += 1;
            let req = MockSpotRequest {
                id: format!("sir-{:08x}", state.next_id),
                spot_price: params.get("SpotPrice").cloned().unwrap_or_default(),
                state: SpotRequestState::Open,
                status: "pending-evaluation".to_string(),
                message: "Your Spot request has been submitted for review, and is pending evaluation."
                    .to_string(),
                instance_id: None,
                polls: 0,
                launch: launch.clone(),
                availability_zone_group: params.get("AvailabilityZoneGroup").cloned(),
            };
            items.push_str(&render_item(&req));
            state.requests.insert(req.id.clone(), req);
        }
        tracing::debug!("mock: {} spot request(s) placed", count);
        document("RequestSpotInstancesResponse", &format!("<spotInstanceRequestSet>{}</spotInstanceRequestSet>", items))
    }

    fn describe(&self, state: &mut MockState, params: &QueryParams) -> String {
        let ids = indexed_values(params, "SpotInstanceRequestId");
        let filters = filters(params);

        for id in &ids {
            if !state.requests.contains_key(id) {
                return error_document(
                    "InvalidSpotInstanceRequestID.NotFound",
                    &format!("The spot instance request ID '{}' does not exist", id),
                );
            }
        }
        for name in filters.keys() {
            if !matches!(name.as_str(), "state" | "spot-instance-request-id" | "spot-price") {
                return error_document(
                    "InvalidParameterValue",
                    &format!("The filter '{}' is invalid", name),
                );
            }
        }

        let fulfil_after = self.fulfil_after;
        let mut items = String::new();
        for req in state.requests.values_mut() {
            if !ids.is_empty() && !ids.contains(&req.id) {
                continue;
            }
            if req.state == SpotRequestState::Open {
                req.polls += 1;
                if req.polls >= fulfil_after {
                    req.state = SpotRequestState::Active;
                    req.status = "fulfilled".to_string();
                    req.message = "Your Spot request is fulfilled.".to_string();
                    req.instance_id = Some(format!("i-{}", &req.id[4..]));
                }
            }
            let matches_filters = filters.iter().all(|(name, values)| {
                let actual = match name.as_str() {
                    "state" => req.state.as_str().to_string(),
                    "spot-instance-request-id" => req.id.clone(),
                    _ => req.spot_price.clone(),
                };
                values.contains(&actual)
            });
            if matches_filters {
                items.push_str(&render_item(req));
            }
        }
        document(
            "DescribeSpotInstanceRequestsResponse",
            &format!("<spotInstanceRequestSet>{}</spotInstanceRequestSet>", items),
        )
    }

    fn cancel(&self, state: &mut MockState, params: &QueryParams) -> String {
        let mut items = String::new();
        for id in indexed_values(params, "SpotInstanceRequestId") {
            let Some(req) = state.requests.get_mut(&id) else {
                return error_document(
                    "InvalidSpotInstanceRequestID.NotFound",
                    &format!("The spot instance request ID '{}' does not exist", id),
                );
            };
            // Closed and failed requests stay as they are.
            if matches!(req.state, SpotRequestState::Open | SpotRequestState::Active) {
                req.status = if req.instance_id.is_some() {
                    "request-canceled-and-instance-running".to_string()
                } else {
                    "canceled-before-fulfillment".to_string()
                };
                req.message = "Your Spot request is canceled.".to_string();
                req.state = SpotRequestState::Cancelled;
            }
            items.push_str(&format!(
                "<item><spotInstanceRequestId>{}</spotInstanceRequestId><state>{}</state></item>",
                req.id,
                req.state.as_str()
            ));
        }
        document(
            "CancelSpotInstanceRequestsResponse",
            &format!("<spotInstanceRequestSet>{}</spotInstanceRequestSet>", items),
        )
    }
}

#[async_trait]
impl Ec2Connection for MockEc2Connection {
    async fn request(&self, params: &QueryParams) -> Result<XmlElement> {
        let body = self.handle(params)?;
        XmlElement::parse(&body)
    }
}

fn describe_key_pairs(state: &MockState, params: &QueryParams) -> String {
    let wanted = filters(params).remove("key-name").unwrap_or_default();
    let items: String = state
        .key_pairs
        .iter()
        .filter(|(name, _)| wanted.is_empty() || wanted.contains(*name))
        .map(|(name, fingerprint)| {
            format!(
                "<item><keyName>{}</keyName><keyFingerprint>{}</keyFingerprint></item>",
                escape(name),
                fingerprint
            )
        })
        .collect();
    document("DescribeKeyPairsResponse", &format!("<keySet>{}</keySet>", items))
}

fn import_key_pair(state: &mut MockState, params: &QueryParams) -> String {
    let Some(name) = params.get("KeyName").cloned() else {
        return error_document("MissingParameter", "The request must contain the parameter KeyName");
    };
    if state.key_pairs.contains_key(&name) {
        return error_document(
            "InvalidKeyPair.Duplicate",
            &format!("The keypair '{}' already exists.", name),
        );
    }
    let fingerprint = format!("mock:{:04}", state.key_pairs.len() + 1);
    state.key_pairs.insert(name.clone(), fingerprint.clone());
    document(
        "ImportKeyPairResponse",
        &format!(
            "<keyName>{}</keyName><keyFingerprint>{}</keyFingerprint>",
            escape(&name),
            fingerprint
        ),
    )
}

/// Values of `key.1`, `key.2`, ... in index order.
fn indexed_values(params: &QueryParams, key: &str) -> Vec<String> {
    let prefix = format!("{}.", key);
    let mut values: Vec<(u32, String)> = params
        .iter()
        .filter_map(|(k, v)| {
            k.strip_prefix(&prefix)
                .and_then(|idx| idx.parse().ok())
                .map(|idx| (idx, v.clone()))
        })
        .collect();
    values.sort_by_key(|(idx, _)| *idx);
    values.into_iter().map(|(_, v)| v).collect()
}

fn filters(params: &QueryParams) -> BTreeMap<String, Vec<String>> {
    let mut out = BTreeMap::new();
    for n in 1.. {
        let Some(name) = params.get(&format!("Filter.{}.Name", n)) else {
            break;
        };
        out.insert(name.clone(), indexed_values(params, &format!("Filter.{}.Value", n)));
    }
    out
}

fn render_item(req: &MockSpotRequest) -> String {
    let launch = &req.launch;
    let mut spec = String::new();
    let mut field = |tag: &str, value: Option<&String>| {
        if let Some(v) = value {
            spec.push_str(&format!("<{tag}>{}</{tag}>", escape(v)));
        }
    };
    field("imageId", launch.get("ImageId"));
    field("keyName", launch.get("KeyName"));
    field("instanceType", launch.get("InstanceType"));
    field("subnetId", launch.get("SubnetId"));
    field("ebsOptimized", launch.get("EbsOptimized"));

    let groups: String = indexed_values(launch, "SecurityGroup")
        .iter()
        .enumerate()
        .map(|(i, g)| {
            format!(
                "<item><groupId>sg-{:08x}</groupId><groupName>{}</groupName></item>",
                i + 1,
                escape(g)
            )
        })
        .collect();
    spec.push_str(&format!("<groupSet>{}</groupSet>", groups));

    if let Some(zone) = launch.get("Placement.AvailabilityZone") {
        spec.push_str(&format!(
            "<placement><availabilityZone>{}</availabilityZone></placement>",
            escape(zone)
        ));
    }

    let mut mappings = String::new();
    for n in 1.. {
        let Some(device) = launch.get(&format!("BlockDeviceMapping.{}.DeviceName", n)) else {
            break;
        };
        let mut ebs = String::new();
        if let Some(size) = launch.get(&format!("BlockDeviceMapping.{}.Ebs.VolumeSize", n)) {
            ebs.push_str(&format!("<volumeSize>{}</volumeSize>", escape(size)));
        }
        if let Some(del) = launch.get(&format!("BlockDeviceMapping.{}.Ebs.DeleteOnTermination", n)) {
            ebs.push_str(&format!("<deleteOnTermination>{}</deleteOnTermination>", escape(del)));
        }
        if let Some(kind) = launch.get(&format!("BlockDeviceMapping.{}.Ebs.VolumeType", n)) {
            ebs.push_str(&format!("<volumeType>{}</volumeType>", escape(kind)));
        }
        mappings.push_str(&format!(
            "<item><deviceName>{}</deviceName>{}</item>",
            escape(device),
            if ebs.is_empty() { String::new() } else { format!("<ebs>{}</ebs>", ebs) }
        ));
    }
    if !mappings.is_empty() {
        spec.push_str(&format!("<blockDeviceMapping>{}</blockDeviceMapping>", mappings));
    }

    let monitoring = launch
        .get("Monitoring.Enabled")
        .map(String::as_str)
        .unwrap_or("false");
    spec.push_str(&format!("<monitoring><enabled>{}</enabled></monitoring>", monitoring));

    format!(
        "<item><spotInstanceRequestId>{id}</spotInstanceRequestId><spotPrice>{price}</spotPrice>\
         <type>one-time</type><state>{state}</state>\
         <status><code>{code}</code><updateTime>2014-01-01T00:00:00.000Z</updateTime><message>{message}</message></status>\
         <launchSpecification>{spec}</launchSpecification>{instance}{azg}\
         <productDescription>Linux/UNIX</productDescription></item>",
        id = req.id,
        price = escape(&req.spot_price),
        state = req.state.as_str(),
        code = req.status,
        message = escape(&req.message),
        spec = spec,
        instance = req
            .instance_id
            .as_ref()
            .map(|i| format!("<instanceId>{}</instanceId>", i))
            .unwrap_or_default(),
        azg = req
            .availability_zone_group
            .as_ref()
            .map(|g| format!("<availabilityZoneGroup>{}</availabilityZoneGroup>", escape(g)))
            .unwrap_or_default(),
    )
}

fn document(root: &str, body: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<{root} xmlns=\"{XMLNS}\"><requestId>mock-request</requestId>{body}</{root}>"
    )
}

fn error_document(code: &str, message: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Response><Errors><Error><Code>{}</Code><Message>{}</Message></Error></Errors><RequestID>mock-request</RequestID></Response>",
        escape(code),
        escape(message)
    )
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
