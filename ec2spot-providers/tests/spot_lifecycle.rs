// End-to-end spot request flows against the in-memory EC2 endpoint.
use ec2spot_common::{SpotError, SpotRequestState};
use ec2spot_providers::ec2::{BlockDeviceMappingSpec, EbsSpec};
use ec2spot_providers::mock::MockEc2Connection;
use ec2spot_providers::spot::{NodeAuthSshKey, SecurityGroups};
use ec2spot_providers::{get_driver, Ec2Connection, Filters, SpotDriver, SpotRequestOptions};
use std::sync::Arc;

const PUBKEY: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIJ7bSk0HJUd0wqYHGnQzmJx5GI2Dc0L1sGjdqOMGRRrw ops@host";

fn setup(fulfil_after: u32) -> (Arc<MockEc2Connection>, SpotDriver) {
    let conn = Arc::new(MockEc2Connection::with_fulfil_after(fulfil_after));
    let driver = get_driver("ec2spot", "ap-southeast-2", conn.clone() as Arc<dyn Ec2Connection>)
        .expect("driver");
    (conn, driver)
}

fn options() -> SpotRequestOptions {
    let mut opts = SpotRequestOptions::new("ami-f195f1cb", "t1.micro", "0.08");
    opts.key_name = Some("ccg-syd-staging".to_string());
    opts.security_groups = Some(SecurityGroups::Many(vec!["default".to_string(), "ssh".to_string()]));
    opts.block_device_mappings = Some(vec![BlockDeviceMappingSpec {
        device_name: "/dev/sda1".to_string(),
        ebs: Some(EbsSpec {
            volume_size: Some(16),
            delete_on_termination: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }]);
    opts
}

#[tokio::test]
async fn create_poll_cancel() {
    let (_conn, driver) = setup(3);

    let mut spots = driver.request_spot_instances(&options()).await.unwrap();
    assert_eq!(spots.len(), 1);
    let mut spot = spots.remove(0);
    assert_eq!(spot.state, SpotRequestState::Open);
    assert_eq!(spot.instance_id, None);
    assert_eq!(spot.extra.get_str("key_name"), Some("ccg-syd-staging"));
    assert_eq!(spot.extra.groups.len(), 2);
    assert_eq!(spot.extra.block_device_mapping[0].ebs.as_ref().unwrap().volume_size, Some(16));

    let mut polls = 0;
    while spot.state == SpotRequestState::Open {
        polls += 1;
        assert!(polls <= 10, "request never left OPEN");
        spot = driver
            .list_spot_requests(Some(std::slice::from_ref(&spot.id)), None)
            .await
            .unwrap()
            .remove(0);
    }
    assert_eq!(polls, 3);
    assert_eq!(spot.state, SpotRequestState::Active);
    assert!(spot.is_fulfilled());
    assert_eq!(spot.status.as_deref(), Some("fulfilled"));

    assert!(driver.cancel_spot_instance_request(&spot).await.unwrap());
    let after = driver
        .list_spot_requests(Some(std::slice::from_ref(&spot.id)), None)
        .await
        .unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].state, SpotRequestState::Cancelled);
    // Cancelling does not terminate the instance.
    assert_eq!(after[0].instance_id, spot.instance_id);
}

#[tokio::test]
async fn create_many_returns_a_sequence() {
    let (_conn, driver) = setup(1);
    let mut opts = options();
    opts.instance_count = Some(3);
    let spots = driver.request_spot_instances(&opts).await.unwrap();
    assert_eq!(spots.len(), 3);
    let mut ids: Vec<_> = spots.iter().map(|s| s.id.clone()).collect();
    ids.dedup();
    assert_eq!(ids.len(), 3);
    assert!(spots.iter().all(|s| s.driver == *driver.session()));
}

#[tokio::test]
async fn list_with_filters() {
    let (_conn, driver) = setup(100);
    let first = driver.request_spot_instances(&options()).await.unwrap().remove(0);
    let second = driver.request_spot_instances(&options()).await.unwrap().remove(0);
    assert!(driver.cancel_spot_instance_request(&second).await.unwrap());

    let all = driver.list_spot_requests(None, None).await.unwrap();
    assert_eq!(all.len(), 2);

    let open = Filters::from([("state".to_string(), vec!["open".to_string()])]);
    let only_open = driver.list_spot_requests(None, Some(&open)).await.unwrap();
    assert_eq!(only_open.len(), 1);
    assert_eq!(only_open[0].id, first.id);

    // Ids and filters combine.
    let none = driver
        .list_spot_requests(Some(std::slice::from_ref(&second.id)), Some(&open))
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn auth_key_is_imported_then_reused() {
    let (conn, driver) = setup(1);
    let mut opts = options();
    opts.key_name = None;
    opts.auth = Some(NodeAuthSshKey { pubkey: PUBKEY.to_string() });

    let a = driver.request_spot_instances(&opts).await.unwrap().remove(0);
    let b = driver.request_spot_instances(&opts).await.unwrap().remove(0);
    assert_eq!(conn.key_pair_names().len(), 1);
    assert_eq!(a.extra.get_str("key_name"), b.extra.get_str("key_name"));

    let imports = conn
        .sent()
        .iter()
        .filter(|p| p.get("Action").map(String::as_str) == Some("ImportKeyPair"))
        .count();
    assert_eq!(imports, 1);
}

#[tokio::test]
async fn key_known_under_another_name_is_imported_again() {
    let (conn, driver) = setup(1);
    let mut import = ec2spot_providers::QueryParams::new();
    import.insert("Action".to_string(), "ImportKeyPair".to_string());
    import.insert("KeyName".to_string(), "ops".to_string());
    import.insert("PublicKeyMaterial".to_string(), PUBKEY.to_string());
    conn.request(&import).await.unwrap();

    let mut opts = options();
    opts.key_name = None;
    opts.auth = Some(NodeAuthSshKey { pubkey: PUBKEY.to_string() });
    let spot = driver.request_spot_instances(&opts).await.unwrap().remove(0);

    let names = conn.key_pair_names();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"ops".to_string()));
    let derived = ec2spot_providers::ec2::key_pair_name(PUBKEY).unwrap();
    assert!(names.contains(&derived));
    assert_eq!(spot.extra.get_str("key_name"), Some(derived.as_str()));
}

#[tokio::test]
async fn unknown_request_id_is_a_provider_error() {
    let (_conn, driver) = setup(1);
    let ids = vec!["sir-nope".to_string()];
    match driver.list_spot_requests(Some(&ids), None).await {
        Err(SpotError::Provider { code, .. }) => assert_eq!(code, "InvalidSpotInstanceRequestID.NotFound"),
        other => panic!("unexpected {:?}", other),
    }
}
