use async_trait::async_trait;
use ec2spot_common::{Result, SpotError};
use std::sync::Arc;

pub mod ec2;
pub mod region;
pub mod spot;
pub mod xml;

#[cfg(feature = "mock")]
pub mod mock;

pub use ec2::{Filters, QueryParams};
pub use region::Region;
pub use spot::{SpotDriver, SpotRequestOptions};
pub use xml::XmlElement;

/// Provider identifier of the spot driver, distinct from the plain `ec2` driver.
pub const PROVIDER_EC2_SPOT: &str = "ec2spot";

/// Transport to an EC2-compatible query API.
///
/// Implementations own endpoint selection, request signing, retries and HTTP.
/// `params` always carries the `Action`; the returned element is the parsed
/// response document root. Transport failures come back as
/// [`SpotError::Transport`], provider error documents may be returned as-is.
#[async_trait]
pub trait Ec2Connection: Send + Sync {
    async fn request(&self, params: &QueryParams) -> Result<XmlElement>;
}

/// Builds a driver for `provider` in `region`.
pub fn get_driver(provider: &str, region: &str, connection: Arc<dyn Ec2Connection>) -> Result<SpotDriver> {
    match provider.trim().to_lowercase().as_str() {
        PROVIDER_EC2_SPOT => Ok(SpotDriver::new(connection, Region::from_code(region)?)),
        other => Err(SpotError::InvalidParameter(format!("Unknown provider: {}", other))),
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::mock::MockEc2Connection;

    #[test]
    fn factory_resolves_spot_driver_per_region() {
        let conn: Arc<dyn Ec2Connection> = Arc::new(MockEc2Connection::new());
        let driver = get_driver("ec2spot", "eu-west-1", conn.clone()).unwrap();
        assert_eq!(driver.region().code, "eu-west-1");
        assert_eq!(driver.name(), "Amazon EC2 (eu-west-1)");
        assert_eq!(driver.session().provider, PROVIDER_EC2_SPOT);

        assert!(matches!(
            get_driver("ec2", "eu-west-1", conn.clone()),
            Err(SpotError::InvalidParameter(_))
        ));
        assert!(matches!(
            get_driver("ec2spot", "nowhere-1", conn),
            Err(SpotError::InvalidParameter(_))
        ));
    }
}
