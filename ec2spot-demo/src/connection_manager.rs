use crate::settings::DemoSettings;
use ec2spot_providers::Ec2Connection;
use std::sync::Arc;

pub struct ConnectionManager;

impl ConnectionManager {
    /// Connection for `settings.connection`, or `None` when that transport is
    /// not compiled in.
    ///
    /// Only the in-memory mock is built here. `ACCESSID`/`SECRETKEY` are meant
    /// for a signed HTTP transport, which this crate does not include; the mock
    /// ignores them.
    pub fn get_connection(settings: &DemoSettings) -> Option<Arc<dyn Ec2Connection>> {
        match settings.connection.to_lowercase().as_str() {
            #[cfg(feature = "connection-mock")]
            "mock" => Some(Arc::new(
                ec2spot_providers::mock::MockEc2Connection::with_fulfil_after(settings.mock_fulfil_after),
            )),
            // Signed HTTP transports plug in here.
            _ => None,
        }
    }
}
