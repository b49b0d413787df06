use ec2spot_providers::{get_driver, PROVIDER_EC2_SPOT};

mod connection_manager;
mod settings;
mod spot_job;

use connection_manager::ConnectionManager;
use settings::DemoSettings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    dotenv::dotenv().ok();

    let settings = DemoSettings::from_env();
    let Some(credentials) = &settings.credentials else {
        println!("ACCESSID and SECRETKEY are sourced from the environment");
        return Ok(());
    };
    tracing::debug!("Credentials loaded for access id {}", credentials.masked_access_id());

    let Some(connection) = ConnectionManager::get_connection(&settings) else {
        anyhow::bail!("No EC2 connection available for '{}'", settings.connection);
    };
    let driver = get_driver(PROVIDER_EC2_SPOT, &settings.region, connection)?;
    println!("✅ Using {} via '{}' connection", driver.name(), settings.connection);

    let spot = spot_job::run(&driver, &settings).await?;
    println!("🏁 {} finished in state {}", spot, spot.state);
    Ok(())
}
