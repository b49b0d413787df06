use anyhow::{Context, Result};
use ec2spot_common::{SpotRequest, SpotRequestState};
use ec2spot_providers::spot::SecurityGroups;
use ec2spot_providers::{SpotDriver, SpotRequestOptions};

use crate::settings::DemoSettings;

/// Places one spot request, waits for it to leave OPEN, and cancels it once
/// fulfilled. Returns the last observed record.
///
/// The wait is a fixed-interval poll without timeout or backoff.
pub async fn run(driver: &SpotDriver, settings: &DemoSettings) -> Result<SpotRequest> {
    let mut opts = SpotRequestOptions::new(&settings.image_id, &settings.size_id, &settings.spot_price);
    opts.key_name = settings.key_name.clone();
    if !settings.security_groups.is_empty() {
        opts.security_groups = Some(SecurityGroups::Many(settings.security_groups.clone()));
    }

    let mut spot = driver
        .request_spot_instances(&opts)
        .await?
        .into_iter()
        .next()
        .context("provider returned no spot request")?;
    tracing::info!("Placed {} in {} (bid {})", spot, driver.name(), settings.spot_price);

    while spot.state == SpotRequestState::Open {
        tracing::info!("{}", spot.message.as_deref().unwrap_or("waiting for fulfilment"));
        tokio::time::sleep(settings.poll_interval).await;
        spot = driver
            .list_spot_requests(Some(std::slice::from_ref(&spot.id)), None)
            .await?
            .into_iter()
            .next()
            .with_context(|| format!("spot request {} disappeared", spot.id))?;
    }

    // Terminal states other than ACTIVE are reported as-is.
    if spot.state != SpotRequestState::Active {
        tracing::warn!("{} ended in state {}", spot, spot.state);
        return Ok(spot);
    }

    tracing::info!("{}", spot.message.as_deref().unwrap_or_default());
    tracing::info!("Fulfilled by instance {}", spot.instance_id.as_deref().unwrap_or("?"));

    let cancelled = driver.cancel_spot_instance_request(&spot).await?;
    tracing::info!("Cancel accepted: {}", cancelled);

    let spot = driver
        .list_spot_requests(Some(std::slice::from_ref(&spot.id)), None)
        .await?
        .into_iter()
        .next()
        .with_context(|| format!("spot request {} disappeared", spot.id))?;
    if spot.state != SpotRequestState::Cancelled {
        anyhow::bail!("{} still {} after cancel", spot, spot.state);
    }
    Ok(spot)
}
