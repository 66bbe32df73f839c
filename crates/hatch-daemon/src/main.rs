use anyhow::Result;

use hatch_daemon::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("hatch-daemon")?;
    hatch_daemon::server::run().await
}
