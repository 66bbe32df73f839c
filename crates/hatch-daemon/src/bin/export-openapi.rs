//! Dumps the daemon's OpenAPI document to stdout.

use anyhow::Result;
use hatch_daemon::server::docs::ApiDoc;
use utoipa::OpenApi;

fn main() -> Result<()> {
    println!("{}", ApiDoc::openapi().to_pretty_json()?);
    Ok(())
}
