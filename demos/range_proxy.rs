//! Run a caching range proxy in front of one or more range servers.
//!
//!     cargo run --example range-proxy -- 8080 range1.example.com range2.example.com

use std::time::Duration;

use range_client::proxy::ProxyConfig;
use range_client::proxy::serve;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let port: u16 = args.next().map(|p| p.parse()).transpose()?.unwrap_or(8080);
    let servers: Vec<String> = args.collect();
    anyhow::ensure!(!servers.is_empty(), "at least one range server is required");

    serve(ProxyConfig {
        port,
        servers,
        check_version_periodicity: Duration::from_secs(15),
    })
    .await?;
    Ok(())
}
