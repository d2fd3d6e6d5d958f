//! Resolve one expression against a single range server.
//!
//!     cargo run --example simple -- range.example.com %allhosts

use range_client::Querier;
use range_client::QuerierConfig;
use range_client::new_querier;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let server = args.next().unwrap_or_else(|| "range.example.com".to_string());
    let expression = args.next().unwrap_or_else(|| "%allhosts".to_string());

    let querier = new_querier(QuerierConfig {
        servers: vec![server],
        ..QuerierConfig::default()
    })?;

    for line in querier.query(&expression).await? {
        println!("{line}");
    }
    querier.close().await?;
    Ok(())
}
