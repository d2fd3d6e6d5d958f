//! Query through the TTL cache with `%version`-driven refresh.
//!
//! The second query for each expression is answered from the cache; the
//! background loop keeps entries warm while the process runs.
//!
//!     cargo run --example with-cache -- range1.example.com range2.example.com

use std::time::Duration;
use std::time::Instant;

use range_client::Querier;
use range_client::QuerierConfig;
use range_client::new_querier;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let servers: Vec<String> = std::env::args().skip(1).collect();
    let servers = if servers.is_empty() {
        vec!["range.example.com".to_string()]
    } else {
        servers
    };

    let querier = new_querier(QuerierConfig {
        retry_count: servers.len() as u32,
        retry_pause: Duration::from_secs(5),
        servers,
        check_version_periodicity: Duration::from_secs(15),
        ttl: Duration::from_secs(30),
        tte: Duration::from_secs(15 * 60),
        ..QuerierConfig::default()
    })?;

    for expression in ["%allhosts", "%allhosts"] {
        let started = Instant::now();
        let lines = querier.query(expression).await?;
        println!(
            "{expression}: {} lines in {:?}",
            lines.len(),
            started.elapsed()
        );
    }

    querier.close().await?;
    Ok(())
}
