//! Discover command implementation.

use std::time::Duration;

use anyhow::{Context, Result};

use zimsync_core::discovery::Browser;

use super::DiscoverArgs;

/// Run the discover command.
pub async fn run(args: DiscoverArgs) -> Result<()> {
    if !args.json {
        println!();
        println!("Browsing for ZimSync peers ({}s)...", args.timeout);
        println!();
    }

    let browser = Browser::new().context("Failed to start mDNS browsing")?;
    let peers = browser.scan(Duration::from_secs(args.timeout)).await;
    browser.shutdown().ok();

    if args.json {
        let output = serde_json::json!({
            "peers": peers.iter().map(|p| serde_json::json!({
                "name": p.name,
                "endpoint": p.endpoint.to_string(),
                "device": p.device_info.as_ref().map(|d| serde_json::json!({
                    "id": d.id.to_string(),
                    "name": d.name,
                    "platform": d.platform,
                    "version": d.version,
                })),
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if peers.is_empty() {
        println!("  (no peers found)");
        return Ok(());
    }

    for peer in &peers {
        let device = peer
            .device_info
            .as_ref()
            .map_or_else(|| "unknown device".to_string(), |d| d.name.clone());
        println!("  {:<21}  {}  ({})", peer.endpoint, peer.name, device);
    }

    Ok(())
}
