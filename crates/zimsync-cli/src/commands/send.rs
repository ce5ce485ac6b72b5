//! Send command implementation.
//!
//! Probes a peer and reports whether it already has the named file. The
//! actual byte movement is pull-driven (see `fetch`), so "send" is an offer
//! check: discover the peer, compare its catalog against the local file.

use anyhow::{Context, Result};

use zimsync_core::client::SyncClient;
use zimsync_core::device::DeviceInfo;
use zimsync_core::file::{format_size, prepare_file_for_transfer};

use super::SendArgs;

/// Run the send command.
pub async fn run(args: SendArgs) -> Result<()> {
    let local = prepare_file_for_transfer(&args.file)
        .await
        .with_context(|| format!("Cannot read '{}'", args.file.display()))?;

    let config = super::load_config();
    let endpoint = super::endpoint_for(&args.host, args.port)?;
    let mut client = SyncClient::connect_with_timeout(
        endpoint,
        DeviceInfo::detect(None),
        std::time::Duration::from_secs(config.connect_timeout_secs),
    )
    .await
    .with_context(|| format!("Failed to connect to {endpoint}"))?;

    let catalog = client
        .discover()
        .await
        .with_context(|| format!("Discovery against {endpoint} failed"))?;

    println!(
        "{} ({}, {}), {} free",
        catalog.device_info.name,
        endpoint,
        catalog.supported_features.join(", "),
        format_size(u64::try_from(catalog.available_space).unwrap_or(0)),
    );
    println!("Shared files: {}", catalog.files.len());
    for meta in catalog.files.iter().take(10) {
        println!("  {:<32}  {:>10}", meta.path, format_size(meta.size));
    }

    match catalog.files.iter().find(|f| f.path == local.path) {
        Some(remote) if remote.checksum == local.checksum => {
            println!("Peer already has '{}' with a matching checksum.", local.path);
        }
        Some(_) => {
            println!("Peer has '{}' but its content differs.", local.path);
        }
        None => {
            println!(
                "Peer does not have '{}'; run `zimsync fetch` from the other side to move it.",
                local.path
            );
        }
    }

    client.close().await;
    Ok(())
}
