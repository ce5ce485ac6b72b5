//! Fetch command implementation.

use anyhow::{Context, Result};

use zimsync_core::client::SyncClient;
use zimsync_core::device::DeviceInfo;
use zimsync_core::file::format_size;
use zimsync_core::protocol::CompressionType;

use super::FetchArgs;

/// Run the fetch command.
pub async fn run(args: FetchArgs) -> Result<()> {
    let config = super::load_config();
    let compression = CompressionType::from_name(&args.compression)
        .with_context(|| format!("Unknown compression '{}'", args.compression))?;

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

    let Some(meta) = catalog.files.iter().find(|f| f.path == args.file_name) else {
        client.close().await;
        anyhow::bail!(
            "'{}' is not shared by {} ({} files available)",
            args.file_name,
            catalog.device_info.name,
            catalog.files.len()
        );
    };

    println!(
        "Fetching '{}' ({}, {}) from {} at {}...",
        meta.path,
        format_size(meta.size),
        compression.name(),
        catalog.device_info.name,
        client.peer_addr()
    );

    let meta = meta.clone();
    let dest = match client
        .fetch(&meta, &args.output, config.chunk_size, compression)
        .await
    {
        Ok(dest) => dest,
        Err(e) => {
            if e.is_recoverable() {
                eprintln!("The failure may be transient; try again.");
            }
            anyhow::bail!("Transfer failed: {e}");
        }
    };

    println!("Verified and wrote {}", dest.display());
    client.close().await;
    Ok(())
}
