//! Serve command implementation.

use anyhow::{Context, Result};

use zimsync_core::device::DeviceInfo;
use zimsync_core::discovery::Advertiser;
use zimsync_core::session::SyncServer;

use super::ServeArgs;

/// Run the serve command until interrupted.
pub async fn run(args: ServeArgs) -> Result<()> {
    let config = super::load_config();

    let port = args.port.unwrap_or(config.port);
    let directory = args.directory.unwrap_or(config.shared_dir);
    let name = args.name.unwrap_or(config.device_name);

    anyhow::ensure!(
        directory.is_dir(),
        "shared directory '{}' does not exist",
        directory.display()
    );

    let device = DeviceInfo::detect(Some(&name));

    let server = SyncServer::new(device.clone(), port, directory.clone(), config.inbound_dir)
        .context("Failed to bind server socket")?;
    let addr = server.local_addr().context("Failed to read local address")?;

    let mut advertiser = if args.no_advertise {
        None
    } else {
        match Advertiser::new() {
            Ok(mut advertiser) => {
                advertiser
                    .register(&device, addr.port())
                    .context("Failed to register mDNS service")?;
                Some(advertiser)
            }
            Err(e) => {
                tracing::warn!(error = %e, "mDNS unavailable, serving without advertisement");
                None
            }
        }
    };

    println!("Serving '{}' on {} as \"{}\"", directory.display(), addr, name);
    println!("Press Ctrl-C to stop.");

    let cancel = server.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let result = server.run().await;

    if let Some(advertiser) = advertiser.as_mut() {
        advertiser.unregister().ok();
    }

    result.context("Server terminated with an error")
}
