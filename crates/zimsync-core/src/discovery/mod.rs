//! mDNS/DNS-SD discovery for ZimSync.
//!
//! Servers advertise themselves under `_zimsync._udp.local.` with a TXT
//! record whose `info` key carries the serialized [`DeviceInfo`]. Browsers
//! collect `(name, endpoint, optional device info)` tuples; a missing or
//! malformed TXT record is tolerated and simply yields no device info.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};

use crate::device::DeviceInfo;
use crate::error::{Error, Result};

/// mDNS service type for ZimSync.
pub const SERVICE_TYPE: &str = "_zimsync._udp.local.";

/// TXT record key carrying the serialized device info.
pub const TXT_INFO_KEY: &str = "info";

/// A peer found while browsing.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    /// Service instance name
    pub name: String,
    /// Endpoint to connect to
    pub endpoint: SocketAddr,
    /// Device info from the TXT record, when present and well-formed
    pub device_info: Option<DeviceInfo>,
}

impl DiscoveredPeer {
    /// Parse from a resolved `ServiceInfo`.
    fn from_service_info(info: &ServiceInfo) -> Option<Self> {
        let addresses = info.get_addresses();
        let ip = addresses.iter().find(|addr| addr.is_ipv4())?;
        let endpoint = SocketAddr::new(*ip, info.get_port());

        let device_info = info
            .get_properties()
            .get(TXT_INFO_KEY)
            .and_then(|p| serde_json::from_str(p.val_str()).ok());

        let name = info
            .get_fullname()
            .strip_suffix(&format!(".{SERVICE_TYPE}"))
            .unwrap_or_else(|| info.get_fullname())
            .to_string();

        Some(Self {
            name,
            endpoint,
            device_info,
        })
    }
}

/// Advertises this device's server on the local network.
pub struct Advertiser {
    daemon: Option<ServiceDaemon>,
    instance_name: Option<String>,
}

impl Advertiser {
    /// Create an advertiser.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Discovery`] if the mDNS daemon cannot be created.
    pub fn new() -> Result<Self> {
        let daemon =
            ServiceDaemon::new().map_err(|e| Error::Discovery(format!("mDNS daemon error: {e}")))?;

        Ok(Self {
            daemon: Some(daemon),
            instance_name: None,
        })
    }

    /// Register the service for `device` on `port`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Discovery`] if registration fails.
    pub fn register(&mut self, device: &DeviceInfo, port: u16) -> Result<()> {
        let instance_name = device.name.clone();

        let info_json = serde_json::to_string(device)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let raw_hostname = hostname::get().map_or_else(
            |_| "localhost".to_string(),
            |h| h.to_string_lossy().to_string(),
        );
        let hostname = if raw_hostname.ends_with(".local.") {
            raw_hostname
        } else if raw_hostname.to_lowercase().ends_with(".local") {
            format!("{raw_hostname}.")
        } else {
            format!("{raw_hostname}.local.")
        };

        let service_info = ServiceInfo::new(
            SERVICE_TYPE,
            &instance_name,
            &hostname,
            (),
            port,
            &[(TXT_INFO_KEY, info_json.as_str())][..],
        )
        .map_err(|e| Error::Discovery(format!("failed to create mDNS service info: {e}")))?
        .enable_addr_auto();

        self.daemon
            .as_ref()
            .ok_or_else(|| Error::Discovery("mDNS daemon already shut down".to_string()))?
            .register(service_info)
            .map_err(|e| Error::Discovery(format!("failed to register mDNS service: {e}")))?;

        self.instance_name = Some(instance_name.clone());
        tracing::info!(instance = %instance_name, port, "Registered mDNS service");
        Ok(())
    }

    /// Unregister the service, if registered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Discovery`] if unregistration fails.
    pub fn unregister(&mut self) -> Result<()> {
        if let Some(instance_name) = self.instance_name.take() {
            let full_name = format!("{instance_name}.{SERVICE_TYPE}");

            let receiver = self
                .daemon
                .as_ref()
                .ok_or_else(|| Error::Discovery("mDNS daemon already shut down".to_string()))?
                .unregister(&full_name)
                .map_err(|e| Error::Discovery(format!("failed to unregister: {e}")))?;

            match receiver.recv_timeout(Duration::from_millis(500)) {
                Ok(status) => {
                    tracing::debug!(instance = %instance_name, ?status, "mDNS unregister completed");
                }
                Err(_) => {
                    tracing::debug!(instance = %instance_name, "mDNS unregister timed out");
                }
            }
        }
        Ok(())
    }
}

impl Drop for Advertiser {
    fn drop(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            match daemon.shutdown() {
                Ok(receiver) => {
                    if receiver.recv_timeout(Duration::from_millis(500)).is_err() {
                        tracing::debug!("mDNS advertiser drop shutdown timed out");
                    }
                }
                Err(e) => {
                    tracing::debug!("mDNS advertiser shutdown during drop: {e}");
                }
            }
        }
    }
}

/// Browses the local network for ZimSync servers.
pub struct Browser {
    daemon: Option<ServiceDaemon>,
    receiver: flume::Receiver<ServiceEvent>,
}

impl Browser {
    /// Create a browser and start watching for services.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Discovery`] if the mDNS daemon cannot be created.
    pub fn new() -> Result<Self> {
        let daemon =
            ServiceDaemon::new().map_err(|e| Error::Discovery(format!("mDNS daemon error: {e}")))?;

        let receiver = daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| Error::Discovery(format!("failed to browse: {e}")))?;

        Ok(Self {
            daemon: Some(daemon),
            receiver,
        })
    }

    /// Collect every peer resolved within `duration`, deduplicated by
    /// endpoint.
    pub async fn scan(&self, duration: Duration) -> Vec<DiscoveredPeer> {
        let mut discovered: HashMap<SocketAddr, DiscoveredPeer> = HashMap::new();
        let deadline = tokio::time::Instant::now() + duration;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            let result =
                tokio::time::timeout(remaining, self.receiver.recv_async()).await;

            match result {
                Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                    if let Some(peer) = DiscoveredPeer::from_service_info(&info) {
                        tracing::debug!(name = %peer.name, endpoint = %peer.endpoint, "Resolved peer");
                        discovered.insert(peer.endpoint, peer);
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => break,
            }
        }

        discovered.into_values().collect()
    }

    /// Stop browsing and shut the daemon down.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Discovery`] if the shutdown fails.
    pub fn shutdown(mut self) -> Result<()> {
        if let Some(daemon) = self.daemon.take() {
            if let Err(e) = daemon.stop_browse(SERVICE_TYPE) {
                tracing::debug!("Failed to stop mDNS browse: {e}");
            }

            let receiver = daemon
                .shutdown()
                .map_err(|e| Error::Discovery(format!("failed to shut down daemon: {e}")))?;

            match receiver.recv_timeout(Duration::from_millis(500)) {
                Ok(status) => {
                    tracing::debug!(?status, "mDNS browser shutdown completed");
                }
                Err(flume::RecvTimeoutError::Timeout) => {
                    tracing::debug!("mDNS browser shutdown timed out");
                }
                Err(flume::RecvTimeoutError::Disconnected) => {
                    tracing::debug!("mDNS browser shutdown channel disconnected");
                }
            }
        }
        Ok(())
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            if let Err(e) = daemon.stop_browse(SERVICE_TYPE) {
                tracing::debug!("Failed to stop mDNS browse during drop: {e}");
            }
            match daemon.shutdown() {
                Ok(receiver) => {
                    if receiver.recv_timeout(Duration::from_millis(500)).is_err() {
                        tracing::debug!("mDNS browser drop shutdown timed out");
                    }
                }
                Err(e) => {
                    tracing::debug!("mDNS browser shutdown during drop: {e}");
                }
            }
        }
    }
}
