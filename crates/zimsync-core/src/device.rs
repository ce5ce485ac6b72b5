//! Device identity for ZimSync.
//!
//! Every peer carries an immutable [`DeviceInfo`] produced once at startup.
//! It travels in `Announce` payloads and in the mDNS TXT record, so other
//! peers can display who is on the network before connecting.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Platform tag advertised by a device.
///
/// The set is closed on the wire; unrecognized tags deserialize as
/// [`Platform::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum Platform {
    /// macOS desktop
    #[serde(rename = "macOS")]
    MacOs,
    /// iOS phone
    #[serde(rename = "iOS")]
    Ios,
    /// iPadOS tablet
    #[serde(rename = "iPadOS")]
    IpadOs,
    /// Linux
    Linux,
    /// Windows
    Windows,
    /// Anything else
    #[default]
    #[serde(other)]
    Other,
}

impl Platform {
    /// The platform tag of the machine we are running on.
    #[must_use]
    pub const fn current() -> Self {
        if cfg!(target_os = "macos") {
            Self::MacOs
        } else if cfg!(target_os = "ios") {
            Self::Ios
        } else if cfg!(target_os = "linux") {
            Self::Linux
        } else if cfg!(target_os = "windows") {
            Self::Windows
        } else {
            Self::Other
        }
    }
}

/// Identity of a device on the network.
///
/// Produced once at startup and immutable thereafter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Stable device UUID
    pub id: Uuid,
    /// Human-readable device name
    pub name: String,
    /// Platform tag
    pub platform: Platform,
    /// Software version string
    pub version: String,
}

impl DeviceInfo {
    /// Build the identity for this process.
    ///
    /// `name` overrides the host name when given.
    #[must_use]
    pub fn detect(name: Option<&str>) -> Self {
        let name = name.map_or_else(
            || {
                hostname::get().map_or_else(
                    |_| "ZimSync Device".to_string(),
                    |h| h.to_string_lossy().to_string(),
                )
            },
            str::to_string,
        );

        Self {
            id: Uuid::new_v4(),
            name,
            platform: Platform::current(),
            version: crate::VERSION.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_serde_tags() {
        let json = serde_json::to_string(&Platform::MacOs).expect("serialize");
        assert_eq!(json, "\"macOS\"");

        let platform: Platform = serde_json::from_str("\"iPadOS\"").expect("deserialize");
        assert_eq!(platform, Platform::IpadOs);
    }

    #[test]
    fn test_platform_unknown_tag_is_other() {
        let platform: Platform = serde_json::from_str("\"visionOS\"").expect("deserialize");
        assert_eq!(platform, Platform::Other);
    }

    #[test]
    fn test_device_info_roundtrip() {
        let info = DeviceInfo {
            id: Uuid::new_v4(),
            name: "Studio".to_string(),
            platform: Platform::MacOs,
            version: "1.0.0".to_string(),
        };

        let json = serde_json::to_string(&info).expect("serialize");
        let decoded: DeviceInfo = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(decoded, info);
    }

    #[test]
    fn test_detect_uses_override_name() {
        let info = DeviceInfo::detect(Some("Control Room"));
        assert_eq!(info.name, "Control Room");
        assert_eq!(info.version, crate::VERSION);
    }
}
