//! Serde adapters for binary fields carried as base64 strings in JSON
//! payloads.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serializer};

pub(crate) mod bytes {
    use super::{Deserialize, Deserializer, Engine, Serializer, STANDARD};

    pub fn serialize<S: Serializer>(
        bytes: &[u8],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(|e| serde::de::Error::custom(format!("invalid base64: {e}")))
    }
}

pub(crate) mod opt_bytes {
    use super::{Deserialize, Deserializer, Engine, Serializer, STANDARD};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| {
                STANDARD
                    .decode(s)
                    .map_err(|e| serde::de::Error::custom(format!("invalid base64: {e}")))
            })
            .transpose()
    }
}

pub(crate) mod checksum {
    use super::{Deserialize, Deserializer, Engine, Serializer, STANDARD};

    pub fn serialize<S: Serializer>(
        checksum: &[u8; 32],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(checksum))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<[u8; 32], D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| serde::de::Error::custom(format!("invalid base64: {e}")))?;
        bytes.try_into().map_err(|bytes: Vec<u8>| {
            serde::de::Error::custom(format!(
                "checksum must be 32 bytes, got {}",
                bytes.len()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Wrapper {
        #[serde(with = "super::bytes")]
        data: Vec<u8>,
        #[serde(with = "super::checksum")]
        checksum: [u8; 32],
    }

    #[test]
    fn test_bytes_roundtrip() {
        let wrapper = Wrapper {
            data: vec![0, 1, 2, 0xFF],
            checksum: [7u8; 32],
        };

        let json = serde_json::to_string(&wrapper).expect("serialize");
        assert!(json.contains("AAEC/w=="));

        let decoded: Wrapper = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(decoded.data, wrapper.data);
        assert_eq!(decoded.checksum, wrapper.checksum);
    }

    #[test]
    fn test_checksum_length_enforced() {
        let json = r#"{"data":"","checksum":"AAEC"}"#;
        let result: Result<Wrapper, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }
}
