//! Advertised endpoints and their directory representation

use serde::{Deserialize, Serialize};

/// A network location advertised under a service name.
#[derive(Clone, Debug, PartialEq)]
pub struct Endpoint {
    pub service_name: String,
    pub address: String,
    pub metadata: Option<serde_json::Value>,
}

impl Endpoint {
    pub fn new(service_name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            address: address.into(),
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Registration key: `<service_name>/<address>`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.service_name, self.address)
    }

    /// Value stored under [`Self::key`].
    ///
    /// # Errors
    /// Returns an error if the metadata cannot be serialized.
    pub fn encode_value(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&StoredEndpoint {
            addr: self.address.clone(),
            metadata: self.metadata.clone(),
        })
    }

    /// Rebuild an endpoint from a stored value.
    ///
    /// # Errors
    /// Returns an error if `value` is not a stored endpoint document.
    pub fn decode_value(
        service_name: impl Into<String>,
        value: &str,
    ) -> Result<Self, serde_json::Error> {
        let stored: StoredEndpoint = serde_json::from_str(value)?;
        Ok(Self {
            service_name: service_name.into(),
            address: stored.addr,
            metadata: stored.metadata,
        })
    }
}

/// Wire shape of the stored value, shared with other naming clients of the
/// same directory.
#[derive(Serialize, Deserialize)]
struct StoredEndpoint {
    #[serde(rename = "Addr")]
    addr: String,
    #[serde(rename = "Metadata", default)]
    metadata: Option<serde_json::Value>,
}
