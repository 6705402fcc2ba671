//! Secure-connect ("cloud") metadata: the JSON document served by an SNI metadata
//! endpoint, describing how to reach a proxied cluster.

use serde::Deserialize;

use crate::{
    error::{Error, Result},
    options::EndPoint,
};

/// The document returned by the metadata service.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct CloudMetadata {
    /// How to contact the cluster.
    pub contact_info: ContactInfo,
}

/// The `contact_info` section of the metadata document.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct ContactInfo {
    /// The `host:port` of the SNI proxy fronting the cluster.
    pub sni_proxy_address: String,

    /// The datacenter the client should treat as local.
    pub local_dc: String,

    /// Identifiers of the nodes behind the proxy.
    pub contact_points: Vec<String>,
}

impl CloudMetadata {
    /// Parses a metadata document from its JSON form.
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::invalid_argument(format!("invalid cloud metadata: {}", e)))
    }

    /// Fetches the metadata document from an HTTPS endpoint.
    #[cfg(feature = "cloud")]
    pub async fn fetch(url: &str) -> Result<Self> {
        let response = reqwest::get(url)
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| {
                Error::connection_closed(format!("cloud metadata request failed: {}", e))
            })?;
        let body = response.text().await.map_err(|e| {
            Error::connection_closed(format!("cloud metadata request failed: {}", e))
        })?;
        Self::parse(&body)
    }

    /// The SNI proxy as a driver endpoint.
    pub fn sni_endpoint(&self) -> Result<EndPoint> {
        EndPoint::parse(&self.contact_info.sni_proxy_address)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_the_metadata_document() {
        let metadata = CloudMetadata::parse(
            r#"{
                "contact_info": {
                    "sni_proxy_address": "proxy.example.com:9042",
                    "local_dc": "dc-eu-west",
                    "contact_points": ["4f7f9a52", "9b2c11aa"]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(
            metadata.sni_endpoint().unwrap(),
            EndPoint::new("proxy.example.com", 9042)
        );
        assert_eq!(metadata.contact_info.local_dc, "dc-eu-west");
        assert_eq!(metadata.contact_info.contact_points.len(), 2);
    }

    #[test]
    fn rejects_documents_missing_contact_info() {
        assert!(CloudMetadata::parse("{}").is_err());
    }
}
