//! OCI content types: descriptors, manifests, indexes, image layouts.
//!
//! These are the JSON shapes exchanged with registries and OCI image
//! layouts. Only the fields brewer consumes are modeled; unknown fields
//! are ignored on decode.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::arch::OciPlatform;
use crate::error::{BrewError, Result};

pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
pub const MEDIA_TYPE_OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MEDIA_TYPE_OCI_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// The annotation carrying the image reference a descriptor was tagged with.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// `(mediaType, digest, size[, platform])` -- the unit of content
/// addressing over the registry API and in image layouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<OciPlatform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    pub fn is_image_manifest(&self) -> bool {
        self.media_type == MEDIA_TYPE_OCI_MANIFEST || self.media_type == MEDIA_TYPE_DOCKER_MANIFEST
    }

    pub fn is_image_index(&self) -> bool {
        self.media_type == MEDIA_TYPE_OCI_INDEX
            || self.media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
    }

    /// Split the digest into `(algorithm, encoded)`, validating its shape.
    pub fn digest_parts(&self) -> Result<(&str, &str)> {
        digest_parts(&self.digest)
    }
}

/// Validate a digest string (`sha256:<hex>` / `sha512:<hex>`) and split it.
pub fn digest_parts(digest: &str) -> Result<(&str, &str)> {
    let (algo, encoded) = digest.split_once(':').ok_or_else(|| BrewError::InvalidLayout {
        reason: format!("invalid digest {:?}", digest),
    })?;
    let hex_len = match algo {
        "sha256" => 64,
        "sha512" => 128,
        _ => {
            return Err(BrewError::InvalidLayout {
                reason: format!("unsupported digest algorithm in {:?}", digest),
            })
        }
    };
    if encoded.len() != hex_len
        || !encoded.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
    {
        return Err(BrewError::InvalidLayout {
            reason: format!("invalid digest {:?}", digest),
        });
    }
    Ok((algo, encoded))
}

/// An OCI image manifest (config + layers).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// An OCI image index (manifest list).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub schema_version: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

/// The `oci-layout` marker file of an OCI image layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageLayout {
    #[serde(rename = "imageLayoutVersion")]
    pub version: String,
}

/// The subset of an image config blob used to fill in missing platforms.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageConfigPlatform {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub variant: String,
}

impl ImageConfigPlatform {
    pub fn platform(&self) -> OciPlatform {
        OciPlatform {
            os: self.os.clone(),
            architecture: self.architecture.clone(),
            variant: self.variant.clone(),
        }
    }
}

/// Is this one of the layer media types accepted by the oci-import path?
pub fn is_accepted_layer_media_type(media_type: &str) -> bool {
    matches!(
        media_type,
        MEDIA_TYPE_OCI_LAYER | MEDIA_TYPE_OCI_LAYER_GZIP | MEDIA_TYPE_OCI_LAYER_ZSTD
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_validation() {
        let good = format!("sha256:{}", "ab".repeat(32));
        assert!(digest_parts(&good).is_ok());

        assert!(digest_parts("sha256:short").is_err());
        assert!(digest_parts("md5:abcd").is_err());
        assert!(digest_parts("not-a-digest").is_err());
        let upper = format!("sha256:{}", "AB".repeat(32));
        assert!(digest_parts(&upper).is_err());
    }

    #[test]
    fn descriptor_media_type_helpers() {
        let mut desc = Descriptor {
            media_type: MEDIA_TYPE_OCI_MANIFEST.to_string(),
            digest: format!("sha256:{}", "00".repeat(32)),
            size: 2,
            platform: None,
            urls: None,
            annotations: None,
        };
        assert!(desc.is_image_manifest());
        assert!(!desc.is_image_index());

        desc.media_type = MEDIA_TYPE_DOCKER_MANIFEST_LIST.to_string();
        assert!(desc.is_image_index());
    }

    #[test]
    fn descriptor_round_trips_camel_case() {
        let json = r#"{"mediaType":"application/vnd.oci.image.manifest.v1+json","digest":"sha256:abcd","size":123}"#;
        let desc: Descriptor = serde_json::from_str(json).unwrap();
        assert_eq!(desc.media_type, MEDIA_TYPE_OCI_MANIFEST);
        assert_eq!(desc.size, 123);
        let back = serde_json::to_string(&desc).unwrap();
        assert_eq!(back, json);
    }
}
