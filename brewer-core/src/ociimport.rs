//! The `oci-import` builder: ingest a pre-built OCI image layout straight
//! from a git tree into the content store, no image build involved.

use std::io::Read;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{BrewError, Result};
use crate::gitstore::CommitFs;
use crate::oci::{self, Descriptor, ImageLayout, Index, Manifest};
use crate::registry::Reference;
use crate::store::ContentStore;

fn read_json_file<T: DeserializeOwned>(fs: &CommitFs, file: &str, context: &str) -> Result<T> {
    let bytes = fs.read_file(file)?;
    serde_json::from_slice(&bytes).map_err(|e| BrewError::JsonDecode {
        digest: context.to_string(),
        source: e,
    })
}

/// Import the OCI image layout at `directory` of `commit` into the
/// content store and point every requested tag at its manifest.
///
/// `file` is either `index.json` (which must then hold exactly one
/// manifest entry) or a bare descriptor file.
pub fn import(
    store: &dyn ContentStore,
    fs: &CommitFs,
    tags: &[String],
    commit: &str,
    directory: &str,
    file: &str,
) -> Result<Descriptor> {
    let fs = fs.sub(directory)?;
    let context = |name: &str| format!("{:?} (from directory {:?} in commit {:?})", name, directory, commit);

    let layout: ImageLayout = read_json_file(&fs, "oci-layout", &context("oci-layout"))?;
    if layout.version != "1.0.0" {
        return Err(BrewError::InvalidLayout {
            reason: format!(
                "unsupported image layout version {:?} in {}",
                layout.version,
                context("oci-layout")
            ),
        });
    }

    let mut manifest_descriptor: Descriptor = if file == "index.json" {
        let index: Index = read_json_file(&fs, file, &context(file))?;
        if index.schema_version != 2 {
            return Err(BrewError::InvalidLayout {
                reason: format!(
                    "unsupported schemaVersion {} in {}",
                    index.schema_version,
                    context(file)
                ),
            });
        }
        if index.manifests.len() != 1 {
            return Err(BrewError::InvalidLayout {
                reason: format!(
                    "expected exactly one manifests entry (not {}) in {}",
                    index.manifests.len(),
                    context(file)
                ),
            });
        }
        index.manifests.into_iter().next().expect("length checked")
    } else {
        read_json_file(&fs, file, &context(file))?
    };

    if manifest_descriptor.media_type != oci::MEDIA_TYPE_OCI_MANIFEST {
        return Err(BrewError::InvalidLayout {
            reason: format!(
                "unsupported mediaType {:?} in descriptor in {}",
                manifest_descriptor.media_type,
                context(file)
            ),
        });
    }
    manifest_descriptor.digest_parts()?;
    if manifest_descriptor.size < 0 {
        return Err(BrewError::InvalidLayout {
            reason: format!(
                "invalid size {} in descriptor in {}",
                manifest_descriptor.size,
                context(file)
            ),
        });
    }

    // ingest a clean descriptor; layout-local annotations and URLs must
    // not leak into the store
    manifest_descriptor.urls = None;
    manifest_descriptor.annotations = None;

    import_blob(store, &fs, &manifest_descriptor, &context(&manifest_descriptor.digest))?;
    let manifest: Manifest = crate::store::read_json(store, &manifest_descriptor)?;

    let blobs = std::iter::once(&manifest.config).chain(manifest.layers.iter());
    for (i, blob) in blobs.enumerate() {
        if i == 0 && blob.media_type != oci::MEDIA_TYPE_OCI_CONFIG {
            return Err(BrewError::InvalidLayout {
                reason: format!(
                    "unsupported mediaType {:?} for config descriptor {}",
                    blob.media_type,
                    context(&blob.digest)
                ),
            });
        }
        if i != 0 && !oci::is_accepted_layer_media_type(&blob.media_type) {
            return Err(BrewError::InvalidLayout {
                reason: format!(
                    "unsupported mediaType {:?} for layer descriptor {}",
                    blob.media_type,
                    context(&blob.digest)
                ),
            });
        }
        if blob.size < 0 {
            return Err(BrewError::InvalidLayout {
                reason: format!(
                    "invalid size {} in blob descriptor {}",
                    blob.size,
                    context(&blob.digest)
                ),
            });
        }
        import_blob(store, &fs, blob, &context(&blob.digest))?;
    }

    for tag in tags {
        let name = Reference::parse(tag)?.canonical();
        store.image_upsert(&name, &manifest_descriptor)?;
        debug!(tag = %name, digest = %manifest_descriptor.digest, "oci-import tagged");
    }

    Ok(manifest_descriptor)
}

/// Copy one blob from `blobs/<algo>/<hex>` in the layout into the store
/// with size and digest enforced. Any stale partial ingest under the same
/// ref is aborted first.
fn import_blob(
    store: &dyn ContentStore,
    fs: &CommitFs,
    descriptor: &Descriptor,
    context: &str,
) -> Result<()> {
    let (algo, encoded) = descriptor.digest_parts()?;
    let path = format!("blobs/{}/{}", algo, encoded);
    let bytes = fs
        .read_file(&path)
        .map_err(|e| BrewError::InvalidLayout {
            reason: format!("failed reading {}: {}", context, e),
        })?;

    store.abort_ingest(&descriptor.digest)?;
    // a limited reader: the store must see at most size+1 bytes so an
    // over-long blob is caught as a size mismatch, not ingested
    let limit = (descriptor.size + 1).max(0) as u64;
    let mut limited = bytes.as_slice().take(limit);
    store.write_blob(&descriptor.digest, descriptor, &mut limited)
}
