//! Local OCI content store: a content-addressed blob store plus an image
//! name index, used both as the build cache and as the staging area for
//! pushes.
//!
//! The embedded implementation keeps blobs under
//! `<cache>/containerd/<arch>/content/blobs/<algo>/<hex>` with a sled
//! metadata database beside them. Writes are single-writer per ingest
//! ref; stale partial ingests must be aborted before a new write.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{BrewError, Result};
use crate::oci::{self, Descriptor};

/// The content-store seam consumed by the build planner, the oci-import
/// path and the pusher.
pub trait ContentStore {
    /// The descriptor an image name points at, if any.
    fn image_get(&self, name: &str) -> Result<Option<Descriptor>>;

    /// Point `name` at `target` (update when the name exists, else
    /// create).
    fn image_upsert(&self, name: &str, target: &Descriptor) -> Result<()>;

    fn blob_exists(&self, digest: &str) -> Result<bool>;

    /// Discard a stale partial ingest under `reference` (no-op when there
    /// is none).
    fn abort_ingest(&self, reference: &str) -> Result<()>;

    /// Ingest a blob under `reference`, verifying size and digest against
    /// `expected`. An ingest already in progress under the same ref is a
    /// conflict.
    fn write_blob(
        &self,
        reference: &str,
        expected: &Descriptor,
        reader: &mut dyn Read,
    ) -> Result<()>;

    fn read_blob(&self, digest: &str) -> Result<Vec<u8>>;
}

/// Walk every descriptor reachable from `desc` (the manifest itself, its
/// config and layers; for an index, all member manifests first).
pub fn reachable_descriptors(store: &dyn ContentStore, desc: &Descriptor) -> Result<Vec<Descriptor>> {
    let mut out = Vec::new();
    collect_reachable(store, desc, &mut out)?;
    Ok(out)
}

fn collect_reachable(
    store: &dyn ContentStore,
    desc: &Descriptor,
    out: &mut Vec<Descriptor>,
) -> Result<()> {
    if desc.is_image_index() {
        let index: oci::Index = read_json(store, desc)?;
        for member in &index.manifests {
            collect_reachable(store, member, out)?;
        }
    } else if desc.is_image_manifest() {
        let manifest: oci::Manifest = read_json(store, desc)?;
        out.push(manifest.config.clone());
        for layer in &manifest.layers {
            out.push(layer.clone());
        }
    }
    out.push(desc.clone());
    Ok(())
}

/// Decode a JSON blob from the store.
pub fn read_json<T: serde::de::DeserializeOwned>(
    store: &dyn ContentStore,
    desc: &Descriptor,
) -> Result<T> {
    let bytes = store.read_blob(&desc.digest)?;
    serde_json::from_slice(&bytes).map_err(|e| BrewError::JsonDecode {
        digest: desc.digest.clone(),
        source: e,
    })
}

/// Write an OCI image layout tarball for `desc` to `out`, tagging the
/// index entry with each of `names` (this is what `docker load`
/// consumes).
pub fn export_oci_layout(
    store: &dyn ContentStore,
    desc: &Descriptor,
    names: &[String],
    out: &mut dyn Write,
) -> Result<()> {
    let mut builder = tar::Builder::new(out);

    let layout = serde_json::to_vec(&oci::ImageLayout {
        version: "1.0.0".to_string(),
    })
    .expect("static layout serializes");
    append_file(&mut builder, "oci-layout", &layout)?;

    let mut manifests = Vec::new();
    for name in names {
        let mut entry = desc.clone();
        let mut annotations = entry.annotations.take().unwrap_or_default();
        annotations.insert(oci::ANNOTATION_REF_NAME.to_string(), name.clone());
        annotations.insert("io.containerd.image.name".to_string(), name.clone());
        entry.annotations = Some(annotations);
        manifests.push(entry);
    }
    if manifests.is_empty() {
        manifests.push(desc.clone());
    }
    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": oci::MEDIA_TYPE_OCI_INDEX,
        "manifests": manifests,
    });
    append_file(
        &mut builder,
        "index.json",
        &serde_json::to_vec(&index).expect("index serializes"),
    )?;

    let mut seen = std::collections::HashSet::new();
    for blob in reachable_descriptors(store, desc)? {
        if !seen.insert(blob.digest.clone()) {
            continue;
        }
        let (algo, encoded) = blob.digest_parts()?;
        let data = store.read_blob(&blob.digest)?;
        append_file(&mut builder, &format!("blobs/{}/{}", algo, encoded), &data)?;
    }

    builder
        .finish()
        .map_err(|e| BrewError::io("oci layout tar", e))?;
    Ok(())
}

fn append_file<W: Write>(builder: &mut tar::Builder<W>, path: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, path, data)
        .map_err(|e| BrewError::io(path, e))
}

/// Import an OCI image layout tarball (as produced by `buildx --output
/// type=oci`), ingesting every blob and registering the index's tagged
/// manifests. Returns the `(name, descriptor)` pairs registered.
pub fn import_oci_layout_tar(
    store: &dyn ContentStore,
    reader: &mut dyn Read,
) -> Result<Vec<(String, Descriptor)>> {
    let mut archive = tar::Archive::new(reader);
    let mut index_bytes: Option<Vec<u8>> = None;

    for entry in archive
        .entries()
        .map_err(|e| BrewError::io("oci tarball", e))?
    {
        let mut entry = entry.map_err(|e| BrewError::io("oci tarball", e))?;
        let path = entry
            .path()
            .map_err(|e| BrewError::io("oci tarball", e))?
            .to_string_lossy()
            .into_owned();

        if path == "index.json" {
            let mut bytes = Vec::new();
            entry
                .read_to_end(&mut bytes)
                .map_err(|e| BrewError::io(path, e))?;
            index_bytes = Some(bytes);
            continue;
        }

        let Some(rest) = path.strip_prefix("blobs/") else {
            continue;
        };
        let Some((algo, encoded)) = rest.split_once('/') else {
            continue;
        };
        let digest = format!("{}:{}", algo, encoded);
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .map_err(|e| BrewError::io(path, e))?;
        let expected = Descriptor {
            media_type: "application/octet-stream".to_string(),
            digest: digest.clone(),
            size: bytes.len() as i64,
            platform: None,
            urls: None,
            annotations: None,
        };
        store.abort_ingest(&digest)?;
        store.write_blob(&digest, &expected, &mut bytes.as_slice())?;
    }

    let index_bytes = index_bytes.ok_or_else(|| BrewError::InvalidLayout {
        reason: "tarball carries no index.json".to_string(),
    })?;
    let index: oci::Index =
        serde_json::from_slice(&index_bytes).map_err(|e| BrewError::JsonDecode {
            digest: "index.json".to_string(),
            source: e,
        })?;

    let mut registered = Vec::new();
    for mut desc in index.manifests {
        let name = desc
            .annotations
            .as_ref()
            .and_then(|a| {
                a.get("io.containerd.image.name")
                    .or_else(|| a.get(oci::ANNOTATION_REF_NAME))
            })
            .cloned();
        if let Some(name) = name {
            // annotations may carry familiar names; store records are
            // keyed by the fully-qualified form
            let name = crate::registry::Reference::parse(&name)
                .map(|r| r.canonical())
                .unwrap_or(name);
            desc.annotations = None;
            store.image_upsert(&name, &desc)?;
            registered.push((name, desc));
        }
    }
    Ok(registered)
}

/// The embedded store: blob CAS + sled image index under one root.
pub struct EmbeddedStore {
    root: PathBuf,
    db: sled::Db,
}

/// How long to keep retrying a locked metadata database before giving up.
const DB_OPEN_TIMEOUT: Duration = Duration::from_secs(60);

impl EmbeddedStore {
    /// Open (or create) the store at `root` (`<cache>/containerd/<arch>`).
    pub fn open(root: &Path) -> Result<EmbeddedStore> {
        let content = root.join("content");
        std::fs::create_dir_all(content.join("ingest"))
            .map_err(|e| BrewError::io(&content, e))?;

        let db_path = root.join("metadata.db");
        let deadline = Instant::now() + DB_OPEN_TIMEOUT;
        let db = loop {
            match sled::open(&db_path) {
                Ok(db) => break db,
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(BrewError::Conflict {
                            reference: format!("{} ({})", db_path.display(), e),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(250));
                }
            }
        };

        Ok(EmbeddedStore {
            root: root.to_path_buf(),
            db,
        })
    }

    fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let (algo, encoded) = oci::digest_parts(digest)?;
        Ok(self
            .root
            .join("content")
            .join("blobs")
            .join(algo)
            .join(encoded))
    }

    fn ingest_path(&self, reference: &str) -> PathBuf {
        let mut name = String::with_capacity(reference.len());
        for c in reference.chars() {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                name.push(c);
            } else {
                name.push('-');
            }
        }
        self.root.join("content").join("ingest").join(name)
    }
}

impl ContentStore for EmbeddedStore {
    fn image_get(&self, name: &str) -> Result<Option<Descriptor>> {
        let value = self
            .db
            .get(name.as_bytes())
            .map_err(|e| BrewError::Conflict {
                reference: format!("{}: {}", name, e),
            })?;
        match value {
            Some(bytes) => {
                let desc = serde_json::from_slice(&bytes).map_err(|e| BrewError::JsonDecode {
                    digest: name.to_string(),
                    source: e,
                })?;
                Ok(Some(desc))
            }
            None => Ok(None),
        }
    }

    fn image_upsert(&self, name: &str, target: &Descriptor) -> Result<()> {
        let bytes = serde_json::to_vec(target).expect("descriptor serializes");
        self.db
            .insert(name.as_bytes(), bytes)
            .map_err(|e| BrewError::Conflict {
                reference: format!("{}: {}", name, e),
            })?;
        self.db.flush().map_err(|e| BrewError::Conflict {
            reference: format!("{}: {}", name, e),
        })?;
        info!(name, digest = %target.digest, "image record updated");
        Ok(())
    }

    fn blob_exists(&self, digest: &str) -> Result<bool> {
        Ok(self.blob_path(digest)?.exists())
    }

    fn abort_ingest(&self, reference: &str) -> Result<()> {
        let path = self.ingest_path(reference);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(reference, "aborted stale ingest");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BrewError::io(path, e)),
        }
    }

    fn write_blob(
        &self,
        reference: &str,
        expected: &Descriptor,
        reader: &mut dyn Read,
    ) -> Result<()> {
        let blob_path = self.blob_path(&expected.digest)?;
        if blob_path.exists() {
            // content-addressed: an existing blob is already correct
            return Ok(());
        }

        let ingest = self.ingest_path(reference);
        if ingest.exists() {
            return Err(BrewError::Conflict {
                reference: reference.to_string(),
            });
        }

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&ingest)
            .map_err(|e| BrewError::io(&ingest, e))?;

        let mut hasher = Sha256::new();
        let mut written: i64 = 0;
        let mut buf = [0u8; 64 * 1024];
        let result = loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(BrewError::io(&ingest, e)),
            };
            written += n as i64;
            if written > expected.size {
                break Err(BrewError::SizeMismatch {
                    digest: expected.digest.clone(),
                    expected: expected.size,
                    actual: written,
                });
            }
            hasher.update(&buf[..n]);
            if let Err(e) = file.write_all(&buf[..n]) {
                break Err(BrewError::io(&ingest, e));
            }
        };

        let finish = result.and_then(|()| {
            if written != expected.size {
                return Err(BrewError::SizeMismatch {
                    digest: expected.digest.clone(),
                    expected: expected.size,
                    actual: written,
                });
            }
            let digest = format!("sha256:{}", hex::encode(hasher.finalize_reset()));
            if digest != expected.digest {
                return Err(BrewError::DigestMismatch {
                    digest: expected.digest.clone(),
                });
            }
            Ok(())
        });

        drop(file);
        if let Err(e) = finish {
            let _ = std::fs::remove_file(&ingest);
            return Err(e);
        }

        if let Some(parent) = blob_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| BrewError::io(parent, e))?;
        }
        std::fs::rename(&ingest, &blob_path).map_err(|e| BrewError::io(&blob_path, e))?;
        debug!(digest = %expected.digest, size = expected.size, "blob ingested");
        Ok(())
    }

    fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest)?;
        std::fs::read(&path).map_err(|e| BrewError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor_for(bytes: &[u8], media_type: &str) -> Descriptor {
        Descriptor {
            media_type: media_type.to_string(),
            digest: format!("sha256:{}", hex::encode(Sha256::digest(bytes))),
            size: bytes.len() as i64,
            platform: None,
            urls: None,
            annotations: None,
        }
    }

    #[test]
    fn blob_ingest_verifies_size_and_digest() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = EmbeddedStore::open(dir.path()).unwrap();

        let data = b"blob contents";
        let desc = descriptor_for(data, "application/octet-stream");

        store
            .write_blob("ref-1", &desc, &mut data.as_slice())
            .unwrap();
        assert!(store.blob_exists(&desc.digest).unwrap());
        assert_eq!(store.read_blob(&desc.digest).unwrap(), data);

        // truncated payload: size mismatch
        let short = descriptor_for(b"other longer contents", "application/octet-stream");
        let err = store
            .write_blob("ref-2", &short, &mut &b"other"[..])
            .unwrap_err();
        assert!(matches!(err, BrewError::SizeMismatch { .. }), "{err}");

        // right size, wrong bytes: digest mismatch
        let mut tampered = descriptor_for(b"aaaa", "application/octet-stream");
        tampered.digest = format!("sha256:{}", "00".repeat(32));
        let err = store
            .write_blob("ref-3", &tampered, &mut &b"aaaa"[..])
            .unwrap_err();
        assert!(matches!(err, BrewError::DigestMismatch { .. }), "{err}");
    }

    #[test]
    fn failed_ingests_must_be_aborted_before_retry() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = EmbeddedStore::open(dir.path()).unwrap();

        // simulate a stale partial ingest
        let stale = store.ingest_path("stuck-ref");
        std::fs::write(&stale, b"partial").unwrap();

        let data = b"payload";
        let desc = descriptor_for(data, "application/octet-stream");
        let err = store
            .write_blob("stuck-ref", &desc, &mut data.as_slice())
            .unwrap_err();
        assert!(matches!(err, BrewError::Conflict { .. }), "{err}");

        store.abort_ingest("stuck-ref").unwrap();
        store
            .write_blob("stuck-ref", &desc, &mut data.as_slice())
            .unwrap();
        assert!(store.blob_exists(&desc.digest).unwrap());

        // aborting a nonexistent ingest is a no-op
        store.abort_ingest("never-started").unwrap();
    }

    #[test]
    fn image_records_upsert() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = EmbeddedStore::open(dir.path()).unwrap();

        assert!(store.image_get("docker.io/library/bash:latest").unwrap().is_none());

        let desc = descriptor_for(b"{}", oci::MEDIA_TYPE_OCI_MANIFEST);
        store
            .image_upsert("docker.io/library/bash:latest", &desc)
            .unwrap();
        assert_eq!(
            store
                .image_get("docker.io/library/bash:latest")
                .unwrap()
                .unwrap(),
            desc
        );

        // update in place
        let other = descriptor_for(b"{\"schemaVersion\":2}", oci::MEDIA_TYPE_OCI_MANIFEST);
        store
            .image_upsert("docker.io/library/bash:latest", &other)
            .unwrap();
        assert_eq!(
            store
                .image_get("docker.io/library/bash:latest")
                .unwrap()
                .unwrap()
                .digest,
            other.digest
        );
    }

    fn seed_image(store: &EmbeddedStore) -> Descriptor {
        let config = br#"{"architecture":"amd64","os":"linux"}"#.to_vec();
        let config_desc = descriptor_for(&config, oci::MEDIA_TYPE_OCI_CONFIG);
        store
            .write_blob("config", &config_desc, &mut config.as_slice())
            .unwrap();

        let layer = b"layer bytes".to_vec();
        let layer_desc = descriptor_for(&layer, oci::MEDIA_TYPE_OCI_LAYER);
        store
            .write_blob("layer", &layer_desc, &mut layer.as_slice())
            .unwrap();

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": oci::MEDIA_TYPE_OCI_MANIFEST,
            "config": config_desc,
            "layers": [layer_desc],
        });
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
        let manifest_desc = descriptor_for(&manifest_bytes, oci::MEDIA_TYPE_OCI_MANIFEST);
        store
            .write_blob("manifest", &manifest_desc, &mut manifest_bytes.as_slice())
            .unwrap();
        manifest_desc
    }

    #[test]
    fn export_and_reimport_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = EmbeddedStore::open(dir.path()).unwrap();
        let manifest_desc = seed_image(&store);

        let mut tarball = Vec::new();
        export_oci_layout(
            &store,
            &manifest_desc,
            &["docker.io/library/test:tag".to_string()],
            &mut tarball,
        )
        .unwrap();

        let other_dir = tempfile::TempDir::new().unwrap();
        let other = EmbeddedStore::open(other_dir.path()).unwrap();
        let registered = import_oci_layout_tar(&other, &mut tarball.as_slice()).unwrap();

        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].0, "docker.io/library/test:tag");
        assert_eq!(registered[0].1.digest, manifest_desc.digest);
        assert!(other.blob_exists(&manifest_desc.digest).unwrap());
        assert_eq!(
            other
                .image_get("docker.io/library/test:tag")
                .unwrap()
                .unwrap()
                .digest,
            manifest_desc.digest
        );

        // reachable walk covers config, layer and the manifest itself
        let reachable = reachable_descriptors(&other, &manifest_desc).unwrap();
        assert_eq!(reachable.len(), 3);
    }
}
