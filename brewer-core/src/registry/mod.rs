//! Registry resolver: authenticated, proxy-aware lookup of manifests,
//! indexes and image configs, with mandatory digest verification of every
//! consumed JSON blob.

mod auth;

pub use auth::{registry_hosts, BearerChallenge, Capabilities, RegistryHost};

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::arch;
use crate::error::{BrewError, Result};
use crate::oci::{self, Descriptor, Index, Manifest};

/// A normalized image reference: host, repository, and tag or digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub host: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl Reference {
    /// Parse a (possibly short) image reference, defaulting the registry
    /// to `docker.io`, the repository namespace to `library/` and the tag
    /// to `latest`.
    pub fn parse(name: &str) -> Result<Reference> {
        let bad = |reason: &str| BrewError::RefUnresolvable {
            reference: name.to_string(),
            reason: reason.to_string(),
        };

        let (rest, digest) = match name.split_once('@') {
            Some((rest, digest)) => {
                oci::digest_parts(digest).map_err(|_| bad("invalid digest"))?;
                (rest, Some(digest.to_string()))
            }
            None => (name, None),
        };

        let (host, remainder) = match rest.split_once('/') {
            Some((first, remainder))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), remainder.to_string())
            }
            _ => ("docker.io".to_string(), rest.to_string()),
        };

        let (repository, tag) = match remainder.rsplit_once(':') {
            Some((repository, tag)) if !tag.contains('/') => {
                (repository.to_string(), Some(tag.to_string()))
            }
            _ => (remainder, None),
        };
        if repository.is_empty() {
            return Err(bad("empty repository"));
        }

        let repository = if host == "docker.io" && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        let tag = match (&tag, &digest) {
            (None, None) => Some("latest".to_string()),
            _ => tag,
        };

        Ok(Reference {
            host,
            repository,
            tag,
            digest,
        })
    }

    /// The fully-qualified form (`docker.io/library/bash:latest`).
    pub fn canonical(&self) -> String {
        let mut out = format!("{}/{}", self.host, self.repository);
        if let Some(tag) = &self.tag {
            out.push(':');
            out.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            out.push('@');
            out.push_str(digest);
        }
        out
    }

    /// The manifest path component: the digest when pinned, else the tag.
    pub fn object(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or("latest")
    }

    pub fn with_digest(&self, digest: &str) -> Reference {
        Reference {
            digest: Some(digest.to_string()),
            ..self.clone()
        }
    }
}

const MANIFEST_ACCEPT: &str = concat!(
    "application/vnd.oci.image.index.v1+json, ",
    "application/vnd.docker.distribution.manifest.list.v2+json, ",
    "application/vnd.oci.image.manifest.v1+json, ",
    "application/vnd.docker.distribution.manifest.v2+json",
);

struct ClientInner {
    http: reqwest::Client,
    /// Bearer tokens keyed by `(auth host, scope)`.
    tokens: RefCell<HashMap<String, String>>,
    /// Remote image-id cache (manifest digest -> config digest).
    image_ids: RefCell<HashMap<String, String>>,
    /// Manifest-list member digests keyed by the list digest.
    manifest_lists: RefCell<HashMap<String, Vec<String>>>,
}

/// Shared registry client (cheap to clone; caches live per run).
#[derive(Clone)]
pub struct RegistryClient {
    inner: Rc<ClientInner>,
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryClient {
    pub fn new() -> RegistryClient {
        RegistryClient {
            inner: Rc::new(ClientInner {
                http: reqwest::Client::new(),
                tokens: RefCell::new(HashMap::new()),
                image_ids: RefCell::new(HashMap::new()),
                manifest_lists: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// Issue one request against `host`, handling Basic and bearer-token
    /// authentication (with a per-scope token cache).
    async fn request(
        &self,
        host: &RegistryHost,
        method: reqwest::Method,
        url: &str,
        accept: &str,
        scope: &str,
        body: Option<(Vec<u8>, &str)>,
    ) -> Result<reqwest::Response> {
        let token_key = format!("{}\n{}", host.auth_host, scope);

        let build = |token: Option<String>, body: Option<(Vec<u8>, &str)>| {
            let mut request = self.inner.http.request(method.clone(), url);
            if !accept.is_empty() {
                request = request.header(reqwest::header::ACCEPT, accept);
            }
            if let Some((bytes, content_type)) = body {
                request = request
                    .header(reqwest::header::CONTENT_TYPE, content_type)
                    .body(bytes);
            }
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
            request
        };

        let cached = self.inner.tokens.borrow().get(&token_key).cloned();
        let response = build(cached, body.clone()).send().await?;
        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let challenge = match challenge {
            Some(header) => header,
            None => return Ok(response),
        };

        if let Some(bearer) = auth::parse_bearer_challenge(&challenge) {
            let token = self.fetch_token(host, &bearer, scope).await?;
            self.inner
                .tokens
                .borrow_mut()
                .insert(token_key, token.clone());
            return Ok(build(Some(token), body).send().await?);
        }

        // Basic challenge: retry with configured credentials, if any
        if let Some((user, pass)) = auth::credentials_for(&host.auth_host) {
            let mut request = self.inner.http.request(method, url).basic_auth(user, Some(pass));
            if !accept.is_empty() {
                request = request.header(reqwest::header::ACCEPT, accept);
            }
            if let Some((bytes, content_type)) = body {
                request = request
                    .header(reqwest::header::CONTENT_TYPE, content_type)
                    .body(bytes);
            }
            return Ok(request.send().await?);
        }

        Ok(response)
    }

    async fn fetch_token(
        &self,
        host: &RegistryHost,
        challenge: &BearerChallenge,
        scope: &str,
    ) -> Result<String> {
        let url = challenge.token_url(scope);
        debug!(url = %url, "fetching registry token");
        let mut request = self.inner.http.get(&url);
        if let Some((user, pass)) = auth::credentials_for(&host.auth_host) {
            request = request.basic_auth(user, Some(pass));
        }
        let response = request.send().await?.error_for_status()?;
        let body: serde_json::Value = response.json().await?;
        body.get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|token| token.as_str())
            .map(str::to_string)
            .ok_or_else(|| BrewError::Registry {
                reference: host.auth_host.clone(),
                reason: "token endpoint returned no token".to_string(),
            })
    }

    /// Resolve an image reference to its descriptor.
    pub async fn resolve(&self, image: &str) -> Result<ResolvedObject> {
        let reference = Reference::parse(image)?;
        let hosts = auth::registry_hosts(&reference.host);
        let scope = format!("repository:{}:pull", reference.repository);

        let mut last_error = None;
        for host in hosts.iter().filter(|h| h.capabilities.resolve) {
            let url = format!(
                "{}/{}/manifests/{}",
                host.base_url(),
                reference.repository,
                reference.object()
            );
            let response = match self
                .request(host, reqwest::Method::GET, &url, MANIFEST_ACCEPT, &scope, None)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    last_error = Some(e.to_string());
                    continue;
                }
            };
            if !response.status().is_success() {
                last_error = Some(format!("{} -> {}", url, response.status()));
                continue;
            }

            let media_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or(oci::MEDIA_TYPE_DOCKER_MANIFEST)
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_string();
            let header_digest = response
                .headers()
                .get("docker-content-digest")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);

            let body = response.bytes().await?;
            let digest = format!("sha256:{}", hex::encode(Sha256::digest(&body)));
            if let Some(header_digest) = header_digest {
                if header_digest != digest {
                    return Err(BrewError::DigestMismatch {
                        digest: header_digest,
                    });
                }
            }
            if let Some(expected) = &reference.digest {
                if *expected != digest {
                    return Err(BrewError::DigestMismatch {
                        digest: expected.clone(),
                    });
                }
            }

            return Ok(ResolvedObject {
                image_ref: reference.canonical(),
                desc: Descriptor {
                    media_type,
                    digest,
                    size: body.len() as i64,
                    platform: None,
                    urls: None,
                    annotations: None,
                },
                reference: reference.clone(),
                hosts: hosts.clone(),
                client: self.clone(),
            });
        }

        Err(BrewError::RefUnresolvable {
            reference: reference.canonical(),
            reason: last_error.unwrap_or_else(|| "no registry host available".to_string()),
        })
    }

    /// Best-effort remote image ids for `image`: the config digest of
    /// every manifest reachable from it (one for a plain image, one per
    /// member for an index). Empty means "unknown".
    pub async fn image_ids(&self, image: &str) -> Vec<String> {
        let Ok(obj) = self.resolve(image).await else {
            return Vec::new();
        };
        let Ok(manifests) = obj.manifests().await else {
            return Vec::new();
        };
        let mut ids = Vec::new();
        for desc in manifests {
            if !desc.is_image_manifest() {
                continue;
            }
            if let Some(id) = self.inner.image_ids.borrow().get(&desc.digest) {
                ids.push(id.clone());
                continue;
            }
            let Ok(manifest) = obj.manifest(&desc).await else {
                continue;
            };
            self.inner
                .image_ids
                .borrow_mut()
                .insert(desc.digest.clone(), manifest.config.digest.clone());
            ids.push(manifest.config.digest.clone());
        }
        ids
    }

    /// The manifest digests reachable from `image`: the image's own
    /// digest for a single manifest, or the member digests of its index.
    pub async fn manifest_list_digests(&self, image: &str) -> Option<Vec<String>> {
        let obj = self.resolve(image).await.ok()?;
        if obj.desc.is_image_manifest() {
            return Some(vec![obj.desc.digest.clone()]);
        }
        if !obj.desc.is_image_index() {
            return None;
        }
        if let Some(digests) = self.inner.manifest_lists.borrow().get(&obj.desc.digest) {
            return Some(digests.clone());
        }
        let index = obj.index().await.ok()?;
        let digests: Vec<String> = index
            .manifests
            .iter()
            .map(|m| m.digest.clone())
            .filter(|d| !d.is_empty())
            .collect();
        if !digests.is_empty() {
            self.inner
                .manifest_lists
                .borrow_mut()
                .insert(obj.desc.digest.clone(), digests.clone());
        }
        Some(digests)
    }
}

impl RegistryClient {
    /// Push `desc` (and everything reachable from it) from the content
    /// store to `reference`'s registry, tagging the manifest with the
    /// reference's tag. The manifest is PUT once per destination tag by
    /// the caller, so repeat tags resolving to the same digest are never
    /// elided.
    pub async fn push_descriptor(
        &self,
        store: &dyn crate::store::ContentStore,
        reference: &Reference,
        desc: &Descriptor,
    ) -> Result<()> {
        let hosts = auth::registry_hosts(&reference.host);
        let host = hosts
            .iter()
            .find(|h| h.capabilities.push)
            .ok_or_else(|| BrewError::Registry {
                reference: reference.canonical(),
                reason: "no push-capable registry host".to_string(),
            })?;
        let scope = format!("repository:{}:pull,push", reference.repository);

        let blobs = crate::store::reachable_descriptors(store, desc)?;
        for blob in &blobs {
            if blob.is_image_manifest() || blob.is_image_index() {
                if blob.digest == desc.digest {
                    continue; // the target manifest goes last, by tag
                }
                self.put_manifest(host, reference, &blob.digest, blob, store, &scope)
                    .await?;
            } else {
                self.put_blob(host, reference, blob, store, &scope).await?;
            }
        }

        self.put_manifest(host, reference, reference.object(), desc, store, &scope)
            .await
    }

    async fn put_blob(
        &self,
        host: &RegistryHost,
        reference: &Reference,
        desc: &Descriptor,
        store: &dyn crate::store::ContentStore,
        scope: &str,
    ) -> Result<()> {
        // skip content the registry already has
        let head_url = format!(
            "{}/{}/blobs/{}",
            host.base_url(),
            reference.repository,
            desc.digest
        );
        let response = self
            .request(host, reqwest::Method::HEAD, &head_url, "", scope, None)
            .await?;
        if response.status().is_success() {
            debug!(digest = %desc.digest, "blob already present");
            return Ok(());
        }

        let start_url = format!(
            "{}/{}/blobs/uploads/",
            host.base_url(),
            reference.repository
        );
        let response = self
            .request(host, reqwest::Method::POST, &start_url, "", scope, None)
            .await?;
        if !response.status().is_success() {
            return Err(BrewError::Registry {
                reference: reference.canonical(),
                reason: format!("upload start failed: {}", response.status()),
            });
        }
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| BrewError::Registry {
                reference: reference.canonical(),
                reason: "upload start returned no Location".to_string(),
            })?;
        let upload_url = if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            format!("{}://{}{}", host.scheme, host.host, location)
        };
        let separator = if upload_url.contains('?') { '&' } else { '?' };
        let put_url = format!("{}{}digest={}", upload_url, separator, desc.digest);

        let bytes = store.read_blob(&desc.digest)?;
        let response = self
            .request(
                host,
                reqwest::Method::PUT,
                &put_url,
                "",
                scope,
                Some((bytes, "application/octet-stream")),
            )
            .await?;
        if !response.status().is_success() {
            return Err(BrewError::Registry {
                reference: reference.canonical(),
                reason: format!("blob upload failed: {}", response.status()),
            });
        }
        debug!(digest = %desc.digest, "blob pushed");
        Ok(())
    }

    async fn put_manifest(
        &self,
        host: &RegistryHost,
        reference: &Reference,
        object: &str,
        desc: &Descriptor,
        store: &dyn crate::store::ContentStore,
        scope: &str,
    ) -> Result<()> {
        let url = format!(
            "{}/{}/manifests/{}",
            host.base_url(),
            reference.repository,
            object
        );
        let bytes = store.read_blob(&desc.digest)?;
        let response = self
            .request(
                host,
                reqwest::Method::PUT,
                &url,
                "",
                scope,
                Some((bytes, desc.media_type.as_str())),
            )
            .await?;
        if !response.status().is_success() {
            return Err(BrewError::Registry {
                reference: reference.canonical(),
                reason: format!("manifest push failed: {}", response.status()),
            });
        }
        debug!(object, digest = %desc.digest, "manifest pushed");
        Ok(())
    }
}

/// A resolved reference: the descriptor plus the fetcher state needed to
/// read the objects behind it.
pub struct ResolvedObject {
    pub image_ref: String,
    pub desc: Descriptor,
    reference: Reference,
    hosts: Vec<RegistryHost>,
    client: RegistryClient,
}

impl ResolvedObject {
    pub fn is_image_manifest(&self) -> bool {
        self.desc.is_image_manifest()
    }

    pub fn is_image_index(&self) -> bool {
        self.desc.is_image_index()
    }

    /// Fetch the blob behind `desc` with the size limited to the declared
    /// size (any surplus or deficit is an error) and the digest verified.
    pub async fn fetch_verified(&self, desc: &Descriptor) -> Result<Vec<u8>> {
        let (algo, _) = desc.digest_parts()?;
        if algo != "sha256" {
            return Err(BrewError::Registry {
                reference: self.image_ref.clone(),
                reason: format!("unsupported digest algorithm in {:?}", desc.digest),
            });
        }

        let kind = if desc.is_image_manifest() || desc.is_image_index() {
            "manifests"
        } else {
            "blobs"
        };
        let scope = format!("repository:{}:pull", self.reference.repository);

        let mut last_error = None;
        for host in self.hosts.iter().filter(|h| h.capabilities.pull) {
            let url = format!(
                "{}/{}/{}/{}",
                host.base_url(),
                self.reference.repository,
                kind,
                desc.digest
            );
            let response = match self
                .client
                .request(
                    host,
                    reqwest::Method::GET,
                    &url,
                    &desc.media_type,
                    &scope,
                    None,
                )
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    last_error = Some(e.to_string());
                    continue;
                }
            };
            if !response.status().is_success() {
                last_error = Some(format!("{} -> {}", url, response.status()));
                continue;
            }

            // read at most size+1 bytes so an over-long body is caught
            // without slurping it whole
            let limit = (desc.size + 1).max(0) as usize;
            let mut body: Vec<u8> = Vec::with_capacity(limit.min(1 << 20));
            let mut response = response;
            while let Some(chunk) = response.chunk().await? {
                let room = limit.saturating_sub(body.len());
                body.extend_from_slice(&chunk[..chunk.len().min(room)]);
                if body.len() >= limit {
                    break;
                }
            }

            if body.len() as i64 != desc.size {
                return Err(BrewError::SizeMismatch {
                    digest: desc.digest.clone(),
                    expected: desc.size,
                    actual: if body.len() as i64 > desc.size {
                        // all we know is "bigger than declared"
                        desc.size + 1
                    } else {
                        body.len() as i64
                    },
                });
            }

            let digest = format!("sha256:{}", hex::encode(Sha256::digest(&body)));
            if digest != desc.digest {
                return Err(BrewError::DigestMismatch {
                    digest: desc.digest.clone(),
                });
            }

            return Ok(body);
        }

        Err(BrewError::RefUnresolvable {
            reference: self.image_ref.clone(),
            reason: last_error.unwrap_or_else(|| "no registry host available".to_string()),
        })
    }

    /// Size- and digest-enforced JSON fetch into `T`. Trailing bytes
    /// beyond the JSON value fail the decode unless they are whitespace.
    pub async fn fetch_json<T: DeserializeOwned>(&self, desc: &Descriptor) -> Result<T> {
        let body = self.fetch_verified(desc).await?;
        serde_json::from_slice(&body).map_err(|e| BrewError::JsonDecode {
            digest: desc.digest.clone(),
            source: e,
        })
    }

    /// The index behind this object (requires an index media type).
    pub async fn index(&self) -> Result<Index> {
        if !self.is_image_index() {
            return Err(BrewError::Registry {
                reference: self.image_ref.clone(),
                reason: format!("unknown media type: {:?}", self.desc.media_type),
            });
        }
        self.fetch_json(&self.desc).await
    }

    /// The manifest behind `desc` (requires a manifest media type).
    pub async fn manifest(&self, desc: &Descriptor) -> Result<Manifest> {
        if !desc.is_image_manifest() {
            return Err(BrewError::Registry {
                reference: self.image_ref.clone(),
                reason: format!("unknown media type: {:?}", desc.media_type),
            });
        }
        self.fetch_json(desc).await
    }

    /// The image config JSON behind a manifest.
    pub async fn config_json<T: DeserializeOwned>(&self, manifest: &Manifest) -> Result<T> {
        self.fetch_json(&manifest.config).await
    }

    /// `[self.desc]` for a single image, else the index's entries.
    pub async fn manifests(&self) -> Result<Vec<Descriptor>> {
        if self.is_image_manifest() {
            return Ok(vec![self.desc.clone()]);
        }
        Ok(self.index().await?.manifests)
    }

    /// Bucket the member manifests by catalog architecture label, filling
    /// missing or incomplete platforms from the image config. Each
    /// descriptor lands under at most one label.
    pub async fn architectures(&self) -> Result<BTreeMap<String, Vec<Descriptor>>> {
        let mut buckets: BTreeMap<String, Vec<Descriptor>> = BTreeMap::new();
        for mut desc in self.manifests().await? {
            let incomplete = match &desc.platform {
                Some(platform) => platform.os.is_empty() || platform.architecture.is_empty(),
                None => true,
            };
            if incomplete && desc.is_image_manifest() {
                let manifest = self.manifest(&desc).await?;
                let config: oci::ImageConfigPlatform = self.config_json(&manifest).await?;
                desc.platform = Some(config.platform());
            }
            let Some(platform) = &desc.platform else {
                continue;
            };
            let normalized = platform.normalize();
            if let Some(label) = arch::label_for_platform(&normalized) {
                let mut desc = desc.clone();
                desc.platform = Some(normalized);
                buckets.entry(label.to_string()).or_default().push(desc);
            }
        }
        Ok(buckets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;

    #[test]
    fn reference_parsing() {
        let r = Reference::parse("bash").unwrap();
        assert_eq!(r.host, "docker.io");
        assert_eq!(r.repository, "library/bash");
        assert_eq!(r.canonical(), "docker.io/library/bash:latest");

        let r = Reference::parse("ghcr.io/org/app:v1").unwrap();
        assert_eq!(r.host, "ghcr.io");
        assert_eq!(r.repository, "org/app");
        assert_eq!(r.object(), "v1");

        let r = Reference::parse("localhost:5000/app").unwrap();
        assert_eq!(r.host, "localhost:5000");
        assert_eq!(r.repository, "app");
        assert_eq!(r.tag.as_deref(), Some("latest"));

        let digest = format!("sha256:{}", "ab".repeat(32));
        let r = Reference::parse(&format!("bash@{digest}")).unwrap();
        assert_eq!(r.digest.as_deref(), Some(digest.as_str()));
        assert_eq!(r.tag, None);
        assert_eq!(r.object(), digest.as_str());

        assert!(Reference::parse("bash@sha256:short").is_err());
    }

    /// One-shot HTTP fixture: serves the registered paths, anything else
    /// is a 404.
    fn serve(responses: Vec<(String, String, Vec<u8>)>) -> (std::net::SocketAddr, std::thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            for _ in 0..responses.len() * 4 {
                let (mut stream, _) = match listener.accept() {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let mut buf = [0u8; 4096];
                let n = stream.read(&mut buf).unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).into_owned();
                let path = request
                    .split_whitespace()
                    .nth(1)
                    .unwrap_or_default()
                    .to_string();
                let found = responses.iter().find(|(p, _, _)| *p == path);
                match found {
                    Some((_, content_type, body)) => {
                        let header = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            content_type,
                            body.len()
                        );
                        let _ = stream.write_all(header.as_bytes());
                        let _ = stream.write_all(body);
                    }
                    None => {
                        let _ = stream.write_all(
                            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        );
                    }
                }
                let _ = stream.flush();
                if request.is_empty() {
                    return;
                }
            }
        });
        (addr, handle)
    }

    fn manifest_json() -> Vec<u8> {
        serde_json::json!({
            "schemaVersion": 2,
            "mediaType": oci::MEDIA_TYPE_OCI_MANIFEST,
            "config": {
                "mediaType": oci::MEDIA_TYPE_OCI_CONFIG,
                "digest": format!("sha256:{}", "11".repeat(32)),
                "size": 2,
            },
            "layers": [],
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn resolve_and_fetch_json_verify_digests() {
        let body = manifest_json();
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&body)));
        let (addr, _handle) = serve(vec![(
            "/v2/test/image/manifests/latest".to_string(),
            oci::MEDIA_TYPE_OCI_MANIFEST.to_string(),
            body.clone(),
        ), (
            format!("/v2/test/image/manifests/{digest}"),
            oci::MEDIA_TYPE_OCI_MANIFEST.to_string(),
            body.clone(),
        )]);

        let client = RegistryClient::new();
        let image = format!("localhost:{}/test/image", addr.port());
        let obj = client.resolve(&image).await.unwrap();
        assert!(obj.is_image_manifest());
        assert_eq!(obj.desc.digest, digest);
        assert_eq!(obj.desc.size, body.len() as i64);

        let manifest = obj.manifest(&obj.desc).await.unwrap();
        assert_eq!(manifest.config.size, 2);
    }

    #[tokio::test]
    async fn fetch_json_rejects_size_mismatch() {
        let body = manifest_json();
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&body)));
        let (addr, _handle) = serve(vec![(
            "/v2/test/image/manifests/latest".to_string(),
            oci::MEDIA_TYPE_OCI_MANIFEST.to_string(),
            body.clone(),
        ), (
            format!("/v2/test/image/manifests/{digest}"),
            oci::MEDIA_TYPE_OCI_MANIFEST.to_string(),
            body.clone(),
        )]);

        let client = RegistryClient::new();
        let image = format!("localhost:{}/test/image", addr.port());
        let obj = client.resolve(&image).await.unwrap();

        // a descriptor one byte shorter than the body: the body is now
        // "1 byte longer than declared" and must be rejected
        let mut short = obj.desc.clone();
        short.size -= 1;
        let err = obj.fetch_json::<Manifest>(&short).await.unwrap_err();
        assert!(matches!(err, BrewError::SizeMismatch { .. }), "{err}");

        // declared size too large: body is smaller than declared
        let mut long = obj.desc.clone();
        long.size += 10;
        let err = obj.fetch_json::<Manifest>(&long).await.unwrap_err();
        assert!(matches!(err, BrewError::SizeMismatch { .. }), "{err}");
    }

    #[tokio::test]
    async fn fetch_json_rejects_digest_mismatch() {
        let body = manifest_json();
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&body)));
        let tampered_digest = format!("sha256:{}", "ee".repeat(32));
        let (addr, _handle) = serve(vec![
            (
                "/v2/test/image/manifests/latest".to_string(),
                oci::MEDIA_TYPE_OCI_MANIFEST.to_string(),
                body.clone(),
            ),
            (
                format!("/v2/test/image/manifests/{digest}"),
                oci::MEDIA_TYPE_OCI_MANIFEST.to_string(),
                body.clone(),
            ),
            (
                // a path claiming a digest whose bytes do not hash to it
                format!("/v2/test/image/manifests/{tampered_digest}"),
                oci::MEDIA_TYPE_OCI_MANIFEST.to_string(),
                body.clone(),
            ),
        ]);

        let client = RegistryClient::new();
        let image = format!("localhost:{}/test/image", addr.port());
        let obj = client.resolve(&image).await.unwrap();

        let mut tampered = obj.desc.clone();
        tampered.digest = tampered_digest;
        let err = obj.fetch_json::<Manifest>(&tampered).await.unwrap_err();
        assert!(matches!(err, BrewError::DigestMismatch { .. }), "{err}");
    }
}
