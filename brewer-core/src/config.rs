//! Runtime configuration: library/cache paths, the active architecture,
//! namespaces and build constraints.
//!
//! Values come from CLI flags backed by the `BASHBREW_*` environment
//! variables, with XDG fallbacks for the on-disk paths.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::arch;

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory of per-repository manifest files.
    pub library: PathBuf,
    /// Cache root (`git/` and `containerd/<arch>/` live under it).
    pub cache: PathBuf,
    /// The active build architecture label.
    pub arch: String,
    /// Default namespace prefix for listed/built tags.
    pub namespace: String,
    /// Per-architecture registry namespaces (`arch=namespace,...`).
    pub arch_namespaces: BTreeMap<String, String>,
    /// Active build constraints.
    pub constraints: Vec<String>,
    /// Skip entries that declare no constraints at all.
    pub exclusive_constraints: bool,
}

impl Config {
    pub fn new(
        library: Option<PathBuf>,
        cache: Option<PathBuf>,
        arch: Option<String>,
        namespace: Option<String>,
        arch_namespaces: Option<String>,
        constraints: Vec<String>,
        exclusive_constraints: bool,
    ) -> Config {
        Config {
            library: library.unwrap_or_else(default_library),
            cache: cache.unwrap_or_else(default_cache),
            arch: arch.unwrap_or_else(|| arch::default_arch().to_string()),
            namespace: namespace.unwrap_or_default(),
            arch_namespaces: parse_arch_namespaces(arch_namespaces.as_deref().unwrap_or("")),
            constraints,
            exclusive_constraints,
        }
    }

    /// The registry namespace for `arch`, if one is configured.
    pub fn arch_namespace(&self, arch: &str) -> Option<&str> {
        self.arch_namespaces
            .get(arch)
            .map(String::as_str)
            .filter(|ns| !ns.is_empty())
    }

    /// `<cache>/containerd/<arch>` -- the embedded content-store root.
    pub fn content_store_root(&self) -> PathBuf {
        self.cache.join("containerd").join(&self.arch)
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn xdg_dir(var: &str, home_fallback: &str) -> PathBuf {
    match std::env::var_os(var) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => home_dir().join(home_fallback),
    }
}

fn default_library() -> PathBuf {
    home_dir()
        .join("docker")
        .join("official-images")
        .join("library")
}

fn default_cache() -> PathBuf {
    xdg_dir("XDG_CACHE_HOME", ".cache").join("bashbrew")
}

/// Parse `arch=namespace` pairs from a comma-separated list, ignoring
/// malformed elements.
pub fn parse_arch_namespaces(value: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for pair in value.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        if let Some((arch, namespace)) = pair.split_once('=') {
            map.insert(arch.trim().to_string(), namespace.trim().to_string());
        }
    }
    map
}

impl Default for Config {
    fn default() -> Config {
        Config::new(None, None, None, None, None, Vec::new(), false)
    }
}

/// A config rooted entirely under `dir` (used by tests).
pub fn test_config(dir: &Path) -> Config {
    Config {
        library: dir.join("library"),
        cache: dir.join("cache"),
        arch: "amd64".to_string(),
        namespace: String::new(),
        arch_namespaces: BTreeMap::new(),
        constraints: Vec::new(),
        exclusive_constraints: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arch_namespace_parsing() {
        let map = parse_arch_namespaces("amd64=amd64, arm64v8=arm64v8, bogus, s390x=s390x");
        assert_eq!(map.len(), 3);
        assert_eq!(map.get("arm64v8").map(String::as_str), Some("arm64v8"));
        assert!(!map.contains_key("bogus"));

        assert_eq!(parse_arch_namespaces("").len(), 0);
    }

    #[test]
    fn content_store_root_is_per_arch() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = test_config(dir.path());
        assert!(config
            .content_store_root()
            .ends_with(Path::new("containerd").join("amd64")));
    }
}
