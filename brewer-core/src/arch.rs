//! Catalog architecture labels and their OCI platform mapping.
//!
//! The catalog format names architectures with short labels (`amd64`,
//! `arm32v7`, `windows-amd64`, ...). Each label maps to exactly one OCI
//! platform triple; the mapping is closed and enumerated here.

use serde::{Deserialize, Serialize};

/// An OCI image-index platform (the `platform` object under `manifests`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciPlatform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variant: String,
}

impl OciPlatform {
    fn of(os: &str, architecture: &str, variant: &str) -> Self {
        OciPlatform {
            os: os.to_string(),
            architecture: architecture.to_string(),
            variant: variant.to_string(),
        }
    }

    /// Canonicalize the platform, containerd-style.
    ///
    /// Architecture aliases are folded (`x86_64` -> `amd64`, `aarch64` ->
    /// `arm64`, ...) and `arm64` with an empty variant gains `v8`.
    pub fn normalize(&self) -> OciPlatform {
        let os = self.os.to_lowercase();
        let (architecture, mut variant) =
            normalize_arch(&self.architecture.to_lowercase(), &self.variant.to_lowercase());
        if architecture == "arm64" && variant.is_empty() {
            variant = "v8".to_string();
        }
        OciPlatform {
            os,
            architecture,
            variant,
        }
    }

    /// Two platforms match iff all three fields are equal after normalization.
    pub fn is(&self, other: &OciPlatform) -> bool {
        self.normalize() == other.normalize()
    }
}

impl std::fmt::Display for OciPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if !self.variant.is_empty() {
            write!(f, "/{}", self.variant)?;
        }
        Ok(())
    }
}

fn normalize_arch(arch: &str, variant: &str) -> (String, String) {
    match arch {
        "i386" | "i486" | "i586" | "i686" => ("386".to_string(), String::new()),
        "x86_64" | "x86-64" | "amd64" => {
            let variant = if variant == "v1" { "" } else { variant };
            ("amd64".to_string(), variant.to_string())
        }
        "aarch64" | "arm64" => {
            // v8 is the implied baseline for arm64
            let variant = match variant {
                "8" | "v8" => "",
                other => other,
            };
            ("arm64".to_string(), variant.to_string())
        }
        "armhf" => ("arm".to_string(), "v7".to_string()),
        "armel" => ("arm".to_string(), "v6".to_string()),
        "arm" => {
            let variant = match variant {
                "" => "v7",
                "5" => "v5",
                "6" => "v6",
                "7" => "v7",
                "8" => "v8",
                other => other,
            };
            ("arm".to_string(), variant.to_string())
        }
        other => (other.to_string(), variant.to_string()),
    }
}

/// The closed set of supported catalog architecture labels, each with its
/// OCI platform. Order is stable (used for deterministic output).
pub const SUPPORTED_ARCHES: &[(&str, &str, &str, &str)] = &[
    // (label, os, architecture, variant)
    ("amd64", "linux", "amd64", ""),
    ("arm32v5", "linux", "arm", "v5"),
    ("arm32v6", "linux", "arm", "v6"),
    ("arm32v7", "linux", "arm", "v7"),
    ("arm64v8", "linux", "arm64", "v8"),
    ("i386", "linux", "386", ""),
    ("mips64le", "linux", "mips64le", ""),
    ("ppc64le", "linux", "ppc64le", ""),
    ("riscv64", "linux", "riscv64", ""),
    ("s390x", "linux", "s390x", ""),
    ("windows-amd64", "windows", "amd64", ""),
];

/// True if `label` is one of the supported catalog architectures.
pub fn is_supported(label: &str) -> bool {
    SUPPORTED_ARCHES.iter().any(|(l, _, _, _)| *l == label)
}

/// The OCI platform for a catalog architecture label, if supported.
pub fn oci_platform(label: &str) -> Option<OciPlatform> {
    SUPPORTED_ARCHES
        .iter()
        .find(|(l, _, _, _)| *l == label)
        .map(|(_, os, arch, variant)| OciPlatform::of(os, arch, variant))
}

/// The catalog label whose platform matches `platform` (after
/// normalization), if any.
pub fn label_for_platform(platform: &OciPlatform) -> Option<&'static str> {
    let normalized = platform.normalize();
    SUPPORTED_ARCHES
        .iter()
        .find(|(_, os, arch, variant)| {
            OciPlatform::of(os, arch, variant).normalize() == normalized
        })
        .map(|(l, _, _, _)| *l)
}

/// The default build architecture for the current host.
pub fn default_arch() -> &'static str {
    match (std::env::consts::OS, std::env::consts::ARCH) {
        ("windows", "x86_64") => "windows-amd64",
        (_, "x86_64") => "amd64",
        (_, "aarch64") => "arm64v8",
        (_, "arm") => "arm32v7",
        (_, "x86") => "i386",
        (_, "powerpc64") => "ppc64le",
        (_, "riscv64") => "riscv64",
        (_, "s390x") => "s390x",
        _ => "amd64",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_labels_normalize_to_themselves() {
        for (label, _, _, _) in SUPPORTED_ARCHES {
            let platform = oci_platform(label).unwrap();
            assert!(
                platform.normalize().is(&platform),
                "{} does not survive normalization",
                label
            );
            assert_eq!(label_for_platform(&platform), Some(*label));
        }
    }

    #[test]
    fn arm64_variant_is_implied() {
        let bare = OciPlatform::of("linux", "arm64", "");
        let v8 = oci_platform("arm64v8").unwrap();
        assert!(bare.is(&v8));
        assert_eq!(label_for_platform(&bare), Some("arm64v8"));
    }

    #[test]
    fn containerd_aliases_fold() {
        let aarch64 = OciPlatform::of("linux", "aarch64", "");
        assert_eq!(label_for_platform(&aarch64), Some("arm64v8"));

        let x86_64 = OciPlatform::of("linux", "x86_64", "");
        assert_eq!(label_for_platform(&x86_64), Some("amd64"));

        let i686 = OciPlatform::of("linux", "i686", "");
        assert_eq!(label_for_platform(&i686), Some("i386"));

        let armhf = OciPlatform::of("linux", "armhf", "");
        assert_eq!(label_for_platform(&armhf), Some("arm32v7"));
    }

    #[test]
    fn os_distinguishes_windows() {
        let windows = oci_platform("windows-amd64").unwrap();
        let linux = oci_platform("amd64").unwrap();
        assert!(!windows.is(&linux));
    }

    #[test]
    fn display_is_slash_joined() {
        assert_eq!(oci_platform("arm32v7").unwrap().to_string(), "linux/arm/v7");
        assert_eq!(oci_platform("amd64").unwrap().to_string(), "linux/amd64");
    }
}
