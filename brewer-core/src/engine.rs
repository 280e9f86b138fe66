//! Local image engine commands.
//!
//! Every build, tag, pull, push and load goes through the `docker` CLI
//! (or `docker buildx` for the BuildKit backend, and `manifest-tool` for
//! manifest lists). Processes run with piped stdio; stderr is buffered
//! and surfaced on non-zero exit together with the argv.

use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{BrewError, Result};

pub const BUILDKIT_SYNTAX_ENV: &str = "BASHBREW_BUILDKIT_SYNTAX";
pub const SBOM_GENERATOR_ENV: &str = "BASHBREW_BUILDKIT_SBOM_GENERATOR";
pub const BUILDX_BUILDER_ENV: &str = "BUILDX_BUILDER";

#[derive(Debug, Default)]
pub struct Engine;

impl Engine {
    pub fn new() -> Engine {
        Engine
    }

    async fn run(
        &self,
        program: &str,
        args: &[&str],
        envs: &[(&str, &str)],
        stdin: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        debug!(program, ?args, "exec");
        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in envs {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|e| BrewError::io(program, e))?;

        // write stdin from a task so a chatty child cannot deadlock
        // against a partially-written context
        let writer = stdin.map(|bytes| {
            let mut handle = child.stdin.take().expect("stdin was piped");
            let bytes = bytes.to_vec();
            tokio::spawn(async move {
                let _ = handle.write_all(&bytes).await;
                let _ = handle.shutdown().await;
            })
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BrewError::io(program, e))?;
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        if !output.status.success() {
            return Err(BrewError::Process {
                argv: format!("{} {}", program, args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// `docker inspect -f {{.Id}} <image>` -- the local image id.
    pub async fn inspect_image_id(&self, image: &str) -> Result<String> {
        let out = self
            .run("docker", &["inspect", "-f", "{{.Id}}", image], &[], None)
            .await?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }

    /// Classic builder: `docker build` with BuildKit disabled, the
    /// context streamed over stdin.
    pub async fn build(
        &self,
        tags: &[String],
        file: &str,
        context: &[u8],
        platform: &str,
    ) -> Result<()> {
        let mut args = vec!["build".to_string()];
        for tag in tags {
            args.push("--tag".to_string());
            args.push(tag.clone());
        }
        if !file.is_empty() {
            args.push("--file".to_string());
            args.push(file.to_string());
        }
        args.push("--rm".to_string());
        args.push("--force-rm".to_string());
        args.push("-".to_string());

        let mut envs = vec![("DOCKER_BUILDKIT", "0")];
        if !platform.is_empty() {
            envs.push(("DOCKER_DEFAULT_PLATFORM", platform));
        }

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run("docker", &args, &envs, Some(context)).await?;
        Ok(())
    }

    /// BuildKit builder: `docker buildx build` with the configured syntax
    /// image. Returns the raw stdout (an OCI tarball when `oci_output`).
    pub async fn buildx_build(
        &self,
        tags: &[String],
        file: &str,
        context: &[u8],
        platform: &str,
    ) -> Result<Vec<u8>> {
        let syntax = std::env::var(BUILDKIT_SYNTAX_ENV)
            .map_err(|_| anyhow::anyhow!("missing {:?}", BUILDKIT_SYNTAX_ENV))?;

        let mut args = vec![
            "buildx".to_string(),
            "build".to_string(),
            "--progress".to_string(),
            "plain".to_string(),
            "--build-arg".to_string(),
            format!("BUILDKIT_SYNTAX={}", syntax),
        ];

        let buildx_builder = !std::env::var(BUILDX_BUILDER_ENV)
            .unwrap_or_default()
            .is_empty();
        if buildx_builder {
            args.push("--provenance".to_string());
            args.push("mode=max".to_string());
        }
        if let Ok(sbom_generator) = std::env::var(SBOM_GENERATOR_ENV) {
            if buildx_builder {
                args.push("--sbom".to_string());
                args.push(format!("generator={}", sbom_generator));
            } else {
                return Err(anyhow::anyhow!(
                    "have {:?} but missing {:?}",
                    SBOM_GENERATOR_ENV,
                    BUILDX_BUILDER_ENV
                )
                .into());
            }
        }
        if !platform.is_empty() {
            args.push("--platform".to_string());
            args.push(platform.to_string());
        }
        for tag in tags {
            args.push("--tag".to_string());
            args.push(tag.clone());
        }
        if !file.is_empty() {
            args.push("--file".to_string());
            args.push(file.to_string());
        }
        args.push("-".to_string());
        if buildx_builder {
            args.push("--output".to_string());
            args.push("type=oci".to_string());
        }

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run("docker", &args, &[], Some(context)).await
    }

    /// Whether the buildx path emits an OCI tarball on stdout (external
    /// builder configured) rather than loading into the engine directly.
    pub fn buildx_emits_oci(&self) -> bool {
        !std::env::var(BUILDX_BUILDER_ENV)
            .unwrap_or_default()
            .is_empty()
    }

    pub async fn tag(&self, from: &str, to: &str) -> Result<()> {
        self.run("docker", &["tag", from, to], &[], None).await?;
        Ok(())
    }

    pub async fn push(&self, tag: &str) -> Result<()> {
        self.run("docker", &["push", tag], &[], None).await?;
        Ok(())
    }

    pub async fn pull(&self, tag: &str) -> Result<()> {
        self.run("docker", &["pull", tag], &[], None).await?;
        Ok(())
    }

    /// `docker load` from a tarball already on disk.
    pub async fn load_file(&self, path: &Path) -> Result<()> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| BrewError::io(path, e))?;
        self.run("docker", &["load"], &[], Some(&bytes)).await?;
        Ok(())
    }

    /// `manifest-tool push from-spec` with the given YAML spec.
    pub async fn manifest_tool_push(&self, spec_yaml: &str) -> Result<()> {
        let mut spec_file = tempfile::NamedTempFile::new()
            .map_err(|e| BrewError::io("manifest-tool spec", e))?;
        std::io::Write::write_all(&mut spec_file, spec_yaml.as_bytes())
            .map_err(|e| BrewError::io("manifest-tool spec", e))?;
        let path = spec_file.path().to_str().ok_or_else(|| {
            anyhow::anyhow!("unrepresentable temp path for manifest-tool spec")
        })?;
        self.run("manifest-tool", &["push", "from-spec", path], &[], None)
            .await?;
        Ok(())
    }
}
