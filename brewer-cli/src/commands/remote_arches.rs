use anyhow::{Context, Result};
use brewer_core::registry::RegistryClient;

use super::App;

pub async fn run(_app: &App, json: bool, args: &[String]) -> Result<()> {
    anyhow::ensure!(!args.is_empty(), "expected at least one argument");

    let client = RegistryClient::new();
    for arg in args {
        let obj = client
            .resolve(arg)
            .await
            .with_context(|| format!("failed to resolve {arg}"))?;
        let arches = obj
            .architectures()
            .await
            .with_context(|| format!("failed to query arches of {arg}"))?;

        if json {
            let out = serde_json::json!({
                "ref": obj.image_ref,
                "desc": obj.desc,
                "arches": arches,
            });
            println!("{}", serde_json::to_string(&out)?);
        } else {
            println!("{} -> {}", obj.image_ref, obj.desc.digest);
            for (arch, descriptors) in &arches {
                for desc in descriptors {
                    println!("  {} -> {}", arch, desc.digest);
                }
            }
        }
    }
    Ok(())
}
