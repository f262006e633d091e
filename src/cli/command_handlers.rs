use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::Serialize;

use crate::{model::manifest::Manifest, Pkgfetch};

/// Handler to resolve command
pub async fn do_resolve(pkgfetch: &Pkgfetch, spec: &str) -> anyhow::Result<()> {
    let resolved = pkgfetch.resolve(spec).await?;
    info!("Resolved {} to {}", spec, resolved);
    println!("{resolved}");
    Ok(())
}

/// Handler to manifest command
pub async fn do_manifest(pkgfetch: &Pkgfetch, spec: &str) -> anyhow::Result<()> {
    let manifest = pkgfetch.manifest(spec).await?;
    print_json(&manifest)
}

/// Handler to packument command
pub async fn do_packument(pkgfetch: &Pkgfetch, spec: &str) -> anyhow::Result<()> {
    let packument = pkgfetch.packument(spec).await?;
    debug!("{} has {} versions", spec, packument.versions.len());
    print_json(&packument)
}

/// Handler to tarball command
/// Without an explicit output the file is named after the package, like
/// `npm pack` does.
pub async fn do_tarball(
    pkgfetch: &Pkgfetch,
    spec: &str,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let output = match output {
        Some(output) => output.to_path_buf(),
        None => {
            let manifest = pkgfetch.manifest(spec).await?;
            PathBuf::from(tarball_file_name(&manifest))
        }
    };
    let written = pkgfetch.tarball(spec, &output).await?;
    print_json(&written)
}

/// Handler to clear-cache command
pub fn do_clear_cache(pkgfetch: &Pkgfetch) -> anyhow::Result<()> {
    pkgfetch.clear_cache()
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn tarball_file_name(manifest: &Manifest) -> String {
    let name = manifest
        .name
        .as_deref()
        .unwrap_or("package")
        .trim_start_matches('@')
        .replace('/', "-");
    match &manifest.version {
        Some(version) => format!("{name}-{version}.tgz"),
        None => format!("{name}.tgz"),
    }
}
