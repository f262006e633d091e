use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use log::debug;
use tokio::sync::OnceCell;

use crate::{
    fetcher::{
        remote::RemoteFetcher,
        tarball::{spawn_tarball, TarballSink, TarballSource, TarballStream},
        FetchError, FetchOptions, Fetcher,
    },
    integrity::Integrity,
    model::{
        manifest::{Manifest, Packument},
        spec::{PackageSpec, Source},
        ParseError,
    },
    pick::pick_version,
};

/// A package published to an npm-compatible registry.
#[derive(Clone)]
pub struct RegistryFetcher {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    spec: PackageSpec,
    name: String,
    range: String,
    opts: FetchOptions,
    integrity: Arc<OnceLock<String>>,
    packument: OnceCell<Packument>,
    package: OnceCell<Manifest>,
}

impl RegistryFetcher {
    pub fn new(spec: PackageSpec, opts: FetchOptions) -> Result<RegistryFetcher, FetchError> {
        let name = spec
            .name
            .clone()
            .ok_or_else(|| ParseError::InvalidName(spec.raw.clone()))?;
        let range = match &spec.source {
            Source::Registry { range } => range.clone(),
            _ => String::new(),
        };
        Ok(RegistryFetcher {
            inner: Arc::new(RegistryInner {
                spec,
                name,
                range,
                opts,
                integrity: Arc::new(OnceLock::new()),
                packument: OnceCell::new(),
                package: OnceCell::new(),
            }),
        })
    }

    fn packument_url(&self) -> String {
        format!(
            "{}/{}",
            self.inner.opts.registry.trim_end_matches('/'),
            self.inner.name.replace('/', "%2f")
        )
    }

    async fn fetch_packument(&self) -> Result<Packument, FetchError> {
        let url = self.packument_url();
        debug!("Fetching packument {}", url);
        let response = self
            .inner
            .opts
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus { url, status });
        }
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn load_manifest(&self) -> Result<Manifest, FetchError> {
        let packument = self.packument().await?;
        let version = pick_version(
            packument.versions.keys(),
            &packument.dist_tags,
            &self.inner.range,
            &self.inner.opts.default_tag,
        )
        .ok_or_else(|| FetchError::NoMatchingVersion {
            name: self.inner.name.clone(),
            wanted: self.inner.range.clone(),
        })?;
        debug!("Picked {}@{} for `{}`", self.inner.name, version, self.inner.range);

        let manifest = packument.versions[&version].clone();
        let dist = manifest.dist();
        let integrity = dist.as_ref().and_then(|dist| dist.integrity.clone());
        if let Some(integrity) = &integrity {
            let _ = self.inner.integrity.set(integrity.clone());
        }
        Ok(manifest.decorate(
            integrity,
            dist.map(|dist| dist.tarball),
            Some(self.inner.spec.raw.clone()),
        ))
    }

    async fn download(&self, sink: &TarballSink) -> Result<(), FetchError> {
        let manifest = self.manifest().await?;
        let tarball = manifest
            .resolved
            .ok_or_else(|| FetchError::NoRemote {
                spec: self.inner.spec.raw.clone(),
            })?;
        sink.set_resolved(&tarball);
        if let Some(integrity) = manifest.integrity {
            sink.expect_integrity(integrity.parse()?);
        }
        RemoteFetcher::new(self.inner.spec.clone(), tarball, self.inner.opts.clone())
            .download(sink)
            .await
    }
}

#[async_trait]
impl Fetcher for RegistryFetcher {
    fn spec(&self) -> &PackageSpec {
        &self.inner.spec
    }

    fn options(&self) -> &FetchOptions {
        &self.inner.opts
    }

    async fn resolve(&self) -> Result<String, FetchError> {
        self.manifest()
            .await?
            .resolved
            .ok_or_else(|| FetchError::NoRemote {
                spec: self.inner.spec.raw.clone(),
            })
    }

    async fn manifest(&self) -> Result<Manifest, FetchError> {
        self.inner
            .package
            .get_or_try_init(|| self.load_manifest())
            .await
            .cloned()
    }

    async fn packument(&self) -> Result<Packument, FetchError> {
        self.inner
            .packument
            .get_or_try_init(|| self.fetch_packument())
            .await
            .cloned()
    }

    fn tarball(&self) -> TarballStream {
        let known = self.inner.opts.integrity.clone().or_else(|| {
            self.inner
                .integrity
                .get()
                .and_then(|integrity| integrity.parse::<Integrity>().ok())
        });
        let this = self.clone();
        spawn_tarball(
            TarballSource {
                cache: self.inner.opts.cache.clone(),
                known,
                resolved: self
                    .inner
                    .package
                    .get()
                    .and_then(|manifest| manifest.resolved.clone()),
                from: Some(self.inner.spec.raw.clone()),
                integrity: self.inner.integrity.clone(),
            },
            move |sink| async move { this.download(&sink).await },
        )
    }

    fn integrity(&self) -> Option<String> {
        self.inner.integrity.get().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::MockServer;

    use crate::{
        archive,
        fetcher::testing::{hits, mock_server, options, FakeGit},
        integrity,
    };

    fn tarball() -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"name":"left-pad","version":"1.3.0"}"#,
        )
        .unwrap();
        archive::pack_dir(dir.path(), Vec::new()).unwrap()
    }

    /// A registry whose tarballs are served by a second server.
    async fn start_registry(tarball: &[u8], integrity: &str) -> (MockServer, MockServer) {
        let tarballs = mock_server(vec![("/-/left-pad-1.3.0.tgz", tarball.to_vec())]).await;
        let packument = json!({
            "name": "left-pad",
            "dist-tags": {"latest": "1.2.0", "next": "2.0.0-beta.1"},
            "versions": {
                "1.2.0": {"name": "left-pad", "version": "1.2.0",
                          "dist": {"tarball": format!("{}/-/left-pad-1.2.0.tgz", tarballs.uri())}},
                "1.3.0": {"name": "left-pad", "version": "1.3.0",
                          "dist": {"tarball": format!("{}/-/left-pad-1.3.0.tgz", tarballs.uri()),
                                   "integrity": integrity}},
                "2.0.0-beta.1": {"name": "left-pad", "version": "2.0.0-beta.1",
                                 "dist": {"tarball": format!("{}/-/left-pad-2.0.0-beta.1.tgz", tarballs.uri())}}
            }
        });
        let registry =
            mock_server(vec![("/left-pad", serde_json::to_vec(&packument).unwrap())]).await;
        (registry, tarballs)
    }

    fn fetcher(cache: &std::path::Path, registry: &MockServer, raw: &str) -> RegistryFetcher {
        let mut options = options(cache, Arc::new(FakeGit::default()));
        options.registry = format!("{}/", registry.uri());
        RegistryFetcher::new(PackageSpec::parse(raw).unwrap(), options).unwrap()
    }

    #[tokio::test]
    async fn pick_and_decorate() {
        let bytes = tarball();
        let sri = integrity::label(&Integrity::from_bytes(&bytes));
        let (registry, tarballs) = start_registry(&bytes, &sri).await;
        let cache = tempfile::tempdir().unwrap();

        let latest = fetcher(cache.path(), &registry, "left-pad");
        assert_eq!(
            latest.manifest().await.unwrap().version.as_deref(),
            Some("1.2.0")
        );
        assert_eq!(latest.integrity(), None);

        let ranged = fetcher(cache.path(), &registry, "left-pad@^1.2.1");
        let manifest = ranged.manifest().await.unwrap();
        assert_eq!(manifest.version.as_deref(), Some("1.3.0"));
        assert_eq!(manifest.integrity.as_deref(), Some(sri.as_str()));
        let resolved = format!("{}/-/left-pad-1.3.0.tgz", tarballs.uri());
        assert_eq!(manifest.resolved.as_deref(), Some(resolved.as_str()));
        assert_eq!(ranged.resolve().await.unwrap(), resolved);

        let tagged = fetcher(cache.path(), &registry, "left-pad@next");
        assert_eq!(
            tagged.manifest().await.unwrap().version.as_deref(),
            Some("2.0.0-beta.1")
        );
    }

    #[tokio::test]
    async fn packument_is_fetched_once() {
        let bytes = tarball();
        let (registry, _tarballs) = start_registry(&bytes, "sha512-unused").await;
        let cache = tempfile::tempdir().unwrap();
        let fetcher = fetcher(cache.path(), &registry, "left-pad@^1");

        let packument = fetcher.packument().await.unwrap();
        assert_eq!(packument.versions.len(), 3);
        assert_eq!(packument.dist_tags["latest"], "1.2.0");
        fetcher.manifest().await.unwrap();
        fetcher.resolve().await.unwrap();
        assert_eq!(hits(&registry).await, 1);
    }

    #[tokio::test]
    async fn no_matching_version() {
        let bytes = tarball();
        let (registry, _tarballs) = start_registry(&bytes, "sha512-unused").await;
        let cache = tempfile::tempdir().unwrap();

        let error = fetcher(cache.path(), &registry, "left-pad@^3")
            .manifest()
            .await
            .unwrap_err();
        assert!(
            matches!(&error, FetchError::NoMatchingVersion { wanted, .. } if wanted == "^3"),
            "{error}"
        );
    }

    #[tokio::test]
    async fn tarball_is_verified_against_registry_integrity() {
        let bytes = tarball();
        let sri = integrity::label(&Integrity::from_bytes(&bytes));
        let (registry, tarballs) = start_registry(&bytes, &sri).await;
        let cache = tempfile::tempdir().unwrap();

        let stream = fetcher(cache.path(), &registry, "left-pad@1.3.0").tarball();
        let data = stream.collect().await.unwrap();
        assert_eq!(data.bytes, bytes);
        assert_eq!(data.integrity.as_deref(), Some(sri.as_str()));
        assert_eq!(hits(&tarballs).await, 1);

        // A second fetcher knows the integrity from the packument and the
        // blob is already stored.
        let again = fetcher(cache.path(), &registry, "left-pad@1.3.0");
        again.manifest().await.unwrap();
        assert_eq!(again.tarball().collect().await.unwrap().bytes, bytes);
        assert_eq!(hits(&tarballs).await, 1);

        let wrong = integrity::label(&Integrity::from_bytes(b"tampered"));
        let (registry, _tarballs) = start_registry(&bytes, &wrong).await;
        let fresh = tempfile::tempdir().unwrap();
        let error = fetcher(fresh.path(), &registry, "left-pad@1.3.0")
            .tarball()
            .collect()
            .await
            .unwrap_err();
        assert!(matches!(error, FetchError::Integrity { .. }), "{error}");
    }
}
