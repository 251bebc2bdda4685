//! Local artifact cache and diagnostics dump sink.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::Utc;
use mps_core::{RawArtifactBundle, VirtualFile};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mps-storage";

pub const MAIN_FILE: &str = "bid.html";
pub const SELECTED_MODAL_FILE: &str = "selected_modal.json";
pub const BUYING_ORDER_FILE: &str = "bo.html";
const MODAL_PREFIX: &str = "modal_";
const MODAL_SUFFIX: &str = ".json";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Result of caching one listing.
#[derive(Debug, Clone)]
pub struct SavedListing {
    pub idn: String,
    pub directory: PathBuf,
    pub artifacts: Vec<StoredArtifact>,
}

impl SavedListing {
    /// True when every file already existed with identical content.
    pub fn unchanged(&self) -> bool {
        self.artifacts.iter().all(|a| a.deduplicated)
    }
}

/// One directory per listing identifier under `root`.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    root: PathBuf,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn listing_dir(&self, idn: &str) -> anyhow::Result<PathBuf> {
        if idn.is_empty()
            || idn.starts_with('.')
            || idn.contains(['/', '\\'])
            || idn.chars().any(char::is_control)
        {
            bail!("listing identifier {idn:?} cannot be used as a directory name");
        }
        Ok(self.root.join(idn))
    }

    pub async fn contains(&self, idn: &str) -> anyhow::Result<bool> {
        let dir = self.listing_dir(idn)?;
        fs::try_exists(dir.join(MAIN_FILE))
            .await
            .with_context(|| format!("checking cached listing {}", dir.display()))
    }

    /// Writes the bundle into its listing directory, replacing whatever was
    /// cached before. Files are written into a staging directory that is
    /// renamed into place once complete.
    pub async fn save(&self, bundle: &RawArtifactBundle) -> anyhow::Result<SavedListing> {
        let directory = self.listing_dir(&bundle.idn)?;
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating cache root {}", self.root.display()))?;

        let staging = self
            .root
            .join(format!(".{}.{}.tmp", bundle.idn, Uuid::new_v4()));
        fs::create_dir(&staging)
            .await
            .with_context(|| format!("creating staging directory {}", staging.display()))?;

        let result = self.write_files(bundle, &directory, &staging).await;
        let artifacts = match result {
            Ok(artifacts) => artifacts,
            Err(err) => {
                let _ = fs::remove_dir_all(&staging).await;
                return Err(err);
            }
        };

        if fs::try_exists(&directory).await.unwrap_or(false) {
            fs::remove_dir_all(&directory)
                .await
                .with_context(|| format!("removing previous cache entry {}", directory.display()))?;
        }
        if let Err(err) = fs::rename(&staging, &directory).await {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming staging directory {} -> {}",
                    staging.display(),
                    directory.display()
                )
            });
        }

        let saved = SavedListing {
            idn: bundle.idn.clone(),
            directory,
            artifacts,
        };
        debug!(idn = %saved.idn, files = saved.artifacts.len(), unchanged = saved.unchanged(), "cached listing");
        Ok(saved)
    }

    async fn write_files(
        &self,
        bundle: &RawArtifactBundle,
        previous: &Path,
        staging: &Path,
    ) -> anyhow::Result<Vec<StoredArtifact>> {
        let mut files: Vec<(String, &[u8])> = vec![(MAIN_FILE.to_string(), bundle.main_html.as_bytes())];
        for (i, modal) in bundle.modals.iter().enumerate() {
            files.push((format!("{MODAL_PREFIX}{i}{MODAL_SUFFIX}"), modal.as_bytes()));
        }
        if let Some(selected) = &bundle.selected_modal {
            files.push((SELECTED_MODAL_FILE.to_string(), selected.as_bytes()));
        }
        if let Some(listing) = &bundle.provider_listing {
            files.push((attachment_name(&listing.filename)?, listing.content.as_bytes()));
        }
        if let Some(html) = &bundle.buying_order_html {
            files.push((BUYING_ORDER_FILE.to_string(), html.as_bytes()));
        }
        if let Some(pdf) = &bundle.buying_order_pdf {
            files.push((attachment_name(&pdf.filename)?, pdf.content.as_slice()));
        }

        let mut artifacts = Vec::with_capacity(files.len());
        for (name, bytes) in files {
            artifacts.push(write_file(previous, staging, &name, bytes).await?);
        }
        Ok(artifacts)
    }

    /// Identifiers of every cached listing, sorted.
    pub async fn listing_ids(&self) -> anyhow::Result<Vec<String>> {
        if !fs::try_exists(&self.root).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("reading cache root {}", self.root.display()))?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.file_type().await?.is_dir() {
                continue;
            }
            if fs::try_exists(entry.path().join(MAIN_FILE)).await.unwrap_or(false) {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub async fn load(&self, idn: &str) -> anyhow::Result<RawArtifactBundle> {
        let dir = self.listing_dir(idn)?;
        let main_html = fs::read_to_string(dir.join(MAIN_FILE))
            .await
            .with_context(|| format!("reading {}", dir.join(MAIN_FILE).display()))?;
        let mut bundle = RawArtifactBundle::new(idn, main_html);

        let mut modals: Vec<(usize, String)> = Vec::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("reading cached listing {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            if name == MAIN_FILE {
                continue;
            }
            if let Some(index) = modal_index(&name) {
                modals.push((index, read_text(&path).await?));
            } else if name == SELECTED_MODAL_FILE {
                bundle.selected_modal = Some(read_text(&path).await?);
            } else if name == BUYING_ORDER_FILE {
                bundle.buying_order_html = Some(read_text(&path).await?);
            } else if has_extension(&name, "pdf") {
                let bytes = fs::read(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                bundle.buying_order_pdf = Some(VirtualFile::new(name, bytes));
            } else if bundle.provider_listing.is_none() {
                let content = read_text(&path).await?;
                bundle.provider_listing = Some(VirtualFile::new(name, content));
            } else {
                warn!(idn, file = %name, "ignoring unexpected file in cached listing");
            }
        }
        modals.sort_by_key(|(index, _)| *index);
        bundle.modals = modals.into_iter().map(|(_, text)| text).collect();
        Ok(bundle)
    }

    /// Reads every cached listing back into bundles.
    pub async fn load_all(&self) -> anyhow::Result<Vec<RawArtifactBundle>> {
        let ids = self.listing_ids().await?;
        let mut bundles = Vec::with_capacity(ids.len());
        for idn in ids {
            bundles.push(self.load(&idn).await?);
        }
        info!(count = bundles.len(), root = %self.root.display(), "loaded cached listings");
        Ok(bundles)
    }
}

fn modal_index(name: &str) -> Option<usize> {
    name.strip_prefix(MODAL_PREFIX)?
        .strip_suffix(MODAL_SUFFIX)?
        .parse()
        .ok()
}

fn has_extension(name: &str, ext: &str) -> bool {
    Path::new(name)
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// Keeps only the final path component of a suggested download name.
fn attachment_name(suggested: &str) -> anyhow::Result<String> {
    let name = Path::new(suggested)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if name.is_empty()
        || name.starts_with('.')
        || [MAIN_FILE, SELECTED_MODAL_FILE, BUYING_ORDER_FILE].contains(&name.as_str())
        || modal_index(&name).is_some()
    {
        bail!("attachment name {suggested:?} collides with the cache layout");
    }
    Ok(name)
}

async fn read_text(path: &Path) -> anyhow::Result<String> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

async fn write_file(
    previous: &Path,
    staging: &Path,
    name: &str,
    bytes: &[u8],
) -> anyhow::Result<StoredArtifact> {
    let content_hash = ArtifactCache::sha256_hex(bytes);
    let deduplicated = match fs::read(previous.join(name)).await {
        Ok(existing) => ArtifactCache::sha256_hex(&existing) == content_hash,
        Err(_) => false,
    };

    let path = staging.join(name);
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&path)
        .await
        .with_context(|| format!("opening cache file {}", path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing cache file {}", path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing cache file {}", path.display()))?;

    Ok(StoredArtifact {
        content_hash,
        relative_path: PathBuf::from(name),
        byte_size: bytes.len(),
        deduplicated,
    })
}

#[derive(Debug, Clone)]
pub struct DumpPaths {
    pub screenshot: PathBuf,
    pub html: PathBuf,
}

/// Receives screenshot + HTML pairs captured when the navigator hits an
/// unexpected condition.
#[async_trait]
pub trait DumpSink: Send + Sync {
    async fn dump(&self, label: &str, screenshot: &[u8], html: &str) -> anyhow::Result<Option<DumpPaths>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDumpSink;

#[async_trait]
impl DumpSink for NoopDumpSink {
    async fn dump(&self, _label: &str, _screenshot: &[u8], _html: &str) -> anyhow::Result<Option<DumpPaths>> {
        Ok(None)
    }
}

/// Writes `<unix-millis>.png` and `<unix-millis>.html` into a directory.
#[derive(Debug, Clone)]
pub struct DirDumpSink {
    dir: PathBuf,
}

impl DirDumpSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl DumpSink for DirDumpSink {
    async fn dump(&self, label: &str, screenshot: &[u8], html: &str) -> anyhow::Result<Option<DumpPaths>> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating dump directory {}", self.dir.display()))?;
        let stamp = Utc::now().timestamp_millis();
        let paths = DumpPaths {
            screenshot: self.dir.join(format!("{stamp}.png")),
            html: self.dir.join(format!("{stamp}.html")),
        };
        fs::write(&paths.screenshot, screenshot)
            .await
            .with_context(|| format!("writing {}", paths.screenshot.display()))?;
        fs::write(&paths.html, html)
            .await
            .with_context(|| format!("writing {}", paths.html.display()))?;
        warn!(label, screenshot = %paths.screenshot.display(), "saved diagnostic dump");
        Ok(Some(paths))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_bundle() -> RawArtifactBundle {
        let mut bundle = RawArtifactBundle::new("1057-12-COT24", "<html>detail</html>");
        bundle.modals = vec!["{\"d\":\"a\"}".into(), "{\"d\":\"b\"}".into()];
        bundle.selected_modal = Some("{\"d\":\"sel\"}".into());
        bundle.provider_listing = Some(VirtualFile::new(
            "ProveedoresCotizacionCAgil_1057-12-COT24.xls",
            "<table></table>".to_string(),
        ));
        bundle.buying_order_html = Some("<html>oc</html>".into());
        bundle.buying_order_pdf = Some(VirtualFile::new("1057-99-AG24.pdf", vec![1, 2, 3]));
        bundle
    }

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactCache::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn saved_bundle_loads_back_identically() {
        let dir = tempdir().expect("tempdir");
        let cache = ArtifactCache::new(dir.path());
        let bundle = sample_bundle();

        let saved = cache.save(&bundle).await.expect("save");
        assert_eq!(saved.artifacts.len(), 7);
        assert!(!saved.unchanged());
        assert!(saved.directory.join("modal_1.json").exists());

        let loaded = cache.load("1057-12-COT24").await.expect("load");
        assert_eq!(loaded, bundle);
        assert!(cache.contains("1057-12-COT24").await.expect("contains"));
        assert!(!cache.contains("other").await.expect("contains"));
    }

    #[tokio::test]
    async fn resave_replaces_directory_and_reports_dedup() {
        let dir = tempdir().expect("tempdir");
        let cache = ArtifactCache::new(dir.path());
        let bundle = sample_bundle();
        cache.save(&bundle).await.expect("first save");

        let again = cache.save(&bundle).await.expect("second save");
        assert!(again.unchanged());

        let mut smaller = RawArtifactBundle::new("1057-12-COT24", "<html>detail</html>");
        smaller.modals = vec!["{\"d\":\"a\"}".into()];
        let replaced = cache.save(&smaller).await.expect("third save");
        assert!(replaced.unchanged());
        assert!(!replaced.directory.join("modal_1.json").exists());
        assert!(!replaced.directory.join("bo.html").exists());
        assert_eq!(cache.load("1057-12-COT24").await.expect("load"), smaller);
    }

    #[tokio::test]
    async fn listing_ids_skip_staging_and_loose_files() {
        let dir = tempdir().expect("tempdir");
        let cache = ArtifactCache::new(dir.path());
        assert!(cache.listing_ids().await.expect("empty").is_empty());

        cache.save(&RawArtifactBundle::new("2-B", "b")).await.expect("save");
        cache.save(&RawArtifactBundle::new("1-A", "a")).await.expect("save");
        std::fs::create_dir(dir.path().join(".1-A.partial.tmp")).expect("staging");
        std::fs::write(dir.path().join("notes.txt"), "x").expect("loose file");

        assert_eq!(cache.listing_ids().await.expect("ids"), vec!["1-A", "2-B"]);
        let all = cache.load_all().await.expect("load all");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].main_html, "a");
    }

    #[tokio::test]
    async fn unsafe_names_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let cache = ArtifactCache::new(dir.path());
        assert!(cache.save(&RawArtifactBundle::new("../x", "a")).await.is_err());

        let mut bundle = RawArtifactBundle::new("3-C", "c");
        bundle.provider_listing = Some(VirtualFile::new("bid.html", String::new()));
        assert!(cache.save(&bundle).await.is_err());
        assert!(cache.listing_ids().await.expect("ids").is_empty());
    }

    #[tokio::test]
    async fn dir_dump_sink_writes_pair() {
        let dir = tempdir().expect("tempdir");
        let sink = DirDumpSink::new(dir.path().join("dumps"));
        let paths = sink
            .dump("login", b"\x89PNG", "<html></html>")
            .await
            .expect("dump")
            .expect("paths");
        assert!(paths.screenshot.exists());
        assert_eq!(std::fs::read_to_string(paths.html).expect("html"), "<html></html>");
        assert!(NoopDumpSink.dump("x", b"", "").await.expect("noop").is_none());
    }
}
