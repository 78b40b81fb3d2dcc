//! Directory tree storage for mirrored repositories.
//!
//! A store manages one staging (or published) tree together with a
//! sidecar `info.json` holding the checksum record of every stored
//! file. Files enter the tree by hardlink, either from a tempfile
//! holding freshly downloaded bytes or from the previously published
//! tree when a record is unchanged.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use anyhow::bail;
use hashbrown::HashMap;
use log::warn;
use parking_lot::RwLock;
use rand::Rng as _;
use rand::SeedableRng as _;
use rand::distr::Alphanumeric;
use rand::rngs::SmallRng;
use tokio::io::AsyncWriteExt as _;

use crate::fileinfo::{FileInfo, clean_path};

const INFO_JSON: &str = "info.json";

/// Calls fsync on a directory to persist changes to its entries.
///
/// Needed after file creation, hardlinks and renames.
pub(crate) async fn dir_sync(d: &Path) -> std::io::Result<()> {
    let dir = tokio::fs::File::open(d).await?;
    dir.sync_all().await
}

/// Recursively fsyncs all directories below (and including) `d`.
pub(crate) async fn dir_sync_tree(d: &Path) -> std::io::Result<()> {
    let mut stack = vec![d.to_path_buf()];

    while let Some(dir) = stack.pop() {
        dir_sync(&dir).await?;

        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                stack.push(entry.path());
            }
        }
    }

    Ok(())
}

pub(crate) struct MirrorStore {
    dir: PathBuf,
    prefix: String,
    info: RwLock<HashMap<String, FileInfo>>,
}

impl MirrorStore {
    /// Opens a store over an existing absolute directory; `prefix` is
    /// the mirror id and names the subdirectory holding the tree.
    pub(crate) fn new(dir: &Path, prefix: &str) -> anyhow::Result<Self> {
        if !dir.is_absolute() {
            bail!("not absolute: {}", dir.display());
        }

        let meta = std::fs::metadata(dir)
            .with_context(|| format!("failed to inspect `{}`", dir.display()))?;
        if !meta.is_dir() {
            bail!("not a directory: {}", dir.display());
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            info: RwLock::new(HashMap::new()),
        })
    }

    #[must_use]
    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    fn full_path(&self, p: &str) -> PathBuf {
        let mut full = self.dir.join(&self.prefix);
        full.push(clean_path(p));
        full
    }

    /// Loads the checksum records of a previously published tree.
    /// A missing `info.json` leaves the store empty.
    pub(crate) async fn load(&self) -> anyhow::Result<()> {
        let info_path = self.dir.join(INFO_JSON);

        let data = match tokio::fs::read(&info_path).await {
            Ok(d) => d,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read `{}`", info_path.display()));
            }
        };

        let map: HashMap<String, FileInfo> = serde_json::from_slice(&data)
            .with_context(|| format!("failed to decode `{}`", info_path.display()))?;

        *self.info.write() = map;
        Ok(())
    }

    /// Persists the checksum records and fsyncs the whole tree.
    pub(crate) async fn save(&self) -> anyhow::Result<()> {
        let info_path = self.dir.join(INFO_JSON);

        let data = {
            let info = self.info.read();
            serde_json::to_vec(&*info).context("failed to encode records")?
        };

        let mut file = tokio::fs::File::create(&info_path)
            .await
            .with_context(|| format!("failed to create `{}`", info_path.display()))?;
        file.write_all(&data).await?;
        file.sync_all().await?;

        dir_sync_tree(&self.dir).await?;

        Ok(())
    }

    async fn temp_file(&self) -> std::io::Result<(tokio::fs::File, PathBuf)> {
        const MAX_TRIES: u32 = 10;

        let mut rng = SmallRng::from_os_rng();
        let mut tries = 0;

        loop {
            let suffix: String = (&mut rng)
                .sample_iter(Alphanumeric)
                .take(6)
                .map(char::from)
                .collect();

            let path = self.dir.join(format!("_tmp.{suffix}"));

            match tokio::fs::File::options()
                .create_new(true)
                .write(true)
                .open(&path)
                .await
            {
                Ok(file) => return Ok((file, path)),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    tries += 1;
                    if tries > MAX_TRIES {
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn link_into_tree(&self, source: &Path, targets: &[String]) -> anyhow::Result<()> {
        for target in targets {
            let full = self.full_path(target);
            let parent = full.parent().expect("tree path has a parent directory");

            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create `{}`", parent.display()))?;

            match tokio::fs::hard_link(source, &full).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to link `{}`", full.display()));
                }
            }
        }
        Ok(())
    }

    async fn write_temp(&self, data: &[u8]) -> anyhow::Result<PathBuf> {
        let (mut file, tempname) = self.temp_file().await.context("failed to create tempfile")?;
        file.write_all(data).await?;
        file.sync_all().await?;
        Ok(tempname)
    }

    async fn remove_temp(&self, tempname: &Path) {
        if let Err(err) = tokio::fs::remove_file(tempname).await {
            warn!("Failed to remove tempfile `{}`:  {err}", tempname.display());
        }
    }

    /// Stores downloaded bytes under the record's canonical path.
    pub(crate) async fn store(&self, fi: &FileInfo, data: &[u8]) -> anyhow::Result<()> {
        {
            let mut info = self.info.write();
            if info.contains_key(fi.path.as_str()) {
                bail!("already stored: {}", fi.path);
            }
            info.insert(fi.path.clone(), fi.clone());
        }

        let tempname = self.write_temp(data).await?;
        let res = self.link_into_tree(&tempname, &[fi.path.clone()]).await;
        self.remove_temp(&tempname).await;
        res
    }

    /// Stores downloaded bytes under the canonical path plus the
    /// by-hash alias paths of every digest the record carries.
    pub(crate) async fn store_with_hash(&self, fi: &FileInfo, data: &[u8]) -> anyhow::Result<()> {
        let targets = self.register_with_hash(fi);

        let tempname = self.write_temp(data).await?;
        let res = self.link_into_tree(&tempname, &targets).await;
        self.remove_temp(&tempname).await;
        res
    }

    /// Hardlinks a file of the previous tree under the record's
    /// canonical path.
    pub(crate) async fn store_link(&self, fi: &FileInfo, fullpath: &Path) -> anyhow::Result<()> {
        {
            let mut info = self.info.write();
            if info.contains_key(fi.path.as_str()) {
                bail!("already stored: {}", fi.path);
            }
            info.insert(fi.path.clone(), fi.clone());
        }

        self.link_into_tree(fullpath, &[fi.path.clone()]).await
    }

    /// Hardlinks a file of the previous tree under the canonical path
    /// and its by-hash aliases.
    pub(crate) async fn store_link_with_hash(
        &self,
        fi: &FileInfo,
        fullpath: &Path,
    ) -> anyhow::Result<()> {
        let targets = self.register_with_hash(fi);
        self.link_into_tree(fullpath, &targets).await
    }

    /// Registers the record under its canonical and alias keys and
    /// returns the paths to link. An already-present canonical path
    /// is kept as is (another alternative of the same file won).
    fn register_with_hash(&self, fi: &FileInfo) -> Vec<String> {
        let mut targets = Vec::with_capacity(4);

        let mut info = self.info.write();

        if info.contains_key(fi.path.as_str()) {
            // another record already owns the canonical path
        } else {
            info.insert(fi.path.clone(), fi.clone());
            targets.push(fi.path.clone());
        }

        for alias in [fi.md5sum_path(), fi.sha1_path(), fi.sha256_path()]
            .into_iter()
            .flatten()
        {
            info.insert(alias.clone(), fi.clone());
            targets.push(alias);
        }

        targets
    }

    /// Looks up a file matching `fi`, preferring its SHA256 alias in
    /// by-hash mode. Returns the stored record and the full path.
    #[must_use]
    pub(crate) fn lookup(&self, fi: &FileInfo, by_hash: bool) -> Option<(FileInfo, PathBuf)> {
        let info = self.info.read();

        let check = |p: &str| -> Option<(FileInfo, PathBuf)> {
            let stored = info.get(p)?;
            if !fi.same(stored) {
                return None;
            }
            Some((stored.clone(), self.full_path(p)))
        };

        if by_hash
            && let Some(alias) = fi.sha256_path()
            && let Some(found) = check(&alias)
        {
            return Some(found);
        }

        check(&fi.path)
    }

    /// Opens the named file below the tree.
    pub(crate) async fn open(&self, p: &str) -> std::io::Result<tokio::fs::File> {
        tokio::fs::File::open(self.full_path(p)).await
    }
}
