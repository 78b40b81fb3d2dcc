//! Mirroring of upstream repositories into atomically published
//! trees.
//!
//! A run builds a timestamped staging directory, reuses unchanged
//! files from the previously published tree via hardlinks, downloads
//! the rest, and publishes the result by atomically replacing a
//! stable symlink. Staging directories no symlink points at are
//! garbage collected afterwards.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use anyhow::anyhow;
use anyhow::bail;
use bytes::Bytes;
use hashbrown::HashMap;
use http_body_util::{BodyExt as _, Empty};
use hyper::header::USER_AGENT;
use hyper::{Request, StatusCode};
use log::{debug, error, info, warn};
use time::OffsetDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cacher::{APP_USER_AGENT, Client, build_client};
use crate::config::{MirrorConfig, MirrorEntryConfig, raw_name};
use crate::error::CacheError;
use crate::fileinfo::FileInfo;
use crate::meta::{extract_file_info, is_supported_compression, supports_by_hash};
use crate::mirror_store::{MirrorStore, dir_sync};

const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year][month][day]_[hour][minute][second]");
const HTTP_RETRIES: u32 = 5;
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5 * 60);
const LOCK_FILENAME: &str = ".lock";

#[must_use]
fn valid_mirror_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-'))
}

#[must_use]
fn basename(p: &str) -> &str {
    match p.rsplit_once('/') {
        Some((_, base)) => base,
        None => p,
    }
}

/// Outcome of one upstream fetch in a mirror run.
struct DlResult {
    path: String,
    status: StatusCode,
    fi: Option<FileInfo>,
    data: Vec<u8>,
}

/// Fetches one file, retrying transport errors, read errors and 5xx
/// up to five times with exponential backoff.
///
/// On checksum mismatch the by-hash alias paths (SHA256, SHA1, MD5)
/// are tried in turn before the download counts as failed. 4xx
/// statuses are returned to the caller without retrying.
async fn download_file(
    client: Client,
    mc: Arc<MirrorEntryConfig>,
    cancel: CancellationToken,
    p: String,
    fi: Option<FileInfo>,
    by_hash: bool,
) -> anyhow::Result<DlResult> {
    let mut targets = vec![p.clone()];
    if by_hash && let Some(fi) = &fi {
        targets.extend(
            [fi.sha256_path(), fi.sha1_path(), fi.md5sum_path()]
                .into_iter()
                .flatten(),
        );
    }

    let mut retries: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            bail!("download of `{p}` cancelled");
        }

        if retries > 0 {
            warn!("Retrying download of `{p}` ({retries}/{HTTP_RETRIES})");
            tokio::time::sleep(Duration::from_secs(1 << (retries - 1))).await;
        }

        let url = mc
            .resolve(&targets[0])
            .ok_or_else(|| anyhow!("unresolvable path `{}`", targets[0]))?;

        let request = Request::get(url.as_str())
            .header(USER_AGENT, APP_USER_AGENT)
            .body(Empty::<Bytes>::new())
            .expect("request is valid");

        let response = match client.request(request).await {
            Ok(r) => r,
            Err(err) => {
                if retries < HTTP_RETRIES {
                    retries += 1;
                    continue;
                }
                return Err(err).with_context(|| format!("download of `{p}`"));
            }
        };

        let status = response.status();
        debug!("GET {url} answered {status}");

        let data = match response.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                if retries < HTTP_RETRIES {
                    retries += 1;
                    continue;
                }
                return Err(err).with_context(|| format!("read of `{p}`"));
            }
        };

        if status.is_server_error() && retries < HTTP_RETRIES {
            retries += 1;
            continue;
        }
        if status != StatusCode::OK {
            return Ok(DlResult {
                path: p,
                status,
                fi: None,
                data: Vec::new(),
            });
        }

        let fi2 = FileInfo::from_data(p.clone(), &data);
        if let Some(expected) = &fi
            && !expected.same(&fi2)
        {
            if targets.len() > 1 {
                targets.remove(0);
                warn!(
                    "Checksum mismatch for `{p}`, trying by-hash target `{}`",
                    targets[0]
                );
                continue;
            }
            return Err(CacheError::IntegrityFailure(p).into());
        }

        return Ok(DlResult {
            path: p,
            status,
            fi: Some(fi2),
            data: data.to_vec(),
        });
    }
}

/// Records a release-authorised record, keeping distinct digests for
/// one path as alternatives when by-hash is enabled.
fn add_file_info_to_list(
    fi: FileInfo,
    map: &mut HashMap<String, Vec<FileInfo>>,
    by_hash: bool,
) -> anyhow::Result<()> {
    let Some(fil) = map.get_mut(fi.path.as_str()) else {
        map.insert(fi.path.clone(), vec![fi]);
        return Ok(());
    };

    if fil.iter().any(|existing| existing.same(&fi)) {
        return Ok(());
    }

    // fi differs from every record seen for this path
    if !by_hash {
        return Err(CacheError::InconsistentChecksum(fi.path).into());
    }
    fil.push(fi);
    Ok(())
}

/// One mirror's update run.
pub(crate) struct Mirror {
    id: String,
    dir: PathBuf,
    mc: Arc<MirrorEntryConfig>,
    storage: MirrorStore,
    current: Option<MirrorStore>,
    semaphore: Arc<Semaphore>,
    client: Client,
    cancel: CancellationToken,
}

impl Mirror {
    /// Prepares an update run: resolves the currently published tree
    /// (if any) and creates the staging directory stamped with `now`.
    pub(crate) async fn new(
        now: OffsetDateTime,
        id: &str,
        config: &MirrorConfig,
        client: Client,
        semaphore: Arc<Semaphore>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let Some(mc) = config.mirrors.get(id) else {
            bail!("no such mirror: {id}");
        };

        if !valid_mirror_id(id) {
            bail!("invalid id: {id}");
        }
        mc.check().with_context(|| id.to_string())?;

        let dir = config.dir.clone();

        let current = match tokio::fs::canonicalize(dir.join(id)).await {
            Ok(curdir) => {
                let parent = curdir
                    .parent()
                    .ok_or_else(|| anyhow!("published tree `{}` has no parent", curdir.display()))?;
                let store = MirrorStore::new(parent, id).with_context(|| id.to_string())?;
                store.load().await.with_context(|| id.to_string())?;
                Some(store)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err).with_context(|| id.to_string()),
        };

        let stamp = now
            .format(&TIMESTAMP_FORMAT)
            .context("failed to format timestamp")?;
        let staging = dir.join(format!(".{id}.{stamp}"));
        tokio::fs::create_dir(&staging)
            .await
            .with_context(|| format!("failed to create `{}`", staging.display()))?;

        let storage = MirrorStore::new(&staging, id)?;

        Ok(Self {
            id: id.to_string(),
            dir,
            mc: Arc::new(mc.clone()),
            storage,
            current,
            semaphore,
            client,
            cancel,
        })
    }

    #[must_use]
    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    async fn store(&self, fi: &FileInfo, data: &[u8], by_hash: bool) -> anyhow::Result<()> {
        if by_hash {
            self.storage.store_with_hash(fi, data).await
        } else {
            self.storage.store(fi, data).await
        }
    }

    async fn store_link(&self, fi: &FileInfo, fp: &Path, by_hash: bool) -> anyhow::Result<()> {
        if by_hash {
            self.storage.store_link_with_hash(fi, fp).await
        } else {
            self.storage.store_link(fi, fp).await
        }
    }

    /// Downloads the candidate release files of every suite.
    ///
    /// 4xx responses are tolerated (not every variant exists); other
    /// non-200 statuses fail the run. Each successful response is
    /// stored, extracted and counted into the by-hash support vote.
    async fn download_release(&self) -> anyhow::Result<(HashMap<String, Vec<FileInfo>>, bool)> {
        let mut set = JoinSet::new();

        for p in self.mc.release_files() {
            let client = self.client.clone();
            let mc = self.mc.clone();
            let cancel = self.cancel.clone();
            let semaphore = self.semaphore.clone();

            set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore is never closed");
                download_file(client, mc, cancel, p, None, false).await
            });
        }

        let mut responses = Vec::new();
        while let Some(res) = set.join_next().await {
            let r = res.context("release download task died")??;

            if r.status.is_client_error() {
                continue;
            }
            if r.status != StatusCode::OK {
                return Err(CacheError::BadStatus(r.status, r.path).into());
            }
            responses.push(r);
        }

        // deterministic processing order regardless of completion order
        responses.sort_by(|a, b| a.path.cmp(&b.path));

        let mut by_hash = true;
        let mut extracted = Vec::new();

        for r in &responses {
            let fi = r.fi.as_ref().expect("200 response carries a record");
            self.storage
                .store(fi, &r.data)
                .await
                .context("failed to store release file")?;

            let (fil, paragraph) = extract_file_info(&r.path, r.data.as_slice())
                .await
                .with_context(|| format!("extraction of `{}`", r.path))?;

            if by_hash && basename(&r.path) != "Release.gpg" {
                by_hash = paragraph.as_ref().is_some_and(supports_by_hash);
            }

            extracted.push(fil);
        }

        let mut fil_map = HashMap::new();
        for fil in extracted {
            for fi in fil {
                add_file_info_to_list(fi, &mut fil_map, by_hash)?;
            }
        }

        Ok((fil_map, by_hash))
    }

    /// Downloads (or reuses from the published tree) the given files.
    ///
    /// `allow_missing` tolerates 404s, used for indices a release
    /// lists but the upstream does not serve.
    async fn download_files(
        &self,
        fil: Vec<FileInfo>,
        allow_missing: bool,
        by_hash: bool,
    ) -> anyhow::Result<Vec<FileInfo>> {
        let total = fil.len();
        let mut reused = Vec::with_capacity(fil.len());
        let mut downloaded = Vec::new();
        let mut set: JoinSet<anyhow::Result<DlResult>> = JoinSet::new();
        let mut logged_at = tokio::time::Instant::now();

        for (i, fi) in fil.into_iter().enumerate() {
            if logged_at.elapsed() > PROGRESS_INTERVAL {
                logged_at = tokio::time::Instant::now();
                info!(
                    "Download progress for {}: total={total}, reused={}, downloads={}",
                    self.id,
                    reused.len(),
                    i - reused.len(),
                );
            }

            if let Some(current) = &self.current
                && let Some((localfi, fullpath)) = current.lookup(&fi, by_hash)
            {
                self.store_link(&localfi, &fullpath, by_hash)
                    .await
                    .context("failed to link reused file")?;
                debug!("Reusing `{}`", localfi.path);
                reused.push(localfi);
                continue;
            }

            if self.cancel.is_cancelled() {
                bail!("{}: update cancelled", self.id);
            }

            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore is never closed");

            let client = self.client.clone();
            let mc = self.mc.clone();
            let cancel = self.cancel.clone();

            set.spawn(async move {
                let _permit = permit;
                download_file(client, mc, cancel, fi.path.clone(), Some(fi), by_hash).await
            });

            // keep memory bounded by draining finished downloads early
            while let Some(res) = set.try_join_next() {
                if let Some(fi2) = self.recv_result(res, allow_missing, by_hash).await? {
                    downloaded.push(fi2);
                }
            }
        }

        while let Some(res) = set.join_next().await {
            if let Some(fi2) = self.recv_result(Ok(res?), allow_missing, by_hash).await? {
                downloaded.push(fi2);
            }
        }

        info!(
            "Stats for {}: total={total}, reused={}, downloaded={}",
            self.id,
            reused.len(),
            downloaded.len()
        );

        reused.append(&mut downloaded);
        Ok(reused)
    }

    async fn recv_result(
        &self,
        res: Result<anyhow::Result<DlResult>, tokio::task::JoinError>,
        allow_missing: bool,
        by_hash: bool,
    ) -> anyhow::Result<Option<FileInfo>> {
        let r = res.context("download task died")??;

        if allow_missing && r.status == StatusCode::NOT_FOUND {
            warn!("Missing file `{}` for {}", r.path, self.id);
            return Ok(None);
        }
        if r.status != StatusCode::OK {
            return Err(CacheError::BadStatus(r.status, r.path).into());
        }

        let fi = r.fi.expect("200 response carries a record");
        self.store(&fi, &r.data, by_hash)
            .await
            .context("failed to store downloaded file")?;

        Ok(Some(fi))
    }

    /// Extracts the item records from every downloaded index that
    /// matches the mirror's filter. Records the release map already
    /// authorises are skipped.
    async fn extract_items(
        &self,
        indices: &[FileInfo],
        index_map: &HashMap<String, Vec<FileInfo>>,
    ) -> anyhow::Result<HashMap<String, FileInfo>> {
        let mut item_map = HashMap::new();

        for index in indices {
            let p = index.path.as_str();
            if !self.mc.matching_index(p) || !is_supported_compression(p) {
                continue;
            }

            // the store registers the canonical path in by-hash mode
            // as well, so the canonical name is always readable
            let file = self
                .storage
                .open(p)
                .await
                .with_context(|| format!("failed to open index `{p}`"))?;

            let (fil, _) = extract_file_info(p, tokio::io::BufReader::new(file))
                .await
                .with_context(|| format!("extraction of `{p}`"))?;

            for fi in fil {
                if index_map.contains_key(fi.path.as_str()) {
                    // already included in Release/InRelease
                    continue;
                }
                item_map.insert(fi.path.clone(), fi);
            }
        }

        Ok(item_map)
    }

    /// Downloads the repository metadata and returns the items it
    /// authorises, without downloading any packages yet.
    pub(crate) async fn update_metadata(&self) -> anyhow::Result<HashMap<String, FileInfo>> {
        info!("Downloading Release/InRelease for {}", self.id);

        let (mut index_map, by_hash) = self
            .download_release()
            .await
            .with_context(|| self.id.clone())?;

        if by_hash {
            info!("Detected by-hash support for {}", self.id);
        }

        if index_map.is_empty() {
            bail!("{}: found no Release/InRelease", self.id);
        }

        // Some upstreams return bogus bodies for Sources indices they
        // do not actually serve; skip them when sources are not
        // mirrored.
        if !self.mc.mirror_source {
            index_map.retain(|p, _| raw_name(p) != "Sources");
        }

        let indices: Vec<FileInfo> = index_map.values().flatten().cloned().collect();
        info!("Downloading {} indices for {}", indices.len(), self.id);

        let indices = self
            .download_files(indices, true, by_hash)
            .await
            .with_context(|| self.id.clone())?;

        self.extract_items(&indices, &index_map)
            .await
            .with_context(|| self.id.clone())
    }

    /// Runs a full update: metadata, items, `info.json`, atomic
    /// symlink swap.
    pub(crate) async fn update(&self) -> anyhow::Result<()> {
        let item_map = self.update_metadata().await?;

        info!("Downloading {} items for {}", item_map.len(), self.id);
        self.download_files(item_map.into_values().collect(), false, false)
            .await
            .with_context(|| self.id.clone())?;

        info!("Saving meta data for {}", self.id);
        self.storage.save().await.with_context(|| self.id.clone())?;

        self.replace_link().await.with_context(|| self.id.clone())?;

        info!("Update of {} succeeded", self.id);
        Ok(())
    }

    /// Atomically points `<dir>/<id>` at the new tree: a temporary
    /// symlink is created, the parent fsynced, and the rename commits
    /// the publication.
    async fn replace_link(&self) -> anyhow::Result<()> {
        let tname = self.dir.join(format!("{}.tmp", self.id));
        let _ = tokio::fs::remove_file(&tname).await;

        tokio::fs::symlink(self.storage.dir().join(&self.id), &tname).await?;

        // the new symlink exists only in the dentry so far
        dir_sync(&self.dir).await?;

        tokio::fs::rename(&tname, self.dir.join(&self.id)).await?;
        dir_sync(&self.dir).await?;

        Ok(())
    }
}

/// Removes staging directories (and stray files) no published
/// symlink refers to.
async fn gc(dir: &Path, cancel: &CancellationToken) -> anyhow::Result<()> {
    let mut using: HashSet<OsString> = HashSet::new();
    using.insert(OsString::from(LOCK_FILENAME));

    let mut names = Vec::new();

    let mut entries = tokio::fs::read_dir(dir).await.context("gc")?;
    while let Some(entry) = entries.next_entry().await.context("gc")? {
        let name = entry.file_name();

        if entry.file_type().await.context("gc")?.is_symlink() {
            let target = tokio::fs::canonicalize(entry.path()).await.context("gc")?;
            using.insert(name.clone());
            if let Some(stage) = target.parent().and_then(Path::file_name) {
                using.insert(stage.to_os_string());
            }
        }

        names.push((name, entry.path()));
    }

    for (name, path) in names {
        if using.contains(&name) {
            continue;
        }
        if cancel.is_cancelled() {
            bail!("gc cancelled");
        }

        info!("Removing old mirror data `{}`", path.display());

        let meta = tokio::fs::symlink_metadata(&path).await.context("gc")?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await.context("gc")?;
        } else {
            tokio::fs::remove_file(&path).await.context("gc")?;
        }
    }

    Ok(())
}

/// Updates the given mirrors (all configured ones if `ids` is empty)
/// while holding an exclusive advisory lock on `<dir>/.lock`, then
/// garbage collects unreferenced staging directories.
///
/// The first failing mirror cancels the remaining ones and its error
/// is surfaced; garbage collection still runs.
pub(crate) async fn run(
    config: MirrorConfig,
    ids: Vec<String>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let lock_path = config.dir.join(LOCK_FILENAME);
    let lock_file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .with_context(|| format!("failed to open `{}`", lock_path.display()))?;

    let _lock = nix::fcntl::Flock::lock(lock_file, nix::fcntl::FlockArg::LockExclusiveNonblock)
        .map_err(|(_, errno)| {
            anyhow!("failed to lock `{}`: {errno} (mirror run in progress?)", lock_path.display())
        })?;

    let ids: Vec<String> = if ids.is_empty() {
        config.mirrors.keys().cloned().collect()
    } else {
        ids
    };

    let now = OffsetDateTime::now_utc();
    let client = build_client();
    let permits = if config.max_conns == 0 {
        Semaphore::MAX_PERMITS
    } else {
        config.max_conns
    };
    let semaphore = Arc::new(Semaphore::new(permits));

    // a failing mirror aborts the others through this scope
    let scope = cancel.child_token();

    let mut first_err: Option<anyhow::Error> = None;

    let mut mirrors = Vec::new();
    for id in &ids {
        match Mirror::new(
            now,
            id,
            &config,
            client.clone(),
            semaphore.clone(),
            scope.clone(),
        )
        .await
        {
            Ok(m) => mirrors.push(m),
            Err(err) => {
                error!("Setup of mirror `{id}` failed:  {err:#}");
                first_err = Some(err);
                break;
            }
        }
    }

    if first_err.is_none() {
        info!("Update starts");

        let mut set = JoinSet::new();
        for m in mirrors {
            set.spawn(async move {
                let id = m.id().to_string();
                m.update().await.with_context(|| id)
            });
        }

        while let Some(res) = set.join_next().await {
            let update_res = match res {
                Ok(r) => r,
                Err(err) => Err(anyhow!("mirror task died: {err}")),
            };
            if let Err(err) = update_res {
                error!("Update failed:  {err:#}");
                if first_err.is_none() {
                    first_err = Some(err);
                    scope.cancel();
                }
            }
        }
    }

    // staging directories of a failed or aborted run are collected too
    if let Err(gc_err) = gc(&config.dir, &cancel).await {
        error!("Garbage collection failed:  {gc_err:#}");
        if first_err.is_none() {
            first_err = Some(gc_err);
        }
    }

    match first_err {
        Some(err) => Err(err),
        None => {
            info!("Update ends");
            Ok(())
        }
    }
}
