//! Core logic to download and cache repository items.
//!
//! One fetch is in flight per logical path at any time; concurrent
//! requesters wait on a shared readiness event and observe the same
//! outcome. Per-host semaphores bound upstream concurrency, and
//! failed statuses are answered from memory for a short period.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use hashbrown::HashMap;
use http_body_util::{BodyExt as _, Empty};
use hyper::body::Incoming;
use hyper::header::{CACHE_CONTROL, USER_AGENT};
use hyper::{Request, StatusCode};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use log::{debug, error, info, warn};
use tokio::io::{AsyncSeekExt as _, AsyncWriteExt as _, BufWriter};
use tokio::sync::{RwLock, Semaphore, watch};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::CacherConfig;
use crate::error::CacheError;
use crate::fileinfo::{DigestState, FileInfo};
use crate::humanfmt::HumanFmt;
use crate::meta::{extract_file_info, is_meta_path};
use crate::storage::Storage;
use crate::urlmap::UrlMap;

pub(crate) const APP_USER_AGENT: &str = concat!(
    "Debian APT-HTTP/1.3 (",
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    ")"
);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const WRITE_BUF_SIZE: usize = 64 * 1024;
const GIB: u64 = 1 << 30;

pub(crate) type Client = hyper_util::client::legacy::Client<
    hyper_timeout::TimeoutConnector<HttpsConnector<HttpConnector>>,
    Empty<Bytes>,
>;

/// Builds the upstream HTTP client: TLS-capable connector with a
/// connect timeout, shared by the cacher and the mirror.
#[must_use]
pub(crate) fn build_client() -> Client {
    let https_connector = HttpsConnector::new();

    let mut timeout_connector = hyper_timeout::TimeoutConnector::new(https_connector);
    timeout_connector.set_connect_timeout(Some(CONNECT_TIMEOUT));

    hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build(timeout_connector)
}

/// Re-keys extracted records below the logical path's prefix.
///
/// Release-like indices return a paragraph and already carry the
/// prefix through their own directory; Packages and Sources list
/// files relative to the repository root and need it prepended.
#[must_use]
fn authorised_records(p: &str, records: Vec<FileInfo>, release_like: bool) -> Vec<FileInfo> {
    if release_like {
        return records;
    }

    let prefix = p.split('/').next().unwrap_or_default();
    records.iter().map(|fi| fi.add_prefix(prefix)).collect()
}

/// The cacher rejects `.xz` and the lzma variants so the proxy path
/// never has to decompress an index.
#[must_use]
fn is_cacher_supported_compression(p: &str) -> bool {
    let base = match p.rsplit_once('/') {
        Some((_, base)) => base,
        None => p,
    };
    match base.rsplit_once('.') {
        None => true,
        Some((_, ext)) => matches!(ext, "gz" | "bz2" | "gpg"),
    }
}

struct DownloadState {
    /// One readiness event per in-flight fetch, keyed by logical path.
    in_flight: HashMap<String, watch::Receiver<bool>>,
    /// Upstream statuses of recently finished fetches, answered
    /// without a new fetch until evicted after the cache period.
    results: HashMap<String, StatusCode>,
}

struct CacherInner {
    meta: Storage,
    items: Storage,
    um: UrlMap,
    check_interval: Duration,
    cache_period: Duration,
    max_conns: usize,
    client: Client,
    cancel: CancellationToken,

    /// L1: authorised records per logical path.
    info: RwLock<HashMap<String, FileInfo>>,

    /// L2: in-flight and recent-status tables.
    downloads: RwLock<DownloadState>,

    /// Independent of L1-L3; never held across an await.
    host_sems: parking_lot::Mutex<HashMap<String, Arc<Semaphore>>>,
}

/// Downloads and caches repository indices and package files.
#[derive(Clone)]
pub(crate) struct Cacher {
    inner: Arc<CacherInner>,
}

impl Cacher {
    /// Sets up the stores and the authorisation map.
    ///
    /// Cached meta files are re-extracted so that records survive a
    /// restart; refresh drivers are spawned for every cached release
    /// file.
    pub(crate) async fn new(
        config: &CacherConfig,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let meta = Storage::new(&config.meta_dir, 0)?;
        let items = Storage::new(&config.cache_dir, config.cache_capacity * GIB)?;

        meta.load().await.context("failed to load meta storage")?;
        items.load().await.context("failed to load item storage")?;

        let mut um = UrlMap::new();
        for (prefix, upstream) in &config.mapping {
            let url = Url::parse(upstream).with_context(|| prefix.clone())?;
            um.register(prefix, url).with_context(|| prefix.clone())?;
        }

        let inner = Arc::new(CacherInner {
            meta,
            items,
            um,
            check_interval: config.check_interval,
            cache_period: config.cache_period,
            max_conns: config.max_conns,
            client: build_client(),
            cancel,
            info: RwLock::new(HashMap::new()),
            downloads: RwLock::new(DownloadState {
                in_flight: HashMap::new(),
                results: HashMap::new(),
            }),
            host_sems: parking_lot::Mutex::new(HashMap::new()),
        });

        let metas = inner.meta.list_all().await;

        {
            let mut info = inner.info.write().await;
            let mut dropped = Vec::new();

            for fi in &metas {
                let file = match inner.meta.lookup(fi).await {
                    Ok(f) => f,
                    Err(err) => {
                        warn!("Failed to open cached meta file `{}`:  {err}", fi.path);
                        continue;
                    }
                };

                match extract_file_info(&fi.path, tokio::io::BufReader::new(file)).await {
                    Ok((records, paragraph)) => {
                        for fi2 in authorised_records(&fi.path, records, paragraph.is_some()) {
                            info.insert(fi2.path.clone(), fi2);
                        }
                    }
                    Err(err) => {
                        warn!("Dropping broken cached meta file `{}`:  {err}", fi.path);
                        if let Err(del_err) = inner.meta.delete(&fi.path).await {
                            warn!("Failed to drop `{}`:  {del_err}", fi.path);
                        }
                        dropped.push(fi.path.clone());
                    }
                }
            }

            // meta files themselves have no authorising index
            for fi in metas {
                if dropped.contains(&fi.path) {
                    continue;
                }
                if !info.contains_key(fi.path.as_str()) {
                    let p = fi.path.clone();
                    info.insert(p.clone(), fi);
                    maint_meta(&inner, &p);
                }
            }
        }

        Ok(Self { inner })
    }

    /// Looks up a cached item, downloading it first if needed.
    ///
    /// Returns the (possibly cached) upstream status code and an open
    /// handle to the cache file on success.
    pub(crate) async fn get(
        &self,
        p: &str,
    ) -> Result<(StatusCode, Option<tokio::fs::File>), CacheError> {
        let inner = &self.inner;

        if inner.um.url(p).is_none() {
            return Ok((StatusCode::NOT_FOUND, None));
        }

        let is_meta = is_meta_path(p);
        if is_meta && !is_cacher_supported_compression(p) {
            // unsupported compression algorithms are not proxied
            return Ok((StatusCode::NOT_FOUND, None));
        }
        let storage = if is_meta { &inner.meta } else { &inner.items };

        loop {
            let fi = inner.info.read().await.get(p).cloned();

            if let Some(fi) = &fi {
                match storage.lookup(fi).await {
                    Ok(file) => return Ok((StatusCode::OK, Some(file))),
                    Err(CacheError::NotFound) => {} // stale or missing, refetch
                    Err(err) => {
                        error!("Lookup failure for `{p}`:  {err}");
                        return Err(err);
                    }
                }
            }

            let (event, result) = {
                let dl = inner.downloads.read().await;
                (dl.in_flight.get(p).cloned(), dl.results.get(p).copied())
            };

            if let Some(status) = result
                && status != StatusCode::OK
            {
                // do not hammer a broken upstream
                return Ok((status, None));
            }

            match event {
                Some(rx) => wait_event(rx).await,
                None => match download(inner, p, fi).await {
                    Some(rx) => wait_event(rx).await,
                    None => return Ok((StatusCode::NOT_FOUND, None)),
                },
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn tables_empty(&self) -> bool {
        let dl = self.inner.downloads.read().await;
        dl.in_flight.is_empty() && dl.results.is_empty()
    }
}

async fn wait_event(mut rx: watch::Receiver<bool>) {
    if !*rx.borrow_and_update() {
        // a closed channel means the fetch task is gone; proceed
        let _ = rx.changed().await;
    }
}

async fn download(
    inner: &Arc<CacherInner>,
    p: &str,
    valid: Option<FileInfo>,
) -> Option<watch::Receiver<bool>> {
    let u = inner.um.url(p)?;

    let mut dl = inner.downloads.write().await;

    if let Some(rx) = dl.in_flight.get(p) {
        return Some(rx.clone());
    }

    let (tx, rx) = watch::channel(false);
    dl.in_flight.insert(p.to_string(), rx.clone());

    tokio::task::spawn(fetch_task(inner.clone(), p.to_string(), u, valid, tx));

    Some(rx)
}

/// Spawns the periodic refresh driver if `p` is a release file.
fn maint_meta(inner: &Arc<CacherInner>, p: &str) {
    let base = match p.rsplit_once('/') {
        Some((_, base)) => base,
        None => p,
    };
    match base {
        "Release" => {
            tokio::task::spawn(maint_release(inner.clone(), p.to_string(), true));
        }
        "InRelease" => {
            tokio::task::spawn(maint_release(inner.clone(), p.to_string(), false));
        }
        _ => {}
    }
}

/// Periodically re-downloads a release file (and its detached
/// signature) so that changed upstream indices re-authorise their
/// dependent files.
async fn maint_release(inner: Arc<CacherInner>, p: String, with_gpg: bool) {
    debug!("Starting refresh driver for `{p}`");

    let start = tokio::time::Instant::now() + inner.check_interval;
    let mut ticker = tokio::time::interval_at(start, inner.check_interval);

    loop {
        tokio::select! {
            () = inner.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let event = download(&inner, &p, None).await;

        if with_gpg
            && let Some(rx) = download(&inner, &format!("{p}.gpg"), None).await
        {
            wait_event(rx).await;
        }

        if let Some(rx) = event {
            wait_event(rx).await;
        }
    }
}

async fn fetch_task(
    inner: Arc<CacherInner>,
    p: String,
    u: Url,
    valid: Option<FileInfo>,
    tx: watch::Sender<bool>,
) {
    let host = u.host_str().unwrap_or_default().to_string();

    let sem = if inner.max_conns == 0 {
        None
    } else {
        let mut sems = inner.host_sems.lock();
        Some(
            sems.entry_ref(host.as_str())
                .or_insert_with(|| Arc::new(Semaphore::new(inner.max_conns)))
                .clone(),
        )
    };
    let _permit = match sem {
        Some(sem) => Some(
            sem.acquire_owned()
                .await
                .expect("host semaphores are never closed"),
        ),
        None => None,
    };

    let status = tokio::select! {
        () = inner.cancel.cancelled() => StatusCode::INTERNAL_SERVER_ERROR,
        res = tokio::time::timeout(REQUEST_TIMEOUT, fetch_once(&inner, &p, &u, valid.as_ref())) => {
            match res {
                Ok(Ok(status)) => status,
                Ok(Err(err)) => {
                    warn!("GET {u} failed:  {err}");
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                Err(_elapsed) => {
                    warn!("GET {u} timed out after {}s", REQUEST_TIMEOUT.as_secs());
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }
        }
    };

    {
        let mut dl = inner.downloads.write().await;
        dl.in_flight.remove(&p);
        dl.results.insert(p.clone(), status);
    }
    let _ = tx.send(true);

    // invalidate the recorded status after the cache period
    tokio::task::spawn(async move {
        tokio::select! {
            () = inner.cancel.cancelled() => return,
            () = tokio::time::sleep(inner.cache_period) => {}
        }
        inner.downloads.write().await.results.remove(&p);
    });
}

/// Performs one upstream fetch of `p`.
///
/// Returns the upstream status; transport, validation and local I/O
/// problems surface as errors and are treated as 500 by the caller.
async fn fetch_once(
    inner: &Arc<CacherInner>,
    p: &str,
    u: &Url,
    valid: Option<&FileInfo>,
) -> Result<StatusCode, CacheError> {
    let request = Request::get(u.as_str())
        .header(CACHE_CONTROL, "max-age=0")
        .header(USER_AGENT, APP_USER_AGENT)
        .body(Empty::new())
        .expect("request is valid");

    let response = inner.client.request(request).await?;

    let status = response.status();
    if status != StatusCode::OK {
        debug!("GET {u} answered {status}");
        return Ok(status);
    }

    let is_meta = is_meta_path(p);
    let storage = if is_meta { &inner.meta } else { &inner.items };

    let (file, tempname) = storage.temp_file().await?;

    match stream_and_commit(inner, p, valid, is_meta, storage, response.into_body(), file, &tempname)
        .await
    {
        Ok(()) => Ok(StatusCode::OK),
        Err(err) => {
            if let Err(rm_err) = tokio::fs::remove_file(&tempname).await {
                warn!(
                    "Failed to remove tempfile `{}`:  {rm_err}",
                    tempname.display()
                );
            }
            Err(err)
        }
    }
}

/// Streams the response body into the tempfile while computing all
/// digests, verifies, extracts meta records and commits the item to
/// the store and the authorisation map.
#[expect(clippy::too_many_arguments)]
async fn stream_and_commit(
    inner: &Arc<CacherInner>,
    p: &str,
    valid: Option<&FileInfo>,
    is_meta: bool,
    storage: &Storage,
    mut body: Incoming,
    file: tokio::fs::File,
    tempname: &Path,
) -> Result<(), CacheError> {
    let start = std::time::Instant::now();

    let mut writer = BufWriter::with_capacity(WRITE_BUF_SIZE, file);
    let mut digests = DigestState::new();

    while let Some(next) = body.frame().await {
        let frame = next?;
        if let Ok(chunk) = frame.into_data() {
            digests.update(&chunk);
            writer.write_all(&chunk).await?;
        }
    }

    writer.flush().await?;
    let mut file = writer.into_inner();
    file.sync_all().await?;

    let fi = digests.finalize(p.to_string());

    if let Some(valid) = valid
        && !valid.same(&fi)
    {
        warn!("Downloaded data for `{p}` does not match the authorised record");
        return Err(CacheError::IntegrityFailure(p.to_string()));
    }

    let mut records = Vec::new();
    if is_meta {
        file.rewind().await?;
        match extract_file_info(p, tokio::io::BufReader::new(file)).await {
            Ok((fil, paragraph)) => {
                records = authorised_records(p, fil, paragraph.is_some());
            }
            Err(err) => {
                // broken meta data is cached as-is
                error!("Invalid meta data in `{p}`:  {err}");
            }
        }
    }

    let mut info = inner.info.write().await;

    match storage.insert(tempname, fi.clone()).await {
        Ok(()) => {}
        Err(err @ CacheError::BadPath) => return Err(err),
        Err(err) => {
            // the cache is now inconsistent, do not continue
            error!("Could not save item `{p}`:  {err}");
            std::process::exit(1);
        }
    }

    let size = fi.size;

    for fi2 in records {
        info.insert(fi2.path.clone(), fi2);
    }
    if is_meta && !info.contains_key(p) {
        // first time this meta file was downloaded
        maint_meta(inner, p);
    }
    info.insert(p.to_string(), fi);

    let elapsed = start.elapsed();
    info!(
        "Downloaded and cached `{p}` in {} (size={}, rate={})",
        HumanFmt::Time(elapsed),
        HumanFmt::Size(size),
        HumanFmt::Rate(size, elapsed)
    );
    Ok(())
}
