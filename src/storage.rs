//! Content-addressed local storage for cache items.
//!
//! Items live below one directory as `<path>.cache` files and are
//! evicted least-recently-used once the configured capacity is
//! exceeded. Insertion commits atomically by hardlinking a tempfile
//! into place; digests of loaded items are computed lazily on first
//! lookup.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use hashbrown::HashMap;
use log::{debug, info, warn};
use rand::Rng as _;
use rand::SeedableRng as _;
use rand::distr::Alphanumeric;
use rand::rngs::SmallRng;
use tokio::sync::Mutex;

use crate::error::CacheError;
use crate::fileinfo::{FileInfo, check_path};

pub(crate) const FILE_SUFFIX: &str = ".cache";
const TEMP_PREFIX: &str = "_tmp";

struct Entry {
    fi: FileInfo,
    atime: u64,
}

/// In-memory index of the store: entry map, LRU min-heap on access
/// time and the logical clock producing those access times.
///
/// `heap` is an array-backed binary min-heap; `index` maps each
/// logical path to its current heap slot and is kept in sync on
/// every swap.
struct StorageInner {
    used: u64,
    lclock: u64,
    index: HashMap<String, usize>,
    heap: Vec<Entry>,
}

impl StorageInner {
    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        *self
            .index
            .get_mut(self.heap[i].fi.path.as_str())
            .expect("heap entry is indexed") = i;
        *self
            .index
            .get_mut(self.heap[j].fi.path.as_str())
            .expect("heap entry is indexed") = j;
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[i].atime >= self.heap[parent].atime {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            let mut smallest = i;

            if left < self.heap.len() && self.heap[left].atime < self.heap[smallest].atime {
                smallest = left;
            }
            if right < self.heap.len() && self.heap[right].atime < self.heap[smallest].atime {
                smallest = right;
            }
            if smallest == i {
                return;
            }
            self.swap(i, smallest);
            i = smallest;
        }
    }

    fn push(&mut self, entry: Entry) {
        let i = self.heap.len();
        self.index.insert(entry.fi.path.clone(), i);
        self.heap.push(entry);
        self.sift_up(i);
    }

    fn pop_min(&mut self) -> Option<Entry> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.swap(0, last);
        let entry = self.heap.pop().expect("heap is nonempty");
        self.index.remove(entry.fi.path.as_str());
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        Some(entry)
    }

    fn remove(&mut self, i: usize) -> Entry {
        let last = self.heap.len() - 1;
        if i != last {
            self.swap(i, last);
        }
        let entry = self.heap.pop().expect("index points into heap");
        self.index.remove(entry.fi.path.as_str());
        if i < self.heap.len() {
            self.sift_down(i);
            self.sift_up(i);
        }
        entry
    }

    fn fix(&mut self, i: usize) {
        self.sift_down(i);
        self.sift_up(i);
    }

    fn heapify(&mut self) {
        for i in (0..self.heap.len() / 2).rev() {
            self.sift_down(i);
        }
    }

    fn next_atime(&mut self) -> u64 {
        let t = self.lclock;
        self.lclock += 1;
        t
    }
}

/// Stores cache items in the local file system.
///
/// Items are removed in LRU fashion once their total size exceeds
/// the capacity. A capacity of zero disables eviction.
pub(crate) struct Storage {
    dir: PathBuf,
    capacity: u64,
    inner: Mutex<StorageInner>,
}

impl Storage {
    pub(crate) fn new(dir: &Path, capacity: u64) -> anyhow::Result<Self> {
        if !dir.is_absolute() {
            anyhow::bail!("storage directory `{}` is not absolute", dir.display());
        }

        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory `{}`", dir.display()))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            capacity,
            inner: Mutex::new(StorageInner {
                used: 0,
                lclock: 0,
                index: HashMap::new(),
                heap: Vec::new(),
            }),
        })
    }

    fn entry_path(&self, p: &str) -> PathBuf {
        let mut full = self.dir.join(p);
        full.as_mut_os_string().push(FILE_SUFFIX);
        full
    }

    /// Loads existing items from the file system.
    ///
    /// Every regular `*.cache` file becomes an entry without digests;
    /// stale tempfiles from interrupted downloads are removed.
    pub(crate) async fn load(&self) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().await;

        let mut stack = vec![self.dir.clone()];
        while let Some(d) = stack.pop() {
            let mut dir_reader = tokio::fs::read_dir(&d).await?;

            while let Some(dentry) = dir_reader.next_entry().await? {
                let file_type = dentry.file_type().await?;
                let path = dentry.path();

                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }

                if path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(TEMP_PREFIX))
                {
                    debug!("Removing stale tempfile `{}`", path.display());
                    if let Err(err) = tokio::fs::remove_file(&path).await {
                        warn!("Failed to remove stale tempfile `{}`:  {err}", path.display());
                    }
                    continue;
                }

                let rel = path
                    .strip_prefix(&self.dir)
                    .expect("walked path is below the storage root");
                let Some(rel) = rel.to_str() else {
                    warn!("Skipping non-unicode cache file `{}`", path.display());
                    continue;
                };
                let Some(subpath) = rel.strip_suffix(FILE_SUFFIX) else {
                    continue;
                };
                if subpath.is_empty() || inner.index.contains_key(subpath) {
                    continue;
                }

                let size = dentry.metadata().await?.len();

                // checksums are computed lazily on first lookup
                let atime = inner.next_atime();
                inner.push(Entry {
                    fi: FileInfo::without_checksums(subpath.to_string(), size),
                    atime,
                });
                inner.used += size;
            }
        }

        inner.heapify();
        self.maint(&mut inner).await;

        Ok(())
    }

    /// Creates a tempfile in the store's root for streaming a
    /// download into; the name is later handed to [`Self::insert()`].
    pub(crate) async fn temp_file(&self) -> Result<(tokio::fs::File, PathBuf), CacheError> {
        const MAX_TRIES: u32 = 10;

        let mut rng = SmallRng::from_os_rng();
        let mut tries = 0;

        loop {
            let suffix: String = (&mut rng)
                .sample_iter(Alphanumeric)
                .take(6)
                .map(char::from)
                .collect();

            let path = self.dir.join(format!("{TEMP_PREFIX}.{suffix}"));

            match tokio::fs::File::options()
                .create_new(true)
                .read(true)
                .write(true)
                .open(&path)
                .await
            {
                Ok(file) => return Ok((file, path)),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    tries += 1;
                    if tries > MAX_TRIES {
                        return Err(CacheError::Io(err));
                    }
                }
                Err(err) => return Err(CacheError::Io(err)),
            }
        }
    }

    /// Inserts or updates a cache item from a tempfile.
    ///
    /// The record's path must be cleaned and relative. The hardlink
    /// from the tempfile to the final name is the commit point; the
    /// tempfile is removed afterwards.
    pub(crate) async fn insert(&self, tempname: &Path, fi: FileInfo) -> Result<(), CacheError> {
        check_path(&fi.path)?;

        let dest = self.entry_path(&fi.path);
        let dest_dir = dest.parent().expect("entry path has a parent directory");
        tokio::fs::create_dir_all(dest_dir).await?;

        let mut inner = self.inner.lock().await;

        if let Some(&i) = inner.index.get(fi.path.as_str()) {
            match tokio::fs::remove_file(&dest).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    warn!("Cache file `{}` was removed already", fi.path);
                }
                Err(err) => return Err(CacheError::Io(err)),
            }
            let old = inner.remove(i);
            inner.used -= old.fi.size;
            debug!("Deleted existing item `{}`", fi.path);
        }

        tokio::fs::hard_link(tempname, &dest).await?;

        if let Err(err) = tokio::fs::remove_file(tempname).await {
            warn!("Failed to remove tempfile `{}`:  {err}", tempname.display());
        }

        let size = fi.size;
        let atime = inner.next_atime();
        inner.push(Entry { fi, atime });
        inner.used += size;

        self.maint(&mut inner).await;

        Ok(())
    }

    /// Looks up an item matching `fi`.
    ///
    /// Missing digests of the stored entry are computed from the file
    /// on first use. A record whose digests do not satisfy `fi`
    /// yields [`CacheError::NotFound`], which is how entries go stale
    /// after an index refresh.
    pub(crate) async fn lookup(&self, fi: &FileInfo) -> Result<tokio::fs::File, CacheError> {
        let mut inner = self.inner.lock().await;

        let Some(&i) = inner.index.get(fi.path.as_str()) else {
            return Err(CacheError::NotFound);
        };

        if !inner.heap[i].fi.has_checksum() {
            let data = tokio::fs::read(self.entry_path(&fi.path)).await?;
            inner.heap[i].fi.calc_checksums(&data);
        }

        if !fi.same(&inner.heap[i].fi) {
            // checksum mismatch
            return Err(CacheError::NotFound);
        }

        let atime = inner.next_atime();
        inner.heap[i].atime = atime;
        inner.fix(i);

        let file = tokio::fs::File::open(self.entry_path(&fi.path)).await?;
        Ok(file)
    }

    /// Deletes an item. A missing entry or an already-removed backing
    /// file is not an error.
    pub(crate) async fn delete(&self, p: &str) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().await;

        let Some(&i) = inner.index.get(p) else {
            return Ok(());
        };

        match tokio::fs::remove_file(self.entry_path(p)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!("Cached file `{p}` was already removed");
            }
            Err(err) => return Err(CacheError::Io(err)),
        }

        let old = inner.remove(i);
        inner.used -= old.fi.size;
        info!("Deleted item `{p}`");

        Ok(())
    }

    /// A snapshot of the records of all cached items.
    pub(crate) async fn list_all(&self) -> Vec<FileInfo> {
        let inner = self.inner.lock().await;
        inner.heap.iter().map(|e| e.fi.clone()).collect()
    }

    /// Removes least-recently-used items until the used size drops
    /// to the capacity. Unlink failures are logged and skipped.
    async fn maint(&self, inner: &mut StorageInner) {
        while self.capacity > 0 && inner.used > self.capacity {
            let Some(entry) = inner.pop_min() else {
                break;
            };
            inner.used -= entry.fi.size;
            if let Err(err) = tokio::fs::remove_file(self.entry_path(&entry.fi.path)).await {
                warn!("Failed to evict `{}`:  {err}", entry.fi.path);
            }
            info!("Evicted `{}`", entry.fi.path);
        }
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.inner.lock().await.heap.len()
    }

    #[cfg(test)]
    pub(crate) async fn used(&self) -> u64 {
        self.inner.lock().await.used
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt as _;

    use super::*;

    async fn insert_data(storage: &Storage, p: &str, data: &[u8]) -> Result<(), CacheError> {
        let (mut file, tempname) = storage.temp_file().await.unwrap();
        file.write_all(data).await.unwrap();
        file.sync_all().await.unwrap();
        drop(file);

        let res = storage
            .insert(&tempname, FileInfo::from_data(p.to_string(), data))
            .await;
        if res.is_err() {
            tokio::fs::remove_file(&tempname).await.unwrap();
        }
        res
    }

    #[tokio::test]
    async fn test_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path(), 0).unwrap();

        insert_data(&storage, "path/to/a", b"a").await.unwrap();
        assert_eq!(storage.len().await, 1);
        assert_eq!(storage.used().await, 1);

        // overwrite
        insert_data(&storage, "path/to/a", b"a").await.unwrap();
        assert_eq!(storage.len().await, 1);
        assert_eq!(storage.used().await, 1);

        insert_data(&storage, "path/to/bc", b"bc").await.unwrap();
        assert_eq!(storage.len().await, 2);
        assert_eq!(storage.used().await, 3);

        insert_data(&storage, "data", b"data").await.unwrap();

        let mut f = storage
            .lookup(&FileInfo::from_data("data".to_string(), b"data"))
            .await
            .unwrap();
        let mut contents = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut f, &mut contents)
            .await
            .unwrap();
        assert_eq!(contents, b"data");

        // digest mismatch surfaces as NotFound
        let err = storage
            .lookup(&FileInfo::from_data("data".to_string(), b"dat."))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::NotFound));

        storage.delete("data").await.unwrap();
        assert_eq!(storage.len().await, 2);
        assert_eq!(storage.used().await, 3);

        // deleting a missing item is fine
        storage.delete("data").await.unwrap();
    }

    #[tokio::test]
    async fn test_storage_lru() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path(), 3).unwrap();

        insert_data(&storage, "path/to/a", b"a").await.unwrap();
        insert_data(&storage, "path/to/bc", b"bc").await.unwrap();
        assert_eq!(storage.used().await, 3);

        // a and bc will be purged
        insert_data(&storage, "path/to/de", b"de").await.unwrap();
        assert_eq!(storage.len().await, 1);
        assert_eq!(storage.used().await, 2);

        let err = storage
            .lookup(&FileInfo::from_data("path/to/a".to_string(), b"a"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::NotFound));
        let err = storage
            .lookup(&FileInfo::from_data("path/to/bc".to_string(), b"bc"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::NotFound));

        insert_data(&storage, "path/to/a", b"a").await.unwrap();

        // touch de
        storage
            .lookup(&FileInfo::from_data("path/to/de".to_string(), b"de"))
            .await
            .unwrap();

        // a is now least recently used and will be purged
        insert_data(&storage, "path/to/f", b"f").await.unwrap();

        let err = storage
            .lookup(&FileInfo::from_data("path/to/a".to_string(), b"a"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::NotFound));
        storage
            .lookup(&FileInfo::from_data("path/to/de".to_string(), b"de"))
            .await
            .unwrap();
        storage
            .lookup(&FileInfo::from_data("path/to/f".to_string(), b"f"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_storage_load() {
        let files: [(&str, &[u8]); 4] = [
            ("a", b"a"),
            ("bc", b"bc"),
            ("def", b"def"),
            ("ghij", b"ghij"),
        ];

        let dir = tempfile::tempdir().unwrap();

        for (name, data) in files {
            tokio::fs::write(dir.path().join(format!("{name}{FILE_SUFFIX}")), data)
                .await
                .unwrap();
        }

        // ignored: no .cache suffix
        tokio::fs::write(dir.path().join("dummy"), b"d").await.unwrap();

        // removed: stale tempfile
        tokio::fs::write(dir.path().join("_tmp.abc123"), b"t")
            .await
            .unwrap();

        let storage = Storage::new(dir.path(), 0).unwrap();
        storage.load().await.unwrap();

        assert_eq!(storage.list_all().await.len(), files.len());
        assert!(!dir.path().join("_tmp.abc123").exists());

        for (name, data) in files {
            storage
                .lookup(&FileInfo::from_data(name.to_string(), data))
                .await
                .unwrap();
        }

        let mut f = storage
            .lookup(&FileInfo::from_data("ghij".to_string(), b"ghij"))
            .await
            .unwrap();
        let mut contents = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut f, &mut contents)
            .await
            .unwrap();
        assert_eq!(contents, b"ghij");
    }

    #[tokio::test]
    async fn test_storage_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path(), 0).unwrap();

        for bad in ["/absolute/path", "./unclean/path", "", "."] {
            let err = insert_data(&storage, bad, b"a").await.unwrap_err();
            assert!(matches!(err, CacheError::BadPath), "path `{bad}`");
        }
    }

    #[tokio::test]
    async fn test_storage_insert_same_twice_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path(), 0).unwrap();

        insert_data(&storage, "x/y", b"hello").await.unwrap();
        insert_data(&storage, "x/y", b"hello").await.unwrap();

        assert_eq!(storage.len().await, 1);
        assert_eq!(storage.used().await, 5);

        let listed = storage.list_all().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, "x/y");
    }
}
