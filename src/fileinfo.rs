use std::fmt::Write as _;

use md5::Md5;
use serde::Deserialize;
use serde::Serialize;
use sha1::Sha1;
use sha2::Digest as _;
use sha2::Sha256;

use crate::error::CacheError;

/// Meta data identifying one repository file: its repository-relative
/// path, its size and up to three digests.
///
/// Absent digests are not checked when comparing records.
#[derive(Clone, Debug, Default)]
pub(crate) struct FileInfo {
    pub(crate) path: String,
    pub(crate) size: u64,
    pub(crate) md5sum: Option<Vec<u8>>,
    pub(crate) sha1sum: Option<Vec<u8>>,
    pub(crate) sha256sum: Option<Vec<u8>>,
}

impl FileInfo {
    /// Constructs a record with size only, digests to be filled in
    /// later via [`Self::calc_checksums()`].
    #[must_use]
    pub(crate) fn without_checksums(path: String, size: u64) -> Self {
        Self {
            path,
            size,
            md5sum: None,
            sha1sum: None,
            sha256sum: None,
        }
    }

    /// Constructs a record with all digests computed from `data`.
    #[must_use]
    pub(crate) fn from_data(path: String, data: &[u8]) -> Self {
        let mut fi = Self::without_checksums(path, 0);
        fi.calc_checksums(data);
        fi
    }

    #[must_use]
    pub(crate) const fn has_checksum(&self) -> bool {
        self.md5sum.is_some()
    }

    pub(crate) fn calc_checksums(&mut self, data: &[u8]) {
        self.size = data.len() as u64;
        self.md5sum = Some(Md5::digest(data).to_vec());
        self.sha1sum = Some(Sha1::digest(data).to_vec());
        self.sha256sum = Some(Sha256::digest(data).to_vec());
    }

    /// Compares two records for caching purposes.
    ///
    /// Paths and sizes must be equal; digests are compared only if
    /// present on both sides.
    #[must_use]
    pub(crate) fn same(&self, other: &Self) -> bool {
        if self.path != other.path || self.size != other.size {
            return false;
        }

        for (mine, theirs) in [
            (&self.md5sum, &other.md5sum),
            (&self.sha1sum, &other.sha1sum),
            (&self.sha256sum, &other.sha256sum),
        ] {
            if let (Some(a), Some(b)) = (mine, theirs)
                && a != b
            {
                return false;
            }
        }

        true
    }

    /// Creates a new record with `prefix` prepended to the path.
    #[must_use]
    pub(crate) fn add_prefix(&self, prefix: &str) -> Self {
        let mut fi = self.clone();
        fi.path = join_cleaned(&clean_path(prefix), &self.path);
        fi
    }

    fn by_hash_path(&self, algorithm: &str, csum: Option<&[u8]>) -> Option<String> {
        let csum = csum?;

        let dir = match self.path.rsplit_once('/') {
            Some((dir, _basename)) => dir,
            None => "",
        };

        let mut buffer = String::with_capacity(dir.len() + algorithm.len() + csum.len() * 2 + 10);
        if !dir.is_empty() {
            buffer.push_str(dir);
            buffer.push('/');
        }
        buffer.push_str("by-hash/");
        buffer.push_str(algorithm);
        buffer.push('/');
        for byte in csum {
            write!(buffer, "{byte:02x}").expect("writing to a String cannot fail");
        }

        Some(buffer)
    }

    /// The "by-hash" alias path for the MD5 digest, if present.
    #[must_use]
    pub(crate) fn md5sum_path(&self) -> Option<String> {
        self.by_hash_path("MD5Sum", self.md5sum.as_deref())
    }

    /// The "by-hash" alias path for the SHA1 digest, if present.
    #[must_use]
    pub(crate) fn sha1_path(&self) -> Option<String> {
        self.by_hash_path("SHA1", self.sha1sum.as_deref())
    }

    /// The "by-hash" alias path for the SHA256 digest, if present.
    #[must_use]
    pub(crate) fn sha256_path(&self) -> Option<String> {
        self.by_hash_path("SHA256", self.sha256sum.as_deref())
    }
}

/// Wire form of [`FileInfo`] used by the mirror's `info.json`.
///
/// Digests are hex strings; an empty string encodes an absent digest.
#[derive(Serialize, Deserialize)]
struct FileInfoJson {
    #[serde(rename = "Path")]
    path: String,
    #[serde(rename = "Size")]
    size: u64,
    #[serde(rename = "MD5Sum", default)]
    md5sum: String,
    #[serde(rename = "SHA1Sum", default)]
    sha1sum: String,
    #[serde(rename = "SHA256Sum", default)]
    sha256sum: String,
}

impl Serialize for FileInfo {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let hexed = |csum: &Option<Vec<u8>>| csum.as_deref().map(hex::encode).unwrap_or_default();

        FileInfoJson {
            path: self.path.clone(),
            size: self.size,
            md5sum: hexed(&self.md5sum),
            sha1sum: hexed(&self.sha1sum),
            sha256sum: hexed(&self.sha256sum),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FileInfo {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error as _;

        let fij = FileInfoJson::deserialize(deserializer)?;

        let unhexed = |digest: &str| -> Result<Option<Vec<u8>>, D::Error> {
            if digest.is_empty() {
                return Ok(None);
            }
            hex::decode(digest)
                .map(Some)
                .map_err(|err| D::Error::custom(format!("digest of {}: {err}", fij.path)))
        };

        Ok(Self {
            md5sum: unhexed(&fij.md5sum)?,
            sha1sum: unhexed(&fij.sha1sum)?,
            sha256sum: unhexed(&fij.sha256sum)?,
            path: fij.path,
            size: fij.size,
        })
    }
}

/// Accumulates all three digests over data streamed through it.
///
/// Used while writing a download to disk so no second read pass is
/// needed to obtain the file's checksums.
pub(crate) struct DigestState {
    md5: Md5,
    sha1: Sha1,
    sha256: Sha256,
    size: u64,
}

impl DigestState {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            md5: Md5::new(),
            sha1: Sha1::new(),
            sha256: Sha256::new(),
            size: 0,
        }
    }

    pub(crate) fn update(&mut self, chunk: &[u8]) {
        self.md5.update(chunk);
        self.sha1.update(chunk);
        self.sha256.update(chunk);
        self.size += chunk.len() as u64;
    }

    #[must_use]
    pub(crate) fn finalize(self, path: String) -> FileInfo {
        FileInfo {
            path,
            size: self.size,
            md5sum: Some(self.md5.finalize().to_vec()),
            sha1sum: Some(self.sha1.finalize().to_vec()),
            sha256sum: Some(self.sha256.finalize().to_vec()),
        }
    }
}

/// Lexically cleans a slash-separated path, resolving `.` and `..`
/// components and collapsing repeated separators.
///
/// Mirrors the cleaning rule the store enforces: the result is
/// relative unless the input was absolute, and `"."` for inputs
/// that resolve to nothing.
#[must_use]
pub(crate) fn clean_path(p: &str) -> String {
    let absolute = p.starts_with('/');

    let mut parts: Vec<&str> = Vec::new();
    for comp in p.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if let Some(last) = parts.last() {
                    if *last == ".." {
                        parts.push("..");
                    } else {
                        parts.pop();
                    }
                } else if !absolute {
                    parts.push("..");
                }
            }
            _ => parts.push(comp),
        }
    }

    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        String::from(".")
    } else {
        joined
    }
}

/// Joins two already-cleaned relative paths.
#[must_use]
pub(crate) fn join_cleaned(dir: &str, rest: &str) -> String {
    if dir.is_empty() || dir == "." {
        return rest.to_string();
    }
    if rest.is_empty() || rest == "." {
        return dir.to_string();
    }
    clean_path(&format!("{dir}/{rest}"))
}

/// Whether `p` satisfies the store's path rule: relative, cleaned,
/// nonempty and not `"."`.
#[must_use]
pub(crate) fn is_clean_rel_path(p: &str) -> bool {
    !p.is_empty() && p != "." && !p.starts_with('/') && p == clean_path(p)
}

pub(crate) fn check_path(p: &str) -> Result<(), CacheError> {
    if is_clean_rel_path(p) {
        Ok(())
    } else {
        Err(CacheError::BadPath)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same() {
        let data = b"abcdefghi";
        let fi = FileInfo::from_data("data".to_string(), data);

        assert_eq!(fi.path, "data");
        assert_eq!(fi.size, 9);

        let badpath = FileInfo::without_checksums("bad".to_string(), 9);
        assert!(!badpath.same(&fi));

        let pathonly = FileInfo::without_checksums("data".to_string(), 9);
        assert!(pathonly.same(&fi));

        let sizemismatch = FileInfo::without_checksums("data".to_string(), 0);
        assert!(!sizemismatch.same(&fi));

        let other = FileInfo::from_data("data".to_string(), b"123");

        let mut md5mismatch = FileInfo::without_checksums("data".to_string(), 9);
        md5mismatch.md5sum = other.md5sum.clone();
        assert!(!md5mismatch.same(&fi));

        let mut md5match = FileInfo::without_checksums("data".to_string(), 9);
        md5match.md5sum = fi.md5sum.clone();
        assert!(md5match.same(&fi));

        let mut sha1mismatch = md5match.clone();
        sha1mismatch.sha1sum = other.sha1sum.clone();
        assert!(!sha1mismatch.same(&fi));

        let mut sha1matchmd5mismatch = FileInfo::without_checksums("data".to_string(), 9);
        sha1matchmd5mismatch.md5sum = other.md5sum.clone();
        sha1matchmd5mismatch.sha1sum = fi.sha1sum.clone();
        assert!(!sha1matchmd5mismatch.same(&fi));

        let allmatch = fi.clone();
        assert!(allmatch.same(&fi));
    }

    #[test]
    fn test_json_roundtrip() {
        let fi = FileInfo::from_data("abc/def".to_string(), b"hello world");

        let encoded = serde_json::to_string(&fi).unwrap();
        let decoded: FileInfo = serde_json::from_str(&encoded).unwrap();

        assert!(fi.same(&decoded));
        assert!(decoded.same(&fi));

        // absent digests decode from empty strings
        let partial: FileInfo =
            serde_json::from_str(r#"{"Path":"abc/def","Size":11,"MD5Sum":"","SHA1Sum":"","SHA256Sum":""}"#)
                .unwrap();
        assert!(partial.same(&fi));
    }

    #[test]
    fn test_add_prefix() {
        let fi = FileInfo::from_data("abc/def".to_string(), b"hello world");
        assert_eq!(fi.path, "abc/def");

        let fi = fi.add_prefix("prefix");
        assert_eq!(fi.path, "prefix/abc/def");
        assert!(fi.path.ends_with("/def"));
    }

    #[test]
    fn test_by_hash_paths() {
        let text = b"hello world";
        let fi = FileInfo::from_data("abc/def".to_string(), text);

        let m5 = hex::encode(Md5::digest(text));
        let s1 = hex::encode(Sha1::digest(text));
        let s256 = hex::encode(Sha256::digest(text));

        assert_eq!(fi.md5sum_path().unwrap(), format!("abc/by-hash/MD5Sum/{m5}"));
        assert_eq!(fi.sha1_path().unwrap(), format!("abc/by-hash/SHA1/{s1}"));
        assert_eq!(fi.sha256_path().unwrap(), format!("abc/by-hash/SHA256/{s256}"));

        let nosum = FileInfo::without_checksums("abc/def".to_string(), 11);
        assert!(nosum.md5sum_path().is_none());
        assert!(nosum.sha1_path().is_none());
        assert!(nosum.sha256_path().is_none());

        // top-level file has no directory component
        let toplevel = FileInfo::from_data("def".to_string(), text);
        assert_eq!(toplevel.sha256_path().unwrap(), format!("by-hash/SHA256/{s256}"));
    }

    #[test]
    fn test_digest_state() {
        let text = b"hello world";

        let mut state = DigestState::new();
        state.update(&text[..5]);
        state.update(&text[5..]);
        let fi = state.finalize("abc/def".to_string());

        let expected = FileInfo::from_data("abc/def".to_string(), text);
        assert_eq!(fi.size, 11);
        assert!(fi.same(&expected));
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("a/b/c"), "a/b/c");
        assert_eq!(clean_path("a//b"), "a/b");
        assert_eq!(clean_path("a/./b"), "a/b");
        assert_eq!(clean_path("a/b/../c"), "a/c");
        assert_eq!(clean_path("./a"), "a");
        assert_eq!(clean_path(""), ".");
        assert_eq!(clean_path("."), ".");
        assert_eq!(clean_path("/a/b"), "/a/b");
        assert_eq!(clean_path("/../a"), "/a");
        assert_eq!(clean_path("../a"), "../a");
    }

    #[test]
    fn test_is_clean_rel_path() {
        assert!(is_clean_rel_path("a/b/c"));
        assert!(is_clean_rel_path("Release"));

        assert!(!is_clean_rel_path(""));
        assert!(!is_clean_rel_path("."));
        assert!(!is_clean_rel_path("/abs"));
        assert!(!is_clean_rel_path("./rel"));
        assert!(!is_clean_rel_path("a//b"));
        assert!(!is_clean_rel_path("a/../b"));
    }
}
