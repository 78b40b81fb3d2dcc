//! Extraction of authorised file records from repository indices.
//!
//! A meta file (`Release`, `InRelease`, `Packages`, `Sources`, `Index`
//! or a detached signature) lists other files together with their
//! sizes and digests. Those records are the source of truth for all
//! later validation.

use async_compression::tokio::bufread::BzDecoder;
use async_compression::tokio::bufread::GzipDecoder;
use async_compression::tokio::bufread::XzDecoder;
use hashbrown::HashMap;
use tokio::io::{AsyncBufRead, BufReader};

use crate::control::{ControlParser, Paragraph};
use crate::error::CacheError;
use crate::fileinfo::{FileInfo, clean_path, join_cleaned};

const COMPRESSION_SUFFIXES: [&str; 5] = [".gz", ".bz2", ".xz", ".lzma", ".lz"];

#[must_use]
fn basename(p: &str) -> &str {
    match p.rsplit_once('/') {
        Some((_, base)) => base,
        None => p,
    }
}

#[must_use]
fn parent_dir(p: &str) -> &str {
    match p.rsplit_once('/') {
        Some((dir, _)) => dir,
        None => "",
    }
}

#[must_use]
fn strip_compression(base: &str) -> &str {
    for suffix in COMPRESSION_SUFFIXES {
        if let Some(stripped) = base.strip_suffix(suffix) {
            return stripped;
        }
    }
    base
}

/// Whether `p` points at a repository index containing checksums for
/// other files.
#[must_use]
pub(crate) fn is_meta_path(p: &str) -> bool {
    matches!(
        strip_compression(basename(p)),
        "Release" | "Release.gpg" | "InRelease" | "Packages" | "Sources" | "Index"
    )
}

/// Whether the meta file is stored raw or with a compression the
/// extractor can decode.
#[must_use]
pub(crate) fn is_supported_compression(p: &str) -> bool {
    match basename(p).rsplit_once('.') {
        None => true,
        Some((_, ext)) => matches!(ext, "gz" | "bz2" | "gpg" | "xz"),
    }
}

/// Whether a `Release` paragraph announces support for index
/// acquisition via hash sums ("by-hash").
#[must_use]
pub(crate) fn supports_by_hash(paragraph: &Paragraph) -> bool {
    match paragraph.get("Acquire-By-Hash") {
        Some(values) => values.len() == 1 && values[0] == "yes",
        None => false,
    }
}

fn parse_checksum_line(l: &str) -> Result<(String, u64, Vec<u8>), CacheError> {
    let mut fields = l.split_ascii_whitespace();

    let (Some(csum), Some(size), Some(path), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(CacheError::InvalidChecksum(l.to_string()));
    };

    let size = size
        .parse::<u64>()
        .map_err(|_| CacheError::InvalidChecksum(l.to_string()))?;
    let csum = hex::decode(csum).map_err(|_| CacheError::InvalidChecksum(l.to_string()))?;

    Ok((path.to_string(), size, csum))
}

/// Parses a `Release`/`InRelease` (or i18n `Index`) paragraph into the
/// records of its `MD5Sum`/`SHA1`/`SHA256` blocks.
///
/// Record paths are keyed below the directory of the meta file itself.
async fn files_from_release<R: AsyncBufRead + Unpin + Send>(
    p: &str,
    reader: R,
) -> Result<(Vec<FileInfo>, Option<Paragraph>), CacheError> {
    let dir = parent_dir(p);

    let Some(paragraph) = ControlParser::new(reader).read_paragraph().await? else {
        return Err(CacheError::MalformedControl(format!("empty index {p}")));
    };

    let empty = Vec::new();
    let md5sums = paragraph.get("MD5Sum").unwrap_or(&empty);
    let sha1sums = paragraph.get("SHA1").unwrap_or(&empty);
    let sha256sums = paragraph.get("SHA256").unwrap_or(&empty);

    if md5sums.is_empty() && sha1sums.is_empty() && sha256sums.is_empty() {
        return Ok((Vec::new(), Some(paragraph)));
    }

    let mut map: HashMap<String, FileInfo> = HashMap::new();

    for l in md5sums {
        let (name, size, csum) = parse_checksum_line(l)?;
        let fpath = join_cleaned(dir, &clean_path(&name));
        map.entry_ref(fpath.as_str())
            .or_insert_with(|| FileInfo::without_checksums(fpath.clone(), size))
            .md5sum = Some(csum);
    }

    for l in sha1sums {
        let (name, size, csum) = parse_checksum_line(l)?;
        let fpath = join_cleaned(dir, &clean_path(&name));
        map.entry_ref(fpath.as_str())
            .or_insert_with(|| FileInfo::without_checksums(fpath.clone(), size))
            .sha1sum = Some(csum);
    }

    for l in sha256sums {
        let (name, size, csum) = parse_checksum_line(l)?;
        let fpath = join_cleaned(dir, &clean_path(&name));
        map.entry_ref(fpath.as_str())
            .or_insert_with(|| FileInfo::without_checksums(fpath.clone(), size))
            .sha256sum = Some(csum);
    }

    // Some repositories publish wrong digests for the release files
    // themselves. Never authorise those records.
    map.remove(&join_cleaned(dir, "Release"));
    map.remove(&join_cleaned(dir, "Release.gpg"));
    map.remove(&join_cleaned(dir, "InRelease"));

    Ok((map.into_values().collect(), Some(paragraph)))
}

/// Parses a `Packages` index into one record per package paragraph.
///
/// Paths come from the `Filename` field and are relative to the
/// repository root.
async fn files_from_packages<R: AsyncBufRead + Unpin + Send>(
    p: &str,
    reader: R,
) -> Result<(Vec<FileInfo>, Option<Paragraph>), CacheError> {
    let mut records = Vec::new();
    let mut parser = ControlParser::new(reader);

    while let Some(paragraph) = parser.read_paragraph().await? {
        let Some(filename) = paragraph.get("Filename") else {
            return Err(CacheError::MalformedControl(format!("no Filename in {p}")));
        };
        let fpath = clean_path(&filename[0]);

        let Some(strsize) = paragraph.get("Size") else {
            return Err(CacheError::MalformedControl(format!("no Size in {p}")));
        };
        let size = strsize[0]
            .parse::<u64>()
            .map_err(|_| CacheError::InvalidChecksum(strsize[0].clone()))?;

        let mut fi = FileInfo::without_checksums(fpath, size);
        if let Some(csum) = paragraph.get("MD5sum") {
            fi.md5sum = Some(
                hex::decode(&csum[0]).map_err(|_| CacheError::InvalidChecksum(csum[0].clone()))?,
            );
        }
        if let Some(csum) = paragraph.get("SHA1") {
            fi.sha1sum = Some(
                hex::decode(&csum[0]).map_err(|_| CacheError::InvalidChecksum(csum[0].clone()))?,
            );
        }
        if let Some(csum) = paragraph.get("SHA256") {
            fi.sha256sum = Some(
                hex::decode(&csum[0]).map_err(|_| CacheError::InvalidChecksum(csum[0].clone()))?,
            );
        }

        records.push(fi);
    }

    Ok((records, None))
}

/// Parses a `Sources` index.
///
/// Each paragraph lists several files below its `Directory`; the
/// `Files`, `Checksums-Sha1` and `Checksums-Sha256` blocks are merged
/// by filename and every resulting record must carry a digest.
async fn files_from_sources<R: AsyncBufRead + Unpin + Send>(
    p: &str,
    reader: R,
) -> Result<(Vec<FileInfo>, Option<Paragraph>), CacheError> {
    let mut records = Vec::new();
    let mut parser = ControlParser::new(reader);

    while let Some(paragraph) = parser.read_paragraph().await? {
        let Some(dir) = paragraph.get("Directory") else {
            return Err(CacheError::MalformedControl(format!("no Directory in {p}")));
        };
        let dir = dir[0].as_str();

        let empty = Vec::new();
        let mut map: HashMap<String, FileInfo> = HashMap::new();

        for l in paragraph.get("Files").unwrap_or(&empty) {
            let (name, size, csum) = parse_checksum_line(l)?;
            let fpath = clean_path(&join_cleaned(dir, &name));
            map.entry_ref(fpath.as_str())
                .or_insert_with(|| FileInfo::without_checksums(fpath.clone(), size))
                .md5sum = Some(csum);
        }

        for l in paragraph.get("Checksums-Sha1").unwrap_or(&empty) {
            let (name, size, csum) = parse_checksum_line(l)?;
            let fpath = clean_path(&join_cleaned(dir, &name));
            map.entry_ref(fpath.as_str())
                .or_insert_with(|| FileInfo::without_checksums(fpath.clone(), size))
                .sha1sum = Some(csum);
        }

        for l in paragraph.get("Checksums-Sha256").unwrap_or(&empty) {
            let (name, size, csum) = parse_checksum_line(l)?;
            let fpath = clean_path(&join_cleaned(dir, &name));
            map.entry_ref(fpath.as_str())
                .or_insert_with(|| FileInfo::without_checksums(fpath.clone(), size))
                .sha256sum = Some(csum);
        }

        for fi in map.into_values() {
            if fi.md5sum.is_none() && fi.sha1sum.is_none() && fi.sha256sum.is_none() {
                return Err(CacheError::InvalidChecksum(format!(
                    "no checksum in {}",
                    fi.path
                )));
            }
            records.push(fi);
        }
    }

    Ok((records, None))
}

/// Parses a repository index and returns the records it authorises.
///
/// For `Release`, `InRelease` and `Index` files the index paragraph
/// itself is returned as well (needed for by-hash detection).
/// Compressed indices are decoded transparently; `.gpg` signatures
/// contain no records.
///
/// `p` is the logical path of the file and selects the handling.
pub(crate) async fn extract_file_info<R: AsyncBufRead + Unpin + Send>(
    p: &str,
    reader: R,
) -> Result<(Vec<FileInfo>, Option<Paragraph>), CacheError> {
    if !is_meta_path(p) {
        return Err(CacheError::NotMetaFile(p.to_string()));
    }

    let base = basename(p);

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match base.rsplit_once('.') {
        None | Some((_, "gpg")) => Box::new(reader),
        Some((_, "gz")) => Box::new(BufReader::new(GzipDecoder::new(reader))),
        Some((_, "bz2")) => Box::new(BufReader::new(BzDecoder::new(reader))),
        Some((_, "xz")) => Box::new(BufReader::new(XzDecoder::new(reader))),
        Some((_, ext)) => {
            return Err(CacheError::UnsupportedCompression(format!(".{ext}")));
        }
    };

    match strip_compression(base) {
        "Release" | "InRelease" | "Index" => files_from_release(p, reader).await,
        "Packages" => files_from_packages(p, reader).await,
        "Sources" => files_from_sources(p, reader).await,
        _ => Ok((Vec::new(), None)), // Release.gpg
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    const RELEASE: &str = "\
Origin: Ubuntu
Suite: trusty
Acquire-By-Hash: yes
MD5Sum:
 5c30f072d01cde094a5c07fccd217cf3             3098 main/binary-all/Packages
 9f164356ab2a7ed56cb5f9635b78d245             1234 Release
SHA256:
 e3b1e5a6951881bca3ee230e5f3215534eb07f602a2f0415af3b182468468104             3098 main/binary-all/Packages
";

    const PACKAGES: &str = "\
Package: libssh-doc
Version: 0.10.6-2
Architecture: all
Filename: pool/main/libs/libssh/libssh-doc_0.10.6-2_all.deb
Size: 11
MD5sum: 5eb63bbbe01eeed093cb22bb8f5acdc3
SHA256: b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9

Package: mini
Filename: pool/main/m/mini/mini_1.0_amd64.deb
Size: 42
SHA256: 0000000000000000000000000000000000000000000000000000000000000001
";

    const SOURCES: &str = "\
Package: libssh
Directory: pool/main/libs/libssh
Files:
 5eb63bbbe01eeed093cb22bb8f5acdc3 11 libssh_0.10.6.dsc
Checksums-Sha256:
 b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9 11 libssh_0.10.6.dsc
 0000000000000000000000000000000000000000000000000000000000000002 7 libssh_0.10.6.tar.xz
";

    #[test]
    fn test_is_meta_path() {
        assert!(!is_meta_path("hoge.deb"));
        assert!(!is_meta_path("Release/hoge"));

        assert!(is_meta_path("Release"));
        assert!(is_meta_path("Release.gpg"));
        assert!(is_meta_path("InRelease"));
        assert!(is_meta_path("Packages"));
        assert!(is_meta_path("Packages.gz"));
        assert!(is_meta_path("Packages.bz2"));
        assert!(is_meta_path("Packages.xz"));
        assert!(!is_meta_path("Packages.gz.xz"));
        assert!(is_meta_path("a/b/c/Sources.gz"));
        assert!(is_meta_path("ubuntu/dists/trusty/Release"));
        assert!(is_meta_path("Index"));
        assert!(!is_meta_path("index"));
    }

    #[test]
    fn test_is_supported_compression() {
        assert!(is_supported_compression("Release"));
        assert!(is_supported_compression("InRelease"));
        assert!(is_supported_compression("Release.gpg"));
        assert!(is_supported_compression("Packages.gz"));
        assert!(is_supported_compression("Packages.bz2"));
        assert!(is_supported_compression("Packages.xz"));

        assert!(!is_supported_compression("Packages.lzma"));
        assert!(!is_supported_compression("Packages.lz"));
    }

    #[tokio::test]
    async fn test_supports_by_hash() {
        let (_, paragraph) = extract_file_info("ubuntu/dists/trusty/Release", RELEASE.as_bytes())
            .await
            .unwrap();
        assert!(supports_by_hash(&paragraph.unwrap()));

        let mut no = Paragraph::new();
        assert!(!supports_by_hash(&no));
        no.insert("Acquire-By-Hash".to_string(), vec!["no".to_string()]);
        assert!(!supports_by_hash(&no));
    }

    #[tokio::test]
    async fn test_extract_release() {
        let (records, paragraph) =
            extract_file_info("ubuntu/dists/trusty/Release", RELEASE.as_bytes())
                .await
                .unwrap();

        assert!(paragraph.is_some());

        // the self-referencing Release record is dropped
        assert_eq!(records.len(), 1);
        let fi = &records[0];
        assert_eq!(fi.path, "ubuntu/dists/trusty/main/binary-all/Packages");
        assert_eq!(fi.size, 3098);
        assert!(fi.md5sum.is_some());
        assert!(fi.sha1sum.is_none());
        assert!(fi.sha256sum.is_some());
    }

    #[tokio::test]
    async fn test_extract_packages() {
        let (mut records, paragraph) = extract_file_info("ubuntu/dists/trusty/main/binary-amd64/Packages", PACKAGES.as_bytes())
            .await
            .unwrap();

        assert!(paragraph.is_none());
        assert_eq!(records.len(), 2);

        records.sort_by(|a, b| a.path.cmp(&b.path));

        let deb = &records[0];
        assert_eq!(deb.path, "pool/main/libs/libssh/libssh-doc_0.10.6-2_all.deb");
        assert_eq!(deb.size, 11);
        let expected = FileInfo::from_data(deb.path.clone(), b"hello world");
        assert!(deb.same(&expected));

        let mini = &records[1];
        assert_eq!(mini.path, "pool/main/m/mini/mini_1.0_amd64.deb");
        assert!(mini.md5sum.is_none());
        assert!(mini.sha256sum.is_some());
    }

    #[tokio::test]
    async fn test_extract_packages_gz() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(PACKAGES.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        let (records, _) = extract_file_info(
            "ubuntu/dists/trusty/main/binary-amd64/Packages.gz",
            compressed.as_slice(),
        )
        .await
        .unwrap();

        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_extract_sources() {
        let (mut records, paragraph) =
            extract_file_info("ubuntu/dists/trusty/main/source/Sources", SOURCES.as_bytes())
                .await
                .unwrap();

        assert!(paragraph.is_none());
        assert_eq!(records.len(), 2);

        records.sort_by(|a, b| a.path.cmp(&b.path));

        let dsc = &records[0];
        assert_eq!(dsc.path, "pool/main/libs/libssh/libssh_0.10.6.dsc");
        assert_eq!(dsc.size, 11);
        assert!(dsc.md5sum.is_some());
        assert!(dsc.sha256sum.is_some());

        let tarball = &records[1];
        assert_eq!(tarball.path, "pool/main/libs/libssh/libssh_0.10.6.tar.xz");
        assert_eq!(tarball.size, 7);
        assert!(tarball.md5sum.is_none());
    }

    #[tokio::test]
    async fn test_extract_sources_without_checksum() {
        let input = "Package: broken\nDirectory: pool/b\nOtherField: x\n";
        // a Sources paragraph with no checksum blocks yields no records
        let (records, _) =
            extract_file_info("dists/sid/main/source/Sources", input.as_bytes())
                .await
                .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_extract_release_gpg() {
        let (records, paragraph) =
            extract_file_info("ubuntu/dists/trusty/Release.gpg", b"binary signature".as_slice())
                .await
                .unwrap();
        assert!(records.is_empty());
        assert!(paragraph.is_none());
    }

    #[tokio::test]
    async fn test_extract_non_meta() {
        let err = extract_file_info("pool/main/x.deb", b"data".as_slice())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::NotMetaFile(_)));
    }

    #[tokio::test]
    async fn test_extract_unsupported_compression() {
        let err = extract_file_info("dists/sid/main/binary-amd64/Packages.lzma", b"x".as_slice())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::UnsupportedCompression(_)));
    }
}
