#[derive(Debug)]
#[non_exhaustive]
pub(crate) enum CacheError {
    Io(std::io::Error),
    Hyper(hyper::Error),
    HyperUtil(hyper_util::client::legacy::Error),
    Json(serde_json::Error),
    /// Store input violates the logical-path rule.
    BadPath,
    /// No entry for the path, or the entry's digests no longer
    /// satisfy the queried record.
    NotFound,
    /// Control file line that is neither a field nor a continuation.
    MalformedControl(String),
    /// Extraction was attempted on a path that is not an index.
    NotMetaFile(String),
    /// Index compressed with an algorithm the extractor rejects.
    UnsupportedCompression(String),
    /// Checksum line or field that could not be parsed.
    InvalidChecksum(String),
    /// Downloaded bytes do not match the authorised record.
    IntegrityFailure(String),
    /// Upstream answered with an unexpected status.
    BadStatus(hyper::StatusCode, String),
    /// Conflicting digests for one path in a release set without
    /// by-hash support.
    InconsistentChecksum(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => e.fmt(f),
            Self::Hyper(e) => e.fmt(f),
            Self::HyperUtil(e) => e.fmt(f),
            Self::Json(e) => e.fmt(f),
            Self::BadPath => f.write_str("bad path"),
            Self::NotFound => f.write_str("not found"),
            Self::MalformedControl(line) => write!(f, "invalid control line: {line}"),
            Self::NotMetaFile(p) => write!(f, "not a meta data file: {p}"),
            Self::UnsupportedCompression(p) => write!(f, "unsupported compression: {p}"),
            Self::InvalidChecksum(l) => write!(f, "invalid checksum line: {l}"),
            Self::IntegrityFailure(p) => write!(f, "invalid checksum for {p}"),
            Self::BadStatus(status, p) => write!(f, "status {status} for {p}"),
            Self::InconsistentChecksum(p) => write!(f, "inconsistent checksum for {p}"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Hyper(e) => Some(e),
            Self::HyperUtil(e) => Some(e),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<hyper::Error> for CacheError {
    fn from(value: hyper::Error) -> Self {
        Self::Hyper(value)
    }
}

impl From<hyper_util::client::legacy::Error> for CacheError {
    fn from(value: hyper_util::client::legacy::Error) -> Self {
        Self::HyperUtil(value)
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}
