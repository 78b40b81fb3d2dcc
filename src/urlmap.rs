use anyhow::bail;
use hashbrown::HashMap;
use url::Url;

/// Whether a prefix is acceptable for registration: one nonempty path
/// segment of lowercase letters, digits, `.`, `_` or `-`.
#[must_use]
pub(crate) fn valid_prefix(prefix: &str) -> bool {
    !prefix.is_empty()
        && prefix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
}

/// A mapping between URL-path prefixes and upstream repository URLs.
#[derive(Debug, Default)]
pub(crate) struct UrlMap {
    mapping: HashMap<String, Url>,
}

impl UrlMap {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            mapping: HashMap::new(),
        }
    }

    /// Registers a prefix for a remote base URL.
    ///
    /// Only http and https upstreams are accepted. The base path is
    /// given a trailing slash so relative references resolve below it.
    pub(crate) fn register(&mut self, prefix: &str, mut base: Url) -> anyhow::Result<()> {
        if !valid_prefix(prefix) {
            bail!("invalid prefix `{prefix}`");
        }

        if !matches!(base.scheme(), "http" | "https") {
            bail!("unsupported scheme `{}`", base.scheme());
        }

        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        self.mapping.insert(prefix.to_string(), base);
        Ok(())
    }

    /// Returns the remote URL corresponding to a local path.
    ///
    /// Leading slashes in `p` are ignored. `None` if `p` does not
    /// start with a registered prefix.
    #[must_use]
    pub(crate) fn url(&self, p: &str) -> Option<Url> {
        let p = p.trim_start_matches('/');

        let (prefix, rest) = match p.split_once('/') {
            Some((prefix, rest)) => (prefix, Some(rest)),
            None => (p, None),
        };

        let base = self.mapping.get(prefix)?;

        match rest {
            None => Some(base.clone()),
            Some(rest) => base.join(rest).ok(),
        }
    }
}
