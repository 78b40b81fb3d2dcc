use std::net::{IpAddr, Ipv6Addr};
use std::num::NonZero;
use std::path::{Path, PathBuf};
use std::str::FromStr as _;
use std::time::Duration;

use anyhow::Context as _;
use anyhow::bail;
use hashbrown::HashMap;
use log::LevelFilter;
use serde::Deserialize;
use serde::Deserializer;
use url::Url;

use crate::fileinfo::{clean_path, join_cleaned};
use crate::urlmap::valid_prefix;

#[macro_export]
macro_rules! nonzero {
    ($exp:expr) => {
        const {
            match NonZero::new($exp) {
                Some(v) => v,
                None => panic!("Value is zero"),
            }
        }
    };
}

pub(crate) const DEFAULT_BIND_ADDRESS: IpAddr = IpAddr::V6(Ipv6Addr::UNSPECIFIED);
pub(crate) const DEFAULT_BIND_PORT: NonZero<u16> = nonzero!(3142);
pub(crate) const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(600);
pub(crate) const DEFAULT_CACHE_PERIOD: Duration = Duration::from_secs(3);
pub(crate) const DEFAULT_CACHE_CAPACITY_GIB: u64 = 1;
pub(crate) const DEFAULT_MAX_CONNS: usize = 10;
pub(crate) const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Info;

/// Configuration of the caching proxy, read from TOML.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CacherConfig {
    /// Minimum log level severity to output.
    /// Can be overridden via program options.
    #[serde(default = "default_log_level", deserialize_with = "from_level_name")]
    pub(crate) log_level: LevelFilter,

    /// Address to listen on.
    #[serde(default = "default_bind_addr")]
    pub(crate) bind_addr: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_bind_port")]
    pub(crate) bind_port: NonZero<u16>,

    /// Interval in seconds between checks for updated
    /// Release/InRelease files.
    #[serde(default = "default_check_interval", deserialize_with = "from_secs")]
    pub(crate) check_interval: Duration,

    /// Period in seconds during which bad upstream response statuses
    /// are answered from memory.
    #[serde(default = "default_cache_period", deserialize_with = "from_secs")]
    pub(crate) cache_period: Duration,

    /// Directory for repository index files. Never subject to
    /// eviction; must differ from cache_dir.
    pub(crate) meta_dir: PathBuf,

    /// Directory for package files.
    pub(crate) cache_dir: PathBuf,

    /// Capacity of cache_dir in GiB.
    #[serde(default = "default_cache_capacity")]
    pub(crate) cache_capacity: u64,

    /// Maximum concurrent connections per upstream host.
    /// Zero disables the limit.
    #[serde(default = "default_max_conns")]
    pub(crate) max_conns: usize,

    /// Mapping between URL-path prefixes and upstream repository URLs.
    pub(crate) mapping: HashMap<String, String>,
}

impl CacherConfig {
    pub(crate) fn load(file: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(file)
            .with_context(|| format!("failed to read file `{}`", file.display()))?;

        let config: Self = toml::from_str(&content).context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.check_interval.is_zero() {
            bail!("check_interval must be positive");
        }

        if !self.meta_dir.is_absolute() {
            bail!("meta_dir `{}` must be an absolute path", self.meta_dir.display());
        }
        if !self.cache_dir.is_absolute() {
            bail!("cache_dir `{}` must be an absolute path", self.cache_dir.display());
        }
        if self.meta_dir == self.cache_dir {
            bail!("meta_dir and cache_dir must be different");
        }

        if self.cache_capacity == 0 {
            bail!("cache_capacity must be positive");
        }

        if self.mapping.is_empty() {
            bail!("no mapping configured");
        }
        for (prefix, upstream) in &self.mapping {
            if !valid_prefix(prefix) {
                bail!("invalid prefix `{prefix}`");
            }
            let url = Url::parse(upstream)
                .with_context(|| format!("invalid upstream URL for prefix `{prefix}`"))?;
            if !matches!(url.scheme(), "http" | "https") {
                bail!("unsupported scheme `{}` for prefix `{prefix}`", url.scheme());
            }
        }

        Ok(())
    }
}

/// Configuration of one mirrored repository.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct MirrorEntryConfig {
    /// Upstream repository base URL.
    #[serde(deserialize_with = "from_base_url")]
    pub(crate) url: Url,

    /// Suites to mirror. A suite ending with `/` denotes a flat
    /// repository.
    pub(crate) suites: Vec<String>,

    /// Sections (components) to mirror.
    #[serde(default)]
    pub(crate) sections: Vec<String>,

    /// Whether to mirror source packages.
    #[serde(default)]
    pub(crate) mirror_source: bool,

    /// Architectures to mirror; `all` is always included.
    #[serde(default)]
    pub(crate) architectures: Vec<String>,
}

#[must_use]
pub(crate) fn is_flat(suite: &str) -> bool {
    suite.ends_with('/')
}

/// Basename of `p` without its extension.
#[must_use]
pub(crate) fn raw_name(p: &str) -> &str {
    let base = match p.rsplit_once('/') {
        Some((_, base)) => base,
        None => p,
    };
    match base.rsplit_once('.') {
        Some((stem, _ext)) => stem,
        None => base,
    }
}

impl MirrorEntryConfig {
    pub(crate) fn check(&self) -> anyhow::Result<()> {
        if self.suites.is_empty() {
            bail!("no suites");
        }

        let flat = is_flat(&self.suites[0]);
        if flat && !self.sections.is_empty() {
            bail!("flat repository cannot have sections");
        }
        if flat && !self.architectures.is_empty() {
            bail!("flat repository cannot have architectures");
        }
        for suite in &self.suites[1..] {
            if flat != is_flat(suite) {
                bail!("mixed flat/non-flat in suites");
            }
        }

        Ok(())
    }

    /// Candidate paths of `Release`, `Release.gpg` and `InRelease`
    /// files for all configured suites, compressed variants included.
    #[must_use]
    pub(crate) fn release_files(&self) -> Vec<String> {
        let mut files = Vec::new();

        for suite in &self.suites {
            let relpath = if is_flat(suite) {
                clean_path(suite)
            } else {
                join_cleaned("dists", suite)
            };

            for name in [
                "Release",
                "Release.gpg",
                "Release.gz",
                "Release.bz2",
                "Release.xz",
                "InRelease",
                "InRelease.gz",
                "InRelease.bz2",
                "InRelease.xz",
            ] {
                files.push(join_cleaned(&relpath, name));
            }
        }

        files
    }

    /// Resolves a repository-relative path against the base URL.
    #[must_use]
    pub(crate) fn resolve(&self, p: &str) -> Option<Url> {
        self.url.join(p).ok()
    }

    /// Whether the index at `p` is covered by this mirror's suites,
    /// sections, architectures and source settings.
    #[must_use]
    pub(crate) fn matching_index(&self, p: &str) -> bool {
        let rn = raw_name(p);

        if rn == "Index" || rn == "Release" {
            return true;
        }

        if is_flat(&self.suites[0]) {
            return match rn {
                "Packages" => true,
                "Sources" => self.mirror_source,
                _ => false,
            };
        }

        let p_no_ext = match p.rsplit_once('.') {
            Some((stem, ext)) if !ext.contains('/') => stem,
            _ => p,
        };

        for section in &self.sections {
            let section = clean_path(section);

            if self
                .architectures
                .iter()
                .map(String::as_str)
                .chain(std::iter::once("all"))
                .any(|arch| p_no_ext.ends_with(&format!("{section}/binary-{arch}/Packages")))
            {
                return true;
            }

            if self.mirror_source && p_no_ext.ends_with(&format!("{section}/source/Sources")) {
                return true;
            }
        }

        false
    }
}

/// Configuration of the mirror mode, read from TOML.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct MirrorConfig {
    /// Minimum log level severity to output.
    #[serde(default = "default_log_level", deserialize_with = "from_level_name")]
    pub(crate) log_level: LevelFilter,

    /// Directory below which all mirrors are published.
    pub(crate) dir: PathBuf,

    /// Maximum concurrent connections per mirror run.
    /// Zero disables the limit.
    #[serde(default = "default_max_conns")]
    pub(crate) max_conns: usize,

    /// Per-mirror settings, keyed by mirror id.
    #[serde(default, rename = "mirror")]
    pub(crate) mirrors: HashMap<String, MirrorEntryConfig>,
}

impl MirrorConfig {
    pub(crate) fn load(file: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(file)
            .with_context(|| format!("failed to read file `{}`", file.display()))?;

        let config: Self = toml::from_str(&content).context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !self.dir.is_absolute() {
            bail!("dir `{}` must be an absolute path", self.dir.display());
        }

        if self.mirrors.is_empty() {
            bail!("no mirrors configured");
        }
        for (id, mc) in &self.mirrors {
            mc.check().with_context(|| format!("mirror `{id}`"))?;
        }

        Ok(())
    }
}

fn from_level_name<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    let s: String = Deserialize::deserialize(deserializer)?;

    LevelFilter::from_str(&s).map_err(D::Error::custom)
}

fn from_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs: u64 = Deserialize::deserialize(deserializer)?;

    Ok(Duration::from_secs(secs))
}

fn from_base_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    let s: String = Deserialize::deserialize(deserializer)?;

    let mut url = Url::parse(&s).map_err(D::Error::custom)?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(D::Error::custom(format!(
            "unsupported scheme `{}`",
            url.scheme()
        )));
    }

    // for Url::join
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }

    Ok(url)
}

const fn default_log_level() -> LevelFilter {
    DEFAULT_LOG_LEVEL
}

const fn default_bind_addr() -> IpAddr {
    DEFAULT_BIND_ADDRESS
}

const fn default_bind_port() -> NonZero<u16> {
    DEFAULT_BIND_PORT
}

const fn default_check_interval() -> Duration {
    DEFAULT_CHECK_INTERVAL
}

const fn default_cache_period() -> Duration {
    DEFAULT_CACHE_PERIOD
}

const fn default_cache_capacity() -> u64 {
    DEFAULT_CACHE_CAPACITY_GIB
}

const fn default_max_conns() -> usize {
    DEFAULT_MAX_CONNS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cacher_config() {
        let config: CacherConfig = toml::from_str(
            r#"
check_interval = 300
cache_period = 5
meta_dir = "/var/lib/apt-depot/meta"
cache_dir = "/var/cache/apt-depot"
cache_capacity = 2
max_conns = 8

[mapping]
ubuntu = "http://archive.ubuntu.com/ubuntu"
security = "https://security.ubuntu.com/ubuntu"
"#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.check_interval, Duration::from_secs(300));
        assert_eq!(config.cache_period, Duration::from_secs(5));
        assert_eq!(config.cache_capacity, 2);
        assert_eq!(config.max_conns, 8);
        assert_eq!(config.mapping.len(), 2);
        assert_eq!(config.bind_port, DEFAULT_BIND_PORT);
    }

    #[test]
    fn test_cacher_config_rejects() {
        let parse = |s: &str| -> anyhow::Result<()> {
            let config: CacherConfig = toml::from_str(s)?;
            config.validate()
        };

        // same directory for meta and cache
        assert!(
            parse(
                r#"
meta_dir = "/var/cache/apt-depot"
cache_dir = "/var/cache/apt-depot"
[mapping]
ubuntu = "http://archive.ubuntu.com/ubuntu"
"#
            )
            .is_err()
        );

        // relative directory
        assert!(
            parse(
                r#"
meta_dir = "meta"
cache_dir = "/var/cache/apt-depot"
[mapping]
ubuntu = "http://archive.ubuntu.com/ubuntu"
"#
            )
            .is_err()
        );

        // invalid prefix
        assert!(
            parse(
                r#"
meta_dir = "/var/lib/apt-depot/meta"
cache_dir = "/var/cache/apt-depot"
[mapping]
Ubuntu = "http://archive.ubuntu.com/ubuntu"
"#
            )
            .is_err()
        );

        // unsupported scheme
        assert!(
            parse(
                r#"
meta_dir = "/var/lib/apt-depot/meta"
cache_dir = "/var/cache/apt-depot"
[mapping]
ubuntu = "ftp://archive.ubuntu.com/ubuntu"
"#
            )
            .is_err()
        );

        // zero check_interval
        assert!(
            parse(
                r#"
check_interval = 0
meta_dir = "/var/lib/apt-depot/meta"
cache_dir = "/var/cache/apt-depot"
[mapping]
ubuntu = "http://archive.ubuntu.com/ubuntu"
"#
            )
            .is_err()
        );
    }

    #[test]
    fn test_mirror_config() {
        let config: MirrorConfig = toml::from_str(
            r#"
dir = "/srv/mirror"
max_conns = 4

[mirror.ubuntu]
url = "http://archive.ubuntu.com/ubuntu"
suites = ["trusty", "trusty-updates"]
sections = ["main", "universe"]
architectures = ["amd64"]
mirror_source = true
"#,
        )
        .unwrap();
        config.validate().unwrap();

        let mc = &config.mirrors["ubuntu"];
        assert_eq!(mc.url.as_str(), "http://archive.ubuntu.com/ubuntu/");
        assert_eq!(mc.suites.len(), 2);
        assert!(mc.mirror_source);
    }

    #[test]
    fn test_mirror_entry_check() {
        let parse = |s: &str| -> MirrorEntryConfig { toml::from_str(s).unwrap() };

        // flat repository with sections
        let mc = parse(
            r#"
url = "http://example.org/debs"
suites = ["stable/"]
sections = ["main"]
"#,
        );
        assert!(mc.check().is_err());

        // mixed flat and non-flat
        let mc = parse(
            r#"
url = "http://example.org/debs"
suites = ["stable/", "sid"]
"#,
        );
        assert!(mc.check().is_err());

        // no suites
        let mc = parse(
            r#"
url = "http://example.org/debs"
suites = []
"#,
        );
        assert!(mc.check().is_err());

        let mc = parse(
            r#"
url = "http://example.org/debs"
suites = ["stable/"]
"#,
        );
        mc.check().unwrap();
    }

    #[test]
    fn test_release_files() {
        let mc: MirrorEntryConfig = toml::from_str(
            r#"
url = "http://example.org/debian"
suites = ["sid"]
"#,
        )
        .unwrap();

        let files = mc.release_files();
        assert_eq!(files.len(), 9);
        assert!(files.contains(&"dists/sid/Release".to_string()));
        assert!(files.contains(&"dists/sid/Release.gpg".to_string()));
        assert!(files.contains(&"dists/sid/InRelease.xz".to_string()));

        let flat: MirrorEntryConfig = toml::from_str(
            r#"
url = "http://example.org/debs"
suites = ["stable/"]
"#,
        )
        .unwrap();

        let files = flat.release_files();
        assert!(files.contains(&"stable/Release".to_string()));
        assert!(files.contains(&"stable/InRelease".to_string()));
    }

    #[test]
    fn test_matching_index() {
        let mc: MirrorEntryConfig = toml::from_str(
            r#"
url = "http://example.org/ubuntu"
suites = ["trusty"]
sections = ["main", "universe"]
architectures = ["amd64"]
mirror_source = true
"#,
        )
        .unwrap();

        assert!(mc.matching_index("dists/trusty/main/binary-amd64/Packages.gz"));
        assert!(mc.matching_index("dists/trusty/main/binary-all/Packages.xz"));
        assert!(mc.matching_index("dists/trusty/universe/binary-amd64/Packages"));
        assert!(mc.matching_index("dists/trusty/main/source/Sources.gz"));
        assert!(mc.matching_index("dists/trusty/main/i18n/Index"));
        assert!(mc.matching_index("dists/trusty/Release"));

        assert!(!mc.matching_index("dists/trusty/main/binary-i386/Packages.gz"));
        assert!(!mc.matching_index("dists/trusty/restricted/binary-amd64/Packages.gz"));
        assert!(!mc.matching_index("dists/trusty/Contents-amd64.gz"));

        let nosrc: MirrorEntryConfig = toml::from_str(
            r#"
url = "http://example.org/ubuntu"
suites = ["trusty"]
sections = ["main"]
architectures = ["amd64"]
"#,
        )
        .unwrap();
        assert!(!nosrc.matching_index("dists/trusty/main/source/Sources.gz"));

        let flat: MirrorEntryConfig = toml::from_str(
            r#"
url = "http://example.org/debs"
suites = ["stable/"]
"#,
        )
        .unwrap();
        assert!(flat.matching_index("stable/Packages.gz"));
        assert!(!flat.matching_index("stable/Sources.gz"));
    }
}
