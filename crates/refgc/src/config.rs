//! Heap configuration.
//!
//! [`GcConfig`] carries every tunable of a heap. Values come from
//! [`GcConfig::default`], the chained `with_*` setters, or `REFGC_*`
//! environment variables through [`GcConfig::from_env`].

use std::time::Duration;

use crate::error::{GcError, Result};
use crate::heap::PAGE_SIZE;

/// Prefix of all environment overrides.
pub const ENV_PREFIX: &str = "REFGC_";

/// Tunables of one heap.
#[derive(Debug, Clone, PartialEq)]
pub struct GcConfig {
    /// Bytes reserved for the small-object space.
    pub small_space_bytes: usize,
    /// Bytes reserved for the large-object space.
    pub large_space_bytes: usize,
    /// Bytes allocated since the last collection that trigger the next one
    /// under the default collect condition.
    pub collect_threshold_bytes: usize,
    /// A soft referent read within this many collections may be retained.
    pub soft_ref_lru_cycles: u64,
    /// Soft referents are only retained while at least this fraction of the
    /// heap is free.
    pub soft_ref_min_free_ratio: f64,
    /// Number of finalizer worker threads.
    pub finalizer_threads: usize,
    /// How long the collector waits for stragglers before logging a warning
    /// and waiting again.
    pub safepoint_timeout: Duration,
    /// Per-thread pauses shorter than this are not recorded.
    pub pause_threshold: Duration,
    /// Maximum number of recorded per-thread pauses.
    pub pause_log_capacity: usize,
    /// Whether freed pages are handed back to the OS.
    pub discard_free_pages: bool,
    /// Upper bound on collections run while draining finalizers at exit.
    pub exit_collection_limit: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            small_space_bytes: 32 * 1024 * 1024,
            large_space_bytes: 32 * 1024 * 1024,
            collect_threshold_bytes: 4 * 1024 * 1024,
            soft_ref_lru_cycles: 4,
            soft_ref_min_free_ratio: 0.25,
            finalizer_threads: 1,
            safepoint_timeout: Duration::from_secs(1),
            pause_threshold: Duration::from_millis(1),
            pause_log_capacity: 1024,
            discard_free_pages: true,
            exit_collection_limit: 8,
        }
    }
}

impl GcConfig {
    /// Creates a configuration with equal small and large space capacities.
    #[must_use]
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            small_space_bytes: bytes,
            large_space_bytes: bytes,
            ..Default::default()
        }
    }

    #[must_use]
    pub const fn with_small_space_bytes(mut self, bytes: usize) -> Self {
        self.small_space_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn with_large_space_bytes(mut self, bytes: usize) -> Self {
        self.large_space_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn with_collect_threshold(mut self, bytes: usize) -> Self {
        self.collect_threshold_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn with_soft_ref_policy(mut self, lru_cycles: u64, min_free_ratio: f64) -> Self {
        self.soft_ref_lru_cycles = lru_cycles;
        self.soft_ref_min_free_ratio = min_free_ratio;
        self
    }

    #[must_use]
    pub const fn with_finalizer_threads(mut self, threads: usize) -> Self {
        self.finalizer_threads = threads;
        self
    }

    #[must_use]
    pub const fn with_safepoint_timeout(mut self, timeout: Duration) -> Self {
        self.safepoint_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_pause_threshold(mut self, threshold: Duration) -> Self {
        self.pause_threshold = threshold;
        self
    }

    #[must_use]
    pub const fn with_discard_free_pages(mut self, discard: bool) -> Self {
        self.discard_free_pages = discard;
        self
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.small_space_bytes < PAGE_SIZE {
            return Err(invalid(format!(
                "small_space_bytes must be at least {PAGE_SIZE}, got {}",
                self.small_space_bytes
            )));
        }
        if self.large_space_bytes < PAGE_SIZE {
            return Err(invalid(format!(
                "large_space_bytes must be at least {PAGE_SIZE}, got {}",
                self.large_space_bytes
            )));
        }
        if !(0.0..=1.0).contains(&self.soft_ref_min_free_ratio) {
            return Err(invalid(format!(
                "soft_ref_min_free_ratio must be within 0..=1, got {}",
                self.soft_ref_min_free_ratio
            )));
        }
        if self.finalizer_threads == 0 {
            return Err(invalid("finalizer_threads must be at least 1".to_owned()));
        }
        if self.safepoint_timeout.is_zero() {
            return Err(invalid("safepoint_timeout must be non-zero".to_owned()));
        }
        Ok(())
    }

    /// Defaults overridden by `REFGC_*` environment variables.
    ///
    /// Recognized variables: `REFGC_SMALL_SPACE`, `REFGC_LARGE_SPACE`,
    /// `REFGC_COLLECT_THRESHOLD` (byte sizes with an optional `K`, `M` or `G`
    /// suffix), `REFGC_SOFT_REF_LRU_CYCLES`, `REFGC_SOFT_REF_MIN_FREE_RATIO`,
    /// `REFGC_FINALIZER_THREADS`, `REFGC_SAFEPOINT_TIMEOUT_MS`,
    /// `REFGC_PAUSE_THRESHOLD_US` and `REFGC_DISCARD_FREE_PAGES`.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::InvalidConfig`] for unknown `REFGC_*` names,
    /// unparsable values, or a resulting configuration that fails
    /// [`validate`](Self::validate).
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Like [`from_env`](Self::from_env) but reads from `vars`.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            config.apply(name, value.as_ref().trim())?;
        }
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "SMALL_SPACE" => self.small_space_bytes = parse_size(name, value)?,
            "LARGE_SPACE" => self.large_space_bytes = parse_size(name, value)?,
            "COLLECT_THRESHOLD" => self.collect_threshold_bytes = parse_size(name, value)?,
            "SOFT_REF_LRU_CYCLES" => self.soft_ref_lru_cycles = parse_num(name, value)?,
            "SOFT_REF_MIN_FREE_RATIO" => self.soft_ref_min_free_ratio = parse_num(name, value)?,
            "FINALIZER_THREADS" => self.finalizer_threads = parse_num(name, value)?,
            "SAFEPOINT_TIMEOUT_MS" => {
                self.safepoint_timeout = Duration::from_millis(parse_num(name, value)?);
            }
            "PAUSE_THRESHOLD_US" => {
                self.pause_threshold = Duration::from_micros(parse_num(name, value)?);
            }
            "DISCARD_FREE_PAGES" => self.discard_free_pages = parse_bool(name, value)?,
            _ => return Err(invalid(format!("unknown option {ENV_PREFIX}{name}"))),
        }
        Ok(())
    }
}

const fn invalid(message: String) -> GcError {
    GcError::InvalidConfig(message)
}

fn parse_num<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| invalid(format!("{ENV_PREFIX}{name}: cannot parse `{value}`")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(format!(
            "{ENV_PREFIX}{name}: expected a boolean, got `{value}`"
        ))),
    }
}

/// Parses `4096`, `512K`, `64M` or `1G`.
fn parse_size(name: &str, value: &str) -> Result<usize> {
    let (digits, shift) = match value.as_bytes().last() {
        Some(b'k' | b'K') => (&value[..value.len() - 1], 10),
        Some(b'm' | b'M') => (&value[..value.len() - 1], 20),
        Some(b'g' | b'G') => (&value[..value.len() - 1], 30),
        _ => (value, 0),
    };
    let base: usize = parse_num(name, digits)?;
    base.checked_mul(1 << shift)
        .ok_or_else(|| invalid(format!("{ENV_PREFIX}{name}: `{value}` overflows")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        GcConfig::default().validate().unwrap();
    }

    #[test]
    fn test_setters_chain() {
        let config = GcConfig::with_capacity(1 << 20)
            .with_collect_threshold(4096)
            .with_soft_ref_policy(2, 0.5)
            .with_finalizer_threads(2);
        assert_eq!(config.small_space_bytes, 1 << 20);
        assert_eq!(config.large_space_bytes, 1 << 20);
        assert_eq!(config.collect_threshold_bytes, 4096);
        assert_eq!(config.soft_ref_lru_cycles, 2);
        assert_eq!(config.finalizer_threads, 2);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let tiny = GcConfig::default().with_small_space_bytes(100);
        assert!(matches!(tiny.validate(), Err(GcError::InvalidConfig(_))));

        let ratio = GcConfig::default().with_soft_ref_policy(1, 1.5);
        assert!(ratio.validate().is_err());

        let threads = GcConfig::default().with_finalizer_threads(0);
        assert!(threads.validate().is_err());
    }

    #[test]
    fn test_from_vars_overrides() {
        let config = GcConfig::from_vars([
            ("REFGC_SMALL_SPACE", "8M"),
            ("REFGC_LARGE_SPACE", "512k"),
            ("REFGC_COLLECT_THRESHOLD", "65536"),
            ("REFGC_FINALIZER_THREADS", "3"),
            ("REFGC_SAFEPOINT_TIMEOUT_MS", "250"),
            ("REFGC_PAUSE_THRESHOLD_US", "10"),
            ("REFGC_DISCARD_FREE_PAGES", "off"),
            ("PATH", "/usr/bin"),
        ])
        .unwrap();
        assert_eq!(config.small_space_bytes, 8 << 20);
        assert_eq!(config.large_space_bytes, 512 << 10);
        assert_eq!(config.collect_threshold_bytes, 65536);
        assert_eq!(config.finalizer_threads, 3);
        assert_eq!(config.safepoint_timeout, Duration::from_millis(250));
        assert_eq!(config.pause_threshold, Duration::from_micros(10));
        assert!(!config.discard_free_pages);
    }

    #[test]
    fn test_from_vars_errors() {
        assert!(GcConfig::from_vars([("REFGC_BOGUS", "1")]).is_err());
        assert!(GcConfig::from_vars([("REFGC_SMALL_SPACE", "lots")]).is_err());
        assert!(GcConfig::from_vars([("REFGC_FINALIZER_THREADS", "0")]).is_err());
        assert!(GcConfig::from_vars([("REFGC_DISCARD_FREE_PAGES", "maybe")]).is_err());
    }

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("X", "4096").unwrap(), 4096);
        assert_eq!(parse_size("X", "2K").unwrap(), 2048);
        assert_eq!(parse_size("X", "1g").unwrap(), 1 << 30);
        assert!(parse_size("X", "").is_err());
    }
}
