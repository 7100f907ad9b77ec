use std::net::SocketAddr;
use std::time::Duration;

use tracing::warn;

/// Process configuration, read once at startup from `MESHCACHE_*` environment
/// variables. Everything has a default so a bare process comes up standalone.
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Address other nodes should dial to reach this one. Only needed when the
    /// bind address is not reachable from peers (NAT, port forwarding).
    pub advertise_addr: Option<SocketAddr>,
    /// When set, peers are discovered through marker files in this directory.
    pub discovery_dir: Option<String>,
    pub cache: CacheSettings,
}

/// TTL and sizing applied to every cache built from this config.
#[derive(Clone, Debug)]
pub struct CacheSettings {
    /// Expiry-since-write for partition stores.
    pub ttl: Duration,
    /// Expiry for the default store, which serves lookups made before a
    /// partition is resolved. Kept short so misrouted entries age out fast.
    pub default_ttl: Duration,
    /// Max entry count per store.
    pub max_size: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(Config::DEFAULT_TTL_SECS),
            default_ttl: Duration::from_secs(Config::DEFAULT_DEFAULT_TTL_SECS),
            max_size: Config::DEFAULT_MAX_SIZE,
        }
    }
}

impl Config {
    const DEFAULT_PORT: u16 = 5700;
    const DEFAULT_TTL_SECS: u64 = 300;
    const DEFAULT_DEFAULT_TTL_SECS: u64 = 10;
    const DEFAULT_MAX_SIZE: u64 = 1000;

    pub fn from_env() -> Self {
        let host = std::env::var("MESHCACHE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env_parse("MESHCACHE_PORT", Self::DEFAULT_PORT);

        let advertise_addr = std::env::var("MESHCACHE_ADVERTISE_ADDR")
            .ok()
            .and_then(|s| match s.parse::<SocketAddr>() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    warn!("MESHCACHE_ADVERTISE_ADDR is not a valid host:port, ignoring: {}", s);
                    None
                }
            });

        Self {
            host,
            port,
            advertise_addr,
            discovery_dir: std::env::var("MESHCACHE_DISCOVERY_DIR").ok(),
            cache: CacheSettings {
                ttl: Duration::from_secs(env_parse(
                    "MESHCACHE_CACHE_TTL_SECS",
                    Self::DEFAULT_TTL_SECS,
                )),
                default_ttl: Duration::from_secs(env_parse(
                    "MESHCACHE_DEFAULT_TTL_SECS",
                    Self::DEFAULT_DEFAULT_TTL_SECS,
                )),
                max_size: env_parse("MESHCACHE_CACHE_MAX_SIZE", Self::DEFAULT_MAX_SIZE),
            },
        }
    }

    /// Per-cache max size override, e.g. `MESHCACHE_CACHE_QUERY_RESULTS_MAX_SIZE=50`.
    /// Cache names are uppercased and non-alphanumerics mapped to underscores.
    pub fn max_size_for(&self, cache_name: &str) -> u64 {
        let key: String = cache_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        env_parse(
            &format!("MESHCACHE_CACHE_{}_MAX_SIZE", key),
            self.cache.max_size,
        )
    }
}

fn env_parse<T: std::str::FromStr + Copy>(var: &str, default: T) -> T {
    match std::env::var(var) {
        Ok(raw) => raw.parse::<T>().unwrap_or_else(|_| {
            warn!("{} is not valid, using default", var);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_env() {
        let settings = CacheSettings::default();
        assert_eq!(settings.ttl, Duration::from_secs(300));
        assert_eq!(settings.default_ttl, Duration::from_secs(10));
        assert_eq!(settings.max_size, 1000);
    }

    #[test]
    fn per_cache_override_sanitizes_name() {
        std::env::set_var("MESHCACHE_CACHE_QUERY_RESULTS_MAX_SIZE", "50");
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 5700,
            advertise_addr: None,
            discovery_dir: None,
            cache: CacheSettings::default(),
        };
        assert_eq!(config.max_size_for("query-results"), 50);
        assert_eq!(config.max_size_for("entities"), 1000);
        std::env::remove_var("MESHCACHE_CACHE_QUERY_RESULTS_MAX_SIZE");
    }
}
