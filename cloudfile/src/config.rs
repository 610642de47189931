//! Mount configuration. Deserializable so a host process can load it from
//! TOML/JSON the way the teacher's `RemoteStorageConfig` is loaded;
//! parsing the file and wiring it to a CLI is left to that host process
//! (out of scope here, per the top-level spec).

use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudFileConfig {
    /// Directory holding the cache's persisted state: `cloudfile_size`,
    /// the three bitmap files, `objects.db`, and the slog.
    pub cache_dir: Utf8PathBuf,

    /// Bound on the total bytes the transactional cache may hold
    /// resident at once (spec §4.3, admission control).
    pub cache_size_bytes: u64,

    /// Free-space watchdog bands (spec §4.3). All three are expressed as
    /// "bytes of configured budget remaining", evaluated against
    /// `cache_size_bytes - used_bytes` since this implementation holds
    /// cache entries in memory rather than on a literal block device.
    /// `min_free_bytes` is a small reserved floor near the bottom of
    /// `cache_size_bytes`, not a separate multi-gigabyte budget, so it
    /// must stay smaller than `critical_free_bytes` and `throttle_free_bytes`.
    pub throttle_free_bytes: u64,
    pub critical_free_bytes: u64,
    pub min_free_bytes: u64,

    pub slog_max_size: u64,

    pub retry_base: Duration,
    pub retry_cap: Duration,

    pub deadline_header: Duration,
    pub deadline_body: Duration,

    /// Delay between a write that makes a big block fracture-eligible
    /// and the fracture actually firing (spec §4.6).
    pub fracture_delay: Duration,

    /// Optional cloud-drive id prefixing every object name, for backends
    /// that multiplex several volumes into one bucket.
    pub cd_id: Option<u64>,

    /// Spread object names across `aaa/bb/` prefixes using the first 5
    /// hex chars of MD5(key) (spec §4.4).
    pub prefix_shard: bool,

    pub num_del_parallel: usize,
}

impl Default for CloudFileConfig {
    fn default() -> Self {
        Self {
            cache_dir: Utf8PathBuf::from("./cloudfile-cache"),
            cache_size_bytes: 4 * GIB,
            throttle_free_bytes: 768 * MIB,
            critical_free_bytes: 256 * MIB,
            min_free_bytes: 64 * MIB,
            slog_max_size: 64 * MIB,
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(30 * 60),
            deadline_header: Duration::from_secs(30),
            deadline_body: Duration::from_secs(180),
            fracture_delay: Duration::from_secs(60),
            cd_id: None,
            prefix_shard: true,
            num_del_parallel: 4,
        }
    }
}
