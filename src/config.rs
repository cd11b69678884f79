//! Runtime configuration
//!
//! Every tunable knob is an `IMPRINT_*` environment variable with a default.
//! Quantization constants that form the wire contract live in `sample` and
//! are deliberately NOT configurable.

use std::path::PathBuf;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Engine settings loaded once at startup and shared by reference.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Maximum connections in the pool.
    pub db_max_connections: u32,
    /// Bounded retry attempts for lock conflicts.
    pub db_retry_attempts: u32,

    /// HTTP bind host/port.
    pub host: String,
    pub port: u16,

    /// Idle session lifetime in seconds.
    pub session_ttl_secs: u64,

    /// Base 4-D match threshold for candidate lookup.
    pub value_threshold: f64,
    /// Multiplier applied per elastic relaxation step.
    pub relax_factor: f64,
    /// Maximum relaxation steps before giving up.
    pub relax_max_steps: u32,
    /// Elastic lookups retry until this many distinct images are found.
    pub min_unique: usize,

    /// 4-D distance below which two features are "ambiguous" for discovery.
    pub correlation_similarity_threshold: f64,
    /// Discriminator acceptance floors.
    pub min_affinity: f64,
    pub min_cohesion: f64,
    /// Sample-list truncation for discriminator scoring.
    pub max_candidate_sample: usize,
    /// Only images ingested at least this long ago are discovery targets.
    pub discovery_min_age_secs: i64,

    /// Random ordinals ingested per augmentation in cycle 1.
    pub random_per_aug: u32,
    /// Knowledge-guided features appended per later cycle.
    pub guided_per_cycle: u32,
    /// Total progressive ingestion cycles per image.
    pub progressive_cycles: u32,
    /// Number of `random_combo_k` augmentations.
    pub combo_augmentations: u32,
    /// Discovery iterations enqueued after each completed ingest.
    pub discover_iterations: u32,

    /// Supervisor resource-sampling cadence.
    pub resource_sample_interval_ms: u64,
    /// Hard cap on ingest workers (further bounded by cpu count).
    pub ingest_thread_cap: usize,

    /// Capacity target; the live value in `system_settings` wins.
    pub max_db_size_gb: f64,
    /// Real-time prune cadence.
    pub prune_every_n_ingests: u32,
    pub prune_min_interval_ms: u64,
    /// Skip-pattern threshold that marks a value type for pruning.
    pub min_skip_count: i64,
    /// GROUP-node age/hit limits for phase-2 pruning.
    pub group_min_age_minutes: i64,
    pub group_max_hit_count: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/imprint.db"),
            db_max_connections: 5,
            db_retry_attempts: 4,
            host: "127.0.0.1".into(),
            port: 3000,
            session_ttl_secs: 900,
            value_threshold: 0.08,
            relax_factor: 1.6,
            relax_max_steps: 3,
            min_unique: 2,
            correlation_similarity_threshold: 0.2,
            min_affinity: 0.55,
            min_cohesion: 0.4,
            max_candidate_sample: 64,
            discovery_min_age_secs: 60,
            random_per_aug: 24,
            guided_per_cycle: 12,
            progressive_cycles: 2,
            combo_augmentations: 3,
            discover_iterations: 4,
            resource_sample_interval_ms: 1500,
            ingest_thread_cap: 8,
            max_db_size_gb: 4.0,
            prune_every_n_ingests: 25,
            prune_min_interval_ms: 60_000,
            min_skip_count: 5,
            group_min_age_minutes: 30,
            group_max_hit_count: 1,
        }
    }
}

impl Settings {
    /// Load settings from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            db_path: std::env::var("IMPRINT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.db_path),
            db_max_connections: env_or("IMPRINT_DB_MAX_CONN", d.db_max_connections),
            db_retry_attempts: env_or("IMPRINT_DB_RETRY_ATTEMPTS", d.db_retry_attempts),
            host: std::env::var("HOST").unwrap_or(d.host),
            port: env_or("PORT", d.port),
            session_ttl_secs: env_or("IMPRINT_SESSION_TTL_SECS", d.session_ttl_secs),
            value_threshold: env_or("IMPRINT_VALUE_THRESHOLD", d.value_threshold),
            relax_factor: env_or("IMPRINT_RELAX_FACTOR", d.relax_factor),
            relax_max_steps: env_or("IMPRINT_RELAX_MAX_STEPS", d.relax_max_steps),
            min_unique: env_or("IMPRINT_MIN_UNIQUE", d.min_unique),
            correlation_similarity_threshold: env_or(
                "IMPRINT_CORRELATION_SIMILARITY_THRESHOLD",
                d.correlation_similarity_threshold,
            ),
            min_affinity: env_or("IMPRINT_MIN_AFFINITY", d.min_affinity),
            min_cohesion: env_or("IMPRINT_MIN_COHESION", d.min_cohesion),
            max_candidate_sample: env_or("IMPRINT_MAX_CANDIDATE_SAMPLE", d.max_candidate_sample),
            discovery_min_age_secs: env_or("IMPRINT_DISCOVERY_MIN_AGE_SECS", d.discovery_min_age_secs),
            random_per_aug: env_or("IMPRINT_RANDOM_PER_AUG", d.random_per_aug),
            guided_per_cycle: env_or("IMPRINT_GUIDED_PER_CYCLE", d.guided_per_cycle),
            progressive_cycles: env_or("IMPRINT_PROGRESSIVE_CYCLES", d.progressive_cycles),
            combo_augmentations: env_or("IMPRINT_COMBO_AUGMENTATIONS", d.combo_augmentations),
            discover_iterations: env_or("IMPRINT_DISCOVER_ITERATIONS", d.discover_iterations),
            resource_sample_interval_ms: env_or(
                "IMPRINT_RESOURCE_SAMPLE_INTERVAL_MS",
                d.resource_sample_interval_ms,
            ),
            ingest_thread_cap: env_or("IMPRINT_INGEST_THREADS", d.ingest_thread_cap),
            max_db_size_gb: env_or("IMPRINT_MAX_DB_SIZE_GB", d.max_db_size_gb),
            prune_every_n_ingests: env_or("IMPRINT_PRUNE_EVERY_N_INGESTS", d.prune_every_n_ingests),
            prune_min_interval_ms: env_or("IMPRINT_PRUNE_MIN_INTERVAL_MS", d.prune_min_interval_ms),
            min_skip_count: env_or("IMPRINT_MIN_SKIP_COUNT", d.min_skip_count),
            group_min_age_minutes: env_or("IMPRINT_GROUP_MIN_AGE_MINUTES", d.group_min_age_minutes),
            group_max_hit_count: env_or("IMPRINT_GROUP_MAX_HIT_COUNT", d.group_max_hit_count),
        }
    }
}

/// Print help for engine-related environment variables.
pub fn print_env_help() {
    println!(
        r#"
Imprint Environment Variables:
==============================

IMPRINT_DB_PATH                  SQLite database file (default ./data/imprint.db)
IMPRINT_DB_MAX_CONN              Pool size (default 5)
IMPRINT_DB_RETRY_ATTEMPTS        Lock-conflict retries (default 4)
HOST / PORT                      HTTP bind address (default 127.0.0.1:3000)
IMPRINT_SESSION_TTL_SECS         Idle session lifetime (default 900)
IMPRINT_VALUE_THRESHOLD          Base 4-D match threshold (default 0.08)
IMPRINT_RELAX_FACTOR             Elastic relaxation multiplier (default 1.6)
IMPRINT_RELAX_MAX_STEPS          Elastic relaxation cap (default 3)
IMPRINT_MIN_UNIQUE               Distinct images target for elastic lookup (default 2)
IMPRINT_CORRELATION_SIMILARITY_THRESHOLD  Ambiguity distance (default 0.2)
IMPRINT_MIN_AFFINITY / IMPRINT_MIN_COHESION  Discriminator floors
IMPRINT_MAX_CANDIDATE_SAMPLE     Scoring sample truncation (default 64)
IMPRINT_DISCOVERY_MIN_AGE_SECS   Min image age for discovery (default 60)
IMPRINT_RANDOM_PER_AUG           Cycle-1 ordinals per augmentation (default 24)
IMPRINT_GUIDED_PER_CYCLE         Guided features per later cycle (default 12)
IMPRINT_PROGRESSIVE_CYCLES       Ingestion cycles per image (default 2)
IMPRINT_COMBO_AUGMENTATIONS      random_combo_k count (default 3)
IMPRINT_DISCOVER_ITERATIONS      Discovery iterations per ingest (default 4)
IMPRINT_RESOURCE_SAMPLE_INTERVAL_MS  Pool supervisor cadence (default 1500)
IMPRINT_INGEST_THREADS           Worker cap (default 8, also cpu-bounded)
IMPRINT_MAX_DB_SIZE_GB           Capacity prune target (default 4.0)
IMPRINT_PRUNE_EVERY_N_INGESTS    Real-time prune cadence (default 25)
IMPRINT_PRUNE_MIN_INTERVAL_MS    Real-time prune rate limit (default 60000)
IMPRINT_MIN_SKIP_COUNT           Skip threshold for value-type pruning (default 5)
IMPRINT_GROUP_MIN_AGE_MINUTES    GROUP-node prune age (default 30)
IMPRINT_GROUP_MAX_HIT_COUNT      GROUP-node prune hit ceiling (default 1)
"#
    );
}
