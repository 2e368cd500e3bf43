use std::env;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Engine tuning knobs, read from `ABACUS_*` environment variables
/// (call `load_dotenv()` first).
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Graphs at or below this size run as a single fragment.
    pub min_job_items: usize,
    /// Hard cap on items per batch job.
    pub max_job_items: usize,
    /// Fragments below this estimated cost are merge candidates.
    pub min_job_cost: f64,
    /// Hard cap on estimated cost per batch job.
    pub max_job_cost: f64,
    /// Ceiling on concurrently-executing fragments per execution coloring.
    pub max_concurrency: usize,
    /// Execution-plan cache capacity (0 disables caching).
    pub plan_cache_capacity: usize,
    /// Execution-plan cache entry time-to-live, in seconds.
    pub plan_cache_ttl_secs: u64,
    /// Interval between interruption checks while waiting on graph
    /// execution, in milliseconds.
    pub poll_interval_ms: u64,
}

impl EngineSettings {
    /// Build settings from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            min_job_items: env_usize("ABACUS_MIN_JOB_ITEMS", 1),
            max_job_items: env_usize("ABACUS_MAX_JOB_ITEMS", 1000),
            min_job_cost: env_f64("ABACUS_MIN_JOB_COST", 0.0),
            max_job_cost: env_f64("ABACUS_MAX_JOB_COST", f64::MAX),
            max_concurrency: env_usize("ABACUS_MAX_CONCURRENCY", 4),
            plan_cache_capacity: env_usize("ABACUS_PLAN_CACHE_CAPACITY", 100),
            plan_cache_ttl_secs: env_u64("ABACUS_PLAN_CACHE_TTL_SECS", 3600),
            poll_interval_ms: env_u64("ABACUS_POLL_INTERVAL_MS", 100),
        }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Engine settings:");
        tracing::info!(
            "  partition:  items={}..{}, cost={}..{}, concurrency={}",
            self.min_job_items,
            self.max_job_items,
            self.min_job_cost,
            if self.max_job_cost == f64::MAX {
                "unbounded".to_string()
            } else {
                self.max_job_cost.to_string()
            },
            self.max_concurrency
        );
        tracing::info!(
            "  plan cache: capacity={}, ttl={}s",
            self.plan_cache_capacity,
            self.plan_cache_ttl_secs
        );
        tracing::info!("  polling:    {}ms", self.poll_interval_ms);
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            min_job_items: 1,
            max_job_items: 1000,
            min_job_cost: 0.0,
            max_job_cost: f64::MAX,
            max_concurrency: 4,
            plan_cache_capacity: 100,
            plan_cache_ttl_secs: 3600,
            poll_interval_ms: 100,
        }
    }
}
