use core_affinity::CoreId;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;

use crate::{Error, Result};

/// Environment variable consulted when no explicit thread count is configured.
pub const THREADS_ENV_VAR: &str = "SBA_NUM_THREADS";

/// Thread configuration of a problem, fixed before any solve.
///
/// Priority:
/// 1. `num_threads`
/// 2. `SBA_NUM_THREADS` environment variable
/// 3. available parallelism of the machine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadConfig {
    pub num_threads: Option<usize>,
    /// Optional CPU cores to pin workers to, assigned round-robin.
    pub core_ids: Option<Vec<usize>>,
}

impl ThreadConfig {
    pub fn with_threads(num_threads: usize) -> Self {
        Self {
            num_threads: Some(num_threads),
            core_ids: None,
        }
    }

    pub fn serial() -> Self {
        Self::with_threads(1)
    }

    pub fn resolve_threads(&self) -> Result<usize> {
        let configured = match self.num_threads {
            Some(n) => Some(n),
            None => read_threads_from_env()?,
        };

        match configured {
            Some(0) => Err(Error::InvalidThreadConfig(
                "thread count must be >= 1".to_string(),
            )),
            Some(n) => Ok(n),
            None => Ok(std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)),
        }
    }
}

fn read_threads_from_env() -> Result<Option<usize>> {
    let raw = match env::var(THREADS_ENV_VAR) {
        Ok(v) => v,
        Err(env::VarError::NotPresent) => return Ok(None),
        Err(e) => {
            return Err(Error::InvalidThreadConfig(format!(
                "failed to read {THREADS_ENV_VAR}: {e}"
            )))
        }
    };

    let parsed: usize = raw.trim().parse().map_err(|_| {
        Error::InvalidThreadConfig(format!(
            "{THREADS_ENV_VAR} must be a positive integer, got '{raw}'"
        ))
    })?;
    if parsed == 0 {
        return Err(Error::InvalidThreadConfig(format!(
            "{THREADS_ENV_VAR} must be >= 1"
        )));
    }
    Ok(Some(parsed))
}

/// A dedicated rayon pool owned by one problem instance.
pub struct ResourceGroup {
    pub name: String,
    pub pool: Arc<ThreadPool>,
    pub cores: Vec<usize>,
}

impl ResourceGroup {
    pub fn new(name: &str, num_threads: usize, core_ids: Option<Vec<usize>>) -> Result<Self> {
        if num_threads == 0 {
            return Err(Error::InvalidThreadConfig(
                "thread count must be >= 1".to_string(),
            ));
        }

        let thread_name_prefix = format!("sba-{}-", name);
        let core_ids_cloned = core_ids.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(move |i| format!("{}{}", thread_name_prefix, i))
            .start_handler(move |i| {
                if let Some(ref cores) = core_ids_cloned {
                    if let Some(&core_index) = cores.get(i % cores.len()) {
                        core_affinity::set_for_current(CoreId { id: core_index });
                    }
                }
            })
            .build()
            .map_err(|e| Error::RuntimeError(e.to_string()))?;

        tracing::debug!(group = name, num_threads, "created worker pool");

        Ok(Self {
            name: name.to_string(),
            pool: Arc::new(pool),
            cores: core_ids.unwrap_or_default(),
        })
    }

    pub fn from_config(name: &str, config: &ThreadConfig) -> Result<Self> {
        let threads = config.resolve_threads()?;
        let cores = config.core_ids.clone().filter(|c| !c.is_empty());
        Self::new(name, threads, cores)
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `f` inside this group's pool; rayon parallel iterators in `f` use its workers.
    pub fn install<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(f)
    }
}

impl std::fmt::Debug for ResourceGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGroup")
            .field("name", &self.name)
            .field("num_threads", &self.num_threads())
            .field("cores", &self.cores)
            .finish()
    }
}
