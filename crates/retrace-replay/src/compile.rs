//! Shader compilation through the cache, inline or on a pool of compile workers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::driver::{CompileRequest, CompileSource, DriverAdapter, DriverError};
use crate::shader_cache::{ContentHash, ShaderCache};

#[derive(Clone, Debug)]
pub(crate) struct Compiled {
    pub(crate) binary: Arc<[u8]>,
    pub(crate) hash: ContentHash,
    pub(crate) cache_hit: bool,
}

/// Cache lookup, then a real compile plus store on a miss. Rival misses on one key are not
/// coordinated; both compile and the later store wins.
pub(crate) fn compile_through_cache(
    cache: &ShaderCache,
    driver: &dyn DriverAdapter,
    request: &CompileRequest<'_>,
) -> Result<Compiled, DriverError> {
    if let Some(binary) = cache.lookup(&request.hash) {
        debug!(ordinal = request.ordinal, hash = %request.hash, "compile cache hit");
        return Ok(Compiled {
            binary,
            hash: request.hash,
            cache_hit: true,
        });
    }
    let binary: Arc<[u8]> = driver.compile(request)?.into();
    cache.store(&request.hash, &binary);
    debug!(
        ordinal = request.ordinal,
        function = request.function,
        bytes = binary.len(),
        "compiled"
    );
    Ok(Compiled {
        binary,
        hash: request.hash,
        cache_hit: false,
    })
}

#[derive(Debug)]
pub(crate) struct CompileJob {
    pub(crate) ordinal: u64,
    pub(crate) function: String,
    pub(crate) bytecode: Vec<u8>,
}

#[derive(Debug, Default)]
struct PoolState {
    queue: VecDeque<CompileJob>,
    pending: HashSet<u64>,
    results: HashMap<u64, Result<Compiled, DriverError>>,
    closed: bool,
    cancelled: bool,
}

/// Compile jobs keyed by entry ordinal. The dispatching worker blocks in [`CompilePool::take`]
/// on its own job's slot.
#[derive(Debug, Default)]
pub(crate) struct CompilePool {
    state: Mutex<PoolState>,
    changed: Condvar,
}

impl CompilePool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn submit(&self, job: CompileJob) {
        let mut state = self.lock();
        state.pending.insert(job.ordinal);
        state.queue.push_back(job);
        drop(state);
        self.changed.notify_all();
    }

    /// Waits for the result of the job submitted for `ordinal`. Returns `None` if no job was
    /// submitted for it.
    pub(crate) fn take(&self, ordinal: u64) -> Option<Result<Compiled, DriverError>> {
        let mut state = self.lock();
        loop {
            if let Some(result) = state.results.remove(&ordinal) {
                return Some(result);
            }
            if !state.pending.contains(&ordinal) {
                return None;
            }
            if state.cancelled {
                return Some(Err(DriverError::Cancelled));
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Body of one compile worker thread; returns once the pool is closed and drained, or
    /// cancelled.
    pub(crate) fn worker_loop(&self, cache: &ShaderCache, driver: &dyn DriverAdapter) {
        loop {
            let job = {
                let mut state = self.lock();
                loop {
                    if state.cancelled {
                        return;
                    }
                    if let Some(job) = state.queue.pop_front() {
                        break job;
                    }
                    if state.closed {
                        return;
                    }
                    state = self
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            };

            let request = CompileRequest {
                function: &job.function,
                ordinal: job.ordinal,
                hash: ContentHash::of_bytecode(&job.bytecode),
                source: CompileSource::Bytecode(&job.bytecode),
            };
            let result = compile_through_cache(cache, driver, &request);

            let mut state = self.lock();
            state.pending.remove(&job.ordinal);
            state.results.insert(job.ordinal, result);
            drop(state);
            self.changed.notify_all();
        }
    }

    /// No more jobs will be submitted.
    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_all();
    }

    pub(crate) fn cancel(&self) {
        self.lock().cancelled = true;
        self.changed.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
