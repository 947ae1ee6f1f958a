//! The replay control loop.
//!
//! The calling thread feeds: it reads entries from the trace, decodes them and routes each to
//! the worker thread of its queue. Workers dispatch strictly in capture order, gate on wait
//! tokens through a [`TokenBoard`] and share the handle table. Compile entries can be handed to
//! a compile pool ahead of dispatch so that shader compilation overlaps with earlier calls.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use retrace_format::{
    codec, ArgValue, CallRole, CodecError, DecodedCall, DescriptorTable, Direction, EntryLocation,
    FunctionDescriptor, ObjectType, ReaderOptions, RecordedHandle, TraceReader, Value,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::compile::{compile_through_cache, CompileJob, CompilePool, Compiled};
use crate::config::{MismatchPolicy, ReplayOptions};
use crate::driver::{
    CompileRequest, CompileSource, DriverAdapter, DriverError, LiveCall, LiveHandle, LiveValue,
};
use crate::error::ReplayError;
use crate::handle_table::{HandleError, Origin, SharedHandleTable};
use crate::identity;
use crate::shader_cache::{ContentHash, ShaderCache, ShaderCacheStats};
use crate::sync::{CancelToken, TokenBoard, WaitOutcome};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayState {
    #[default]
    Idle,
    Running,
    Completed,
    Aborted,
    Cancelled,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ReplayReport {
    pub state: ReplayState,
    pub entries_dispatched: u64,
    pub per_queue: BTreeMap<u32, u64>,
    pub result_mismatches: u64,
    pub handles_created: u64,
    pub handles_destroyed: u64,
    /// Handles still alive at the end of the run and released during teardown.
    pub handles_released: u64,
    pub shader_compiles: u64,
    pub shader_cache_hits: u64,
    pub shader_cache: ShaderCacheStats,
    pub error: Option<String>,
}

pub struct Replayer {
    table: Arc<DescriptorTable>,
    driver: Arc<dyn DriverAdapter>,
    cache: Arc<ShaderCache>,
    options: ReplayOptions,
    handles: SharedHandleTable,
    cancel: CancelToken,
    state: ReplayState,
    report: Option<ReplayReport>,
}

impl Replayer {
    pub fn new(
        table: Arc<DescriptorTable>,
        driver: Arc<dyn DriverAdapter>,
        cache: Arc<ShaderCache>,
        options: ReplayOptions,
    ) -> Self {
        Self {
            table,
            driver,
            cache,
            options,
            handles: SharedHandleTable::new(),
            cancel: CancelToken::new(),
            state: ReplayState::Idle,
            report: None,
        }
    }

    /// Token that cancels [`Replayer::run`] from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> ReplayState {
        self.state
    }

    pub fn handles(&self) -> &SharedHandleTable {
        &self.handles
    }

    /// Report of the finished run, including failed ones.
    pub fn report(&self) -> Option<&ReplayReport> {
        self.report.as_ref()
    }

    /// Opens `path` and replays it. Header and index failures surface as
    /// [`ReplayError::CorruptTrace`].
    pub fn replay_file(&mut self, path: impl AsRef<Path>) -> Result<ReplayReport, ReplayError> {
        let options = ReaderOptions {
            allow_unfinalized: self.options.allow_unfinalized,
        };
        let mut reader =
            TraceReader::open_with(path, options).map_err(ReplayError::CorruptTrace)?;
        self.run(&mut reader)
    }

    /// Replays every entry of `reader`. A replayer runs once.
    ///
    /// Teardown (releasing every still-alive handle, newest first) happens before this returns,
    /// whatever the outcome.
    pub fn run<R: Read>(
        &mut self,
        reader: &mut TraceReader<R>,
    ) -> Result<ReplayReport, ReplayError> {
        if self.state != ReplayState::Idle {
            return Err(ReplayError::AlreadyRan);
        }
        self.state = ReplayState::Running;
        info!(
            format_version = reader.header().format_version,
            api_version = reader.header().api_version,
            compile_workers = self.options.compile_workers,
            "replay started"
        );

        let run = RunContext {
            table: &self.table,
            driver: &*self.driver,
            cache: &self.cache,
            handles: &self.handles,
            options: &self.options,
            cancel: &self.cancel,
            board: Arc::new(TokenBoard::new()),
            pool: Arc::new(CompilePool::new()),
            stop: AtomicBool::new(false),
            error: Mutex::new(None),
            counters: RunCounters::default(),
            per_queue: Mutex::new(BTreeMap::new()),
        };
        {
            let board = Arc::clone(&run.board);
            let pool = Arc::clone(&run.pool);
            self.cancel.on_cancel(move || {
                board.stop();
                pool.cancel();
            });
        }

        thread::scope(|s| {
            for _ in 0..self.options.compile_workers {
                s.spawn(|| run.pool.worker_loop(run.cache, run.driver));
            }
            run.feed(s, reader);
            run.pool.close();
            run.board.close_input();
        });
        self.cancel.clear_wakers();

        let handles_released = run.teardown();
        self.cache.flush();

        let error = lock(&run.error).take();
        let state = match (&error, self.cancel.is_cancelled()) {
            (Some(_), _) => ReplayState::Aborted,
            (None, true) => ReplayState::Cancelled,
            (None, false) => ReplayState::Completed,
        };
        let c = &run.counters;
        let report = ReplayReport {
            state,
            entries_dispatched: c.dispatched.load(Ordering::Relaxed),
            per_queue: std::mem::take(&mut *lock(&run.per_queue)),
            result_mismatches: c.mismatches.load(Ordering::Relaxed),
            handles_created: c.created.load(Ordering::Relaxed),
            handles_destroyed: c.destroyed.load(Ordering::Relaxed),
            handles_released,
            shader_compiles: c.compiles.load(Ordering::Relaxed),
            shader_cache_hits: c.cache_hits.load(Ordering::Relaxed),
            shader_cache: self.cache.stats(),
            error: error.as_ref().map(ToString::to_string),
        };
        info!(
            state = ?report.state,
            dispatched = report.entries_dispatched,
            mismatches = report.result_mismatches,
            released = report.handles_released,
            "replay finished"
        );

        self.state = state;
        self.report = Some(report.clone());
        match (error, state) {
            (Some(err), _) => Err(err),
            (None, ReplayState::Cancelled) => Err(ReplayError::Cancelled),
            (None, _) => Ok(report),
        }
    }
}

#[derive(Default)]
struct RunCounters {
    dispatched: AtomicU64,
    mismatches: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
    compiles: AtomicU64,
    cache_hits: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// A decoded call on its way to a queue worker.
struct Routed {
    call: DecodedCall,
    location: EntryLocation,
}

/// Whether a dispatch ran to completion or the run is stopping underneath it.
enum Flow {
    Continue,
    Stopped,
}

struct RunContext<'a> {
    table: &'a DescriptorTable,
    driver: &'a dyn DriverAdapter,
    cache: &'a ShaderCache,
    handles: &'a SharedHandleTable,
    options: &'a ReplayOptions,
    cancel: &'a CancelToken,
    board: Arc<TokenBoard>,
    pool: Arc<CompilePool>,
    stop: AtomicBool,
    /// First error of the run.
    error: Mutex<Option<ReplayError>>,
    counters: RunCounters,
    per_queue: Mutex<BTreeMap<u32, u64>>,
}

impl<'a> RunContext<'a> {
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.cancel.is_cancelled()
    }

    /// Records `err` unless an earlier error is already recorded.
    fn record(&self, err: ReplayError) {
        let mut slot = lock(&self.error);
        if slot.is_none() {
            warn!("replay failed: {err}");
            *slot = Some(err);
        }
    }

    /// Records `err` and stops every worker.
    fn abort(&self, err: ReplayError) {
        self.record(err);
        self.stop.store(true, Ordering::SeqCst);
        self.board.stop();
        self.pool.cancel();
    }

    fn feed<'scope, R: Read>(
        &'scope self,
        s: &'scope thread::Scope<'scope, '_>,
        reader: &mut TraceReader<R>,
    ) {
        let mut queues: HashMap<u32, Sender<Routed>> = HashMap::new();
        while !self.stopping() {
            let located = match reader.next_entry() {
                Ok(Some(located)) => located,
                Ok(None) => break,
                Err(err) => {
                    // Entries already routed still run; the error is reported afterwards.
                    self.record(ReplayError::CorruptTrace(err));
                    break;
                }
            };
            let location = located.location;
            let call = match codec::decode_entry(&located.entry, self.table) {
                Ok(call) => call,
                Err(CodecError::UnknownFunction { selector, ordinal }) => {
                    self.record(ReplayError::UnknownFunction {
                        selector,
                        ordinal,
                        location,
                    });
                    break;
                }
                Err(source) => {
                    self.record(ReplayError::MalformedEntry {
                        ordinal: located.entry.header.ordinal,
                        location,
                        source,
                    });
                    break;
                }
            };

            if self.options.compile_workers > 0 {
                self.submit_compile(&call);
            }

            let queue = call.header.queue;
            let sender = queues.entry(queue).or_insert_with(|| {
                let (tx, rx) = mpsc::channel();
                self.board.worker_started();
                s.spawn(move || self.queue_worker(queue, rx));
                tx
            });
            if sender.send(Routed { call, location }).is_err() {
                // The worker already quit because the run is stopping.
                break;
            }
        }
        drop(queues);
    }

    fn submit_compile(&self, call: &DecodedCall) {
        let Some(desc) = self.table.get(call.header.selector) else {
            return;
        };
        if let CallRole::CompileShader { bytecode_param } = desc.role {
            if let Some(bytecode) = call.args.get(bytecode_param).and_then(|v| v.as_bytes()) {
                self.pool.submit(CompileJob {
                    ordinal: call.header.ordinal,
                    function: desc.name.clone(),
                    bytecode: bytecode.to_vec(),
                });
            }
        }
    }

    fn queue_worker(&self, queue: u32, rx: Receiver<Routed>) {
        let mut dispatched = 0u64;
        for routed in rx {
            if self.stopping() {
                break;
            }
            match self.dispatch(queue, &routed) {
                Ok(Flow::Continue) => dispatched += 1,
                Ok(Flow::Stopped) => break,
                Err(err) => {
                    self.abort(err);
                    break;
                }
            }
        }
        lock(&self.per_queue).insert(queue, dispatched);
        self.board.worker_finished();
    }

    fn dispatch(&self, queue: u32, routed: &Routed) -> Result<Flow, ReplayError> {
        let call = &routed.call;
        let header = &call.header;
        let ordinal = header.ordinal;
        let desc = self
            .table
            .get(header.selector)
            .ok_or(ReplayError::UnknownFunction {
                selector: header.selector,
                ordinal,
                location: routed.location,
            })?;

        if !header.waits.is_empty() {
            match self.board.wait_for(&header.waits) {
                WaitOutcome::Ready => {}
                WaitOutcome::Stopped => return Ok(Flow::Stopped),
                WaitOutcome::Deadlock { token } => {
                    return Err(ReplayError::UnsatisfiedWait {
                        queue,
                        token,
                        ordinal,
                    })
                }
            }
        }

        let mut outputs: Vec<(ObjectType, RecordedHandle)> = Vec::new();
        let args = {
            let handles = self.handles.lock();
            desc.params
                .iter()
                .zip(&call.args)
                .map(|(param, value)| match param.direction {
                    Direction::In => value.map_handles(&mut |ty, recorded: &RecordedHandle| {
                        handles.resolve(*recorded, ty, ordinal)
                    }),
                    Direction::Out => {
                        value.for_each_handle(&mut |ty, recorded: &RecordedHandle| {
                            outputs.push((ty, *recorded))
                        });
                        value.map_handles(&mut |_, _| Ok::<_, HandleError>(LiveHandle::NULL))
                    }
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        let compiled = match desc.role {
            CallRole::CompileShader { bytecode_param } => {
                match self.compiled_binary(desc, routed, bytecode_param)? {
                    Some(compiled) => Some(compiled),
                    None => return Ok(Flow::Stopped),
                }
            }
            CallRole::CompilePipeline { create_info_param } => {
                match self.compiled_pipeline(desc, routed, &args, create_info_param)? {
                    Some(compiled) => Some(compiled),
                    None => return Ok(Flow::Stopped),
                }
            }
            _ => None,
        };

        let live_call = LiveCall {
            descriptor: desc,
            ordinal,
            queue,
            recorded_result: header.result,
            args,
            outputs: &outputs,
            compiled: compiled.as_ref().map(|c| &*c.binary),
        };
        let outcome = match self.driver.invoke(&live_call) {
            Ok(outcome) => outcome,
            Err(DriverError::Cancelled) => return Ok(Flow::Stopped),
            Err(err) => {
                return Err(driver_call_error(
                    desc,
                    header.result,
                    None,
                    ordinal,
                    err.to_string(),
                ))
            }
        };
        self.check_result(
            desc,
            header.result,
            outcome.result,
            &outputs,
            outcome.created.len(),
            ordinal,
        )?;

        if outcome.result >= 0 {
            let shader = match desc.role {
                CallRole::CompileShader { .. } => compiled.as_ref().map(|c| c.hash),
                _ => None,
            };
            self.register_outputs(desc, call, &outputs, &outcome.created, shader)?;
        }
        if let CallRole::Destroy { param, frees } = &desc.role {
            if let Some(value) = call.args.get(*param) {
                self.destroy_handles(value, frees, ordinal)?;
            }
        }

        self.board.signal(&header.signals);
        bump(&self.counters.dispatched);
        debug!(
            ordinal,
            queue,
            function = %desc.name,
            result = outcome.result,
            "dispatched"
        );
        Ok(Flow::Continue)
    }

    /// Binary for a compile entry: the pool's result when one was submitted, otherwise an inline
    /// compile through the cache. `None` means the run is stopping.
    fn compiled_binary(
        &self,
        desc: &FunctionDescriptor,
        routed: &Routed,
        bytecode_param: usize,
    ) -> Result<Option<Compiled>, ReplayError> {
        let ordinal = routed.call.header.ordinal;
        let result = match self.pool.take(ordinal) {
            Some(result) => result,
            None => {
                let bytecode = routed
                    .call
                    .args
                    .get(bytecode_param)
                    .and_then(|v| v.as_bytes())
                    .ok_or_else(|| ReplayError::MalformedEntry {
                        ordinal,
                        location: routed.location,
                        source: CodecError::Malformed {
                            function: desc.name.clone(),
                            ordinal,
                            reason: format!("parameter {bytecode_param} is not a bytecode blob"),
                        },
                    })?;
                let request = CompileRequest {
                    function: &desc.name,
                    ordinal,
                    hash: ContentHash::of_bytecode(bytecode),
                    source: CompileSource::Bytecode(bytecode),
                };
                compile_through_cache(self.cache, self.driver, &request)
            }
        };
        self.count_compile(desc, routed, result)
    }

    /// Pipeline binary, compiled at dispatch time because its create-info references live
    /// shader modules. Keyed by the create-info and the content of those modules.
    fn compiled_pipeline(
        &self,
        desc: &FunctionDescriptor,
        routed: &Routed,
        args: &[LiveValue],
        create_info_param: usize,
    ) -> Result<Option<Compiled>, ReplayError> {
        let ordinal = routed.call.header.ordinal;
        let (Some(recorded), Some(live)) = (
            routed.call.args.get(create_info_param),
            args.get(create_info_param),
        ) else {
            return Err(ReplayError::MalformedEntry {
                ordinal,
                location: routed.location,
                source: CodecError::Malformed {
                    function: desc.name.clone(),
                    ordinal,
                    reason: format!("missing create-info parameter {create_info_param}"),
                },
            });
        };
        let hash = identity::pipeline_key(desc, recorded, &self.handles.lock());
        let request = CompileRequest {
            function: &desc.name,
            ordinal,
            hash,
            source: CompileSource::Pipeline(live),
        };
        let result = compile_through_cache(self.cache, self.driver, &request);
        self.count_compile(desc, routed, result)
    }

    fn count_compile(
        &self,
        desc: &FunctionDescriptor,
        routed: &Routed,
        result: Result<Compiled, DriverError>,
    ) -> Result<Option<Compiled>, ReplayError> {
        match result {
            Ok(compiled) => {
                if compiled.cache_hit {
                    bump(&self.counters.cache_hits);
                } else {
                    bump(&self.counters.compiles);
                }
                Ok(Some(compiled))
            }
            Err(DriverError::Cancelled) => Ok(None),
            Err(err) => Err(driver_call_error(
                desc,
                routed.call.header.result,
                None,
                routed.call.header.ordinal,
                err.to_string(),
            )),
        }
    }

    fn check_result(
        &self,
        desc: &FunctionDescriptor,
        recorded: i32,
        live: i32,
        outputs: &[(ObjectType, RecordedHandle)],
        created: usize,
        ordinal: u64,
    ) -> Result<(), ReplayError> {
        let recorded_objects = outputs.iter().any(|(_, h)| !h.is_null());
        if recorded >= 0 && live < 0 && recorded_objects {
            return Err(driver_call_error(
                desc,
                recorded,
                Some(live),
                ordinal,
                format!("object-creating call failed live with {live} (recorded {recorded})"),
            ));
        }
        if live >= 0 && created != outputs.len() {
            return Err(driver_call_error(
                desc,
                recorded,
                Some(live),
                ordinal,
                format!(
                    "driver returned {created} objects, the capture recorded {}",
                    outputs.len()
                ),
            ));
        }
        if live != recorded {
            bump(&self.counters.mismatches);
            match self.options.mismatch_policy {
                MismatchPolicy::Warn => {
                    warn!(ordinal, function = %desc.name, recorded, live, "result code mismatch");
                }
                MismatchPolicy::Fatal => {
                    return Err(driver_call_error(
                        desc,
                        recorded,
                        Some(live),
                        ordinal,
                        format!("result {live} differs from recorded {recorded}"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Pairs recorded output handles with the live ones in order. Live objects created for
    /// slots the capture left null have no recorded identity and are released right away.
    ///
    /// Each object is registered under the handle in the descriptor's parent parameter and with
    /// its structural identity: `shader` for compiled shader modules, otherwise a hash of the
    /// creating call.
    fn register_outputs(
        &self,
        desc: &FunctionDescriptor,
        call: &DecodedCall,
        outputs: &[(ObjectType, RecordedHandle)],
        created: &[LiveHandle],
        shader: Option<ContentHash>,
    ) -> Result<(), ReplayError> {
        let ordinal = call.header.ordinal;
        let parent = desc
            .parent_param
            .and_then(|index| call.args.get(index))
            .and_then(|value| match value {
                Value::Handle(_, recorded) => Some(*recorded),
                _ => None,
            });
        let mut strays = Vec::new();
        {
            let mut handles = self.handles.lock();
            for (index, (&(object_type, recorded), &live)) in
                outputs.iter().zip(created).enumerate()
            {
                if recorded.is_null() {
                    if !live.is_null() {
                        strays.push((object_type, live));
                    }
                    continue;
                }
                if live.is_null() {
                    return Err(driver_call_error(
                        desc,
                        call.header.result,
                        None,
                        ordinal,
                        format!("driver returned a null {object_type} for recorded handle {recorded}"),
                    ));
                }
                let origin = Origin {
                    parent,
                    content: Some(shader.unwrap_or_else(|| {
                        identity::object_identity(desc, &call.args, index, &handles)
                    })),
                };
                handles.register_with_origin(recorded, object_type, live, origin, ordinal)?;
                bump(&self.counters.created);
            }
        }
        for (object_type, live) in strays {
            if let Err(err) = self.driver.release(object_type, live) {
                warn!(ordinal, %object_type, %live, "failed to release unrecorded object: {err}");
            }
        }
        Ok(())
    }

    /// Finalizes every handle in `value`, along with the descendants of the types in `frees`.
    /// Implicitly freed objects are not released: the driver destroyed them with their owner.
    fn destroy_handles(
        &self,
        value: &ArgValue,
        frees: &[ObjectType],
        ordinal: u64,
    ) -> Result<(), ReplayError> {
        let mut handles = self.handles.lock();
        let mut result = Ok(());
        value.for_each_handle(&mut |object_type, recorded: &RecordedHandle| {
            if result.is_err() || recorded.is_null() {
                return;
            }
            match handles.destroy_with_children(*recorded, object_type, frees, ordinal) {
                Ok(finalized) => {
                    if finalized.len() > 1 {
                        debug!(
                            ordinal,
                            owner = %recorded,
                            freed = finalized.len() - 1,
                            "freed objects along with their owner"
                        );
                    }
                    self.counters
                        .destroyed
                        .fetch_add(finalized.len() as u64, Ordering::Relaxed);
                }
                Err(err) => result = Err(err),
            }
        });
        Ok(result?)
    }

    /// Releases every still-alive handle, newest first. Returns how many were released.
    fn teardown(&self) -> u64 {
        let records = self.handles.lock().drain_alive_reverse();
        let mut released = 0;
        for record in records {
            if record.object_type.is_retrieved() || record.live.is_null() {
                continue;
            }
            match self.driver.release(record.object_type, record.live) {
                Ok(()) => released += 1,
                Err(err) => warn!(
                    recorded = %record.recorded,
                    live = %record.live,
                    object_type = %record.object_type,
                    "teardown release failed: {err}"
                ),
            }
        }
        if released > 0 {
            debug!(released, "released handles at teardown");
        }
        released
    }
}

fn driver_call_error(
    desc: &FunctionDescriptor,
    recorded: i32,
    live: Option<i32>,
    ordinal: u64,
    reason: String,
) -> ReplayError {
    ReplayError::DriverCall {
        function: desc.name.clone(),
        ordinal,
        recorded,
        live,
        reason,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
