#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use retrace_format::{
    selectors, DecodedCall, DescriptorTable, ObjectType, RecordedHandle, Recorder, TraceReader,
    TraceWriter, Value, WriterOptions,
};
use retrace_replay::{
    CallOutcome, CancelToken, CompileRequest, CompileSource, DriverAdapter, DriverError, LiveCall,
    LiveHandle, LiveValue, ReplayOptions, Replayer, ShaderCache,
};

pub const INSTANCE: RecordedHandle = RecordedHandle(0x1);
pub const PHYSICAL_DEVICE: RecordedHandle = RecordedHandle(0x2);
pub const DEVICE: RecordedHandle = RecordedHandle(0x3);
pub const COMMAND_POOL: RecordedHandle = RecordedHandle(0x4);
pub const COMMAND_BUFFER: RecordedHandle = RecordedHandle(0x5);

#[derive(Clone, Debug)]
pub struct Invocation {
    pub ordinal: u64,
    pub queue: u32,
    pub function: String,
    pub args: Vec<LiveValue>,
    pub created: Vec<LiveHandle>,
    pub compiled: Option<Vec<u8>>,
}

/// Driver double that logs every call and can be told to fail or misreport specific ordinals.
pub struct RecordingDriver {
    next_handle: AtomicU64,
    pub invocations: Mutex<Vec<Invocation>>,
    pub compiles: Mutex<Vec<u64>>,
    pub releases: Mutex<Vec<(ObjectType, LiveHandle)>>,
    results: Mutex<HashMap<u64, i32>>,
    failures: Mutex<HashMap<u64, DriverError>>,
    cancel_at: Mutex<Option<(u64, CancelToken)>>,
}

impl RecordingDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_handle: AtomicU64::new(0x9000),
            invocations: Mutex::new(Vec::new()),
            compiles: Mutex::new(Vec::new()),
            releases: Mutex::new(Vec::new()),
            results: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            cancel_at: Mutex::new(None),
        })
    }

    /// Makes the live call at `ordinal` return `result` instead of the recorded one.
    pub fn return_result(&self, ordinal: u64, result: i32) {
        self.results.lock().unwrap().insert(ordinal, result);
    }

    pub fn fail(&self, ordinal: u64, err: DriverError) {
        self.failures.lock().unwrap().insert(ordinal, err);
    }

    /// Cancels `token` from inside the live call at `ordinal`.
    pub fn cancel_at(&self, ordinal: u64, token: CancelToken) {
        *self.cancel_at.lock().unwrap() = Some((ordinal, token));
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn invocation(&self, ordinal: u64) -> Invocation {
        self.invocations()
            .into_iter()
            .find(|inv| inv.ordinal == ordinal)
            .unwrap_or_else(|| panic!("ordinal {ordinal} was not dispatched"))
    }

    pub fn ordinals(&self) -> Vec<u64> {
        self.invocations().iter().map(|inv| inv.ordinal).collect()
    }

    pub fn releases(&self) -> Vec<(ObjectType, LiveHandle)> {
        self.releases.lock().unwrap().clone()
    }

    pub fn compile_count(&self) -> usize {
        self.compiles.lock().unwrap().len()
    }
}

impl DriverAdapter for RecordingDriver {
    fn invoke(&self, call: &LiveCall<'_>) -> Result<CallOutcome, DriverError> {
        if let Some(err) = self.failures.lock().unwrap().get(&call.ordinal) {
            return Err(err.clone());
        }
        let result = self
            .results
            .lock()
            .unwrap()
            .get(&call.ordinal)
            .copied()
            .unwrap_or(call.recorded_result);
        let created: Vec<LiveHandle> = call
            .outputs
            .iter()
            .map(|(_, recorded)| {
                if result < 0 || recorded.is_null() {
                    LiveHandle::NULL
                } else {
                    LiveHandle(self.next_handle.fetch_add(1, Ordering::SeqCst))
                }
            })
            .collect();
        self.invocations.lock().unwrap().push(Invocation {
            ordinal: call.ordinal,
            queue: call.queue,
            function: call.descriptor.name.clone(),
            args: call.args.clone(),
            created: created.clone(),
            compiled: call.compiled.map(<[u8]>::to_vec),
        });
        if let Some((ordinal, token)) = &*self.cancel_at.lock().unwrap() {
            if *ordinal == call.ordinal {
                token.cancel();
            }
        }
        Ok(CallOutcome { result, created })
    }

    fn compile(&self, request: &CompileRequest<'_>) -> Result<Vec<u8>, DriverError> {
        self.compiles.lock().unwrap().push(request.ordinal);
        let mut binary = b"BIN:".to_vec();
        match request.source {
            CompileSource::Bytecode(bytecode) => binary.extend_from_slice(bytecode),
            CompileSource::Pipeline(_) => binary.extend_from_slice(&request.hash.0),
        }
        Ok(binary)
    }

    fn release(&self, object_type: ObjectType, handle: LiveHandle) -> Result<(), DriverError> {
        self.releases.lock().unwrap().push((object_type, handle));
        Ok(())
    }
}

pub fn handle(ty: ObjectType, raw: u64) -> Value<RecordedHandle> {
    Value::Handle(ty, RecordedHandle(raw))
}

fn live_handle(value: &LiveValue) -> LiveHandle {
    match value {
        Value::Handle(_, live) => *live,
        other => panic!("expected a handle, got {}", other.kind_name()),
    }
}

impl Invocation {
    pub fn handle_arg(&self, index: usize) -> LiveHandle {
        live_handle(&self.args[index])
    }
}

pub fn create_command_pool(queue: u32, pool: u64) -> DecodedCall {
    DecodedCall::new(
        selectors::CREATE_COMMAND_POOL,
        queue,
        vec![
            handle(ObjectType::Device, DEVICE.0),
            Value::U32(0),
            Value::U32(0),
            handle(ObjectType::CommandPool, pool),
        ],
    )
}

pub fn allocate_command_buffers(queue: u32, pool: u64, buffers: &[u64]) -> DecodedCall {
    DecodedCall::new(
        selectors::ALLOCATE_COMMAND_BUFFERS,
        queue,
        vec![
            handle(ObjectType::Device, DEVICE.0),
            handle(ObjectType::CommandPool, pool),
            Value::U32(0),
            Value::Array(
                buffers
                    .iter()
                    .map(|&raw| handle(ObjectType::CommandBuffer, raw))
                    .collect(),
            ),
        ],
    )
}

pub fn destroy_command_pool(queue: u32, pool: u64) -> DecodedCall {
    DecodedCall::new(
        selectors::DESTROY_COMMAND_POOL,
        queue,
        vec![
            handle(ObjectType::Device, DEVICE.0),
            handle(ObjectType::CommandPool, pool),
        ],
    )
}

pub fn destroy_device(queue: u32) -> DecodedCall {
    DecodedCall::new(
        selectors::DESTROY_DEVICE,
        queue,
        vec![handle(ObjectType::Device, DEVICE.0)],
    )
}

/// Instance, physical device, device, command pool and one command buffer, all on queue 0.
pub fn device_setup() -> Vec<DecodedCall> {
    use ObjectType as T;
    vec![
        DecodedCall::new(
            selectors::CREATE_INSTANCE,
            0,
            vec![
                Value::Optional(Some(Box::new(Value::Str("retrace-tests".into())))),
                Value::U32(retrace_format::format::DEFAULT_API_VERSION),
                Value::Array(Vec::new()),
                Value::Array(Vec::new()),
                handle(T::Instance, INSTANCE.0),
            ],
        ),
        DecodedCall::new(
            selectors::ENUMERATE_PHYSICAL_DEVICES,
            0,
            vec![
                handle(T::Instance, INSTANCE.0),
                Value::Array(vec![handle(T::PhysicalDevice, PHYSICAL_DEVICE.0)]),
            ],
        ),
        DecodedCall::new(
            selectors::CREATE_DEVICE,
            0,
            vec![
                handle(T::PhysicalDevice, PHYSICAL_DEVICE.0),
                Value::Array(vec![Value::Struct(vec![
                    Value::U32(0),
                    Value::Array(vec![Value::F32(1.0)]),
                ])]),
                Value::Array(Vec::new()),
                Value::Optional(None),
                handle(T::Device, DEVICE.0),
            ],
        ),
        DecodedCall::new(
            selectors::CREATE_COMMAND_POOL,
            0,
            vec![
                handle(T::Device, DEVICE.0),
                Value::U32(0),
                Value::U32(0),
                handle(T::CommandPool, COMMAND_POOL.0),
            ],
        ),
        DecodedCall::new(
            selectors::ALLOCATE_COMMAND_BUFFERS,
            0,
            vec![
                handle(T::Device, DEVICE.0),
                handle(T::CommandPool, COMMAND_POOL.0),
                Value::U32(0),
                Value::Array(vec![handle(T::CommandBuffer, COMMAND_BUFFER.0)]),
            ],
        ),
    ]
}

pub fn create_buffer(queue: u32, buffer: u64) -> DecodedCall {
    DecodedCall::new(
        selectors::CREATE_BUFFER,
        queue,
        vec![
            handle(ObjectType::Device, DEVICE.0),
            Value::U32(0),
            Value::U64(4096),
            Value::U32(0x20),
            Value::U32(0),
            Value::Array(Vec::new()),
            handle(ObjectType::Buffer, buffer),
        ],
    )
}

pub fn update_buffer(queue: u32, buffer: u64, data: &[u8]) -> DecodedCall {
    DecodedCall::new(
        selectors::CMD_UPDATE_BUFFER,
        queue,
        vec![
            handle(ObjectType::CommandBuffer, COMMAND_BUFFER.0),
            handle(ObjectType::Buffer, buffer),
            Value::U64(0),
            Value::Bytes(data.to_vec()),
        ],
    )
}

pub fn destroy_buffer(queue: u32, buffer: u64) -> DecodedCall {
    DecodedCall::new(
        selectors::DESTROY_BUFFER,
        queue,
        vec![
            handle(ObjectType::Device, DEVICE.0),
            handle(ObjectType::Buffer, buffer),
        ],
    )
}

pub fn create_shader_module(queue: u32, module: u64, code: &[u8]) -> DecodedCall {
    DecodedCall::new(
        selectors::CREATE_SHADER_MODULE,
        queue,
        vec![
            handle(ObjectType::Device, DEVICE.0),
            Value::Bytes(code.to_vec()),
            handle(ObjectType::ShaderModule, module),
        ],
    )
}

pub fn create_pipeline_layout(queue: u32, layout: u64) -> DecodedCall {
    DecodedCall::new(
        selectors::CREATE_PIPELINE_LAYOUT,
        queue,
        vec![
            handle(ObjectType::Device, DEVICE.0),
            Value::Array(Vec::new()),
            Value::Array(Vec::new()),
            handle(ObjectType::PipelineLayout, layout),
        ],
    )
}

/// One compute pipeline with entry point `main`, built from `module` and `layout`.
pub fn create_compute_pipeline(queue: u32, module: u64, layout: u64, pipeline: u64) -> DecodedCall {
    DecodedCall::new(
        selectors::CREATE_COMPUTE_PIPELINES,
        queue,
        vec![
            handle(ObjectType::Device, DEVICE.0),
            handle(ObjectType::PipelineCache, 0),
            Value::Array(vec![Value::Struct(vec![
                Value::U32(0),
                handle(ObjectType::ShaderModule, module),
                Value::Str("main".into()),
                handle(ObjectType::PipelineLayout, layout),
            ])]),
            Value::Array(vec![handle(ObjectType::Pipeline, pipeline)]),
        ],
    )
}

pub fn dispatch(queue: u32, x: u32) -> DecodedCall {
    DecodedCall::new(
        selectors::CMD_DISPATCH,
        queue,
        vec![
            handle(ObjectType::CommandBuffer, COMMAND_BUFFER.0),
            Value::U32(x),
            Value::U32(1),
            Value::U32(1),
        ],
    )
}

/// Records `calls` (ordinals assigned from 1) into an in-memory trace.
pub fn trace_bytes(calls: Vec<DecodedCall>) -> Vec<u8> {
    let table = DescriptorTable::vulkan_core();
    let options = WriterOptions {
        max_chunk_entries: 4,
        ..WriterOptions::default()
    };
    let writer = TraceWriter::new(Vec::new(), options).unwrap();
    let mut recorder = Recorder::new(writer, &table);
    for call in calls {
        recorder.record(call).unwrap();
    }
    recorder.finish().unwrap()
}

/// Writes calls verbatim, keeping their ordinals and skipping descriptor validation.
pub fn raw_trace_bytes(calls: &[DecodedCall]) -> Vec<u8> {
    let mut writer = TraceWriter::new(Vec::new(), WriterOptions::default()).unwrap();
    for call in calls {
        writer.append(call).unwrap();
    }
    writer.finish().unwrap()
}

pub fn reader(bytes: Vec<u8>) -> TraceReader<Cursor<Vec<u8>>> {
    TraceReader::new(Cursor::new(bytes)).unwrap()
}

pub fn write_trace_file(path: &Path, calls: Vec<DecodedCall>) {
    std::fs::write(path, trace_bytes(calls)).unwrap();
}

pub fn replayer(
    driver: Arc<RecordingDriver>,
    cache: ShaderCache,
    options: ReplayOptions,
) -> Replayer {
    Replayer::new(
        Arc::new(DescriptorTable::vulkan_core()),
        driver,
        Arc::new(cache),
        options,
    )
}
