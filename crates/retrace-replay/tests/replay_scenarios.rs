mod common;

use std::io::Cursor;

use common::*;
use retrace_format::{
    DecodedCall, FunctionSelector, ObjectType, RecordedHandle, TraceError, TraceReader, Value,
};
use retrace_replay::{
    DriverError, FailureClass, HandleError, MismatchPolicy, ReplayError, ReplayOptions,
    ReplayState, ResolutionFailure, ShaderCache, ShaderCacheConfig,
};

const BUFFER: u64 = 0xb1;

fn with_setup(rest: Vec<DecodedCall>) -> Vec<DecodedCall> {
    let mut calls = device_setup();
    calls.extend(rest);
    calls
}

/// Ordinal of the first call after `device_setup()`.
const FIRST: u64 = 6;

#[test]
fn create_write_destroy_uses_one_live_buffer() {
    let driver = RecordingDriver::new();
    let mut replayer = replayer(
        driver.clone(),
        ShaderCache::disabled(),
        ReplayOptions::default(),
    );
    let bytes = trace_bytes(with_setup(vec![
        create_buffer(0, BUFFER),
        update_buffer(0, BUFFER, b"hello"),
        destroy_buffer(0, BUFFER),
    ]));

    let report = replayer.run(&mut reader(bytes)).unwrap();
    assert_eq!(report.state, ReplayState::Completed);
    assert_eq!(report.entries_dispatched, 8);

    let created = driver.invocation(FIRST).created;
    assert_eq!(created.len(), 1);
    let live = created[0];
    assert!(!live.is_null());

    let write = driver.invocation(FIRST + 1);
    assert_eq!(write.function, "vkCmdUpdateBuffer");
    assert_eq!(write.handle_arg(1), live);
    assert_eq!(write.args[3], Value::Bytes(b"hello".to_vec()));

    let destroy = driver.invocation(FIRST + 2);
    assert_eq!(destroy.handle_arg(1), live);
    assert_eq!(report.handles_destroyed, 1);

    let table = replayer.handles().lock();
    assert_eq!(table.alive_count(), 0);
    let history = table.history(RecordedHandle(BUFFER));
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].destroyed_at(), Some(FIRST + 2));
    assert!(!driver.releases().iter().any(|&(_, h)| h == live));
}

#[test]
fn use_after_destroy_is_a_handle_resolution_error() {
    let driver = RecordingDriver::new();
    let mut replayer = replayer(
        driver.clone(),
        ShaderCache::disabled(),
        ReplayOptions::default(),
    );
    let bytes = trace_bytes(with_setup(vec![
        create_buffer(0, BUFFER),
        destroy_buffer(0, BUFFER),
        update_buffer(0, BUFFER, b"late"),
    ]));

    let err = replayer.run(&mut reader(bytes)).unwrap_err();
    match &err {
        ReplayError::Handle(HandleError::Unresolved {
            recorded,
            expected,
            ordinal,
            reason,
        }) => {
            assert_eq!(*recorded, RecordedHandle(BUFFER));
            assert_eq!(*expected, ObjectType::Buffer);
            assert_eq!(*ordinal, FIRST + 2);
            assert_eq!(
                *reason,
                ResolutionFailure::Destroyed {
                    destroyed_at: FIRST + 1
                }
            );
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.class(), FailureClass::HandleResolution);
    assert_eq!(err.exit_code(), 5);

    let report = replayer.report().unwrap();
    assert_eq!(report.state, ReplayState::Aborted);
    assert_eq!(report.entries_dispatched, 7);
    assert!(report.error.as_deref().unwrap().contains("destroyed at ordinal 7"));
    // Teardown still ran: instance, device, pool and command buffer.
    assert_eq!(driver.releases().len(), 4);
}

#[test]
fn destroying_an_unknown_handle_fails() {
    let driver = RecordingDriver::new();
    let mut replayer = replayer(driver, ShaderCache::disabled(), ReplayOptions::default());
    let bytes = trace_bytes(with_setup(vec![destroy_buffer(0, 0xee)]));

    let err = replayer.run(&mut reader(bytes)).unwrap_err();
    assert!(matches!(
        err,
        ReplayError::Handle(HandleError::Unresolved {
            reason: ResolutionFailure::NeverCreated,
            ordinal: FIRST,
            ..
        })
    ));
}

#[test]
fn recreated_pool_can_reuse_the_freed_command_buffer_value() {
    let driver = RecordingDriver::new();
    let mut replayer = replayer(
        driver.clone(),
        ShaderCache::disabled(),
        ReplayOptions::default(),
    );
    let bytes = trace_bytes(with_setup(vec![
        destroy_command_pool(0, COMMAND_POOL.0),
        create_command_pool(0, COMMAND_POOL.0),
        allocate_command_buffers(0, COMMAND_POOL.0, &[COMMAND_BUFFER.0]),
        dispatch(0, 4),
    ]));

    let report = replayer.run(&mut reader(bytes)).unwrap();
    assert_eq!(report.state, ReplayState::Completed);
    assert_eq!(report.handles_destroyed, 2);

    let freed = driver.invocation(5).created[0];
    let reallocated = driver.invocation(FIRST + 2).created[0];
    assert_eq!(driver.invocation(FIRST + 3).handle_arg(0), reallocated);

    let releases = driver.releases();
    assert!(!releases.iter().any(|&(_, live)| live == freed));
    let types: Vec<ObjectType> = releases.iter().map(|&(ty, _)| ty).collect();
    assert_eq!(
        types,
        vec![
            ObjectType::CommandBuffer,
            ObjectType::CommandPool,
            ObjectType::Device,
            ObjectType::Instance,
        ]
    );
    assert_eq!(releases[0].1, reallocated);
}

#[test]
fn destroyed_pool_takes_its_command_buffers_out_of_teardown() {
    let driver = RecordingDriver::new();
    let mut replayer = replayer(
        driver.clone(),
        ShaderCache::disabled(),
        ReplayOptions::default(),
    );
    let bytes = trace_bytes(with_setup(vec![destroy_command_pool(0, COMMAND_POOL.0)]));

    let report = replayer.run(&mut reader(bytes)).unwrap();
    assert_eq!(report.handles_destroyed, 2);
    assert_eq!(report.handles_released, 2);
    let types: Vec<ObjectType> = driver.releases().iter().map(|&(ty, _)| ty).collect();
    assert_eq!(types, vec![ObjectType::Device, ObjectType::Instance]);

    let table = replayer.handles().lock();
    let history = table.history(COMMAND_BUFFER);
    assert_eq!(history[0].destroyed_at(), Some(FIRST));
}

#[test]
fn recording_into_a_freed_command_buffer_names_its_pool() {
    let driver = RecordingDriver::new();
    let mut replayer = replayer(driver, ShaderCache::disabled(), ReplayOptions::default());
    let bytes = trace_bytes(with_setup(vec![
        destroy_command_pool(0, COMMAND_POOL.0),
        dispatch(0, 1),
    ]));

    let err = replayer.run(&mut reader(bytes)).unwrap_err();
    assert!(matches!(
        err,
        ReplayError::Handle(HandleError::Unresolved {
            reason: ResolutionFailure::FreedWithOwner {
                owner: COMMAND_POOL,
                destroyed_at: FIRST,
            },
            ordinal,
            ..
        }) if ordinal == FIRST + 1
    ));
    assert!(err.to_string().contains("when its owner 0x4 was destroyed"));
}

#[test]
fn destroying_the_device_finalizes_everything_it_owns() {
    let driver = RecordingDriver::new();
    let mut replayer = replayer(
        driver.clone(),
        ShaderCache::disabled(),
        ReplayOptions::default(),
    );
    let bytes = trace_bytes(with_setup(vec![
        create_buffer(0, BUFFER),
        create_shader_module(0, 0x51, b"spirv"),
        destroy_device(0),
    ]));

    let report = replayer.run(&mut reader(bytes)).unwrap();
    // Device, pool, command buffer, buffer and shader module.
    assert_eq!(report.handles_destroyed, 5);
    assert_eq!(driver.releases(), vec![(ObjectType::Instance, driver.invocation(1).created[0])]);
}

#[test]
fn identical_bytecode_compiles_once_and_creates_two_modules() {
    let dir = tempfile::tempdir().unwrap();
    let driver = RecordingDriver::new();
    let mut replayer = replayer(
        driver.clone(),
        ShaderCache::new(ShaderCacheConfig::with_root(dir.path())),
        ReplayOptions::default(),
    );
    let code = b"\x03\x02\x23\x07 compute shader".to_vec();
    let bytes = trace_bytes(with_setup(vec![
        create_shader_module(0, 0x51, &code),
        create_shader_module(0, 0x52, &code),
    ]));

    let report = replayer.run(&mut reader(bytes)).unwrap();
    assert_eq!(driver.compile_count(), 1);
    assert_eq!(report.shader_compiles, 1);
    assert_eq!(report.shader_cache_hits, 1);
    assert_eq!(report.shader_cache.stores, 1);
    assert_eq!(report.shader_cache.memory_hits, 1);

    let first = driver.invocation(FIRST);
    let second = driver.invocation(FIRST + 1);
    assert_ne!(first.created[0], second.created[0]);
    let mut expected = b"BIN:".to_vec();
    expected.extend_from_slice(&code);
    assert_eq!(first.compiled.as_deref(), Some(&expected[..]));
    assert_eq!(second.compiled.as_deref(), Some(&expected[..]));
}

#[test]
fn identical_pipelines_compile_once_and_stay_distinct() {
    let dir = tempfile::tempdir().unwrap();
    let driver = RecordingDriver::new();
    let mut replayer = replayer(
        driver.clone(),
        ShaderCache::new(ShaderCacheConfig::with_root(dir.path())),
        ReplayOptions::default(),
    );
    let bytes = trace_bytes(with_setup(vec![
        create_shader_module(0, 0x51, b"spirv a"),
        create_pipeline_layout(0, 0x61),
        create_compute_pipeline(0, 0x51, 0x61, 0x71),
        create_compute_pipeline(0, 0x51, 0x61, 0x72),
        create_shader_module(0, 0x52, b"spirv b"),
        create_compute_pipeline(0, 0x52, 0x61, 0x73),
    ]));

    let report = replayer.run(&mut reader(bytes)).unwrap();
    // Two modules and two distinct pipelines; the repeated pipeline is a hit.
    assert_eq!(driver.compile_count(), 4);
    assert_eq!(report.shader_compiles, 4);
    assert_eq!(report.shader_cache_hits, 1);

    let first = driver.invocation(FIRST + 2);
    let second = driver.invocation(FIRST + 3);
    let other = driver.invocation(FIRST + 5);
    assert!(first.compiled.is_some());
    assert_eq!(first.compiled, second.compiled);
    assert_ne!(first.compiled, other.compiled);
    assert_ne!(first.created[0], second.created[0]);

    let table = replayer.handles().lock();
    let live = |raw| {
        table
            .resolve(RecordedHandle(raw), ObjectType::Pipeline, 100)
            .unwrap()
    };
    assert_eq!(live(0x71), first.created[0]);
    assert_eq!(live(0x72), second.created[0]);
}

#[test]
fn persisted_binaries_serve_a_second_run() {
    let dir = tempfile::tempdir().unwrap();
    let calls = || with_setup(vec![create_shader_module(0, 0x51, b"spirv words")]);

    let first_driver = RecordingDriver::new();
    replayer(
        first_driver.clone(),
        ShaderCache::new(ShaderCacheConfig::with_root(dir.path())),
        ReplayOptions::default(),
    )
    .run(&mut reader(trace_bytes(calls())))
    .unwrap();
    assert_eq!(first_driver.compile_count(), 1);

    let second_driver = RecordingDriver::new();
    let report = replayer(
        second_driver.clone(),
        ShaderCache::new(ShaderCacheConfig::with_root(dir.path())),
        ReplayOptions::default(),
    )
    .run(&mut reader(trace_bytes(calls())))
    .unwrap();
    assert_eq!(second_driver.compile_count(), 0);
    assert_eq!(report.shader_cache.persistent_hits, 1);
}

#[test]
fn compile_pool_prepares_binaries_ahead_of_dispatch() {
    let driver = RecordingDriver::new();
    let options = ReplayOptions {
        compile_workers: 2,
        ..ReplayOptions::default()
    };
    let mut replayer = replayer(driver.clone(), ShaderCache::disabled(), options);
    let codes: Vec<Vec<u8>> = (0..6u8).map(|i| vec![i; 64]).collect();
    let modules = codes
        .iter()
        .enumerate()
        .map(|(i, code)| create_shader_module(0, 0x50 + i as u64, code))
        .collect();

    let report = replayer
        .run(&mut reader(trace_bytes(with_setup(modules))))
        .unwrap();
    assert_eq!(report.shader_compiles, 6);
    assert_eq!(driver.compile_count(), 6);
    for (i, code) in codes.iter().enumerate() {
        let inv = driver.invocation(FIRST + i as u64);
        let compiled = inv.compiled.unwrap();
        assert_eq!(&compiled[4..], &code[..]);
    }
}

#[test]
fn corrupted_magic_fails_before_any_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.rtrace");
    let mut bytes = trace_bytes(with_setup(Vec::new()));
    bytes[0] ^= 0xff;
    std::fs::write(&path, &bytes).unwrap();

    assert!(matches!(
        TraceReader::new(Cursor::new(bytes)),
        Err(TraceError::InvalidMagic)
    ));

    let driver = RecordingDriver::new();
    let mut replayer = replayer(
        driver.clone(),
        ShaderCache::disabled(),
        ReplayOptions::default(),
    );
    let err = replayer.replay_file(&path).unwrap_err();
    assert!(matches!(
        err,
        ReplayError::CorruptTrace(TraceError::InvalidMagic)
    ));
    assert_eq!(err.exit_code(), 3);
    assert!(driver.invocations().is_empty());
}

#[test]
fn unknown_selector_stops_after_prior_entries() {
    let mut calls = device_setup();
    calls.push(DecodedCall::new(FunctionSelector(0x7777), 0, vec![Value::U32(1)]));
    calls.push(dispatch(0, 4));
    for (i, call) in calls.iter_mut().enumerate() {
        call.header.ordinal = i as u64 + 1;
    }

    let driver = RecordingDriver::new();
    let mut replayer = replayer(
        driver.clone(),
        ShaderCache::disabled(),
        ReplayOptions::default(),
    );
    let err = replayer
        .run(&mut reader(raw_trace_bytes(&calls)))
        .unwrap_err();
    match &err {
        ReplayError::UnknownFunction {
            selector, ordinal, ..
        } => {
            assert_eq!(*selector, FunctionSelector(0x7777));
            assert_eq!(*ordinal, FIRST);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.exit_code(), 4);
    assert_eq!(driver.ordinals(), vec![1, 2, 3, 4, 5]);
    assert_eq!(replayer.state(), ReplayState::Aborted);
}

#[test]
fn queues_keep_capture_order_and_honor_tokens() {
    const READY: u64 = 1;
    let mut calls = device_setup();
    if let Some(last) = calls.last_mut() {
        last.header.signals = vec![READY];
    }
    // Queue 2 signals token 100+i after its i-th dispatch; queue 1 waits for it first.
    for i in 0..20u64 {
        let mut waiter = dispatch(1, i as u32).with_waits(vec![100 + i]);
        let mut signaler = dispatch(2, i as u32).with_signals(vec![100 + i]);
        if i == 0 {
            waiter.header.waits.push(READY);
            signaler.header.waits.push(READY);
        }
        calls.push(waiter);
        calls.push(signaler);
    }

    let driver = RecordingDriver::new();
    let mut replayer = replayer(
        driver.clone(),
        ShaderCache::disabled(),
        ReplayOptions::default(),
    );
    let report = replayer.run(&mut reader(trace_bytes(calls))).unwrap();
    assert_eq!(report.entries_dispatched, 45);
    assert_eq!(report.per_queue.get(&1), Some(&20));
    assert_eq!(report.per_queue.get(&2), Some(&20));

    let log = driver.invocations();
    for queue in [0, 1, 2] {
        let ordinals: Vec<u64> = log
            .iter()
            .filter(|inv| inv.queue == queue)
            .map(|inv| inv.ordinal)
            .collect();
        assert!(
            ordinals.windows(2).all(|w| w[0] < w[1]),
            "queue {queue} out of order: {ordinals:?}"
        );
    }
    let position = |ordinal: u64| log.iter().position(|inv| inv.ordinal == ordinal).unwrap();
    for i in 0..20u64 {
        let waiter = FIRST + 2 * i;
        let signaler = waiter + 1;
        assert!(position(signaler) < position(waiter));
    }
}

#[test]
fn wait_that_nothing_signals_is_reported() {
    let driver = RecordingDriver::new();
    let mut replayer = replayer(
        driver.clone(),
        ShaderCache::disabled(),
        ReplayOptions::default(),
    );
    let bytes = trace_bytes(with_setup(vec![dispatch(0, 1).with_waits(vec![999])]));

    let err = replayer.run(&mut reader(bytes)).unwrap_err();
    assert!(matches!(
        err,
        ReplayError::UnsatisfiedWait {
            queue: 0,
            token: 999,
            ordinal: FIRST
        }
    ));
    assert_eq!(err.exit_code(), 7);
    assert_eq!(driver.ordinals(), vec![1, 2, 3, 4, 5]);
}

#[test]
fn cross_queue_wait_cycle_is_reported() {
    let mut calls = device_setup();
    if let Some(last) = calls.last_mut() {
        last.header.signals = vec![1];
    }
    calls.push(dispatch(1, 1).with_waits(vec![1, 20]));
    calls.push(dispatch(1, 2).with_signals(vec![10]));
    calls.push(dispatch(2, 1).with_waits(vec![1, 10]));
    calls.push(dispatch(2, 2).with_signals(vec![20]));

    let driver = RecordingDriver::new();
    let mut replayer = replayer(driver, ShaderCache::disabled(), ReplayOptions::default());
    let err = replayer.run(&mut reader(trace_bytes(calls))).unwrap_err();
    assert!(matches!(err, ReplayError::UnsatisfiedWait { .. }));
}

#[test]
fn cancelling_mid_run_stops_dispatch_and_still_tears_down() {
    let driver = RecordingDriver::new();
    let mut replayer = replayer(
        driver.clone(),
        ShaderCache::disabled(),
        ReplayOptions::default(),
    );
    driver.cancel_at(3, replayer.cancel_token());
    let bytes = trace_bytes(with_setup(vec![create_buffer(0, BUFFER), dispatch(0, 1)]));

    let err = replayer.run(&mut reader(bytes)).unwrap_err();
    assert!(matches!(err, ReplayError::Cancelled));
    assert_eq!(err.exit_code(), 8);
    assert_eq!(driver.ordinals(), vec![1, 2, 3]);

    let report = replayer.report().unwrap();
    assert_eq!(report.state, ReplayState::Cancelled);
    assert_eq!(report.entries_dispatched, 3);
    // The physical device is retrieved, not created, so only the device and instance go.
    let released: Vec<ObjectType> = driver.releases().iter().map(|&(ty, _)| ty).collect();
    assert_eq!(released, vec![ObjectType::Device, ObjectType::Instance]);
}

#[test]
fn cancelled_before_start_dispatches_nothing() {
    let driver = RecordingDriver::new();
    let mut replayer = replayer(
        driver.clone(),
        ShaderCache::disabled(),
        ReplayOptions::default(),
    );
    replayer.cancel_token().cancel();
    let err = replayer
        .run(&mut reader(trace_bytes(device_setup())))
        .unwrap_err();
    assert!(matches!(err, ReplayError::Cancelled));
    assert!(driver.invocations().is_empty());
}

#[test]
fn result_mismatch_warns_by_default() {
    let driver = RecordingDriver::new();
    driver.return_result(FIRST, -4);
    let mut replayer = replayer(
        driver.clone(),
        ShaderCache::disabled(),
        ReplayOptions::default(),
    );
    let bytes = trace_bytes(with_setup(vec![dispatch(0, 1), dispatch(0, 2)]));

    let report = replayer.run(&mut reader(bytes)).unwrap();
    assert_eq!(report.result_mismatches, 1);
    assert_eq!(report.entries_dispatched, 7);
}

#[test]
fn result_mismatch_is_fatal_when_strict() {
    let driver = RecordingDriver::new();
    driver.return_result(FIRST, -4);
    let options = ReplayOptions {
        mismatch_policy: MismatchPolicy::Fatal,
        ..ReplayOptions::default()
    };
    let mut replayer = replayer(driver.clone(), ShaderCache::disabled(), options);
    let bytes = trace_bytes(with_setup(vec![dispatch(0, 1), dispatch(0, 2)]));

    let err = replayer.run(&mut reader(bytes)).unwrap_err();
    assert!(matches!(
        err,
        ReplayError::DriverCall {
            ordinal: FIRST,
            recorded: 0,
            live: Some(-4),
            ..
        }
    ));
    assert_eq!(err.exit_code(), 6);
    assert!(!driver.ordinals().contains(&(FIRST + 1)));
}

#[test]
fn failed_creation_is_fatal_under_any_policy() {
    let driver = RecordingDriver::new();
    driver.return_result(FIRST, -2);
    let mut replayer = replayer(
        driver.clone(),
        ShaderCache::disabled(),
        ReplayOptions::default(),
    );
    let bytes = trace_bytes(with_setup(vec![
        create_buffer(0, BUFFER),
        update_buffer(0, BUFFER, b"x"),
    ]));

    let err = replayer.run(&mut reader(bytes)).unwrap_err();
    assert!(matches!(
        err,
        ReplayError::DriverCall {
            ordinal: FIRST,
            live: Some(-2),
            ..
        }
    ));
}

#[test]
fn adapter_errors_abort_the_run() {
    let driver = RecordingDriver::new();
    driver.fail(FIRST, DriverError::Unsupported("vkCmdDispatch".into()));
    let mut replayer = replayer(
        driver.clone(),
        ShaderCache::disabled(),
        ReplayOptions::default(),
    );
    let bytes = trace_bytes(with_setup(vec![dispatch(0, 1)]));

    let err = replayer.run(&mut reader(bytes)).unwrap_err();
    assert!(matches!(err, ReplayError::DriverCall { live: None, .. }));
    assert!(err.to_string().contains("not supported"));
}

#[test]
fn creations_that_failed_at_capture_register_nothing() {
    let driver = RecordingDriver::new();
    let mut replayer = replayer(
        driver.clone(),
        ShaderCache::disabled(),
        ReplayOptions::default(),
    );
    let bytes = trace_bytes(with_setup(vec![create_buffer(0, 0).with_result(-2)]));

    let report = replayer.run(&mut reader(bytes)).unwrap();
    assert_eq!(report.result_mismatches, 0);
    assert_eq!(report.handles_created, 5);
}

#[test]
fn teardown_releases_newest_first() {
    let driver = RecordingDriver::new();
    let mut replayer = replayer(
        driver.clone(),
        ShaderCache::disabled(),
        ReplayOptions::default(),
    );
    let bytes = trace_bytes(with_setup(vec![
        create_buffer(0, 0xb1),
        create_buffer(0, 0xb2),
    ]));

    let report = replayer.run(&mut reader(bytes)).unwrap();
    assert_eq!(report.handles_released, 6);

    let releases = driver.releases();
    let types: Vec<ObjectType> = releases.iter().map(|&(ty, _)| ty).collect();
    assert_eq!(
        types,
        vec![
            ObjectType::Buffer,
            ObjectType::Buffer,
            ObjectType::CommandBuffer,
            ObjectType::CommandPool,
            ObjectType::Device,
            ObjectType::Instance,
        ]
    );
    assert!(releases.windows(2).all(|w| w[0].1 > w[1].1));
    assert_eq!(replayer.handles().lock().alive_count(), 0);
}

#[test]
fn a_replayer_runs_once() {
    let driver = RecordingDriver::new();
    let mut replayer = replayer(driver, ShaderCache::disabled(), ReplayOptions::default());
    replayer
        .run(&mut reader(trace_bytes(device_setup())))
        .unwrap();
    let err = replayer
        .run(&mut reader(trace_bytes(device_setup())))
        .unwrap_err();
    assert!(matches!(err, ReplayError::AlreadyRan));
}
