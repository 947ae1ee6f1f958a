use proptest::prelude::*;
use proptest::test_runner::{Config, TestRunner};

use retrace_format::codec::{decode, decode_entry, encode, to_entry};
use retrace_format::{
    ArgKind, ArgValue, DecodedCall, DescriptorTable, EntryHeader, FunctionDescriptor,
    RecordedHandle, Value,
};

fn value_strategy(kind: &ArgKind) -> BoxedStrategy<ArgValue> {
    match kind {
        ArgKind::U8 => any::<u8>().prop_map(Value::U8).boxed(),
        ArgKind::U16 => any::<u16>().prop_map(Value::U16).boxed(),
        ArgKind::U32 => any::<u32>().prop_map(Value::U32).boxed(),
        ArgKind::U64 => any::<u64>().prop_map(Value::U64).boxed(),
        ArgKind::I32 => any::<i32>().prop_map(Value::I32).boxed(),
        ArgKind::I64 => any::<i64>().prop_map(Value::I64).boxed(),
        // Raw bits so that NaN payloads and negative zero are exercised too.
        ArgKind::F32 => any::<u32>()
            .prop_map(|bits| Value::F32(f32::from_bits(bits)))
            .boxed(),
        ArgKind::F64 => any::<u64>()
            .prop_map(|bits| Value::F64(f64::from_bits(bits)))
            .boxed(),
        ArgKind::Bytes => prop::collection::vec(any::<u8>(), 0..96)
            .prop_map(Value::Bytes)
            .boxed(),
        ArgKind::Str => "[a-zA-Z0-9_. ]{0,24}".prop_map(Value::Str).boxed(),
        ArgKind::Handle(ty) => {
            let ty = *ty;
            prop_oneof![Just(0u64), any::<u64>()]
                .prop_map(move |raw| Value::Handle(ty, RecordedHandle(raw)))
                .boxed()
        }
        ArgKind::Optional(inner) => prop::option::of(value_strategy(inner))
            .prop_map(|v| Value::Optional(v.map(Box::new)))
            .boxed(),
        ArgKind::Array(inner) => prop::collection::vec(value_strategy(inner), 0..4)
            .prop_map(Value::Array)
            .boxed(),
        ArgKind::Struct(members) => members
            .iter()
            .map(value_strategy)
            .collect::<Vec<_>>()
            .prop_map(Value::Struct)
            .boxed(),
    }
}

fn call_strategy(desc: &FunctionDescriptor) -> impl Strategy<Value = DecodedCall> {
    let selector = desc.selector;
    let args: Vec<_> = desc.params.iter().map(|p| value_strategy(&p.kind)).collect();
    (
        0u32..4,
        any::<u64>(),
        any::<i32>(),
        prop::collection::vec(any::<u64>(), 0..3),
        prop::collection::vec(any::<u64>(), 0..3),
        args,
    )
        .prop_map(move |(queue, ordinal, result, waits, signals, args)| DecodedCall {
            header: EntryHeader {
                selector,
                queue,
                ordinal,
                result,
                waits,
                signals,
            },
            args,
        })
}

#[test]
fn every_builtin_selector_roundtrips() {
    let table = DescriptorTable::vulkan_core();
    for desc in table.iter() {
        let mut runner = TestRunner::new(Config {
            cases: 48,
            ..Config::default()
        });
        runner
            .run(&call_strategy(desc), |call| {
                let bytes = encode(&call).expect("encode");
                let decoded = decode(&bytes, &table).expect("decode");
                prop_assert_eq!(&decoded, &call);

                let entry = to_entry(&call).expect("to_entry");
                prop_assert_eq!(decode_entry(&entry, &table).expect("decode_entry"), call);
                Ok(())
            })
            .unwrap_or_else(|err| panic!("{} failed to roundtrip: {err}", desc.name));
    }
}

#[test]
fn descriptor_table_json_preserves_decoding() {
    let builtin = DescriptorTable::vulkan_core();
    let loaded = DescriptorTable::from_json(&builtin.to_json().unwrap()).unwrap();
    assert_eq!(loaded.len(), builtin.len());
    for desc in builtin.iter() {
        assert_eq!(loaded.get(desc.selector), Some(desc));
    }
}

proptest! {
    #[test]
    fn truncated_entries_never_decode(cut in 1usize..64) {
        let table = DescriptorTable::vulkan_core();
        let desc = table.by_name("vkCmdUpdateBuffer").unwrap();
        let call = DecodedCall::new(
            desc.selector,
            0,
            vec![
                Value::Handle(retrace_format::ObjectType::CommandBuffer, RecordedHandle(1)),
                Value::Handle(retrace_format::ObjectType::Buffer, RecordedHandle(2)),
                Value::U64(0),
                Value::Bytes(vec![0xab; 32]),
            ],
        );
        let bytes = encode(&call).unwrap();
        let cut = cut.min(bytes.len());
        prop_assert!(decode(&bytes[..bytes.len() - cut], &table).is_err());
    }
}
