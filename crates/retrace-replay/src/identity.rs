//! Structural identity of replayed objects.
//!
//! An object's identity hashes the function that created it and its input arguments, with each
//! referenced handle replaced by the identity of the object behind it. Shader modules are
//! identified by their bytecode instead. Equal create-infos over equal shader modules therefore
//! produce equal pipeline keys, whatever handle values the capture assigned.

use retrace_format::{ArgValue, Direction, FunctionDescriptor, ObjectType, RecordedHandle, Value};

use crate::handle_table::HandleTable;
use crate::shader_cache::{ContentHash, CACHE_FORMAT_VERSION};

const OBJECT_DOMAIN: &[u8] = b"retrace object identity v1";
const PIPELINE_DOMAIN: &[u8] = b"retrace pipeline cache key v1";

/// Identity of output object `index` of a creating call.
pub(crate) fn object_identity(
    desc: &FunctionDescriptor,
    args: &[ArgValue],
    index: usize,
    handles: &HandleTable,
) -> ContentHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(OBJECT_DOMAIN);
    hasher.update(&desc.selector.0.to_le_bytes());
    for (param, value) in desc.params.iter().zip(args) {
        if param.direction == Direction::In {
            feed(&mut hasher, value, handles);
        }
    }
    hasher.update(&(index as u64).to_le_bytes());
    ContentHash(*hasher.finalize().as_bytes())
}

/// Cache key for a pipeline-creating call: its create-info argument combined with the content
/// hashes of the shader modules (and identities of the other objects) it references.
pub(crate) fn pipeline_key(
    desc: &FunctionDescriptor,
    create_info: &ArgValue,
    handles: &HandleTable,
) -> ContentHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(PIPELINE_DOMAIN);
    hasher.update(&CACHE_FORMAT_VERSION.to_le_bytes());
    hasher.update(&desc.selector.0.to_le_bytes());
    feed(&mut hasher, create_info, handles);
    ContentHash(*hasher.finalize().as_bytes())
}

fn feed(hasher: &mut blake3::Hasher, value: &ArgValue, handles: &HandleTable) {
    match value {
        Value::U8(v) => tagged(hasher, 0, &[*v]),
        Value::U16(v) => tagged(hasher, 1, &v.to_le_bytes()),
        Value::U32(v) => tagged(hasher, 2, &v.to_le_bytes()),
        Value::U64(v) => tagged(hasher, 3, &v.to_le_bytes()),
        Value::I32(v) => tagged(hasher, 4, &v.to_le_bytes()),
        Value::I64(v) => tagged(hasher, 5, &v.to_le_bytes()),
        Value::F32(v) => tagged(hasher, 6, &v.to_bits().to_le_bytes()),
        Value::F64(v) => tagged(hasher, 7, &v.to_bits().to_le_bytes()),
        Value::Bytes(bytes) => sized(hasher, 8, bytes),
        Value::Str(s) => sized(hasher, 9, s.as_bytes()),
        Value::Handle(ty, recorded) => feed_handle(hasher, *ty, *recorded, handles),
        Value::Optional(None) => tagged(hasher, 11, &[0]),
        Value::Optional(Some(inner)) => {
            tagged(hasher, 11, &[1]);
            feed(hasher, inner, handles);
        }
        Value::Array(items) | Value::Struct(items) => {
            let tag = if matches!(value, Value::Array(_)) { 12 } else { 13 };
            tagged(hasher, tag, &(items.len() as u64).to_le_bytes());
            for item in items {
                feed(hasher, item, handles);
            }
        }
    }
}

fn feed_handle(
    hasher: &mut blake3::Hasher,
    ty: ObjectType,
    recorded: RecordedHandle,
    handles: &HandleTable,
) {
    sized(hasher, 10, ty.to_string().as_bytes());
    if recorded.is_null() {
        hasher.update(&[0]);
        return;
    }
    match handles.content_of(recorded) {
        Some(content) => {
            hasher.update(&[1]);
            hasher.update(&content.0);
        }
        // Objects replayed without an identity fall back to the capture's handle value.
        None => {
            hasher.update(&[2]);
            hasher.update(&recorded.0.to_le_bytes());
        }
    }
}

fn tagged(hasher: &mut blake3::Hasher, tag: u8, bytes: &[u8]) {
    hasher.update(&[tag]);
    hasher.update(bytes);
}

fn sized(hasher: &mut blake3::Hasher, tag: u8, bytes: &[u8]) {
    hasher.update(&[tag]);
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::LiveHandle;
    use crate::handle_table::Origin;
    use retrace_format::{selectors, DescriptorTable};

    fn create_info(module: u64, layout: u64) -> ArgValue {
        Value::Array(vec![Value::Struct(vec![
            Value::U32(0),
            Value::Handle(ObjectType::ShaderModule, RecordedHandle(module)),
            Value::Str("main".to_owned()),
            Value::Handle(ObjectType::PipelineLayout, RecordedHandle(layout)),
        ])])
    }

    fn module(handles: &mut HandleTable, recorded: u64, code: &[u8], ordinal: u64) {
        let origin = Origin {
            parent: None,
            content: Some(ContentHash::of_bytecode(code)),
        };
        handles
            .register_with_origin(
                RecordedHandle(recorded),
                ObjectType::ShaderModule,
                LiveHandle(0x100 + recorded),
                origin,
                ordinal,
            )
            .unwrap();
    }

    #[test]
    fn pipeline_key_follows_module_content_not_handle_values() {
        let table = DescriptorTable::vulkan_core();
        let desc = table.get(selectors::CREATE_COMPUTE_PIPELINES).unwrap();
        let mut handles = HandleTable::new();
        module(&mut handles, 0x51, b"spirv a", 1);
        module(&mut handles, 0x52, b"spirv a", 2);
        module(&mut handles, 0x53, b"spirv b", 3);

        let key = |module| pipeline_key(desc, &create_info(module, 0), &handles);
        assert_eq!(key(0x51), key(0x52));
        assert_ne!(key(0x51), key(0x53));
        assert_ne!(
            key(0x51),
            pipeline_key(desc, &create_info(0x51, 0x77), &handles)
        );
    }

    #[test]
    fn object_identity_distinguishes_outputs_and_arguments() {
        let table = DescriptorTable::vulkan_core();
        let desc = table.get(selectors::ALLOCATE_COMMAND_BUFFERS).unwrap();
        let handles = HandleTable::new();
        let args = |level| {
            vec![
                Value::Handle(ObjectType::Device, RecordedHandle(3)),
                Value::Handle(ObjectType::CommandPool, RecordedHandle(4)),
                Value::U32(level),
                Value::Array(Vec::new()),
            ]
        };

        let first = object_identity(desc, &args(0), 0, &handles);
        assert_eq!(first, object_identity(desc, &args(0), 0, &handles));
        assert_ne!(first, object_identity(desc, &args(0), 1, &handles));
        assert_ne!(first, object_identity(desc, &args(1), 0, &handles));
    }
}
