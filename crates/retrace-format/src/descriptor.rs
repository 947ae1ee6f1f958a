//! Per-function argument layout and call semantics, keyed by [`FunctionSelector`].
//!
//! The table is data: it is either produced by the registry generator (and loaded from its JSON
//! output with [`DescriptorTable::from_json`]) or hand-populated, as the built-in
//! [`DescriptorTable::vulkan_core`] subset is.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entry::{FunctionSelector, Value};

/// Current version of the JSON interchange document.
pub const DESCRIPTOR_TABLE_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectType {
    Instance,
    PhysicalDevice,
    Device,
    Queue,
    CommandPool,
    CommandBuffer,
    Buffer,
    BufferView,
    Image,
    ImageView,
    DeviceMemory,
    Semaphore,
    Fence,
    Event,
    QueryPool,
    Sampler,
    ShaderModule,
    PipelineCache,
    PipelineLayout,
    Pipeline,
    RenderPass,
    Framebuffer,
    DescriptorSetLayout,
    DescriptorPool,
    DescriptorSet,
    Surface,
    Swapchain,
    /// Object types the built-in enumeration does not name (raw `VkObjectType` value).
    Other(u32),
}

impl ObjectType {
    /// Handles that are enumerated or retrieved rather than created, and are therefore never
    /// released explicitly.
    pub fn is_retrieved(self) -> bool {
        matches!(self, ObjectType::PhysicalDevice | ObjectType::Queue)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectType::Other(raw) => write!(f, "Other({raw})"),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

/// Wire shape of one argument.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgKind {
    U8,
    U16,
    U32,
    U64,
    I32,
    I64,
    F32,
    F64,
    /// Opaque byte blob (shader code, upload data, pNext chains) with a `u32` length prefix.
    Bytes,
    Str,
    Handle(ObjectType),
    /// Nullable pointer: a presence byte followed by the inner value.
    Optional(Box<ArgKind>),
    /// Variable-length array with an explicit `u32` element count.
    Array(Box<ArgKind>),
    Struct(Vec<ArgKind>),
}

impl ArgKind {
    pub fn array(inner: ArgKind) -> Self {
        ArgKind::Array(Box::new(inner))
    }

    pub fn optional(inner: ArgKind) -> Self {
        ArgKind::Optional(Box::new(inner))
    }

    /// Smallest number of payload bytes a value of this kind can occupy.
    pub fn min_encoded_len(&self) -> usize {
        match self {
            ArgKind::U8 | ArgKind::Optional(_) => 1,
            ArgKind::U16 => 2,
            ArgKind::U32 | ArgKind::I32 | ArgKind::F32 => 4,
            ArgKind::Bytes | ArgKind::Str | ArgKind::Array(_) => 4,
            ArgKind::U64 | ArgKind::I64 | ArgKind::F64 | ArgKind::Handle(_) => 8,
            ArgKind::Struct(members) => members.iter().map(ArgKind::min_encoded_len).sum(),
        }
    }

    pub fn contains_handles(&self) -> bool {
        match self {
            ArgKind::Handle(_) => true,
            ArgKind::Optional(inner) | ArgKind::Array(inner) => inner.contains_handles(),
            ArgKind::Struct(members) => members.iter().any(ArgKind::contains_handles),
            _ => false,
        }
    }

    /// Returns whether `value` has exactly this shape (including handle object types).
    pub fn matches<H>(&self, value: &Value<H>) -> bool {
        match (self, value) {
            (ArgKind::U8, Value::U8(_))
            | (ArgKind::U16, Value::U16(_))
            | (ArgKind::U32, Value::U32(_))
            | (ArgKind::U64, Value::U64(_))
            | (ArgKind::I32, Value::I32(_))
            | (ArgKind::I64, Value::I64(_))
            | (ArgKind::F32, Value::F32(_))
            | (ArgKind::F64, Value::F64(_))
            | (ArgKind::Bytes, Value::Bytes(_))
            | (ArgKind::Str, Value::Str(_)) => true,
            (ArgKind::Handle(expected), Value::Handle(actual, _)) => expected == actual,
            (ArgKind::Optional(_), Value::Optional(None)) => true,
            (ArgKind::Optional(inner), Value::Optional(Some(value))) => inner.matches(value),
            (ArgKind::Array(inner), Value::Array(items)) => items.iter().all(|v| inner.matches(v)),
            (ArgKind::Struct(members), Value::Struct(items)) => {
                members.len() == items.len()
                    && members.iter().zip(items).all(|(kind, v)| kind.matches(v))
            }
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    In,
    /// Written by the call. Handle-typed outputs carry the recorded values of created objects.
    Out,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDesc {
    pub name: String,
    pub kind: ArgKind,
    #[serde(default)]
    pub direction: Direction,
}

impl ParamDesc {
    pub fn input(name: &str, kind: ArgKind) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            direction: Direction::In,
        }
    }

    pub fn output(name: &str, kind: ArgKind) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            direction: Direction::Out,
        }
    }
}

/// What the dispatcher must do around the live call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallRole {
    /// No handle lifetime effects beyond creating outputs, if any are declared.
    Command,
    /// Creates the objects named by its output handle parameters.
    Create,
    /// Destroys every handle contained in parameter `param`.
    ///
    /// Live objects of a type listed in `frees` that were created under a destroyed handle
    /// (directly or through another freed object) go with it, the way destroying a command pool
    /// frees its command buffers.
    Destroy {
        param: usize,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        frees: Vec<ObjectType>,
    },
    /// Creates a shader object from the bytecode in parameter `bytecode_param`; the compiled
    /// binary is served through the shader cache.
    CompileShader { bytecode_param: usize },
    /// Creates pipelines from the create-info in parameter `create_info_param`. The compiled
    /// binary is cached under the create-info combined with the content of the shader modules
    /// it references.
    CompilePipeline { create_info_param: usize },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub selector: FunctionSelector,
    pub name: String,
    pub params: Vec<ParamDesc>,
    pub role: CallRole,
    /// Input handle parameter naming the object that owns everything the call creates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_param: Option<usize>,
}

impl FunctionDescriptor {
    pub fn new(selector: u32, name: &str, role: CallRole, params: Vec<ParamDesc>) -> Self {
        Self {
            selector: FunctionSelector(selector),
            name: name.to_owned(),
            params,
            role,
            parent_param: None,
        }
    }

    pub fn with_parent(mut self, param: usize) -> Self {
        self.parent_param = Some(param);
        self
    }

    /// Whether the call produces objects that later entries may reference.
    pub fn creates_objects(&self) -> bool {
        self.params
            .iter()
            .any(|p| p.direction == Direction::Out && p.kind.contains_handles())
    }

    fn validate(&self) -> Result<(), DescriptorError> {
        let check_param = |index: usize, want: &'static str, ok: fn(&ArgKind) -> bool| {
            match self.params.get(index) {
                Some(param) if param.direction == Direction::In && ok(&param.kind) => Ok(()),
                _ => Err(DescriptorError::InvalidRoleParam {
                    function: self.name.clone(),
                    index,
                    expected: want,
                }),
            }
        };
        if let Some(parent) = self.parent_param {
            check_param(parent, "input handle parameter", |kind| {
                matches!(kind, ArgKind::Handle(_))
            })?;
        }
        match self.role {
            CallRole::Command | CallRole::Create => Ok(()),
            CallRole::Destroy { param, .. } => {
                check_param(param, "input parameter containing handles", ArgKind::contains_handles)
            }
            CallRole::CompileShader { bytecode_param } => {
                check_param(bytecode_param, "bytes input parameter", |kind| {
                    *kind == ArgKind::Bytes
                })
            }
            CallRole::CompilePipeline { create_info_param } => check_param(
                create_info_param,
                "input parameter containing handles",
                ArgKind::contains_handles,
            ),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("duplicate function selector {0}")]
    DuplicateSelector(FunctionSelector),

    #[error("duplicate function name {0}")]
    DuplicateName(String),

    #[error("{function}: role parameter {index} must be an {expected}")]
    InvalidRoleParam {
        function: String,
        index: usize,
        expected: &'static str,
    },

    #[error("unsupported descriptor table version {0}")]
    UnsupportedVersion(u32),

    #[error("invalid descriptor table json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct DescriptorTableFile {
    version: u32,
    functions: Vec<FunctionDescriptor>,
}

/// Read-only lookup from selector to descriptor.
#[derive(Clone, Debug, Default)]
pub struct DescriptorTable {
    by_selector: HashMap<FunctionSelector, FunctionDescriptor>,
    by_name: HashMap<String, FunctionSelector>,
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, desc: FunctionDescriptor) -> Result<(), DescriptorError> {
        desc.validate()?;
        if self.by_selector.contains_key(&desc.selector) {
            return Err(DescriptorError::DuplicateSelector(desc.selector));
        }
        if self.by_name.contains_key(&desc.name) {
            return Err(DescriptorError::DuplicateName(desc.name));
        }
        self.by_name.insert(desc.name.clone(), desc.selector);
        self.by_selector.insert(desc.selector, desc);
        Ok(())
    }

    pub fn get(&self, selector: FunctionSelector) -> Option<&FunctionDescriptor> {
        self.by_selector.get(&selector)
    }

    pub fn by_name(&self, name: &str) -> Option<&FunctionDescriptor> {
        self.by_name.get(name).and_then(|sel| self.by_selector.get(sel))
    }

    pub fn len(&self) -> usize {
        self.by_selector.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_selector.is_empty()
    }

    /// Descriptors in ascending selector order.
    pub fn iter(&self) -> impl Iterator<Item = &FunctionDescriptor> {
        let mut all: Vec<_> = self.by_selector.values().collect();
        all.sort_by_key(|d| d.selector);
        all.into_iter()
    }

    pub fn from_json(json: &str) -> Result<Self, DescriptorError> {
        let file: DescriptorTableFile = serde_json::from_str(json)?;
        Self::from_file(file)
    }

    pub fn from_reader(reader: impl std::io::Read) -> Result<Self, DescriptorError> {
        let file: DescriptorTableFile = serde_json::from_reader(reader)?;
        Self::from_file(file)
    }

    fn from_file(file: DescriptorTableFile) -> Result<Self, DescriptorError> {
        if file.version != DESCRIPTOR_TABLE_VERSION {
            return Err(DescriptorError::UnsupportedVersion(file.version));
        }
        let mut table = Self::new();
        for desc in file.functions {
            table.insert(desc)?;
        }
        Ok(table)
    }

    pub fn to_json(&self) -> Result<String, DescriptorError> {
        let file = DescriptorTableFile {
            version: DESCRIPTOR_TABLE_VERSION,
            functions: self.iter().cloned().collect(),
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::RecordedHandle;

    fn create_buffer() -> FunctionDescriptor {
        FunctionDescriptor::new(
            10,
            "vkCreateBuffer",
            CallRole::Create,
            vec![
                ParamDesc::input("device", ArgKind::Handle(ObjectType::Device)),
                ParamDesc::input("size", ArgKind::U64),
                ParamDesc::output("buffer", ArgKind::Handle(ObjectType::Buffer)),
            ],
        )
    }

    #[test]
    fn rejects_duplicate_selectors_and_names() {
        let mut table = DescriptorTable::new();
        table.insert(create_buffer()).unwrap();

        let err = table.insert(create_buffer()).unwrap_err();
        assert!(matches!(err, DescriptorError::DuplicateSelector(FunctionSelector(10))));

        let mut renamed = create_buffer();
        renamed.selector = FunctionSelector(11);
        let err = table.insert(renamed).unwrap_err();
        assert!(matches!(err, DescriptorError::DuplicateName(name) if name == "vkCreateBuffer"));
    }

    #[test]
    fn rejects_role_pointing_at_wrong_param() {
        let desc = FunctionDescriptor::new(
            20,
            "vkCreateShaderModule",
            CallRole::CompileShader { bytecode_param: 0 },
            vec![ParamDesc::input("device", ArgKind::Handle(ObjectType::Device))],
        );
        let err = DescriptorTable::new().insert(desc).unwrap_err();
        assert!(matches!(err, DescriptorError::InvalidRoleParam { index: 0, .. }));
    }

    #[test]
    fn rejects_parent_that_is_not_an_input_handle() {
        let desc = create_buffer().with_parent(2);
        let err = DescriptorTable::new().insert(desc).unwrap_err();
        assert!(matches!(err, DescriptorError::InvalidRoleParam { index: 2, .. }));

        let desc = create_buffer().with_parent(1);
        assert!(DescriptorTable::new().insert(desc).is_err());
        DescriptorTable::new().insert(create_buffer().with_parent(0)).unwrap();
    }

    #[test]
    fn destroy_roles_keep_their_freed_types_through_json() {
        let destroy_pool = FunctionDescriptor::new(
            0x31,
            "vkDestroyCommandPool",
            CallRole::Destroy {
                param: 1,
                frees: vec![ObjectType::CommandBuffer],
            },
            vec![
                ParamDesc::input("device", ArgKind::Handle(ObjectType::Device)),
                ParamDesc::input("commandPool", ArgKind::Handle(ObjectType::CommandPool)),
            ],
        );
        let mut table = DescriptorTable::new();
        table.insert(destroy_pool.clone()).unwrap();
        table.insert(create_buffer().with_parent(0)).unwrap();

        let parsed = DescriptorTable::from_json(&table.to_json().unwrap()).unwrap();
        assert_eq!(parsed.by_name("vkDestroyCommandPool"), Some(&destroy_pool));
        assert_eq!(parsed.by_name("vkCreateBuffer").unwrap().parent_param, Some(0));

        // Documents written before freed types existed still load.
        let legacy = r#"{"version":1,"functions":[{"selector":17,"name":"vkDestroyBuffer",
            "params":[{"name":"device","kind":{"Handle":"Device"}},
                      {"name":"buffer","kind":{"Handle":"Buffer"}}],
            "role":{"kind":"destroy","param":1}}]}"#;
        let parsed = DescriptorTable::from_json(legacy).unwrap();
        let desc = parsed.by_name("vkDestroyBuffer").unwrap();
        assert_eq!(desc.role, CallRole::Destroy { param: 1, frees: Vec::new() });
        assert_eq!(desc.parent_param, None);
    }

    #[test]
    fn json_interchange_roundtrips() {
        let mut table = DescriptorTable::new();
        table.insert(create_buffer()).unwrap();
        let json = table.to_json().unwrap();

        let parsed = DescriptorTable::from_json(&json).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.by_name("vkCreateBuffer"), Some(&create_buffer()));
        assert!(parsed.get(FunctionSelector(10)).unwrap().creates_objects());
    }

    #[test]
    fn kind_matching_checks_handle_types() {
        let kind = ArgKind::array(ArgKind::Handle(ObjectType::Fence));
        let fences: Value<RecordedHandle> =
            Value::Array(vec![Value::Handle(ObjectType::Fence, RecordedHandle(3))]);
        let buffers: Value<RecordedHandle> =
            Value::Array(vec![Value::Handle(ObjectType::Buffer, RecordedHandle(3))]);
        assert!(kind.matches(&fences));
        assert!(!kind.matches(&buffers));
    }
}
