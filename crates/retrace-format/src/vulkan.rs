//! Hand-populated descriptors for the core Vulkan subset that the replay tests and the `retrace`
//! binary use when no generated table is supplied.
//!
//! Signatures are flattened: create-info structures are reduced to the fields that matter for
//! replay, and `pAllocator` arguments are omitted.

use crate::descriptor::{
    ArgKind, CallRole, DescriptorTable, FunctionDescriptor, ObjectType, ParamDesc,
};

/// Stable selector values for the built-in table.
pub mod selectors {
    use crate::entry::FunctionSelector;

    pub const CREATE_INSTANCE: FunctionSelector = FunctionSelector(0x0001);
    pub const DESTROY_INSTANCE: FunctionSelector = FunctionSelector(0x0002);
    pub const ENUMERATE_PHYSICAL_DEVICES: FunctionSelector = FunctionSelector(0x0003);
    pub const CREATE_DEVICE: FunctionSelector = FunctionSelector(0x0004);
    pub const DESTROY_DEVICE: FunctionSelector = FunctionSelector(0x0005);
    pub const GET_DEVICE_QUEUE: FunctionSelector = FunctionSelector(0x0006);
    pub const DEVICE_WAIT_IDLE: FunctionSelector = FunctionSelector(0x0007);

    pub const CREATE_BUFFER: FunctionSelector = FunctionSelector(0x0010);
    pub const DESTROY_BUFFER: FunctionSelector = FunctionSelector(0x0011);
    pub const ALLOCATE_MEMORY: FunctionSelector = FunctionSelector(0x0012);
    pub const FREE_MEMORY: FunctionSelector = FunctionSelector(0x0013);
    pub const BIND_BUFFER_MEMORY: FunctionSelector = FunctionSelector(0x0014);
    pub const CREATE_IMAGE: FunctionSelector = FunctionSelector(0x0015);
    pub const DESTROY_IMAGE: FunctionSelector = FunctionSelector(0x0016);
    pub const BIND_IMAGE_MEMORY: FunctionSelector = FunctionSelector(0x0017);
    pub const CREATE_IMAGE_VIEW: FunctionSelector = FunctionSelector(0x0018);
    pub const DESTROY_IMAGE_VIEW: FunctionSelector = FunctionSelector(0x0019);

    pub const CREATE_SHADER_MODULE: FunctionSelector = FunctionSelector(0x0020);
    pub const DESTROY_SHADER_MODULE: FunctionSelector = FunctionSelector(0x0021);
    pub const CREATE_DESCRIPTOR_SET_LAYOUT: FunctionSelector = FunctionSelector(0x0022);
    pub const DESTROY_DESCRIPTOR_SET_LAYOUT: FunctionSelector = FunctionSelector(0x0023);
    pub const CREATE_PIPELINE_LAYOUT: FunctionSelector = FunctionSelector(0x0024);
    pub const DESTROY_PIPELINE_LAYOUT: FunctionSelector = FunctionSelector(0x0025);
    pub const CREATE_COMPUTE_PIPELINES: FunctionSelector = FunctionSelector(0x0026);
    pub const DESTROY_PIPELINE: FunctionSelector = FunctionSelector(0x0027);

    pub const CREATE_COMMAND_POOL: FunctionSelector = FunctionSelector(0x0030);
    pub const DESTROY_COMMAND_POOL: FunctionSelector = FunctionSelector(0x0031);
    pub const ALLOCATE_COMMAND_BUFFERS: FunctionSelector = FunctionSelector(0x0032);
    pub const FREE_COMMAND_BUFFERS: FunctionSelector = FunctionSelector(0x0033);
    pub const BEGIN_COMMAND_BUFFER: FunctionSelector = FunctionSelector(0x0034);
    pub const END_COMMAND_BUFFER: FunctionSelector = FunctionSelector(0x0035);
    pub const CMD_BIND_PIPELINE: FunctionSelector = FunctionSelector(0x0036);
    pub const CMD_DISPATCH: FunctionSelector = FunctionSelector(0x0037);
    pub const CMD_COPY_BUFFER: FunctionSelector = FunctionSelector(0x0038);
    pub const CMD_UPDATE_BUFFER: FunctionSelector = FunctionSelector(0x0039);

    pub const CREATE_SEMAPHORE: FunctionSelector = FunctionSelector(0x0040);
    pub const DESTROY_SEMAPHORE: FunctionSelector = FunctionSelector(0x0041);
    pub const CREATE_FENCE: FunctionSelector = FunctionSelector(0x0042);
    pub const DESTROY_FENCE: FunctionSelector = FunctionSelector(0x0043);
    pub const WAIT_FOR_FENCES: FunctionSelector = FunctionSelector(0x0044);
    pub const RESET_FENCES: FunctionSelector = FunctionSelector(0x0045);
    pub const QUEUE_SUBMIT: FunctionSelector = FunctionSelector(0x0046);
    pub const QUEUE_WAIT_IDLE: FunctionSelector = FunctionSelector(0x0047);

    /// Capture-side meta command: contents written by the application into mapped memory.
    pub const FILL_MEMORY: FunctionSelector = FunctionSelector(0x1000_0001);
}

fn input(name: &str, kind: ArgKind) -> ParamDesc {
    ParamDesc::input(name, kind)
}

fn output(name: &str, kind: ArgKind) -> ParamDesc {
    ParamDesc::output(name, kind)
}

fn handle(ty: ObjectType) -> ArgKind {
    ArgKind::Handle(ty)
}

fn handles(ty: ObjectType) -> ArgKind {
    ArgKind::array(ArgKind::Handle(ty))
}

fn device() -> ParamDesc {
    input("device", handle(ObjectType::Device))
}

fn command_buffer() -> ParamDesc {
    input("commandBuffer", handle(ObjectType::CommandBuffer))
}

fn destroy(selector: u32, name: &str, ty: ObjectType, param_name: &str) -> FunctionDescriptor {
    FunctionDescriptor::new(
        selector,
        name,
        CallRole::Destroy {
            param: 1,
            frees: Vec::new(),
        },
        vec![device(), input(param_name, handle(ty))],
    )
}

/// Everything a device owns; destroying the device finalizes whatever the trace left alive.
const DEVICE_CHILDREN: &[ObjectType] = &[
    ObjectType::Queue,
    ObjectType::CommandPool,
    ObjectType::CommandBuffer,
    ObjectType::Buffer,
    ObjectType::BufferView,
    ObjectType::Image,
    ObjectType::ImageView,
    ObjectType::DeviceMemory,
    ObjectType::Semaphore,
    ObjectType::Fence,
    ObjectType::Event,
    ObjectType::QueryPool,
    ObjectType::Sampler,
    ObjectType::ShaderModule,
    ObjectType::PipelineCache,
    ObjectType::PipelineLayout,
    ObjectType::Pipeline,
    ObjectType::RenderPass,
    ObjectType::Framebuffer,
    ObjectType::DescriptorSetLayout,
    ObjectType::DescriptorPool,
    ObjectType::DescriptorSet,
    ObjectType::Swapchain,
];

fn instance_children() -> Vec<ObjectType> {
    let mut types = vec![
        ObjectType::PhysicalDevice,
        ObjectType::Device,
        ObjectType::Surface,
    ];
    types.extend_from_slice(DEVICE_CHILDREN);
    types
}

fn descriptors() -> Vec<FunctionDescriptor> {
    use ObjectType as T;
    use selectors as s;

    let create = CallRole::Create;
    let command = CallRole::Command;

    vec![
        FunctionDescriptor::new(
            s::CREATE_INSTANCE.0,
            "vkCreateInstance",
            create.clone(),
            vec![
                input("applicationName", ArgKind::optional(ArgKind::Str)),
                input("apiVersion", ArgKind::U32),
                input("enabledLayers", ArgKind::array(ArgKind::Str)),
                input("enabledExtensions", ArgKind::array(ArgKind::Str)),
                output("instance", handle(T::Instance)),
            ],
        ),
        FunctionDescriptor::new(
            s::DESTROY_INSTANCE.0,
            "vkDestroyInstance",
            CallRole::Destroy {
                param: 0,
                frees: instance_children(),
            },
            vec![input("instance", handle(T::Instance))],
        ),
        FunctionDescriptor::new(
            s::ENUMERATE_PHYSICAL_DEVICES.0,
            "vkEnumeratePhysicalDevices",
            create.clone(),
            vec![
                input("instance", handle(T::Instance)),
                output("physicalDevices", handles(T::PhysicalDevice)),
            ],
        )
        .with_parent(0),
        FunctionDescriptor::new(
            s::CREATE_DEVICE.0,
            "vkCreateDevice",
            create.clone(),
            vec![
                input("physicalDevice", handle(T::PhysicalDevice)),
                input(
                    "queueCreateInfos",
                    ArgKind::array(ArgKind::Struct(vec![
                        ArgKind::U32,
                        ArgKind::array(ArgKind::F32),
                    ])),
                ),
                input("enabledExtensions", ArgKind::array(ArgKind::Str)),
                input("enabledFeatures", ArgKind::optional(ArgKind::Bytes)),
                output("device", handle(T::Device)),
            ],
        )
        .with_parent(0),
        FunctionDescriptor::new(
            s::DESTROY_DEVICE.0,
            "vkDestroyDevice",
            CallRole::Destroy {
                param: 0,
                frees: DEVICE_CHILDREN.to_vec(),
            },
            vec![device()],
        ),
        FunctionDescriptor::new(
            s::GET_DEVICE_QUEUE.0,
            "vkGetDeviceQueue",
            create.clone(),
            vec![
                device(),
                input("queueFamilyIndex", ArgKind::U32),
                input("queueIndex", ArgKind::U32),
                output("queue", handle(T::Queue)),
            ],
        )
        .with_parent(0),
        FunctionDescriptor::new(
            s::DEVICE_WAIT_IDLE.0,
            "vkDeviceWaitIdle",
            command.clone(),
            vec![device()],
        ),
        FunctionDescriptor::new(
            s::CREATE_BUFFER.0,
            "vkCreateBuffer",
            create.clone(),
            vec![
                device(),
                input("flags", ArgKind::U32),
                input("size", ArgKind::U64),
                input("usage", ArgKind::U32),
                input("sharingMode", ArgKind::U32),
                input("queueFamilyIndices", ArgKind::array(ArgKind::U32)),
                output("buffer", handle(T::Buffer)),
            ],
        )
        .with_parent(0),
        destroy(s::DESTROY_BUFFER.0, "vkDestroyBuffer", T::Buffer, "buffer"),
        FunctionDescriptor::new(
            s::ALLOCATE_MEMORY.0,
            "vkAllocateMemory",
            create.clone(),
            vec![
                device(),
                input("allocationSize", ArgKind::U64),
                input("memoryTypeIndex", ArgKind::U32),
                output("memory", handle(T::DeviceMemory)),
            ],
        )
        .with_parent(0),
        destroy(s::FREE_MEMORY.0, "vkFreeMemory", T::DeviceMemory, "memory"),
        FunctionDescriptor::new(
            s::BIND_BUFFER_MEMORY.0,
            "vkBindBufferMemory",
            command.clone(),
            vec![
                device(),
                input("buffer", handle(T::Buffer)),
                input("memory", handle(T::DeviceMemory)),
                input("memoryOffset", ArgKind::U64),
            ],
        ),
        FunctionDescriptor::new(
            s::CREATE_IMAGE.0,
            "vkCreateImage",
            create.clone(),
            vec![
                device(),
                input("imageType", ArgKind::U32),
                input("format", ArgKind::U32),
                input(
                    "extent",
                    ArgKind::Struct(vec![ArgKind::U32, ArgKind::U32, ArgKind::U32]),
                ),
                input("mipLevels", ArgKind::U32),
                input("arrayLayers", ArgKind::U32),
                input("samples", ArgKind::U32),
                input("tiling", ArgKind::U32),
                input("usage", ArgKind::U32),
                output("image", handle(T::Image)),
            ],
        )
        .with_parent(0),
        destroy(s::DESTROY_IMAGE.0, "vkDestroyImage", T::Image, "image"),
        FunctionDescriptor::new(
            s::BIND_IMAGE_MEMORY.0,
            "vkBindImageMemory",
            command.clone(),
            vec![
                device(),
                input("image", handle(T::Image)),
                input("memory", handle(T::DeviceMemory)),
                input("memoryOffset", ArgKind::U64),
            ],
        ),
        FunctionDescriptor::new(
            s::CREATE_IMAGE_VIEW.0,
            "vkCreateImageView",
            create.clone(),
            vec![
                device(),
                input("image", handle(T::Image)),
                input("viewType", ArgKind::U32),
                input("format", ArgKind::U32),
                input(
                    "subresourceRange",
                    ArgKind::Struct(vec![
                        ArgKind::U32,
                        ArgKind::U32,
                        ArgKind::U32,
                        ArgKind::U32,
                        ArgKind::U32,
                    ]),
                ),
                output("view", handle(T::ImageView)),
            ],
        )
        .with_parent(0),
        destroy(
            s::DESTROY_IMAGE_VIEW.0,
            "vkDestroyImageView",
            T::ImageView,
            "imageView",
        ),
        FunctionDescriptor::new(
            s::CREATE_SHADER_MODULE.0,
            "vkCreateShaderModule",
            CallRole::CompileShader { bytecode_param: 1 },
            vec![
                device(),
                input("code", ArgKind::Bytes),
                output("shaderModule", handle(T::ShaderModule)),
            ],
        )
        .with_parent(0),
        destroy(
            s::DESTROY_SHADER_MODULE.0,
            "vkDestroyShaderModule",
            T::ShaderModule,
            "shaderModule",
        ),
        FunctionDescriptor::new(
            s::CREATE_DESCRIPTOR_SET_LAYOUT.0,
            "vkCreateDescriptorSetLayout",
            create.clone(),
            vec![
                device(),
                input(
                    "bindings",
                    ArgKind::array(ArgKind::Struct(vec![
                        ArgKind::U32,
                        ArgKind::U32,
                        ArgKind::U32,
                        ArgKind::U32,
                    ])),
                ),
                output("setLayout", handle(T::DescriptorSetLayout)),
            ],
        )
        .with_parent(0),
        destroy(
            s::DESTROY_DESCRIPTOR_SET_LAYOUT.0,
            "vkDestroyDescriptorSetLayout",
            T::DescriptorSetLayout,
            "descriptorSetLayout",
        ),
        FunctionDescriptor::new(
            s::CREATE_PIPELINE_LAYOUT.0,
            "vkCreatePipelineLayout",
            create.clone(),
            vec![
                device(),
                input("setLayouts", handles(T::DescriptorSetLayout)),
                input(
                    "pushConstantRanges",
                    ArgKind::array(ArgKind::Struct(vec![
                        ArgKind::U32,
                        ArgKind::U32,
                        ArgKind::U32,
                    ])),
                ),
                output("pipelineLayout", handle(T::PipelineLayout)),
            ],
        )
        .with_parent(0),
        destroy(
            s::DESTROY_PIPELINE_LAYOUT.0,
            "vkDestroyPipelineLayout",
            T::PipelineLayout,
            "pipelineLayout",
        ),
        FunctionDescriptor::new(
            s::CREATE_COMPUTE_PIPELINES.0,
            "vkCreateComputePipelines",
            CallRole::CompilePipeline {
                create_info_param: 2,
            },
            vec![
                device(),
                input("pipelineCache", handle(T::PipelineCache)),
                input(
                    "createInfos",
                    ArgKind::array(ArgKind::Struct(vec![
                        ArgKind::U32,
                        handle(T::ShaderModule),
                        ArgKind::Str,
                        handle(T::PipelineLayout),
                    ])),
                ),
                output("pipelines", handles(T::Pipeline)),
            ],
        )
        .with_parent(0),
        destroy(s::DESTROY_PIPELINE.0, "vkDestroyPipeline", T::Pipeline, "pipeline"),
        FunctionDescriptor::new(
            s::CREATE_COMMAND_POOL.0,
            "vkCreateCommandPool",
            create.clone(),
            vec![
                device(),
                input("flags", ArgKind::U32),
                input("queueFamilyIndex", ArgKind::U32),
                output("commandPool", handle(T::CommandPool)),
            ],
        )
        .with_parent(0),
        FunctionDescriptor::new(
            s::DESTROY_COMMAND_POOL.0,
            "vkDestroyCommandPool",
            CallRole::Destroy {
                param: 1,
                frees: vec![T::CommandBuffer],
            },
            vec![device(), input("commandPool", handle(T::CommandPool))],
        ),
        FunctionDescriptor::new(
            s::ALLOCATE_COMMAND_BUFFERS.0,
            "vkAllocateCommandBuffers",
            create.clone(),
            vec![
                device(),
                input("commandPool", handle(T::CommandPool)),
                input("level", ArgKind::U32),
                output("commandBuffers", handles(T::CommandBuffer)),
            ],
        )
        .with_parent(1),
        FunctionDescriptor::new(
            s::FREE_COMMAND_BUFFERS.0,
            "vkFreeCommandBuffers",
            CallRole::Destroy {
                param: 2,
                frees: Vec::new(),
            },
            vec![
                device(),
                input("commandPool", handle(T::CommandPool)),
                input("commandBuffers", handles(T::CommandBuffer)),
            ],
        ),
        FunctionDescriptor::new(
            s::BEGIN_COMMAND_BUFFER.0,
            "vkBeginCommandBuffer",
            command.clone(),
            vec![command_buffer(), input("flags", ArgKind::U32)],
        ),
        FunctionDescriptor::new(
            s::END_COMMAND_BUFFER.0,
            "vkEndCommandBuffer",
            command.clone(),
            vec![command_buffer()],
        ),
        FunctionDescriptor::new(
            s::CMD_BIND_PIPELINE.0,
            "vkCmdBindPipeline",
            command.clone(),
            vec![
                command_buffer(),
                input("pipelineBindPoint", ArgKind::U32),
                input("pipeline", handle(T::Pipeline)),
            ],
        ),
        FunctionDescriptor::new(
            s::CMD_DISPATCH.0,
            "vkCmdDispatch",
            command.clone(),
            vec![
                command_buffer(),
                input("groupCountX", ArgKind::U32),
                input("groupCountY", ArgKind::U32),
                input("groupCountZ", ArgKind::U32),
            ],
        ),
        FunctionDescriptor::new(
            s::CMD_COPY_BUFFER.0,
            "vkCmdCopyBuffer",
            command.clone(),
            vec![
                command_buffer(),
                input("srcBuffer", handle(T::Buffer)),
                input("dstBuffer", handle(T::Buffer)),
                input(
                    "regions",
                    ArgKind::array(ArgKind::Struct(vec![
                        ArgKind::U64,
                        ArgKind::U64,
                        ArgKind::U64,
                    ])),
                ),
            ],
        ),
        FunctionDescriptor::new(
            s::CMD_UPDATE_BUFFER.0,
            "vkCmdUpdateBuffer",
            command.clone(),
            vec![
                command_buffer(),
                input("dstBuffer", handle(T::Buffer)),
                input("dstOffset", ArgKind::U64),
                input("data", ArgKind::Bytes),
            ],
        ),
        FunctionDescriptor::new(
            s::CREATE_SEMAPHORE.0,
            "vkCreateSemaphore",
            create.clone(),
            vec![
                device(),
                input("semaphoreType", ArgKind::U32),
                input("initialValue", ArgKind::U64),
                output("semaphore", handle(T::Semaphore)),
            ],
        )
        .with_parent(0),
        destroy(
            s::DESTROY_SEMAPHORE.0,
            "vkDestroySemaphore",
            T::Semaphore,
            "semaphore",
        ),
        FunctionDescriptor::new(
            s::CREATE_FENCE.0,
            "vkCreateFence",
            create.clone(),
            vec![
                device(),
                input("flags", ArgKind::U32),
                output("fence", handle(T::Fence)),
            ],
        )
        .with_parent(0),
        destroy(s::DESTROY_FENCE.0, "vkDestroyFence", T::Fence, "fence"),
        FunctionDescriptor::new(
            s::WAIT_FOR_FENCES.0,
            "vkWaitForFences",
            command.clone(),
            vec![
                device(),
                input("fences", handles(T::Fence)),
                input("waitAll", ArgKind::U32),
                input("timeout", ArgKind::U64),
            ],
        ),
        FunctionDescriptor::new(
            s::RESET_FENCES.0,
            "vkResetFences",
            command.clone(),
            vec![device(), input("fences", handles(T::Fence))],
        ),
        FunctionDescriptor::new(
            s::QUEUE_SUBMIT.0,
            "vkQueueSubmit",
            command.clone(),
            vec![
                input("queue", handle(T::Queue)),
                input(
                    "submits",
                    ArgKind::array(ArgKind::Struct(vec![
                        handles(T::Semaphore),
                        ArgKind::array(ArgKind::U32),
                        handles(T::CommandBuffer),
                        handles(T::Semaphore),
                    ])),
                ),
                input("fence", handle(T::Fence)),
            ],
        ),
        FunctionDescriptor::new(
            s::QUEUE_WAIT_IDLE.0,
            "vkQueueWaitIdle",
            command,
            vec![input("queue", handle(T::Queue))],
        ),
        FunctionDescriptor::new(
            s::FILL_MEMORY.0,
            "retrace.FillMemory",
            CallRole::Command,
            vec![
                input("memory", handle(T::DeviceMemory)),
                input("offset", ArgKind::U64),
                input("data", ArgKind::Bytes),
            ],
        ),
    ]
}

impl DescriptorTable {
    /// Built-in table for the core Vulkan subset.
    pub fn vulkan_core() -> Self {
        let mut table = DescriptorTable::new();
        for desc in descriptors() {
            // The list above is static; a failure here is a bug in this module.
            if let Err(err) = table.insert(desc) {
                panic!("invalid built-in descriptor: {err}");
            }
        }
        table
    }
}
