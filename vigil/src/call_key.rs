//! Call-site identity.
//!
//! ## Usage
//!
//! Declare one [`CallKey`] per instrumented call site, ideally as a `static`,
//! and pass it to every profiling call made from that site.
//!
//! ```
//! use vigil::{Backend, CallCategory, CallKey};
//!
//! static DRAW_INDEXED: CallKey =
//!     CallKey::new(Backend::Vulkan, CallCategory::DrawIndexed, "vkCmdDrawIndexed");
//!
//! assert_eq!(DRAW_INDEXED.backend(), Backend::Vulkan);
//! ```

use std::{
    borrow::Cow,
    fmt,
    hash::{Hash, Hasher},
};

/// A rendering/compute backend that calls can be routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum Backend {
    /// Vulkan 1.x.
    Vulkan,
    /// Desktop OpenGL.
    OpenGl,
    /// OpenGL ES.
    OpenGlEs,
    /// Apple Metal.
    Metal,
    /// Direct3D 11.
    Direct3D11,
    /// Direct3D 12.
    Direct3D12,
    /// WebGPU.
    WebGpu,
}

impl Backend {
    /// Number of backends.
    pub const COUNT: usize = 7;

    /// Every backend, in index order.
    pub const ALL: [Backend; Self::COUNT] = [
        Backend::Vulkan,
        Backend::OpenGl,
        Backend::OpenGlEs,
        Backend::Metal,
        Backend::Direct3D11,
        Backend::Direct3D12,
        Backend::WebGpu,
    ];

    /// Dense index suitable for fixed-size per-backend tables.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Short lowercase name.
    pub const fn name(self) -> &'static str {
        match self {
            Backend::Vulkan => "vulkan",
            Backend::OpenGl => "opengl",
            Backend::OpenGlEs => "opengl-es",
            Backend::Metal => "metal",
            Backend::Direct3D11 => "d3d11",
            Backend::Direct3D12 => "d3d12",
            Backend::WebGpu => "webgpu",
        }
    }

    /// Whether native error codes from this backend are `HRESULT`s.
    pub const fn uses_hresult(self) -> bool {
        matches!(self, Backend::Direct3D11 | Backend::Direct3D12)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a call's duration is accounted within a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeBucket {
    /// Work executed (or recorded) for the GPU.
    Gpu,
    /// Waiting on fences, semaphores, submission or presentation.
    Sync,
    /// Everything else.
    Cpu,
}

/// Coarse classification of an instrumented call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum CallCategory {
    /// Non-indexed draw.
    Draw,
    /// Indexed draw.
    DrawIndexed,
    /// Indirect or multi-draw.
    DrawIndirect,
    /// Compute dispatch.
    Dispatch,
    /// Attachment clear.
    Clear,
    /// Pipeline, descriptor, vertex-buffer or other state binding.
    StateChange,
    /// Buffer upload or copy.
    BufferUpload,
    /// Texture upload or copy.
    TextureUpload,
    /// Buffer/image/sampler creation.
    ResourceCreate,
    /// Shader module compilation.
    ShaderCompile,
    /// Program linking.
    ShaderLink,
    /// Graphics/compute pipeline creation.
    PipelineCreate,
    /// Waiting on a fence.
    FenceWait,
    /// Waiting on a semaphore.
    SemaphoreWait,
    /// Queue submission.
    QueueSubmit,
    /// Swapchain presentation.
    Present,
    /// Query pool readback.
    Query,
    /// Frame-level events generated by the engine itself.
    Frame,
    /// Anything else.
    Other,
}

impl CallCategory {
    /// Short lowercase name.
    pub const fn name(self) -> &'static str {
        match self {
            CallCategory::Draw => "draw",
            CallCategory::DrawIndexed => "draw_indexed",
            CallCategory::DrawIndirect => "draw_indirect",
            CallCategory::Dispatch => "dispatch",
            CallCategory::Clear => "clear",
            CallCategory::StateChange => "state_change",
            CallCategory::BufferUpload => "buffer_upload",
            CallCategory::TextureUpload => "texture_upload",
            CallCategory::ResourceCreate => "resource_create",
            CallCategory::ShaderCompile => "shader_compile",
            CallCategory::ShaderLink => "shader_link",
            CallCategory::PipelineCreate => "pipeline_create",
            CallCategory::FenceWait => "fence_wait",
            CallCategory::SemaphoreWait => "semaphore_wait",
            CallCategory::QueueSubmit => "queue_submit",
            CallCategory::Present => "present",
            CallCategory::Query => "query",
            CallCategory::Frame => "frame",
            CallCategory::Other => "other",
        }
    }

    /// Frame bucket this category's time is charged to.
    pub const fn time_bucket(self) -> TimeBucket {
        match self {
            CallCategory::Draw
            | CallCategory::DrawIndexed
            | CallCategory::DrawIndirect
            | CallCategory::Dispatch
            | CallCategory::Clear => TimeBucket::Gpu,
            CallCategory::FenceWait
            | CallCategory::SemaphoreWait
            | CallCategory::QueueSubmit
            | CallCategory::Present => TimeBucket::Sync,
            CallCategory::StateChange
            | CallCategory::BufferUpload
            | CallCategory::TextureUpload
            | CallCategory::ResourceCreate
            | CallCategory::ShaderCompile
            | CallCategory::ShaderLink
            | CallCategory::PipelineCreate
            | CallCategory::Query
            | CallCategory::Frame
            | CallCategory::Other => TimeBucket::Cpu,
        }
    }

    /// Whether calls of this category count as draw calls.
    pub const fn is_draw(self) -> bool {
        matches!(
            self,
            CallCategory::Draw | CallCategory::DrawIndexed | CallCategory::DrawIndirect
        )
    }

    /// Whether calls of this category count as state changes.
    pub const fn is_state_change(self) -> bool {
        matches!(self, CallCategory::StateChange)
    }

    /// Whether this category belongs to the shader toolchain.
    pub const fn is_shader(self) -> bool {
        matches!(self, CallCategory::ShaderCompile | CallCategory::ShaderLink)
    }
}

impl fmt::Display for CallCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of a call site: backend, category and name.
///
/// The hash is computed once at construction; equality and hashing cover all
/// three fields.
#[derive(Clone)]
pub struct CallKey {
    backend: Backend,
    category: CallCategory,
    name: Cow<'static, str>,
    hash: u64,
}

impl CallKey {
    /// Creates a key at compile time.
    pub const fn new(backend: Backend, category: CallCategory, name: &'static str) -> Self {
        Self {
            backend,
            category,
            name: Cow::Borrowed(name),
            hash: key_hash(backend, category, name.as_bytes()),
        }
    }

    /// Creates a key from a runtime-built name.
    pub fn dynamic(
        backend: Backend,
        category: CallCategory,
        name: impl Into<Cow<'static, str>>,
    ) -> Self {
        let name = name.into();
        let hash = key_hash(backend, category, name.as_bytes());
        Self {
            backend,
            category,
            name,
            hash,
        }
    }

    /// The same call site on another backend, used when a call is rerouted.
    pub fn with_backend(&self, backend: Backend) -> Self {
        if backend == self.backend {
            return self.clone();
        }
        Self {
            backend,
            category: self.category,
            name: self.name.clone(),
            hash: key_hash(backend, self.category, self.name.as_bytes()),
        }
    }

    /// Backend the call site targets.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Category of the call.
    pub fn category(&self) -> CallCategory {
        self.category
    }

    /// Call-site name, typically the native entry point.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Precomputed hash of all three fields.
    pub fn precomputed_hash(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for CallKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.backend == other.backend
            && self.category == other.category
            && self.name == other.name
    }
}

impl Eq for CallKey {}

impl Hash for CallKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Debug for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallKey")
            .field("backend", &self.backend)
            .field("category", &self.category)
            .field("name", &self.name)
            .finish()
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.backend, self.category, self.name)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for CallKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("CallKey", 3)?;
        state.serialize_field("backend", &self.backend)?;
        state.serialize_field("category", &self.category)?;
        state.serialize_field("name", self.name.as_ref())?;
        state.end()
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

const fn fnv_byte(hash: u64, byte: u8) -> u64 {
    (hash ^ byte as u64).wrapping_mul(FNV_PRIME)
}

const fn key_hash(backend: Backend, category: CallCategory, name: &[u8]) -> u64 {
    let mut hash = fnv_byte(FNV_OFFSET, backend as u8);
    hash = fnv_byte(hash, category as u8);
    let mut i = 0;
    while i < name.len() {
        hash = fnv_byte(hash, name[i]);
        i += 1;
    }
    hash
}
