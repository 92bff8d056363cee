//! Core backend abstraction traits
//!
//! These traits define the interface that the wgpu and dummy backends
//! implement. The engine compiles the scene tree against this surface only,
//! so the whole frame loop can run (and be tested) without GPU hardware.

use std::ops::Range;

use thiserror::Error;

use crate::backend::types::*;

/// Backend error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create surface: {0}")]
    SurfaceCreationFailed(String),
    #[error("Failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("Failed to configure surface: {0}")]
    SurfaceConfigurationFailed(String),
    #[error("Failed to acquire next image: {0}")]
    AcquireImageFailed(String),
    #[error("Failed to create shader: {0}")]
    ShaderCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Operation requires an acquired device")]
    DeviceNotReady,
    #[error("Unknown resource handle: {0}")]
    UnknownHandle(&'static str),
    #[error("Surface lost")]
    SurfaceLost,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a GPU texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u64);

/// Handle to a texture view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureViewHandle(pub(crate) u64);

/// Handle to a compiled shader module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderModuleHandle(pub(crate) u64);

/// Handle to a bind group layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindGroupLayoutHandle(pub(crate) u64);

/// Handle to a bind group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindGroupHandle(pub(crate) u64);

/// Handle to a pipeline layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineLayoutHandle(pub(crate) u64);

/// Handle to a render pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPipelineHandle(pub(crate) u64);

/// Handle to a pre-recorded render bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderBundleHandle(pub(crate) u64);

/// Handle to a finished command buffer awaiting submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandBufferHandle(pub(crate) u64);

/// Shader stage visibility flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderStageFlags(u32);

impl ShaderStageFlags {
    pub const VERTEX: Self = Self(1 << 0);
    pub const FRAGMENT: Self = Self(1 << 1);
    pub const VERTEX_FRAGMENT: Self = Self((1 << 0) | (1 << 1));

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for ShaderStageFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Buffer binding flavor declared in a bind group layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferBindingKind {
    #[default]
    Uniform,
    Storage {
        read_only: bool,
    },
}

/// Bind group layout entry
#[derive(Debug, Clone)]
pub struct BindGroupLayoutEntry {
    pub binding: u32,
    pub visibility: ShaderStageFlags,
    pub kind: BufferBindingKind,
}

/// Bind group entry for creating bind groups
#[derive(Debug, Clone)]
pub enum BindGroupEntry {
    Buffer {
        buffer: BufferHandle,
        offset: u64,
        size: Option<u64>,
    },
    Texture(TextureViewHandle),
}

/// Vertex attribute description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u64,
}

/// Vertex buffer layout
#[derive(Debug, Clone, PartialEq)]
pub struct VertexBufferLayout {
    pub array_stride: u64,
    pub step_mode: VertexStepMode,
    pub attributes: Vec<VertexAttribute>,
}

/// Depth/stencil pipeline state
#[derive(Debug, Clone)]
pub struct DepthStencilState {
    pub format: TextureFormat,
    pub depth_write_enabled: bool,
    pub depth_compare: CompareFunction,
}

/// Color target pipeline state
#[derive(Debug, Clone)]
pub struct ColorTargetState {
    pub format: TextureFormat,
    pub blend: Option<BlendState>,
    pub write_mask: ColorWrites,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorWrites(pub u32);

impl ColorWrites {
    pub const RED: Self = Self(1 << 0);
    pub const GREEN: Self = Self(1 << 1);
    pub const BLUE: Self = Self(1 << 2);
    pub const ALPHA: Self = Self(1 << 3);
    pub const ALL: Self = Self(0xF);

    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// Multisample pipeline state
#[derive(Debug, Clone, Copy)]
pub struct MultisampleState {
    pub count: u32,
    pub mask: u64,
    pub alpha_to_coverage_enabled: bool,
}

impl Default for MultisampleState {
    fn default() -> Self {
        Self {
            count: 1,
            mask: !0,
            alpha_to_coverage_enabled: false,
        }
    }
}

/// Render pipeline descriptor
///
/// Shader stages reference pre-created modules by handle; entry points are
/// selected per stage (the same module may serve both).
#[derive(Debug, Clone)]
pub struct RenderPipelineDescriptor {
    pub label: Option<String>,
    pub layout: Option<PipelineLayoutHandle>,
    pub vertex_module: ShaderModuleHandle,
    pub vertex_entry_point: String,
    pub fragment_module: Option<ShaderModuleHandle>,
    pub fragment_entry_point: Option<String>,
    pub vertex_layouts: Vec<VertexBufferLayout>,
    pub color_targets: Vec<ColorTargetState>,
    pub depth_stencil: Option<DepthStencilState>,
    pub multisample: MultisampleState,
    pub primitive_topology: PrimitiveTopology,
    pub front_face: FrontFace,
    pub cull_mode: CullMode,
}

#[derive(Debug, Clone)]
pub enum LoadOp {
    Clear([f64; 4]),
    Load,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Store,
    Discard,
}

/// Color attachment for a render pass
#[derive(Debug, Clone)]
pub struct ColorAttachmentDesc {
    pub view: TextureViewHandle,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
}

/// Depth/stencil attachment for a render pass
#[derive(Debug, Clone)]
pub struct DepthStencilAttachmentDesc {
    pub view: TextureViewHandle,
    pub format: TextureFormat,
    pub depth_load_op: LoadOp,
    pub depth_store_op: StoreOp,
    pub depth_clear_value: f32,
    pub stencil_load_op: LoadOp,
    pub stencil_store_op: StoreOp,
    pub stencil_clear_value: u32,
}

/// Render pass descriptor
#[derive(Debug, Clone)]
pub struct RenderPassDescriptor {
    pub label: Option<String>,
    pub color_attachments: Vec<ColorAttachmentDesc>,
    pub depth_stencil_attachment: Option<DepthStencilAttachmentDesc>,
}

/// Render bundle encoder configuration: the attachment formats the bundle
/// will be replayed against.
#[derive(Debug, Clone)]
pub struct RenderBundleDescriptor {
    pub label: Option<String>,
    pub color_formats: Vec<TextureFormat>,
    pub depth_stencil_format: Option<TextureFormat>,
    pub sample_count: u32,
}

/// A single diagnostic emitted while compiling a shader module.
#[derive(Debug, Clone)]
pub struct CompilationMessage {
    pub message: String,
    pub line: Option<u64>,
}

/// Parameters for device acquisition
#[derive(Debug, Clone, Default)]
pub struct DeviceOptions {
    pub power_preference: PowerPreference,
    pub features: Vec<String>,
    pub limits: DeviceLimits,
    pub verbose: bool,
}

/// Details reported once the adapter/device sequence completes.
#[derive(Debug, Clone)]
pub struct AdapterDetails {
    pub name: String,
    pub preferred_format: TextureFormat,
}

/// Result of polling an in-flight device acquisition.
#[derive(Debug, Clone)]
pub enum AcquireStatus {
    /// No acquisition has been started.
    Idle,
    /// The one-shot acquisition future has not resolved yet.
    Pending,
    /// Adapter and device are ready; GPU calls may proceed.
    Ready(AdapterDetails),
    /// The sequence failed; the caller may retry with `begin_acquire`.
    Failed(BackendError),
}

/// Main graphics backend trait
///
/// Device acquisition is asynchronous but never blocking: `begin_acquire`
/// starts the one-shot adapter/device sequence inside the backend, and
/// `poll_acquire` advances it by a single poll. The engine guarantees
/// single-flight (it never begins a second acquisition while one is
/// pending).
pub trait GpuBackend {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    // Device acquisition

    /// Start the adapter/device acquisition sequence.
    fn begin_acquire(&mut self, options: &DeviceOptions);

    /// Poll the in-flight acquisition once.
    fn poll_acquire(&mut self) -> AcquireStatus;

    /// Whether a device has been acquired.
    fn is_ready(&self) -> bool;

    // Surface

    /// Configure the presented surface, resolving `FormatRequest::Preferred`
    /// against the adapter-reported format. Returns the concrete format.
    fn configure_surface(
        &mut self,
        format: FormatRequest,
        width: u32,
        height: u32,
    ) -> BackendResult<TextureFormat>;

    /// Get the current frame's surface view. The view is per-frame and must
    /// be re-fetched every frame, even when the surface configuration is
    /// cached.
    fn current_frame_view(&mut self) -> BackendResult<TextureViewHandle>;

    /// Present the current frame.
    fn present_frame(&mut self) -> BackendResult<()>;

    // Resource creation

    /// Create a buffer sized to `data` with its contents uploaded.
    fn create_buffer_init(&mut self, usage: BufferUsage, data: &[u8]) -> BackendResult<BufferHandle>;

    /// Destroy a buffer.
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    /// Create a texture.
    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle>;

    /// Create a view over a texture.
    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle>;

    /// Destroy a texture.
    fn destroy_texture(&mut self, texture: TextureHandle);

    /// Destroy a texture view.
    fn destroy_texture_view(&mut self, view: TextureViewHandle);

    /// Compile a shader module, returning any compilation diagnostics.
    fn create_shader_module(
        &mut self,
        source: &str,
    ) -> BackendResult<(ShaderModuleHandle, Vec<CompilationMessage>)>;

    /// Destroy a shader module.
    fn destroy_shader_module(&mut self, module: ShaderModuleHandle);

    /// Destroy a bind group.
    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle);

    /// Destroy a bind group layout.
    fn destroy_bind_group_layout(&mut self, layout: BindGroupLayoutHandle);

    /// Destroy a pipeline layout.
    fn destroy_pipeline_layout(&mut self, layout: PipelineLayoutHandle);

    /// Destroy a render pipeline.
    fn destroy_render_pipeline(&mut self, pipeline: RenderPipelineHandle);

    /// Create a bind group layout.
    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle>;

    /// Create a bind group.
    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle>;

    /// Create a pipeline layout from bind group layouts.
    fn create_pipeline_layout(
        &mut self,
        layouts: &[BindGroupLayoutHandle],
    ) -> BackendResult<PipelineLayoutHandle>;

    /// Create a render pipeline.
    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle>;

    // Render bundle recording

    /// Open a bundle encoder configured with the pass's attachment formats.
    fn begin_render_bundle(&mut self, desc: &RenderBundleDescriptor);

    /// Set the current pipeline on the open bundle encoder.
    fn bundle_set_pipeline(&mut self, pipeline: RenderPipelineHandle);

    /// Bind a vertex buffer on the open bundle encoder.
    fn bundle_set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle);

    /// Bind a bind group on the open bundle encoder.
    fn bundle_set_bind_group(&mut self, index: u32, bind_group: BindGroupHandle);

    /// Record a draw on the open bundle encoder.
    fn bundle_draw(&mut self, vertices: Range<u32>, instances: Range<u32>);

    /// Finish the open bundle encoder into a replayable bundle.
    fn finish_render_bundle(&mut self) -> BackendResult<RenderBundleHandle>;

    /// Destroy a render bundle.
    fn destroy_render_bundle(&mut self, bundle: RenderBundleHandle);

    // Frame encoding

    /// Open a command encoder.
    fn begin_command_encoder(&mut self, label: Option<&str>);

    /// Begin a render pass on the open encoder.
    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor);

    /// Replay pre-recorded bundles into the current render pass.
    fn execute_bundles(&mut self, bundles: &[RenderBundleHandle]);

    /// End the current render pass.
    fn end_render_pass(&mut self);

    /// Finish the open encoder into a command buffer awaiting submission.
    fn finish_command_encoder(&mut self) -> BackendResult<CommandBufferHandle>;

    /// Submit finished command buffers as one batch.
    fn submit(&mut self, buffers: Vec<CommandBufferHandle>) -> BackendResult<()>;
}
