//! Typed scene nodes.
//!
//! Every node pairs its authored, kind-specific properties with the cached
//! compilation state for that kind. A cached native handle of `None` means
//! "must be (re)computed" — clearing a handle *is* the invalidation signal.
//! The one exception is [`DrawState::dirty`]: a draw's validity depends on
//! sibling bind-group-layout changes it cannot detect structurally, so it
//! carries an explicit flag.

use std::sync::Arc;

use crate::alloc::BufferData;
use crate::backend::traits::{
    BindGroupHandle, BindGroupLayoutHandle, BufferHandle, PipelineLayoutHandle,
    RenderBundleHandle, RenderPipelineHandle, ShaderModuleHandle, ShaderStageFlags,
    TextureHandle, TextureViewHandle, VertexBufferLayout,
};
use crate::backend::traits::{BufferBindingKind, ColorWrites, LoadOp, StoreOp};
use crate::backend::types::{
    BlendState, CompareFunction, CullMode, DeviceLimits, Extent3d, FormatRequest, FrontFace,
    PrimitiveTopology, TextureFormat, VertexFormat, VertexStepMode,
};
use crate::error::SceneError;
use crate::hash::FormatHash;
use crate::schema::NodeKind;
use crate::tree::NodeId;

// ---------------------------------------------------------------------------
// Authored properties, one struct per kind that has any
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LimitsProps {
    pub limits: DeviceLimits,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureProps {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SwapChainProps {
    pub format: FormatRequest,
}

#[derive(Debug, Clone, Default)]
pub struct CommandProps {
    pub label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ColorAttachmentProps {
    pub load_op: LoadOp,
    pub store_op: StoreOp,
}

impl Default for ColorAttachmentProps {
    fn default() -> Self {
        Self {
            load_op: LoadOp::Clear([0.0, 0.0, 0.0, 1.0]),
            store_op: StoreOp::Store,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DepthStencilAttachmentProps {
    pub depth_load_op: LoadOp,
    pub depth_store_op: StoreOp,
    pub depth_clear_value: f32,
    pub stencil_load_op: LoadOp,
    pub stencil_store_op: StoreOp,
    pub stencil_clear_value: u32,
}

impl Default for DepthStencilAttachmentProps {
    fn default() -> Self {
        Self {
            depth_load_op: LoadOp::Clear([1.0, 0.0, 0.0, 0.0]),
            depth_store_op: StoreOp::Store,
            depth_clear_value: 1.0,
            stencil_load_op: LoadOp::Clear([0.0; 4]),
            stencil_store_op: StoreOp::Store,
            stencil_clear_value: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TextureProps {
    pub format: TextureFormat,
    /// Sized to the canvas, rebuilt on resize.
    pub full_screen: bool,
    /// Explicit extent; required when `full_screen` is false.
    pub size: Option<Extent3d>,
}

impl Default for TextureProps {
    fn default() -> Self {
        Self {
            format: TextureFormat::Bgra8UnormSrgb,
            full_screen: false,
            size: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RenderPipelineProps {
    pub topology: PrimitiveTopology,
    pub front_face: FrontFace,
    pub cull_mode: CullMode,
}

#[derive(Debug, Clone)]
pub struct ColorTargetStateProps {
    /// Explicit target format; `None` resolves to the owning pass's
    /// color format at the same target index.
    pub format: Option<TextureFormat>,
    pub blend: Option<BlendState>,
    pub write_mask: ColorWrites,
}

impl Default for ColorTargetStateProps {
    fn default() -> Self {
        Self {
            format: None,
            blend: None,
            write_mask: ColorWrites::ALL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MultisampleStateProps {
    pub count: u32,
    pub mask: u64,
    pub alpha_to_coverage_enabled: bool,
}

impl Default for MultisampleStateProps {
    fn default() -> Self {
        Self {
            count: 1,
            mask: !0,
            alpha_to_coverage_enabled: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DepthStencilStateProps {
    pub depth_write_enabled: bool,
    pub depth_compare: CompareFunction,
}

impl Default for DepthStencilStateProps {
    fn default() -> Self {
        Self {
            depth_write_enabled: true,
            depth_compare: CompareFunction::Less,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShaderModuleProps {
    pub source: Arc<str>,
    pub vertex_entry_point: Option<String>,
    pub fragment_entry_point: Option<String>,
}

impl Default for ShaderModuleProps {
    fn default() -> Self {
        Self {
            source: Arc::from(""),
            vertex_entry_point: None,
            fragment_entry_point: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VertexBufferLayoutProps {
    /// Computed as the sum of attribute sizes when unset.
    pub array_stride: Option<u64>,
    pub step_mode: VertexStepMode,
}

#[derive(Debug, Clone)]
pub struct VertexAttributeProps {
    pub format: VertexFormat,
    /// Packed sequentially after the preceding sibling when unset.
    pub offset: Option<u64>,
    /// Sequential when unset.
    pub shader_location: Option<u32>,
}

impl Default for VertexAttributeProps {
    fn default() -> Self {
        Self {
            format: VertexFormat::Float32x4,
            offset: None,
            shader_location: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DrawProps {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

impl Default for DrawProps {
    fn default() -> Self {
        Self {
            vertex_count: 0,
            instance_count: 1,
            first_vertex: 0,
            first_instance: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BindBufferProps {
    /// Explicit binding index; the next unused index in declaration order
    /// when unset.
    pub binding: Option<u32>,
    pub visibility: ShaderStageFlags,
    pub kind: BufferBindingKind,
}

impl Default for BindBufferProps {
    fn default() -> Self {
        Self {
            binding: None,
            visibility: ShaderStageFlags::VERTEX_FRAGMENT,
            kind: BufferBindingKind::Uniform,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VertexBufferProps {
    pub data: BufferData,
    /// Explicit vertex-buffer slot; next unused when unset.
    pub slot: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct UniformBufferProps {
    pub data: BufferData,
    /// Explicit binding index; next unused when unset.
    pub binding: Option<u32>,
}

/// Authored properties tagged with their kind, as accepted by
/// [`SceneTree::create_node`](crate::tree::SceneTree::create_node) and
/// [`SceneTree::set_props`](crate::tree::SceneTree::set_props).
#[derive(Debug, Clone)]
pub enum Props {
    Root,
    Limits(LimitsProps),
    Feature(FeatureProps),
    SwapChain(SwapChainProps),
    Command(CommandProps),
    RenderPass,
    ColorAttachment(ColorAttachmentProps),
    DepthStencilAttachment(DepthStencilAttachmentProps),
    RenderBundle,
    Texture(TextureProps),
    RenderPipeline(RenderPipelineProps),
    ColorTargetState(ColorTargetStateProps),
    MultisampleState(MultisampleStateProps),
    DepthStencilState(DepthStencilStateProps),
    ShaderModule(ShaderModuleProps),
    BindGroupLayout,
    VertexBufferLayout(VertexBufferLayoutProps),
    Draw(DrawProps),
    BindBuffer(BindBufferProps),
    VertexAttribute(VertexAttributeProps),
    VertexBuffer(VertexBufferProps),
    BindGroup,
    UniformBuffer(UniformBufferProps),
}

impl Props {
    pub fn kind(&self) -> NodeKind {
        match self {
            Props::Root => NodeKind::Root,
            Props::Limits(_) => NodeKind::Limits,
            Props::Feature(_) => NodeKind::Feature,
            Props::SwapChain(_) => NodeKind::SwapChain,
            Props::Command(_) => NodeKind::Command,
            Props::RenderPass => NodeKind::RenderPass,
            Props::ColorAttachment(_) => NodeKind::ColorAttachment,
            Props::DepthStencilAttachment(_) => NodeKind::DepthStencilAttachment,
            Props::RenderBundle => NodeKind::RenderBundle,
            Props::Texture(_) => NodeKind::Texture,
            Props::RenderPipeline(_) => NodeKind::RenderPipeline,
            Props::ColorTargetState(_) => NodeKind::ColorTargetState,
            Props::MultisampleState(_) => NodeKind::MultisampleState,
            Props::DepthStencilState(_) => NodeKind::DepthStencilState,
            Props::ShaderModule(_) => NodeKind::ShaderModule,
            Props::BindGroupLayout => NodeKind::BindGroupLayout,
            Props::VertexBufferLayout(_) => NodeKind::VertexBufferLayout,
            Props::Draw(_) => NodeKind::Draw,
            Props::BindBuffer(_) => NodeKind::BindBuffer,
            Props::VertexAttribute(_) => NodeKind::VertexAttribute,
            Props::VertexBuffer(_) => NodeKind::VertexBuffer,
            Props::BindGroup => NodeKind::BindGroup,
            Props::UniformBuffer(_) => NodeKind::UniformBuffer,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-kind state: authored props + cached compilation results
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RootState {
    /// Forces full device re-acquisition when set.
    pub invalid: bool,
    /// Forces surface reconfiguration when set.
    pub swap_chain_invalid: bool,
}

#[derive(Debug, Default)]
pub struct SwapChainState {
    pub props: SwapChainProps,
}

#[derive(Debug, Default)]
pub struct TextureState {
    pub props: TextureProps,
    pub texture: Option<TextureHandle>,
    pub view: Option<TextureViewHandle>,
    /// Format last run through the hash; the hash is only recomputed when
    /// the format actually changed.
    pub hashed_format: Option<TextureFormat>,
    pub format_hash: FormatHash,
}

#[derive(Debug, Default)]
pub struct RenderPassState {
    /// Resolved during the frame; consumed by bundle re-record checks.
    pub color_formats: Vec<TextureFormat>,
    pub depth_stencil_format: Option<TextureFormat>,
    pub format_hash: FormatHash,
}

#[derive(Debug, Default)]
pub struct RenderBundleState {
    pub bundle: Option<RenderBundleHandle>,
    /// Pass format hash this bundle was last recorded against.
    pub format_hash: FormatHash,
}

#[derive(Debug, Default)]
pub struct RenderPipelineState {
    pub props: RenderPipelineProps,
    pub pipeline: Option<RenderPipelineHandle>,
    /// Bind group layouts in group-index order, rebuilt with the pipeline.
    pub bind_group_layouts: Vec<BindGroupLayoutHandle>,
    pub pipeline_layout: Option<PipelineLayoutHandle>,
    /// Draw children in declaration order, cached so repeated resolves skip
    /// the child walk.
    pub draw_calls: Vec<NodeId>,
    /// Whether `draw_calls` reflects the current child list.
    pub draws_valid: bool,
}

#[derive(Debug, Default)]
pub struct ShaderModuleState {
    pub props: ShaderModuleProps,
    /// Pool-managed module handle.
    pub module: Option<ShaderModuleHandle>,
}

#[derive(Debug, Default)]
pub struct BindGroupLayoutState {
    pub layout: Option<BindGroupLayoutHandle>,
}

#[derive(Debug, Default)]
pub struct VertexBufferLayoutState {
    pub props: VertexBufferLayoutProps,
    pub resolved: Option<VertexBufferLayout>,
}

#[derive(Debug)]
pub struct DrawState {
    pub props: DrawProps,
    /// Set when this draw's bindings (or the pipeline's bind group layouts)
    /// changed and must be re-resolved at the next bundle record.
    pub dirty: bool,
    /// Resolved (slot, buffer) pairs in declaration order.
    pub vertex_buffers: Vec<(u32, BufferHandle)>,
    /// Resolved (group index, bind group) pairs in declaration order.
    pub bind_groups: Vec<(u32, BindGroupHandle)>,
}

impl Default for DrawState {
    fn default() -> Self {
        Self {
            props: DrawProps::default(),
            dirty: true,
            vertex_buffers: Vec::new(),
            bind_groups: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct VertexBufferState {
    pub props: VertexBufferProps,
    /// Pool-managed buffer handle.
    pub buffer: Option<BufferHandle>,
}

#[derive(Debug, Default)]
pub struct BindGroupState {
    pub bind_group: Option<BindGroupHandle>,
    /// Layout the cached bind group was created against; a different layout
    /// identity forces recreation.
    pub layout: Option<BindGroupLayoutHandle>,
}

#[derive(Debug, Default)]
pub struct UniformBufferState {
    pub props: UniformBufferProps,
    /// Pool-managed buffer handle.
    pub buffer: Option<BufferHandle>,
}

/// Tagged union over all node kinds: authored props plus cached state.
#[derive(Debug)]
pub enum NodeState {
    Root(RootState),
    Limits(LimitsProps),
    Feature(FeatureProps),
    SwapChain(SwapChainState),
    Command(CommandProps),
    RenderPass(RenderPassState),
    ColorAttachment(ColorAttachmentProps),
    DepthStencilAttachment(DepthStencilAttachmentProps),
    RenderBundle(RenderBundleState),
    Texture(TextureState),
    RenderPipeline(RenderPipelineState),
    ColorTargetState(ColorTargetStateProps),
    MultisampleState(MultisampleStateProps),
    DepthStencilState(DepthStencilStateProps),
    ShaderModule(ShaderModuleState),
    BindGroupLayout(BindGroupLayoutState),
    VertexBufferLayout(VertexBufferLayoutState),
    Draw(DrawState),
    BindBuffer(BindBufferProps),
    VertexAttribute(VertexAttributeProps),
    VertexBuffer(VertexBufferState),
    BindGroup(BindGroupState),
    UniformBuffer(UniformBufferState),
}

impl NodeState {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeState::Root(_) => NodeKind::Root,
            NodeState::Limits(_) => NodeKind::Limits,
            NodeState::Feature(_) => NodeKind::Feature,
            NodeState::SwapChain(_) => NodeKind::SwapChain,
            NodeState::Command(_) => NodeKind::Command,
            NodeState::RenderPass(_) => NodeKind::RenderPass,
            NodeState::ColorAttachment(_) => NodeKind::ColorAttachment,
            NodeState::DepthStencilAttachment(_) => NodeKind::DepthStencilAttachment,
            NodeState::RenderBundle(_) => NodeKind::RenderBundle,
            NodeState::Texture(_) => NodeKind::Texture,
            NodeState::RenderPipeline(_) => NodeKind::RenderPipeline,
            NodeState::ColorTargetState(_) => NodeKind::ColorTargetState,
            NodeState::MultisampleState(_) => NodeKind::MultisampleState,
            NodeState::DepthStencilState(_) => NodeKind::DepthStencilState,
            NodeState::ShaderModule(_) => NodeKind::ShaderModule,
            NodeState::BindGroupLayout(_) => NodeKind::BindGroupLayout,
            NodeState::VertexBufferLayout(_) => NodeKind::VertexBufferLayout,
            NodeState::Draw(_) => NodeKind::Draw,
            NodeState::BindBuffer(_) => NodeKind::BindBuffer,
            NodeState::VertexAttribute(_) => NodeKind::VertexAttribute,
            NodeState::VertexBuffer(_) => NodeKind::VertexBuffer,
            NodeState::BindGroup(_) => NodeKind::BindGroup,
            NodeState::UniformBuffer(_) => NodeKind::UniformBuffer,
        }
    }

    /// Build fresh state from authored props.
    pub(crate) fn from_props(props: Props) -> Self {
        match props {
            Props::Root => NodeState::Root(RootState {
                invalid: true,
                swap_chain_invalid: false,
            }),
            Props::Limits(p) => NodeState::Limits(p),
            Props::Feature(p) => NodeState::Feature(p),
            Props::SwapChain(p) => NodeState::SwapChain(SwapChainState { props: p }),
            Props::Command(p) => NodeState::Command(p),
            Props::RenderPass => NodeState::RenderPass(RenderPassState::default()),
            Props::ColorAttachment(p) => NodeState::ColorAttachment(p),
            Props::DepthStencilAttachment(p) => NodeState::DepthStencilAttachment(p),
            Props::RenderBundle => NodeState::RenderBundle(RenderBundleState::default()),
            Props::Texture(p) => NodeState::Texture(TextureState {
                props: p,
                ..Default::default()
            }),
            Props::RenderPipeline(p) => NodeState::RenderPipeline(RenderPipelineState {
                props: p,
                ..Default::default()
            }),
            Props::ColorTargetState(p) => NodeState::ColorTargetState(p),
            Props::MultisampleState(p) => NodeState::MultisampleState(p),
            Props::DepthStencilState(p) => NodeState::DepthStencilState(p),
            Props::ShaderModule(p) => NodeState::ShaderModule(ShaderModuleState {
                props: p,
                module: None,
            }),
            Props::BindGroupLayout => NodeState::BindGroupLayout(BindGroupLayoutState::default()),
            Props::VertexBufferLayout(p) => {
                NodeState::VertexBufferLayout(VertexBufferLayoutState {
                    props: p,
                    resolved: None,
                })
            }
            Props::Draw(p) => NodeState::Draw(DrawState {
                props: p,
                ..Default::default()
            }),
            Props::BindBuffer(p) => NodeState::BindBuffer(p),
            Props::VertexAttribute(p) => NodeState::VertexAttribute(p),
            Props::VertexBuffer(p) => NodeState::VertexBuffer(VertexBufferState {
                props: p,
                buffer: None,
            }),
            Props::BindGroup => NodeState::BindGroup(BindGroupState::default()),
            Props::UniformBuffer(p) => NodeState::UniformBuffer(UniformBufferState {
                props: p,
                buffer: None,
            }),
        }
    }

    /// Replace the authored props, preserving cached state. Fails with
    /// [`SceneError::KindMismatch`] when `props` carries a different kind.
    pub(crate) fn apply_props(&mut self, props: Props) -> Result<(), SceneError> {
        let expected = self.kind();
        let got = props.kind();
        if expected != got {
            return Err(SceneError::KindMismatch { expected, got });
        }
        match (self, props) {
            (NodeState::Root(_), Props::Root) => {}
            (NodeState::Limits(s), Props::Limits(p)) => *s = p,
            (NodeState::Feature(s), Props::Feature(p)) => *s = p,
            (NodeState::SwapChain(s), Props::SwapChain(p)) => s.props = p,
            (NodeState::Command(s), Props::Command(p)) => *s = p,
            (NodeState::RenderPass(_), Props::RenderPass) => {}
            (NodeState::ColorAttachment(s), Props::ColorAttachment(p)) => *s = p,
            (NodeState::DepthStencilAttachment(s), Props::DepthStencilAttachment(p)) => *s = p,
            (NodeState::RenderBundle(_), Props::RenderBundle) => {}
            (NodeState::Texture(s), Props::Texture(p)) => s.props = p,
            (NodeState::RenderPipeline(s), Props::RenderPipeline(p)) => s.props = p,
            (NodeState::ColorTargetState(s), Props::ColorTargetState(p)) => *s = p,
            (NodeState::MultisampleState(s), Props::MultisampleState(p)) => *s = p,
            (NodeState::DepthStencilState(s), Props::DepthStencilState(p)) => *s = p,
            (NodeState::ShaderModule(s), Props::ShaderModule(p)) => s.props = p,
            (NodeState::BindGroupLayout(_), Props::BindGroupLayout) => {}
            (NodeState::VertexBufferLayout(s), Props::VertexBufferLayout(p)) => s.props = p,
            (NodeState::Draw(s), Props::Draw(p)) => s.props = p,
            (NodeState::BindBuffer(s), Props::BindBuffer(p)) => *s = p,
            (NodeState::VertexAttribute(s), Props::VertexAttribute(p)) => *s = p,
            (NodeState::VertexBuffer(s), Props::VertexBuffer(p)) => s.props = p,
            (NodeState::BindGroup(_), Props::BindGroup) => {}
            (NodeState::UniformBuffer(s), Props::UniformBuffer(p)) => s.props = p,
            _ => unreachable!("kind equality checked above"),
        }
        Ok(())
    }
}

/// One entry in the scene tree: tagged state plus tree linkage.
#[derive(Debug)]
pub struct Node {
    pub(crate) state: NodeState,
    pub(crate) parent: Option<NodeId>,
    pub(crate) first_child: Option<NodeId>,
    pub(crate) last_child: Option<NodeId>,
    pub(crate) prev_sibling: Option<NodeId>,
    pub(crate) next_sibling: Option<NodeId>,
}

impl Node {
    pub(crate) fn new(state: NodeState) -> Self {
        Self {
            state,
            parent: None,
            first_child: None,
            last_child: None,
            prev_sibling: None,
            next_sibling: None,
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.state.kind()
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }
}
