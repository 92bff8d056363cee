//! Arena-backed scene tree.
//!
//! Nodes live in slab storage addressed by generational [`NodeId`] handles;
//! parent/child/sibling relations are index fields, so structural edits are
//! O(1) and the tree holds no reference cycles. Every structural or property
//! edit runs the kind-specific invalidation hook, clearing exactly the
//! cached handles that depend on the edited subtree.

use crate::alloc::{BufferPool, ShaderPool};
use crate::backend::traits::{
    BindGroupHandle, BindGroupLayoutHandle, PipelineLayoutHandle, RenderBundleHandle,
    RenderPipelineHandle, TextureHandle, TextureViewHandle,
};
use crate::error::{SceneError, SceneResult};
use crate::event::EventListeners;
use crate::node::{Node, NodeState, Props};
use crate::schema::{parent_is_legal, NodeKind};

/// Generational handle to a node in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Native handles whose owners were cleared or removed, awaiting
/// destruction at the next frame boundary.
#[derive(Debug, Default)]
pub struct RetiredHandles {
    pub textures: Vec<TextureHandle>,
    pub texture_views: Vec<TextureViewHandle>,
    pub bind_groups: Vec<BindGroupHandle>,
    pub bind_group_layouts: Vec<BindGroupLayoutHandle>,
    pub pipeline_layouts: Vec<PipelineLayoutHandle>,
    pub pipelines: Vec<RenderPipelineHandle>,
    pub bundles: Vec<RenderBundleHandle>,
}

impl RetiredHandles {
    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
            && self.texture_views.is_empty()
            && self.bind_groups.is_empty()
            && self.bind_group_layouts.is_empty()
            && self.pipeline_layouts.is_empty()
            && self.pipelines.is_empty()
            && self.bundles.is_empty()
    }
}

/// The mutable scene-graph description, plus the resource pools shared by
/// every buffer/shader-bearing node in it.
#[derive(Debug)]
pub struct SceneTree {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    root: NodeId,
    pub(crate) buffers: BufferPool,
    pub(crate) shaders: ShaderPool,
    pub(crate) resize: EventListeners<NodeId>,
    pub(crate) retired: RetiredHandles,
}

impl SceneTree {
    /// Creates a tree holding a single Root node.
    pub fn new() -> Self {
        let mut tree = Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            root: NodeId {
                index: 0,
                generation: 0,
            },
            buffers: BufferPool::new(),
            shaders: ShaderPool::new(),
            resize: EventListeners::new(),
            retired: RetiredHandles::default(),
        };
        tree.root = tree.create_node(Props::Root);
        tree
    }

    /// The Root node. Created once per tree, never removed.
    pub fn root(&self) -> NodeId {
        self.root
    }

    // -- Allocation --

    /// Creates a detached node from authored props.
    pub fn create_node(&mut self, props: Props) -> NodeId {
        let node = Node::new(NodeState::from_props(props));
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation += 1;
            slot.node = Some(node);
            NodeId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            NodeId {
                index,
                generation: 0,
            }
        }
    }

    /// Frees a detached, childless node's slot for reuse.
    ///
    /// # Panics
    ///
    /// Panics if the handle is stale, the node is still attached, or it
    /// still has children.
    pub fn destroy_node(&mut self, id: NodeId) {
        let node = self.node(id);
        assert!(node.parent.is_none(), "cannot destroy an attached node");
        assert!(
            node.first_child.is_none(),
            "cannot destroy a node with children"
        );
        let slot = &mut self.slots[id.index as usize];
        slot.generation += 1;
        slot.node = None;
        self.free_list.push(id.index);
    }

    /// Whether `id` refers to a live node.
    pub fn is_alive(&self, id: NodeId) -> bool {
        self.slots
            .get(id.index as usize)
            .map_or(false, |s| s.generation == id.generation && s.node.is_some())
    }

    // -- Accessors --

    pub fn node(&self, id: NodeId) -> &Node {
        let slot = self
            .slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation);
        match slot.and_then(|s| s.node.as_ref()) {
            Some(node) => node,
            None => panic!("stale NodeId: {id:?}"),
        }
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation);
        match slot.and_then(|s| s.node.as_mut()) {
            Some(node) => node,
            None => panic!("stale NodeId: {id:?}"),
        }
    }

    pub fn kind(&self, id: NodeId) -> NodeKind {
        self.node(id).kind()
    }

    pub fn state(&self, id: NodeId) -> &NodeState {
        &self.node(id).state
    }

    pub(crate) fn state_mut(&mut self, id: NodeId) -> &mut NodeState {
        &mut self.node_mut(id).state
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    pub fn first_child(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).first_child
    }

    pub fn last_child(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).last_child
    }

    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).next_sibling
    }

    pub fn prev_sibling(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).prev_sibling
    }

    /// Iterator over the direct children of `id`, in order.
    pub fn children(&self, id: NodeId) -> Children<'_> {
        Children {
            tree: self,
            next: self.node(id).first_child,
        }
    }

    /// The direct children of `id`, collected.
    pub fn child_ids(&self, id: NodeId) -> Vec<NodeId> {
        self.children(id).collect()
    }

    /// Direct children of `id` of the given kind.
    pub(crate) fn children_of_kind(&self, id: NodeId, kind: NodeKind) -> Vec<NodeId> {
        self.children(id).filter(|&c| self.kind(c) == kind).collect()
    }

    // -- Structural edits --

    /// Appends `child` as the last child of `parent`. A child already under
    /// `parent` is moved to the end; a child under a different parent is
    /// rejected with [`SceneError::AlreadyAttached`].
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> SceneResult<()> {
        self.check_edit(parent, child)?;
        if self.node(child).parent == Some(parent) {
            self.unlink(child);
        }
        self.link_last(parent, child);
        self.on_attached(parent, child)?;
        Ok(())
    }

    /// Inserts `child` before `before` in `parent`'s child list.
    ///
    /// # Panics
    ///
    /// Panics if `before` is not a child of `parent`.
    pub fn insert_before(
        &mut self,
        parent: NodeId,
        child: NodeId,
        before: NodeId,
    ) -> SceneResult<()> {
        self.check_edit(parent, child)?;
        assert_eq!(
            self.node(before).parent,
            Some(parent),
            "insert_before reference node is not a child of parent"
        );
        if self.node(child).parent == Some(parent) {
            if child == before {
                return Ok(());
            }
            self.unlink(child);
        }
        self.link_before(parent, child, before);
        self.on_attached(parent, child)?;
        Ok(())
    }

    /// Detaches `child` from `parent`, releasing the allocator references
    /// and cached handles held by the detached subtree.
    ///
    /// # Panics
    ///
    /// Panics if `child` is not a child of `parent`.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> SceneResult<()> {
        assert_eq!(
            self.node(child).parent,
            Some(parent),
            "remove_child: node is not a child of the given parent"
        );
        self.unlink(child);
        self.release_subtree(child)?;
        self.on_detached(parent, self.kind(child))?;
        Ok(())
    }

    /// Replaces a node's authored properties and triggers targeted
    /// invalidation.
    pub fn set_props(&mut self, id: NodeId, props: Props) -> SceneResult<()> {
        match self.kind(id) {
            NodeKind::Limits | NodeKind::Feature => {
                self.node_mut(id).state.apply_props(props)?;
                if self.parent(id) == Some(self.root) {
                    self.mark_root_invalid();
                }
            }
            NodeKind::SwapChain => {
                let changed = {
                    let old = match self.state(id) {
                        NodeState::SwapChain(s) => s.props.clone(),
                        _ => unreachable!(),
                    };
                    match &props {
                        Props::SwapChain(p) => *p != old,
                        _ => true,
                    }
                };
                self.node_mut(id).state.apply_props(props)?;
                if changed {
                    self.mark_swap_chain_invalid();
                }
            }
            NodeKind::Texture => {
                self.node_mut(id).state.apply_props(props)?;
                self.clear_texture(id);
            }
            NodeKind::ShaderModule => {
                let released = match self.state(id) {
                    NodeState::ShaderModule(s) => {
                        s.module.is_some().then(|| s.props.source.clone())
                    }
                    _ => unreachable!(),
                };
                self.node_mut(id).state.apply_props(props)?;
                if let Some(old_source) = released {
                    self.shaders.free(&old_source)?;
                    if let NodeState::ShaderModule(s) = self.state_mut(id) {
                        s.module = None;
                    }
                }
                self.invalidate_owning_pipeline(id);
            }
            NodeKind::ColorTargetState
            | NodeKind::MultisampleState
            | NodeKind::DepthStencilState
            | NodeKind::RenderPipeline => {
                self.node_mut(id).state.apply_props(props)?;
                self.invalidate_owning_pipeline(id);
            }
            NodeKind::VertexBufferLayout => {
                self.node_mut(id).state.apply_props(props)?;
                if let NodeState::VertexBufferLayout(s) = self.state_mut(id) {
                    s.resolved = None;
                }
                self.invalidate_owning_pipeline(id);
            }
            NodeKind::VertexAttribute => {
                self.node_mut(id).state.apply_props(props)?;
                if let Some(layout) = self.parent(id) {
                    if let NodeState::VertexBufferLayout(s) = self.state_mut(layout) {
                        s.resolved = None;
                    }
                    self.invalidate_owning_pipeline(layout);
                }
            }
            NodeKind::BindBuffer => {
                self.node_mut(id).state.apply_props(props)?;
                if let Some(layout) = self.parent(id) {
                    self.clear_bind_group_layout(layout);
                    self.invalidate_owning_pipeline(layout);
                }
            }
            NodeKind::VertexBuffer => {
                let released = match self.state(id) {
                    NodeState::VertexBuffer(s) => {
                        s.buffer.is_some().then(|| s.props.data.clone())
                    }
                    _ => unreachable!(),
                };
                self.node_mut(id).state.apply_props(props)?;
                if let Some(old_data) = released {
                    self.buffers.free(&old_data)?;
                    if let NodeState::VertexBuffer(s) = self.state_mut(id) {
                        s.buffer = None;
                    }
                }
                if let Some(draw) = self.parent(id) {
                    self.mark_draw_dirty(draw);
                }
            }
            NodeKind::UniformBuffer => {
                let released = match self.state(id) {
                    NodeState::UniformBuffer(s) => {
                        s.buffer.is_some().then(|| s.props.data.clone())
                    }
                    _ => unreachable!(),
                };
                self.node_mut(id).state.apply_props(props)?;
                if let Some(old_data) = released {
                    self.buffers.free(&old_data)?;
                    if let NodeState::UniformBuffer(s) = self.state_mut(id) {
                        s.buffer = None;
                    }
                }
                if let Some(group) = self.parent(id) {
                    self.clear_bind_group(group);
                    if let Some(draw) = self.parent(group) {
                        self.mark_draw_dirty(draw);
                    }
                }
            }
            // Draw-call arguments are read at record time; load/store ops and
            // encoder labels are read at encode time. No compiled state
            // depends on them.
            NodeKind::Root
            | NodeKind::Command
            | NodeKind::RenderPass
            | NodeKind::ColorAttachment
            | NodeKind::DepthStencilAttachment
            | NodeKind::RenderBundle
            | NodeKind::BindGroupLayout
            | NodeKind::BindGroup
            | NodeKind::Draw => {
                self.node_mut(id).state.apply_props(props)?;
            }
        }
        Ok(())
    }

    // -- Root flags --

    pub fn root_invalid(&self) -> bool {
        match self.state(self.root) {
            NodeState::Root(s) => s.invalid,
            _ => unreachable!("root node is always Root"),
        }
    }

    pub(crate) fn mark_root_invalid(&mut self) {
        log::debug!("root marked invalid; device will be re-acquired");
        if let NodeState::Root(s) = self.state_mut(self.root) {
            s.invalid = true;
        }
    }

    pub(crate) fn clear_root_invalid(&mut self) {
        if let NodeState::Root(s) = self.state_mut(self.root) {
            s.invalid = false;
        }
    }

    pub fn swap_chain_invalid(&self) -> bool {
        match self.state(self.root) {
            NodeState::Root(s) => s.swap_chain_invalid,
            _ => unreachable!("root node is always Root"),
        }
    }

    pub(crate) fn mark_swap_chain_invalid(&mut self) {
        if let NodeState::Root(s) = self.state_mut(self.root) {
            s.swap_chain_invalid = true;
        }
    }

    pub(crate) fn clear_swap_chain_invalid(&mut self) {
        if let NodeState::Root(s) = self.state_mut(self.root) {
            s.swap_chain_invalid = false;
        }
    }

    // -- Cache clearing --

    /// Clears a texture's cached view and handle. Full-screen textures are
    /// re-subscribed to the resize event when next resolved.
    pub(crate) fn clear_texture(&mut self, id: NodeId) {
        self.resize.unsubscribe(id);
        let (texture, view) = match self.state_mut(id) {
            NodeState::Texture(s) => (s.texture.take(), s.view.take()),
            _ => (None, None),
        };
        if let Some(handle) = texture {
            self.retired.textures.push(handle);
        }
        if let Some(handle) = view {
            self.retired.texture_views.push(handle);
        }
    }

    /// Clears a pipeline's compiled handle, layout, and cached draw list,
    /// marks its draws dirty, and clears the owning bundle.
    pub(crate) fn clear_pipeline(&mut self, id: NodeId) {
        let (pipeline, layout) = match self.state_mut(id) {
            NodeState::RenderPipeline(s) => {
                s.bind_group_layouts.clear();
                s.draw_calls.clear();
                s.draws_valid = false;
                (s.pipeline.take(), s.pipeline_layout.take())
            }
            _ => return,
        };
        if let Some(handle) = pipeline {
            self.retired.pipelines.push(handle);
        }
        if let Some(handle) = layout {
            self.retired.pipeline_layouts.push(handle);
        }
        for draw in self.children_of_kind(id, NodeKind::Draw) {
            self.mark_draw_dirty(draw);
        }
        if let Some(bundle) = self.parent(id) {
            self.clear_bundle(bundle);
        }
    }

    pub(crate) fn clear_bundle(&mut self, id: NodeId) {
        let handle = match self.state_mut(id) {
            NodeState::RenderBundle(s) => s.bundle.take(),
            _ => None,
        };
        if let Some(handle) = handle {
            self.retired.bundles.push(handle);
        }
    }

    pub(crate) fn clear_bind_group_layout(&mut self, id: NodeId) {
        let handle = match self.state_mut(id) {
            NodeState::BindGroupLayout(s) => s.layout.take(),
            _ => None,
        };
        if let Some(handle) = handle {
            self.retired.bind_group_layouts.push(handle);
        }
    }

    pub(crate) fn clear_bind_group(&mut self, id: NodeId) {
        let handle = match self.state_mut(id) {
            NodeState::BindGroup(s) => s.bind_group.take(),
            _ => None,
        };
        if let Some(handle) = handle {
            self.retired.bind_groups.push(handle);
        }
    }

    pub(crate) fn mark_draw_dirty(&mut self, id: NodeId) {
        if let NodeState::Draw(s) = self.state_mut(id) {
            s.dirty = true;
        }
    }

    /// Clears the pipeline that owns `id` (which is the node itself or a
    /// direct child of the pipeline).
    fn invalidate_owning_pipeline(&mut self, id: NodeId) {
        if self.kind(id) == NodeKind::RenderPipeline {
            self.clear_pipeline(id);
        } else if let Some(parent) = self.parent(id) {
            if self.kind(parent) == NodeKind::RenderPipeline {
                self.clear_pipeline(parent);
            }
        }
    }

    // -- Internal helpers --

    fn check_edit(&self, parent: NodeId, child: NodeId) -> SceneResult<()> {
        let child_kind = self.kind(child);
        let parent_kind = self.kind(parent);
        if !parent_is_legal(child_kind, parent_kind) {
            return Err(SceneError::IllegalParent {
                child: child_kind,
                parent: parent_kind,
            });
        }
        match self.node(child).parent {
            Some(existing) if existing != parent => Err(SceneError::AlreadyAttached),
            _ => Ok(()),
        }
    }

    fn link_last(&mut self, parent: NodeId, child: NodeId) {
        let old_last = self.node(parent).last_child;
        {
            let node = self.node_mut(child);
            node.parent = Some(parent);
            node.prev_sibling = old_last;
            node.next_sibling = None;
        }
        if let Some(last) = old_last {
            self.node_mut(last).next_sibling = Some(child);
        } else {
            self.node_mut(parent).first_child = Some(child);
        }
        self.node_mut(parent).last_child = Some(child);
    }

    fn link_before(&mut self, parent: NodeId, child: NodeId, before: NodeId) {
        let prev = self.node(before).prev_sibling;
        {
            let node = self.node_mut(child);
            node.parent = Some(parent);
            node.prev_sibling = prev;
            node.next_sibling = Some(before);
        }
        self.node_mut(before).prev_sibling = Some(child);
        if let Some(prev) = prev {
            self.node_mut(prev).next_sibling = Some(child);
        } else {
            self.node_mut(parent).first_child = Some(child);
        }
    }

    /// Removes `id` from its parent's child list and clears its own
    /// pointers. Touches exactly one list.
    fn unlink(&mut self, id: NodeId) {
        let (parent, prev, next) = {
            let node = self.node(id);
            (node.parent, node.prev_sibling, node.next_sibling)
        };
        let Some(parent) = parent else { return };

        match prev {
            Some(prev) => self.node_mut(prev).next_sibling = next,
            None => self.node_mut(parent).first_child = next,
        }
        match next {
            Some(next) => self.node_mut(next).prev_sibling = prev,
            None => self.node_mut(parent).last_child = prev,
        }
        let node = self.node_mut(id);
        node.parent = None;
        node.prev_sibling = None;
        node.next_sibling = None;
    }

    /// Releases pool references and cached handles across a detached
    /// subtree. The nodes stay alive and may be re-attached; their caches
    /// rebuild on the next resolve.
    fn release_subtree(&mut self, id: NodeId) -> SceneResult<()> {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            stack.extend(self.children(current));
            match self.kind(current) {
                NodeKind::Texture => self.clear_texture(current),
                NodeKind::ShaderModule => {
                    let released = match self.state(current) {
                        NodeState::ShaderModule(s) => {
                            s.module.is_some().then(|| s.props.source.clone())
                        }
                        _ => unreachable!(),
                    };
                    if let Some(source) = released {
                        self.shaders.free(&source)?;
                        if let NodeState::ShaderModule(s) = self.state_mut(current) {
                            s.module = None;
                        }
                    }
                }
                NodeKind::VertexBuffer => {
                    let released = match self.state(current) {
                        NodeState::VertexBuffer(s) => {
                            s.buffer.is_some().then(|| s.props.data.clone())
                        }
                        _ => unreachable!(),
                    };
                    if let Some(data) = released {
                        self.buffers.free(&data)?;
                        if let NodeState::VertexBuffer(s) = self.state_mut(current) {
                            s.buffer = None;
                        }
                    }
                }
                NodeKind::UniformBuffer => {
                    let released = match self.state(current) {
                        NodeState::UniformBuffer(s) => {
                            s.buffer.is_some().then(|| s.props.data.clone())
                        }
                        _ => unreachable!(),
                    };
                    if let Some(data) = released {
                        self.buffers.free(&data)?;
                        if let NodeState::UniformBuffer(s) = self.state_mut(current) {
                            s.buffer = None;
                        }
                    }
                }
                NodeKind::RenderPipeline => self.clear_pipeline(current),
                NodeKind::RenderBundle => self.clear_bundle(current),
                NodeKind::BindGroupLayout => self.clear_bind_group_layout(current),
                NodeKind::BindGroup => self.clear_bind_group(current),
                _ => {}
            }
        }
        Ok(())
    }

    /// Kind-specific invalidation after an attach (append or insert).
    fn on_attached(&mut self, parent: NodeId, child: NodeId) -> SceneResult<()> {
        let parent_kind = self.kind(parent);
        let child_kind = self.kind(child);
        match (parent_kind, child_kind) {
            (NodeKind::Root, NodeKind::Limits | NodeKind::Feature) => {
                self.mark_root_invalid();
            }
            (NodeKind::Root, NodeKind::SwapChain) => {
                self.mark_swap_chain_invalid();
            }
            (
                NodeKind::ColorAttachment | NodeKind::DepthStencilAttachment,
                NodeKind::Texture,
            ) => {
                self.clear_texture(child);
            }
            (NodeKind::RenderBundle, NodeKind::RenderPipeline) => {
                self.clear_bundle(parent);
            }
            (
                NodeKind::RenderPipeline,
                NodeKind::ShaderModule
                | NodeKind::VertexBufferLayout
                | NodeKind::ColorTargetState
                | NodeKind::MultisampleState
                | NodeKind::DepthStencilState
                | NodeKind::BindGroupLayout,
            ) => {
                self.clear_pipeline(parent);
            }
            (NodeKind::RenderPipeline, NodeKind::Draw) => {
                // The compiled handle stays valid; only the cached draw list
                // and the owning bundle are stale.
                self.mark_draw_dirty(child);
                if let NodeState::RenderPipeline(s) = self.state_mut(parent) {
                    s.draw_calls.clear();
                    s.draws_valid = false;
                }
                if let Some(bundle) = self.parent(parent) {
                    self.clear_bundle(bundle);
                }
            }
            (NodeKind::BindGroupLayout, NodeKind::BindBuffer) => {
                self.clear_bind_group_layout(parent);
                self.invalidate_owning_pipeline(parent);
            }
            (NodeKind::VertexBufferLayout, NodeKind::VertexAttribute) => {
                if let NodeState::VertexBufferLayout(s) = self.state_mut(parent) {
                    s.resolved = None;
                }
                self.invalidate_owning_pipeline(parent);
            }
            (NodeKind::Draw, NodeKind::VertexBuffer | NodeKind::BindGroup) => {
                self.mark_draw_dirty(parent);
            }
            (NodeKind::BindGroup, NodeKind::UniformBuffer) => {
                self.clear_bind_group(parent);
                if let Some(draw) = self.parent(parent) {
                    self.mark_draw_dirty(draw);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Kind-specific invalidation after a detach. The detached child's own
    /// caches were already released by `release_subtree`.
    fn on_detached(&mut self, parent: NodeId, child_kind: NodeKind) -> SceneResult<()> {
        match (self.kind(parent), child_kind) {
            (NodeKind::Root, NodeKind::Limits | NodeKind::Feature) => {
                self.mark_root_invalid();
            }
            (NodeKind::Root, NodeKind::SwapChain) => {
                self.mark_swap_chain_invalid();
            }
            (NodeKind::RenderBundle, NodeKind::RenderPipeline) => {
                self.clear_bundle(parent);
            }
            (
                NodeKind::RenderPipeline,
                NodeKind::ShaderModule
                | NodeKind::VertexBufferLayout
                | NodeKind::ColorTargetState
                | NodeKind::MultisampleState
                | NodeKind::DepthStencilState
                | NodeKind::BindGroupLayout,
            ) => {
                self.clear_pipeline(parent);
            }
            (NodeKind::RenderPipeline, NodeKind::Draw) => {
                if let NodeState::RenderPipeline(s) = self.state_mut(parent) {
                    s.draw_calls.clear();
                    s.draws_valid = false;
                }
                if let Some(bundle) = self.parent(parent) {
                    self.clear_bundle(bundle);
                }
            }
            (NodeKind::BindGroupLayout, NodeKind::BindBuffer) => {
                self.clear_bind_group_layout(parent);
                self.invalidate_owning_pipeline(parent);
            }
            (NodeKind::VertexBufferLayout, NodeKind::VertexAttribute) => {
                if let NodeState::VertexBufferLayout(s) = self.state_mut(parent) {
                    s.resolved = None;
                }
                self.invalidate_owning_pipeline(parent);
            }
            (NodeKind::Draw, NodeKind::VertexBuffer | NodeKind::BindGroup) => {
                self.mark_draw_dirty(parent);
            }
            (NodeKind::BindGroup, NodeKind::UniformBuffer) => {
                self.clear_bind_group(parent);
                if let Some(draw) = self.parent(parent) {
                    self.mark_draw_dirty(draw);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl Default for SceneTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over a node's direct children.
pub struct Children<'a> {
    tree: &'a SceneTree,
    next: Option<NodeId>,
}

impl Iterator for Children<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let current = self.next?;
        self.next = self.tree.node(current).next_sibling;
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::BufferData;
    use crate::backend::traits::{BufferHandle, RenderPipelineHandle};
    use crate::backend::types::BufferUsage;
    use crate::node::{
        DrawProps, Props, ShaderModuleProps, TextureProps, VertexBufferProps,
    };
    use std::sync::Arc;

    fn assert_list_consistent(tree: &SceneTree, parent: NodeId) {
        let forward: Vec<_> = tree.children(parent).collect();
        if let Some(&first) = forward.first() {
            assert_eq!(tree.prev_sibling(first), None);
        }
        if let Some(&last) = forward.last() {
            assert_eq!(tree.next_sibling(last), None);
            assert_eq!(tree.last_child(parent), Some(last));
        }
        // Walk backwards from last via prev and compare.
        let mut backward = Vec::new();
        let mut cursor = tree.last_child(parent);
        while let Some(id) = cursor {
            backward.push(id);
            cursor = tree.prev_sibling(id);
        }
        backward.reverse();
        assert_eq!(forward, backward);
        for &child in &forward {
            assert_eq!(tree.parent(child), Some(parent));
        }
    }

    #[test]
    fn test_append_and_iterate_in_order() {
        let mut tree = SceneTree::new();
        let root = tree.root();
        let a = tree.create_node(Props::Command(Default::default()));
        let b = tree.create_node(Props::Command(Default::default()));
        let c = tree.create_node(Props::Command(Default::default()));
        tree.append_child(root, a).unwrap();
        tree.append_child(root, b).unwrap();
        tree.append_child(root, c).unwrap();

        assert_eq!(tree.child_ids(root), vec![a, b, c]);
        assert_list_consistent(&tree, root);
    }

    #[test]
    fn test_insert_before_first_and_middle() {
        let mut tree = SceneTree::new();
        let root = tree.root();
        let a = tree.create_node(Props::Command(Default::default()));
        let b = tree.create_node(Props::Command(Default::default()));
        let c = tree.create_node(Props::Command(Default::default()));
        tree.append_child(root, c).unwrap();
        tree.insert_before(root, a, c).unwrap();
        tree.insert_before(root, b, c).unwrap();

        assert_eq!(tree.child_ids(root), vec![a, b, c]);
        assert_list_consistent(&tree, root);
    }

    #[test]
    fn test_remove_middle_child() {
        let mut tree = SceneTree::new();
        let root = tree.root();
        let a = tree.create_node(Props::Command(Default::default()));
        let b = tree.create_node(Props::Command(Default::default()));
        let c = tree.create_node(Props::Command(Default::default()));
        tree.append_child(root, a).unwrap();
        tree.append_child(root, b).unwrap();
        tree.append_child(root, c).unwrap();

        tree.remove_child(root, b).unwrap();
        assert_eq!(tree.child_ids(root), vec![a, c]);
        assert_eq!(tree.parent(b), None);
        assert_eq!(tree.prev_sibling(b), None);
        assert_eq!(tree.next_sibling(b), None);
        assert_list_consistent(&tree, root);
    }

    #[test]
    fn test_illegal_parent_rejected_and_pointers_unchanged() {
        let mut tree = SceneTree::new();
        let root = tree.root();
        let draw = tree.create_node(Props::Draw(DrawProps::default()));

        let err = tree.append_child(root, draw).unwrap_err();
        assert_eq!(
            err,
            SceneError::IllegalParent {
                child: NodeKind::Draw,
                parent: NodeKind::Root,
            }
        );
        assert_eq!(tree.parent(draw), None);
        assert_eq!(tree.first_child(root), None);
    }

    #[test]
    fn test_exhaustive_illegal_pairs_rejected() {
        for child_kind in NodeKind::ALL {
            if child_kind == NodeKind::Root {
                continue;
            }
            for parent_kind in NodeKind::ALL {
                if crate::schema::parent_is_legal(child_kind, parent_kind) {
                    continue;
                }
                let mut tree = SceneTree::new();
                let parent = if parent_kind == NodeKind::Root {
                    tree.root()
                } else {
                    tree.create_node(crate::schema::default_props(parent_kind))
                };
                let child = tree.create_node(crate::schema::default_props(child_kind));
                let err = tree.append_child(parent, child).unwrap_err();
                assert_eq!(
                    err,
                    SceneError::IllegalParent {
                        child: child_kind,
                        parent: parent_kind,
                    }
                );
                assert_eq!(tree.parent(child), None);
                assert_eq!(tree.first_child(parent), None);
            }
        }
    }

    #[test]
    fn test_reparenting_rejected() {
        let mut tree = SceneTree::new();
        let root = tree.root();
        let cmd_a = tree.create_node(Props::Command(Default::default()));
        let cmd_b = tree.create_node(Props::Command(Default::default()));
        tree.append_child(root, cmd_a).unwrap();
        tree.append_child(root, cmd_b).unwrap();
        let pass = tree.create_node(Props::RenderPass);
        tree.append_child(cmd_a, pass).unwrap();

        let err = tree.append_child(cmd_b, pass).unwrap_err();
        assert_eq!(err, SceneError::AlreadyAttached);
        assert_eq!(tree.parent(pass), Some(cmd_a));
    }

    #[test]
    fn test_reorder_within_same_parent_allowed() {
        let mut tree = SceneTree::new();
        let root = tree.root();
        let a = tree.create_node(Props::Command(Default::default()));
        let b = tree.create_node(Props::Command(Default::default()));
        tree.append_child(root, a).unwrap();
        tree.append_child(root, b).unwrap();

        // Move `a` to the end.
        tree.append_child(root, a).unwrap();
        assert_eq!(tree.child_ids(root), vec![b, a]);

        // And back to the front.
        tree.insert_before(root, a, b).unwrap();
        assert_eq!(tree.child_ids(root), vec![a, b]);
        assert_list_consistent(&tree, root);
    }

    #[test]
    fn test_generation_prevents_stale_access() {
        let mut tree = SceneTree::new();
        let id = tree.create_node(Props::Command(Default::default()));
        tree.destroy_node(id);
        assert!(!tree.is_alive(id));
        let reused = tree.create_node(Props::Command(Default::default()));
        assert!(tree.is_alive(reused));
        assert!(!tree.is_alive(id));
    }

    #[test]
    #[should_panic(expected = "stale NodeId")]
    fn test_stale_handle_panics() {
        let mut tree = SceneTree::new();
        let id = tree.create_node(Props::Command(Default::default()));
        tree.destroy_node(id);
        let _ = tree.kind(id);
    }

    #[test]
    fn test_limits_edit_marks_root_invalid() {
        let mut tree = SceneTree::new();
        let root = tree.root();
        tree.clear_root_invalid();

        let limits = tree.create_node(Props::Limits(Default::default()));
        tree.append_child(root, limits).unwrap();
        assert!(tree.root_invalid());

        tree.clear_root_invalid();
        tree.set_props(limits, Props::Limits(Default::default())).unwrap();
        assert!(tree.root_invalid());
    }

    #[test]
    fn test_shader_edit_clears_pipeline_and_dirties_draws() {
        let mut tree = SceneTree::new();
        let pipeline = tree.create_node(Props::RenderPipeline(Default::default()));
        let shader = tree.create_node(Props::ShaderModule(ShaderModuleProps {
            source: Arc::from("@vertex fn vs() {}"),
            vertex_entry_point: Some("vs".into()),
            fragment_entry_point: None,
        }));
        let draw = tree.create_node(Props::Draw(DrawProps::default()));
        tree.append_child(pipeline, shader).unwrap();
        tree.append_child(pipeline, draw).unwrap();

        // Pretend the pipeline was compiled and the draw resolved.
        if let NodeState::RenderPipeline(s) = tree.state_mut(pipeline) {
            s.pipeline = Some(RenderPipelineHandle(7));
        }
        if let NodeState::Draw(s) = tree.state_mut(draw) {
            s.dirty = false;
        }

        tree.set_props(
            shader,
            Props::ShaderModule(ShaderModuleProps {
                source: Arc::from("@vertex fn vs() { let x = 1.0; }"),
                vertex_entry_point: Some("vs".into()),
                fragment_entry_point: None,
            }),
        )
        .unwrap();

        match tree.state(pipeline) {
            NodeState::RenderPipeline(s) => assert!(s.pipeline.is_none()),
            _ => unreachable!(),
        }
        match tree.state(draw) {
            NodeState::Draw(s) => assert!(s.dirty),
            _ => unreachable!(),
        }
        assert_eq!(tree.retired.pipelines, vec![RenderPipelineHandle(7)]);
    }

    #[test]
    fn test_removal_releases_buffer_reference() {
        let mut tree = SceneTree::new();
        let draw = tree.create_node(Props::Draw(DrawProps::default()));
        let data = BufferData::new(vec![0u8; 12]);
        let vb = tree.create_node(Props::VertexBuffer(VertexBufferProps {
            data: data.clone(),
            slot: None,
        }));
        tree.append_child(draw, vb).unwrap();

        // Simulate the compiler having allocated the buffer.
        let handle = tree
            .buffers
            .alloc(BufferUsage::VERTEX, &data, |_| Ok(BufferHandle(3)))
            .unwrap();
        if let NodeState::VertexBuffer(s) = tree.state_mut(vb) {
            s.buffer = Some(handle);
        }
        assert_eq!(tree.buffers.ref_count(&data), 1);

        tree.remove_child(draw, vb).unwrap();
        assert_eq!(tree.buffers.ref_count(&data), 0);
        assert_eq!(tree.buffers.take_retired(), vec![BufferHandle(3)]);
    }

    #[test]
    fn test_texture_props_edit_clears_cache() {
        let mut tree = SceneTree::new();
        let texture = tree.create_node(Props::Texture(TextureProps {
            full_screen: true,
            ..Default::default()
        }));
        if let NodeState::Texture(s) = tree.state_mut(texture) {
            s.texture = Some(crate::backend::traits::TextureHandle(1));
            s.view = Some(crate::backend::traits::TextureViewHandle(2));
        }
        tree.resize.subscribe(texture);

        tree.set_props(
            texture,
            Props::Texture(TextureProps {
                full_screen: true,
                ..Default::default()
            }),
        )
        .unwrap();

        match tree.state(texture) {
            NodeState::Texture(s) => {
                assert!(s.texture.is_none());
                assert!(s.view.is_none());
            }
            _ => unreachable!(),
        }
        assert!(tree.resize.is_empty());
        assert!(!tree.retired.is_empty());
    }

    #[test]
    fn test_kind_mismatch_on_set_props() {
        let mut tree = SceneTree::new();
        let cmd = tree.create_node(Props::Command(Default::default()));
        let err = tree.set_props(cmd, Props::RenderPass).unwrap_err();
        assert_eq!(
            err,
            SceneError::KindMismatch {
                expected: NodeKind::Command,
                got: NodeKind::RenderPass,
            }
        );
    }
}
