//! Root/device controller and per-frame orchestration.
//!
//! The [`Engine`] owns the scene tree, the resource pools, and one backend.
//! Once per animation tick the host calls [`Engine::encode_and_submit`]:
//! while the device is being acquired the frame is silently dropped (no
//! frame work accumulates); once ready, the engine lazily re-validates only
//! the parts of the tree marked dirty, encodes the render passes executing
//! their (possibly cached) render bundles, and submits one command buffer
//! per Command node as a single batch.

use crate::backend::traits::{
    AcquireStatus, ColorAttachmentDesc, DepthStencilAttachmentDesc, DeviceOptions, GpuBackend,
    RenderPassDescriptor,
};
use crate::compiler::bundle::resolve_render_bundle;
use crate::compiler::texture::{
    resolve_default_depth, resolve_swap_chain, resolve_texture, DefaultDepthSlot, ResolvedAttachment,
    SwapChainSlot,
};
use crate::error::SceneResult;
use crate::hash::{self, FormatHash};
use crate::node::NodeState;
use crate::schema::NodeKind;
use crate::tree::{NodeId, SceneTree};

/// Device acquisition lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceLifecycle {
    Uninitialized,
    Acquiring,
    Ready,
}

/// The main engine: one per drawable surface.
pub struct Engine<B: GpuBackend> {
    backend: B,
    tree: SceneTree,
    options: DeviceOptions,
    device: DeviceLifecycle,
    canvas_size: (u32, u32),
    swap_chain: SwapChainSlot,
    default_depth: DefaultDepthSlot,
}

impl<B: GpuBackend> Engine<B> {
    /// Create an engine bound to a backend and an initial canvas size in
    /// pixels. The device is acquired lazily on the first frame.
    pub fn new(backend: B, width: u32, height: u32) -> Self {
        Self {
            backend,
            tree: SceneTree::new(),
            options: DeviceOptions::default(),
            device: DeviceLifecycle::Uninitialized,
            canvas_size: (width.max(1), height.max(1)),
            swap_chain: SwapChainSlot::default(),
            default_depth: DefaultDepthSlot::default(),
        }
    }

    pub fn tree(&self) -> &SceneTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut SceneTree {
        &mut self.tree
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn device_state(&self) -> DeviceLifecycle {
        self.device
    }

    pub fn canvas_size(&self) -> (u32, u32) {
        self.canvas_size
    }

    /// Update acquisition parameters. Changing the power preference
    /// invalidates the device and forces re-acquisition on the next frame.
    pub fn set_device_options(&mut self, options: DeviceOptions) {
        if options.power_preference != self.options.power_preference {
            self.tree.mark_root_invalid();
        }
        self.options = options;
    }

    /// Notify the engine that the drawable surface changed size. Fires the
    /// resize event: all full-screen textures (and the default depth
    /// attachment) are invalidated and rebuilt at their next resolve; the
    /// surface is reconfigured on the next frame.
    pub fn canvas_resized(&mut self, width: u32, height: u32) {
        self.canvas_size = (width.max(1), height.max(1));
        self.swap_chain.configured = false;
        self.tree.mark_swap_chain_invalid();

        if let Some(view) = self.default_depth.view.take() {
            self.backend.destroy_texture_view(view);
        }
        if let Some(texture) = self.default_depth.texture.take() {
            self.backend.destroy_texture(texture);
        }

        for texture in self.tree.resize.emit() {
            self.tree.clear_texture(texture);
        }
        if self.options.verbose {
            log::debug!("canvas resized to {}x{}", width, height);
        }
    }

    /// Perform one frame: acquire the device if needed (single-flight,
    /// dropping the frame while pending), otherwise re-validate dirty state
    /// and encode/submit every Command subtree as one batch.
    pub fn encode_and_submit(&mut self) -> SceneResult<()> {
        if self.tree.root_invalid() {
            if self.device != DeviceLifecycle::Acquiring {
                let request = self.collect_device_request();
                self.backend.begin_acquire(&request);
                self.device = DeviceLifecycle::Acquiring;
                if self.options.verbose {
                    log::debug!("device acquisition started");
                }
            }
            match self.backend.poll_acquire() {
                AcquireStatus::Idle | AcquireStatus::Pending => return Ok(()),
                AcquireStatus::Failed(error) => {
                    log::error!("device acquisition failed: {error}");
                    self.device = DeviceLifecycle::Uninitialized;
                    return Ok(());
                }
                AcquireStatus::Ready(details) => {
                    if self.options.verbose {
                        log::debug!(
                            "device ready on {} (preferred format {:?})",
                            details.name,
                            details.preferred_format
                        );
                    }
                    self.device = DeviceLifecycle::Ready;
                    self.tree.clear_root_invalid();
                    // A fresh device means a fresh surface configuration.
                    self.swap_chain.configured = false;
                }
            }
        }
        if self.device != DeviceLifecycle::Ready {
            return Ok(());
        }

        self.destroy_retired();
        self.render_frame()
    }

    /// Merge engine-level options with the Limits/Feature nodes under Root.
    fn collect_device_request(&self) -> DeviceOptions {
        let mut request = self.options.clone();
        let root = self.tree.root();
        for node in self.tree.children_of_kind(root, NodeKind::Limits) {
            if let NodeState::Limits(p) = self.tree.state(node) {
                let limits = &mut request.limits;
                limits.max_texture_dimension_2d = p
                    .limits
                    .max_texture_dimension_2d
                    .or(limits.max_texture_dimension_2d);
                limits.max_bind_groups = p.limits.max_bind_groups.or(limits.max_bind_groups);
                limits.max_buffer_size = p.limits.max_buffer_size.or(limits.max_buffer_size);
            }
        }
        for node in self.tree.children_of_kind(root, NodeKind::Feature) {
            if let NodeState::Feature(p) = self.tree.state(node) {
                if !p.name.is_empty() && !request.features.contains(&p.name) {
                    request.features.push(p.name.clone());
                }
            }
        }
        request
    }

    /// Destroy native handles retired by tree edits since the last frame.
    fn destroy_retired(&mut self) {
        for handle in self.tree.buffers.take_retired() {
            self.backend.destroy_buffer(handle);
        }
        for handle in self.tree.shaders.take_retired() {
            self.backend.destroy_shader_module(handle);
        }
        let retired = std::mem::take(&mut self.tree.retired);
        for handle in retired.texture_views {
            self.backend.destroy_texture_view(handle);
        }
        for handle in retired.textures {
            self.backend.destroy_texture(handle);
        }
        for handle in retired.bind_groups {
            self.backend.destroy_bind_group(handle);
        }
        for handle in retired.bind_group_layouts {
            self.backend.destroy_bind_group_layout(handle);
        }
        for handle in retired.pipelines {
            self.backend.destroy_render_pipeline(handle);
        }
        for handle in retired.pipeline_layouts {
            self.backend.destroy_pipeline_layout(handle);
        }
        for handle in retired.bundles {
            self.backend.destroy_render_bundle(handle);
        }
    }

    fn render_frame(&mut self) -> SceneResult<()> {
        let swap = resolve_swap_chain(
            &mut self.tree,
            &mut self.backend,
            &mut self.swap_chain,
            self.canvas_size,
        )?;

        let root = self.tree.root();
        let mut command_buffers = Vec::new();
        for command in self.tree.children_of_kind(root, NodeKind::Command) {
            let label = match self.tree.state(command) {
                NodeState::Command(p) => p.label.clone(),
                _ => None,
            };
            self.backend.begin_command_encoder(label.as_deref());
            for pass in self.tree.children_of_kind(command, NodeKind::RenderPass) {
                self.encode_pass(pass, &swap)?;
            }
            command_buffers.push(self.backend.finish_command_encoder()?);
        }

        self.backend.submit(command_buffers)?;
        self.backend.present_frame()?;
        Ok(())
    }

    /// Resolve a pass's attachments (defaulting to the swap chain and the
    /// default depth texture), compute its combined format hash, and encode
    /// it by replaying its resolved render bundles.
    fn encode_pass(&mut self, pass: NodeId, swap: &ResolvedAttachment) -> SceneResult<()> {
        let mut color_descs = Vec::new();
        let mut color_formats = Vec::new();
        let mut combined = FormatHash::ZERO;

        for attachment in self
            .tree
            .children_of_kind(pass, NodeKind::ColorAttachment)
        {
            let props = match self.tree.state(attachment) {
                NodeState::ColorAttachment(p) => p.clone(),
                _ => continue,
            };
            let resolved = match self.first_texture_child(attachment) {
                Some(texture) => resolve_texture(
                    &mut self.tree,
                    &mut self.backend,
                    texture,
                    self.canvas_size,
                )?,
                // No Texture child: render to the swap chain.
                None => *swap,
            };
            color_formats.push(resolved.format);
            combined = hash::combine(combined, resolved.format_hash);
            color_descs.push(ColorAttachmentDesc {
                view: resolved.view,
                load_op: props.load_op,
                store_op: props.store_op,
            });
        }

        let mut depth_desc = None;
        let mut depth_format = None;
        if let Some(attachment) = self
            .tree
            .children_of_kind(pass, NodeKind::DepthStencilAttachment)
            .first()
            .copied()
        {
            let props = match self.tree.state(attachment) {
                NodeState::DepthStencilAttachment(p) => p.clone(),
                _ => Default::default(),
            };
            let resolved = match self.first_texture_child(attachment) {
                Some(texture) => resolve_texture(
                    &mut self.tree,
                    &mut self.backend,
                    texture,
                    self.canvas_size,
                )?,
                // No Texture child: use the shared full-screen depth texture.
                None => resolve_default_depth(
                    &mut self.backend,
                    &mut self.default_depth,
                    self.canvas_size,
                )?,
            };
            depth_format = Some(resolved.format);
            combined = hash::combine(combined, resolved.format_hash);
            depth_desc = Some(DepthStencilAttachmentDesc {
                view: resolved.view,
                format: resolved.format,
                depth_load_op: props.depth_load_op,
                depth_store_op: props.depth_store_op,
                depth_clear_value: props.depth_clear_value,
                stencil_load_op: props.stencil_load_op,
                stencil_store_op: props.stencil_store_op,
                stencil_clear_value: props.stencil_clear_value,
            });
        }

        if let NodeState::RenderPass(s) = self.tree.state_mut(pass) {
            s.color_formats = color_formats;
            s.depth_stencil_format = depth_format;
            s.format_hash = combined;
        }

        // Bundles are recorded (or reused) before the pass opens, so the
        // pass body is a pure replay.
        let mut bundles = Vec::new();
        for bundle in self.tree.children_of_kind(pass, NodeKind::RenderBundle) {
            bundles.push(resolve_render_bundle(
                &mut self.tree,
                &mut self.backend,
                bundle,
                pass,
            )?);
        }

        self.backend.begin_render_pass(&RenderPassDescriptor {
            label: None,
            color_attachments: color_descs,
            depth_stencil_attachment: depth_desc,
        });
        self.backend.execute_bundles(&bundles);
        self.backend.end_render_pass();
        Ok(())
    }

    fn first_texture_child(&self, attachment: NodeId) -> Option<NodeId> {
        self.tree
            .children(attachment)
            .find(|&c| self.tree.kind(c) == NodeKind::Texture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::types::PowerPreference;

    #[test]
    fn test_first_frame_acquires_then_renders() {
        let mut backend = DummyBackend::new();
        backend.set_acquire_delay(1);
        let mut engine = Engine::new(backend, 640, 480);
        assert_eq!(engine.device_state(), DeviceLifecycle::Uninitialized);

        engine.encode_and_submit().unwrap();
        assert_eq!(engine.device_state(), DeviceLifecycle::Acquiring);
        assert_eq!(engine.backend().stats().submits, 0);

        engine.encode_and_submit().unwrap();
        assert_eq!(engine.device_state(), DeviceLifecycle::Ready);
        assert_eq!(engine.backend().stats().submits, 1);
    }

    #[test]
    fn test_acquisition_failure_retries_next_frame() {
        let mut backend = DummyBackend::new();
        backend.fail_next_acquire(crate::backend::traits::BackendError::DeviceCreationFailed(
            "simulated".into(),
        ));
        let mut engine = Engine::new(backend, 640, 480);

        engine.encode_and_submit().unwrap();
        assert_eq!(engine.device_state(), DeviceLifecycle::Uninitialized);
        assert!(engine.tree().root_invalid());

        // The failure left the controller retryable.
        engine.encode_and_submit().unwrap();
        assert_eq!(engine.device_state(), DeviceLifecycle::Ready);
    }

    #[test]
    fn test_power_preference_change_forces_reacquisition() {
        let mut engine = Engine::new(DummyBackend::new(), 640, 480);
        engine.encode_and_submit().unwrap();
        assert_eq!(engine.device_state(), DeviceLifecycle::Ready);
        assert!(!engine.tree().root_invalid());

        engine.set_device_options(DeviceOptions {
            power_preference: PowerPreference::HighPerformance,
            ..Default::default()
        });
        assert!(engine.tree().root_invalid());
    }

    #[test]
    fn test_empty_scene_submits_empty_batch() {
        let mut engine = Engine::new(DummyBackend::new(), 640, 480);
        engine.encode_and_submit().unwrap();
        assert_eq!(engine.backend().stats().submits, 1);
        assert_eq!(engine.backend().stats().command_buffers_submitted, 0);
        assert_eq!(engine.backend().stats().frames_presented, 1);
    }
}
