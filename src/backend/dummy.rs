//! Dummy GPU backend for testing and headless development.
//!
//! Performs no GPU work, but hands out unique handles and counts every
//! operation, so tests can assert exact native-create counts, bundle
//! executions, and submission batches. Device acquisition is simulated and
//! configurable: it resolves after a chosen number of polls, or fails.

use std::ops::Range;

use crate::backend::traits::*;
use crate::backend::types::*;

/// Operation counters exposed to tests.
#[derive(Debug, Default, Clone)]
pub struct DummyStats {
    pub buffers_created: usize,
    pub buffers_destroyed: usize,
    pub textures_created: usize,
    pub textures_destroyed: usize,
    pub texture_views_created: usize,
    pub shader_modules_created: usize,
    pub shader_modules_destroyed: usize,
    pub bind_group_layouts_created: usize,
    pub bind_groups_created: usize,
    pub bind_groups_destroyed: usize,
    pub render_pipelines_destroyed: usize,
    pub pipeline_layouts_created: usize,
    pub render_pipelines_created: usize,
    pub render_bundles_created: usize,
    pub render_bundles_destroyed: usize,
    pub render_passes_begun: usize,
    pub bundles_executed: usize,
    pub frame_views_fetched: usize,
    pub surface_configures: usize,
    pub command_buffers_submitted: usize,
    pub submits: usize,
    pub frames_presented: usize,
}

#[derive(Debug)]
enum AcquireState {
    Idle,
    Pending { remaining: u32 },
    Done,
}

/// Dummy GPU backend.
#[derive(Debug)]
pub struct DummyBackend {
    next_id: u64,
    ready: bool,
    acquire: AcquireState,
    /// Polls the simulated acquisition takes before resolving.
    acquire_delay: u32,
    /// Error the next acquisition resolves to, instead of succeeding.
    acquire_failure: Option<BackendError>,
    preferred_format: TextureFormat,
    surface_format: Option<TextureFormat>,
    encoder_open: bool,
    pass_open: bool,
    bundle_open: bool,
    /// Every bundle handle executed, in order (for reuse assertions).
    pub executed_bundles: Vec<RenderBundleHandle>,
    stats: DummyStats,
}

impl DummyBackend {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ready: false,
            acquire: AcquireState::Idle,
            acquire_delay: 0,
            acquire_failure: None,
            preferred_format: TextureFormat::Bgra8UnormSrgb,
            surface_format: None,
            encoder_open: false,
            pass_open: false,
            bundle_open: false,
            executed_bundles: Vec::new(),
            stats: DummyStats::default(),
        }
    }

    pub fn stats(&self) -> &DummyStats {
        &self.stats
    }

    /// Make the next acquisition stay pending for `polls` polls.
    pub fn set_acquire_delay(&mut self, polls: u32) {
        self.acquire_delay = polls;
    }

    /// Make the next acquisition fail with `error`.
    pub fn fail_next_acquire(&mut self, error: BackendError) {
        self.acquire_failure = Some(error);
    }

    fn fresh_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy"
    }

    fn begin_acquire(&mut self, options: &DeviceOptions) {
        log::trace!(
            "DummyBackend: beginning acquisition (power preference {:?})",
            options.power_preference
        );
        self.acquire = AcquireState::Pending {
            remaining: self.acquire_delay,
        };
    }

    fn poll_acquire(&mut self) -> AcquireStatus {
        match &mut self.acquire {
            AcquireState::Idle => AcquireStatus::Idle,
            AcquireState::Pending { remaining } => {
                if *remaining > 0 {
                    *remaining -= 1;
                    return AcquireStatus::Pending;
                }
                self.acquire = AcquireState::Done;
                if let Some(error) = self.acquire_failure.take() {
                    self.acquire = AcquireState::Idle;
                    return AcquireStatus::Failed(error);
                }
                self.ready = true;
                AcquireStatus::Ready(AdapterDetails {
                    name: "Dummy Adapter".to_string(),
                    preferred_format: self.preferred_format,
                })
            }
            AcquireState::Done => AcquireStatus::Ready(AdapterDetails {
                name: "Dummy Adapter".to_string(),
                preferred_format: self.preferred_format,
            }),
        }
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn configure_surface(
        &mut self,
        format: FormatRequest,
        width: u32,
        height: u32,
    ) -> BackendResult<TextureFormat> {
        if !self.ready {
            return Err(BackendError::DeviceNotReady);
        }
        let resolved = match format {
            FormatRequest::Preferred => self.preferred_format,
            FormatRequest::Exact(f) => f,
        };
        log::trace!("DummyBackend: configuring surface {width}x{height} as {resolved:?}");
        self.surface_format = Some(resolved);
        self.stats.surface_configures += 1;
        Ok(resolved)
    }

    fn current_frame_view(&mut self) -> BackendResult<TextureViewHandle> {
        if self.surface_format.is_none() {
            return Err(BackendError::AcquireImageFailed(
                "surface not configured".to_string(),
            ));
        }
        self.stats.frame_views_fetched += 1;
        Ok(TextureViewHandle(self.fresh_id()))
    }

    fn present_frame(&mut self) -> BackendResult<()> {
        self.stats.frames_presented += 1;
        Ok(())
    }

    fn create_buffer_init(
        &mut self,
        _usage: BufferUsage,
        data: &[u8],
    ) -> BackendResult<BufferHandle> {
        log::trace!("DummyBackend: creating buffer of {} bytes", data.len());
        self.stats.buffers_created += 1;
        Ok(BufferHandle(self.fresh_id()))
    }

    fn destroy_buffer(&mut self, _buffer: BufferHandle) {
        self.stats.buffers_destroyed += 1;
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        log::trace!(
            "DummyBackend: creating texture {}x{}x{} {:?}",
            desc.size.width,
            desc.size.height,
            desc.size.depth,
            desc.format
        );
        self.stats.textures_created += 1;
        Ok(TextureHandle(self.fresh_id()))
    }

    fn create_texture_view(&mut self, _texture: TextureHandle) -> BackendResult<TextureViewHandle> {
        self.stats.texture_views_created += 1;
        Ok(TextureViewHandle(self.fresh_id()))
    }

    fn destroy_texture(&mut self, _texture: TextureHandle) {
        self.stats.textures_destroyed += 1;
    }

    fn destroy_texture_view(&mut self, _view: TextureViewHandle) {}

    fn create_shader_module(
        &mut self,
        source: &str,
    ) -> BackendResult<(ShaderModuleHandle, Vec<CompilationMessage>)> {
        log::trace!("DummyBackend: compiling shader of {} bytes", source.len());
        self.stats.shader_modules_created += 1;
        Ok((ShaderModuleHandle(self.fresh_id()), Vec::new()))
    }

    fn destroy_shader_module(&mut self, _module: ShaderModuleHandle) {
        self.stats.shader_modules_destroyed += 1;
    }

    fn destroy_bind_group(&mut self, _bind_group: BindGroupHandle) {
        self.stats.bind_groups_destroyed += 1;
    }

    fn destroy_bind_group_layout(&mut self, _layout: BindGroupLayoutHandle) {}

    fn destroy_pipeline_layout(&mut self, _layout: PipelineLayoutHandle) {}

    fn destroy_render_pipeline(&mut self, _pipeline: RenderPipelineHandle) {
        self.stats.render_pipelines_destroyed += 1;
    }

    fn create_bind_group_layout(
        &mut self,
        _entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        self.stats.bind_group_layouts_created += 1;
        Ok(BindGroupLayoutHandle(self.fresh_id()))
    }

    fn create_bind_group(
        &mut self,
        _layout: BindGroupLayoutHandle,
        _entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        self.stats.bind_groups_created += 1;
        Ok(BindGroupHandle(self.fresh_id()))
    }

    fn create_pipeline_layout(
        &mut self,
        _layouts: &[BindGroupLayoutHandle],
    ) -> BackendResult<PipelineLayoutHandle> {
        self.stats.pipeline_layouts_created += 1;
        Ok(PipelineLayoutHandle(self.fresh_id()))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        log::trace!("DummyBackend: creating pipeline {:?}", desc.label);
        self.stats.render_pipelines_created += 1;
        Ok(RenderPipelineHandle(self.fresh_id()))
    }

    fn begin_render_bundle(&mut self, _desc: &RenderBundleDescriptor) {
        assert!(!self.bundle_open, "bundle encoder already open");
        self.bundle_open = true;
    }

    fn bundle_set_pipeline(&mut self, _pipeline: RenderPipelineHandle) {}

    fn bundle_set_vertex_buffer(&mut self, _slot: u32, _buffer: BufferHandle) {}

    fn bundle_set_bind_group(&mut self, _index: u32, _bind_group: BindGroupHandle) {}

    fn bundle_draw(&mut self, _vertices: Range<u32>, _instances: Range<u32>) {}

    fn finish_render_bundle(&mut self) -> BackendResult<RenderBundleHandle> {
        assert!(self.bundle_open, "finish_render_bundle without an open encoder");
        self.bundle_open = false;
        self.stats.render_bundles_created += 1;
        Ok(RenderBundleHandle(self.fresh_id()))
    }

    fn destroy_render_bundle(&mut self, _bundle: RenderBundleHandle) {
        self.stats.render_bundles_destroyed += 1;
    }

    fn begin_command_encoder(&mut self, _label: Option<&str>) {
        self.encoder_open = true;
    }

    fn begin_render_pass(&mut self, _desc: &RenderPassDescriptor) {
        assert!(self.encoder_open, "begin_render_pass without an open encoder");
        self.pass_open = true;
        self.stats.render_passes_begun += 1;
    }

    fn execute_bundles(&mut self, bundles: &[RenderBundleHandle]) {
        assert!(self.pass_open, "execute_bundles outside a render pass");
        self.stats.bundles_executed += bundles.len();
        self.executed_bundles.extend_from_slice(bundles);
    }

    fn end_render_pass(&mut self) {
        self.pass_open = false;
    }

    fn finish_command_encoder(&mut self) -> BackendResult<CommandBufferHandle> {
        assert!(!self.pass_open, "finish_command_encoder inside a render pass");
        self.encoder_open = false;
        Ok(CommandBufferHandle(self.fresh_id()))
    }

    fn submit(&mut self, buffers: Vec<CommandBufferHandle>) -> BackendResult<()> {
        log::trace!(
            "DummyBackend: submitting {} command buffer(s)",
            buffers.len()
        );
        self.stats.command_buffers_submitted += buffers.len();
        self.stats.submits += 1;
        Ok(())
    }
}
