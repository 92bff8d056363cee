//! wgpu backend implementation

use std::collections::HashMap;
use std::future::Future;
use std::ops::Range;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use wgpu::util::DeviceExt;

use crate::backend::traits::*;
use crate::backend::types::*;

/// Buffered render-bundle command
#[derive(Clone)]
enum BundleCommand {
    SetPipeline(RenderPipelineHandle),
    SetVertexBuffer { slot: u32, buffer: BufferHandle },
    SetBindGroup { index: u32, bind_group: BindGroupHandle },
    Draw { vertices: Range<u32>, instances: Range<u32> },
}

/// Pending render bundle with buffered commands
struct PendingBundle {
    descriptor: RenderBundleDescriptor,
    commands: Vec<BundleCommand>,
}

/// Pending render pass with the bundles to replay
struct PendingPass {
    descriptor: RenderPassDescriptor,
    bundles: Vec<RenderBundleHandle>,
}

/// Everything the acquisition future produces.
struct AcquiredDevice {
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    preferred_format: wgpu::TextureFormat,
    adapter_name: String,
}

type AcquireFuture = Pin<Box<dyn Future<Output = Result<AcquiredDevice, BackendError>>>>;

/// wgpu backend implementation
pub struct WgpuBackend {
    instance: Arc<wgpu::Instance>,
    surface: Arc<wgpu::Surface<'static>>,
    adapter: Option<wgpu::Adapter>,
    device: Option<wgpu::Device>,
    queue: Option<wgpu::Queue>,
    details: Option<AdapterDetails>,
    acquisition: Option<AcquireFuture>,
    surface_config: Option<wgpu::SurfaceConfiguration>,
    current_texture: Option<wgpu::SurfaceTexture>,

    // Resource storage
    buffers: HashMap<u64, wgpu::Buffer>,
    textures: HashMap<u64, wgpu::Texture>,
    texture_views: HashMap<u64, wgpu::TextureView>,
    shader_modules: HashMap<u64, wgpu::ShaderModule>,
    bind_group_layouts: HashMap<u64, wgpu::BindGroupLayout>,
    bind_groups: HashMap<u64, wgpu::BindGroup>,
    pipeline_layouts: HashMap<u64, wgpu::PipelineLayout>,
    render_pipelines: HashMap<u64, wgpu::RenderPipeline>,
    render_bundles: HashMap<u64, wgpu::RenderBundle>,
    command_buffers: HashMap<u64, wgpu::CommandBuffer>,
    next_id: u64,

    // Per-frame surface views, dropped at present
    frame_view_ids: Vec<u64>,

    // Command encoding
    encoder: Option<wgpu::CommandEncoder>,
    pending_bundle: Option<PendingBundle>,
    pending_pass: Option<PendingPass>,
}

impl WgpuBackend {
    /// Create a backend bound to a drawable surface. The device itself is
    /// acquired asynchronously via `begin_acquire`/`poll_acquire` (or
    /// [`WgpuBackend::acquire_blocking`] on native).
    pub fn new(target: impl Into<wgpu::SurfaceTarget<'static>>) -> BackendResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let surface = instance
            .create_surface(target)
            .map_err(|e| BackendError::SurfaceCreationFailed(e.to_string()))?;

        Ok(Self {
            instance: Arc::new(instance),
            surface: Arc::new(surface),
            adapter: None,
            device: None,
            queue: None,
            details: None,
            acquisition: None,
            surface_config: None,
            current_texture: None,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            texture_views: HashMap::new(),
            shader_modules: HashMap::new(),
            bind_group_layouts: HashMap::new(),
            bind_groups: HashMap::new(),
            pipeline_layouts: HashMap::new(),
            render_pipelines: HashMap::new(),
            render_bundles: HashMap::new(),
            command_buffers: HashMap::new(),
            next_id: 1,
            frame_view_ids: Vec::new(),
            encoder: None,
            pending_bundle: None,
            pending_pass: None,
        })
    }

    /// Run the acquisition sequence to completion on the current thread.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn acquire_blocking(&mut self, options: &DeviceOptions) -> BackendResult<AdapterDetails> {
        self.begin_acquire(options);
        let future = self
            .acquisition
            .take()
            .ok_or_else(|| BackendError::InitializationFailed("no acquisition in flight".into()))?;
        let parts = pollster::block_on(future)?;
        Ok(self.install_device(parts))
    }

    fn fresh_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn device(&self) -> BackendResult<&wgpu::Device> {
        self.device.as_ref().ok_or(BackendError::DeviceNotReady)
    }

    fn install_device(&mut self, parts: AcquiredDevice) -> AdapterDetails {
        let details = AdapterDetails {
            name: parts.adapter_name,
            preferred_format: Self::convert_texture_format_back(parts.preferred_format),
        };
        log::info!("acquired GPU device on {}", details.name);
        self.adapter = Some(parts.adapter);
        self.device = Some(parts.device);
        self.queue = Some(parts.queue);
        self.details = Some(details.clone());
        // A new device invalidates any previous surface configuration.
        self.surface_config = None;
        details
    }

    fn convert_texture_format(format: TextureFormat) -> wgpu::TextureFormat {
        match format {
            TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
            TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
            TextureFormat::Bgra8UnormSrgb => wgpu::TextureFormat::Bgra8UnormSrgb,
            TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
            TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
            TextureFormat::Depth24PlusStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
            TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
            TextureFormat::Rg32Float => wgpu::TextureFormat::Rg32Float,
        }
    }

    fn convert_texture_format_back(format: wgpu::TextureFormat) -> TextureFormat {
        match format {
            wgpu::TextureFormat::Rgba8Unorm => TextureFormat::Rgba8Unorm,
            wgpu::TextureFormat::Rgba8UnormSrgb => TextureFormat::Rgba8UnormSrgb,
            wgpu::TextureFormat::Bgra8Unorm => TextureFormat::Bgra8Unorm,
            wgpu::TextureFormat::Bgra8UnormSrgb => TextureFormat::Bgra8UnormSrgb,
            wgpu::TextureFormat::Rgba16Float => TextureFormat::Rgba16Float,
            wgpu::TextureFormat::Rgba32Float => TextureFormat::Rgba32Float,
            wgpu::TextureFormat::Depth32Float => TextureFormat::Depth32Float,
            wgpu::TextureFormat::Depth24PlusStencil8 => TextureFormat::Depth24PlusStencil8,
            wgpu::TextureFormat::R32Float => TextureFormat::R32Float,
            wgpu::TextureFormat::Rg32Float => TextureFormat::Rg32Float,
            _ => TextureFormat::Bgra8UnormSrgb,
        }
    }

    fn convert_buffer_usage(usage: BufferUsage) -> wgpu::BufferUsages {
        let mut result = wgpu::BufferUsages::empty();
        if usage.contains(BufferUsage::MAP_READ) {
            result |= wgpu::BufferUsages::MAP_READ;
        }
        if usage.contains(BufferUsage::MAP_WRITE) {
            result |= wgpu::BufferUsages::MAP_WRITE;
        }
        if usage.contains(BufferUsage::COPY_SRC) {
            result |= wgpu::BufferUsages::COPY_SRC;
        }
        if usage.contains(BufferUsage::COPY_DST) {
            result |= wgpu::BufferUsages::COPY_DST;
        }
        if usage.contains(BufferUsage::INDEX) {
            result |= wgpu::BufferUsages::INDEX;
        }
        if usage.contains(BufferUsage::VERTEX) {
            result |= wgpu::BufferUsages::VERTEX;
        }
        if usage.contains(BufferUsage::UNIFORM) {
            result |= wgpu::BufferUsages::UNIFORM;
        }
        if usage.contains(BufferUsage::STORAGE) {
            result |= wgpu::BufferUsages::STORAGE;
        }
        result
    }

    fn convert_texture_usage(usage: TextureUsage) -> wgpu::TextureUsages {
        let mut result = wgpu::TextureUsages::empty();
        if usage.contains(TextureUsage::COPY_SRC) {
            result |= wgpu::TextureUsages::COPY_SRC;
        }
        if usage.contains(TextureUsage::COPY_DST) {
            result |= wgpu::TextureUsages::COPY_DST;
        }
        if usage.contains(TextureUsage::TEXTURE_BINDING) {
            result |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        if usage.contains(TextureUsage::STORAGE_BINDING) {
            result |= wgpu::TextureUsages::STORAGE_BINDING;
        }
        if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
            result |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        result
    }

    fn convert_vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
        match format {
            VertexFormat::Float32 => wgpu::VertexFormat::Float32,
            VertexFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
            VertexFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
            VertexFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
            VertexFormat::Uint32 => wgpu::VertexFormat::Uint32,
            VertexFormat::Sint32 => wgpu::VertexFormat::Sint32,
        }
    }

    fn convert_compare_function(func: CompareFunction) -> wgpu::CompareFunction {
        match func {
            CompareFunction::Never => wgpu::CompareFunction::Never,
            CompareFunction::Less => wgpu::CompareFunction::Less,
            CompareFunction::Equal => wgpu::CompareFunction::Equal,
            CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
            CompareFunction::Greater => wgpu::CompareFunction::Greater,
            CompareFunction::NotEqual => wgpu::CompareFunction::NotEqual,
            CompareFunction::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
            CompareFunction::Always => wgpu::CompareFunction::Always,
        }
    }

    fn convert_blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
        match factor {
            BlendFactor::Zero => wgpu::BlendFactor::Zero,
            BlendFactor::One => wgpu::BlendFactor::One,
            BlendFactor::Src => wgpu::BlendFactor::Src,
            BlendFactor::OneMinusSrc => wgpu::BlendFactor::OneMinusSrc,
            BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
            BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
            BlendFactor::Dst => wgpu::BlendFactor::Dst,
            BlendFactor::OneMinusDst => wgpu::BlendFactor::OneMinusDst,
            BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
            BlendFactor::OneMinusDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
        }
    }

    fn convert_blend_operation(op: BlendOperation) -> wgpu::BlendOperation {
        match op {
            BlendOperation::Add => wgpu::BlendOperation::Add,
            BlendOperation::Subtract => wgpu::BlendOperation::Subtract,
            BlendOperation::ReverseSubtract => wgpu::BlendOperation::ReverseSubtract,
            BlendOperation::Min => wgpu::BlendOperation::Min,
            BlendOperation::Max => wgpu::BlendOperation::Max,
        }
    }

    fn convert_blend_state(state: &BlendState) -> wgpu::BlendState {
        wgpu::BlendState {
            color: wgpu::BlendComponent {
                src_factor: Self::convert_blend_factor(state.color.src_factor),
                dst_factor: Self::convert_blend_factor(state.color.dst_factor),
                operation: Self::convert_blend_operation(state.color.operation),
            },
            alpha: wgpu::BlendComponent {
                src_factor: Self::convert_blend_factor(state.alpha.src_factor),
                dst_factor: Self::convert_blend_factor(state.alpha.dst_factor),
                operation: Self::convert_blend_operation(state.alpha.operation),
            },
        }
    }

    fn convert_load_op(op: &LoadOp) -> wgpu::LoadOp<wgpu::Color> {
        match op {
            LoadOp::Clear(color) => wgpu::LoadOp::Clear(wgpu::Color {
                r: color[0],
                g: color[1],
                b: color[2],
                a: color[3],
            }),
            LoadOp::Load => wgpu::LoadOp::Load,
        }
    }

    fn convert_store_op(op: StoreOp) -> wgpu::StoreOp {
        match op {
            StoreOp::Store => wgpu::StoreOp::Store,
            StoreOp::Discard => wgpu::StoreOp::Discard,
        }
    }

    /// Map WebGPU-style feature names onto wgpu feature flags. Unknown
    /// names are logged and skipped rather than failing acquisition.
    fn convert_features(names: &[String]) -> wgpu::Features {
        let mut features = wgpu::Features::empty();
        for name in names {
            match name.as_str() {
                "depth-clip-control" => features |= wgpu::Features::DEPTH_CLIP_CONTROL,
                "depth32float-stencil8" => features |= wgpu::Features::DEPTH32FLOAT_STENCIL8,
                "timestamp-query" => features |= wgpu::Features::TIMESTAMP_QUERY,
                "indirect-first-instance" => features |= wgpu::Features::INDIRECT_FIRST_INSTANCE,
                "shader-f16" => features |= wgpu::Features::SHADER_F16,
                "float32-filterable" => features |= wgpu::Features::FLOAT32_FILTERABLE,
                "texture-compression-bc" => features |= wgpu::Features::TEXTURE_COMPRESSION_BC,
                other => log::warn!("ignoring unknown device feature {other:?}"),
            }
        }
        features
    }

    fn convert_limits(limits: &DeviceLimits) -> wgpu::Limits {
        let mut result = wgpu::Limits::default();
        if let Some(max) = limits.max_texture_dimension_2d {
            result.max_texture_dimension_2d = max;
        }
        if let Some(max) = limits.max_bind_groups {
            result.max_bind_groups = max;
        }
        if let Some(max) = limits.max_buffer_size {
            result.max_buffer_size = max;
        }
        result
    }
}

impl GpuBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn begin_acquire(&mut self, options: &DeviceOptions) {
        let instance = Arc::clone(&self.instance);
        let surface = Arc::clone(&self.surface);
        let power_preference = match options.power_preference {
            PowerPreference::None => wgpu::PowerPreference::None,
            PowerPreference::LowPower => wgpu::PowerPreference::LowPower,
            PowerPreference::HighPerformance => wgpu::PowerPreference::HighPerformance,
        };
        let required_features = Self::convert_features(&options.features);
        let required_limits = Self::convert_limits(&options.limits);

        self.acquisition = Some(Box::pin(async move {
            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference,
                    compatible_surface: Some(surface.as_ref()),
                    force_fallback_adapter: false,
                })
                .await
                .ok_or_else(|| {
                    BackendError::InitializationFailed("no suitable adapter found".into())
                })?;

            let adapter_name = adapter.get_info().name;
            let (device, queue) = adapter
                .request_device(
                    &wgpu::DeviceDescriptor {
                        label: Some("scenegraph device"),
                        required_features,
                        required_limits,
                    },
                    None,
                )
                .await
                .map_err(|e| BackendError::DeviceCreationFailed(e.to_string()))?;

            device.on_uncaptured_error(Box::new(|error| {
                log::error!("uncaptured device error: {error}");
            }));

            let capabilities = surface.get_capabilities(&adapter);
            let preferred_format = capabilities
                .formats
                .iter()
                .copied()
                .find(|f| f.is_srgb())
                .or_else(|| capabilities.formats.first().copied())
                .ok_or_else(|| {
                    BackendError::SurfaceConfigurationFailed(
                        "surface reports no supported formats".into(),
                    )
                })?;

            Ok(AcquiredDevice {
                adapter,
                device,
                queue,
                preferred_format,
                adapter_name,
            })
        }));
    }

    fn poll_acquire(&mut self) -> AcquireStatus {
        if let Some(future) = self.acquisition.as_mut() {
            let waker = std::task::Waker::noop();
            let mut cx = Context::from_waker(waker);
            return match future.as_mut().poll(&mut cx) {
                Poll::Pending => AcquireStatus::Pending,
                Poll::Ready(Ok(parts)) => {
                    self.acquisition = None;
                    AcquireStatus::Ready(self.install_device(parts))
                }
                Poll::Ready(Err(error)) => {
                    self.acquisition = None;
                    AcquireStatus::Failed(error)
                }
            };
        }
        match &self.details {
            Some(details) => AcquireStatus::Ready(details.clone()),
            None => AcquireStatus::Idle,
        }
    }

    fn is_ready(&self) -> bool {
        self.device.is_some()
    }

    fn configure_surface(
        &mut self,
        format: FormatRequest,
        width: u32,
        height: u32,
    ) -> BackendResult<TextureFormat> {
        let device = self.device.as_ref().ok_or(BackendError::DeviceNotReady)?;
        let adapter = self.adapter.as_ref().ok_or(BackendError::DeviceNotReady)?;

        let resolved = match format {
            FormatRequest::Exact(f) => f,
            FormatRequest::Preferred => self
                .details
                .as_ref()
                .map(|d| d.preferred_format)
                .ok_or(BackendError::DeviceNotReady)?,
        };
        let wgpu_format = Self::convert_texture_format(resolved);

        // Clamp to device limits while maintaining aspect ratio.
        let max_size = device.limits().max_texture_dimension_2d;
        let (width, height) = if width > max_size || height > max_size {
            let scale = (max_size as f32 / width as f32).min(max_size as f32 / height as f32);
            (
                ((width as f32 * scale) as u32).max(1),
                ((height as f32 * scale) as u32).max(1),
            )
        } else {
            (width.max(1), height.max(1))
        };

        let capabilities = self.surface.get_capabilities(adapter);
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: wgpu_format,
            width,
            height,
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode: capabilities
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        self.surface.configure(device, &config);
        self.surface_config = Some(config);
        Ok(resolved)
    }

    fn current_frame_view(&mut self) -> BackendResult<TextureViewHandle> {
        if self.surface_config.is_none() {
            return Err(BackendError::AcquireImageFailed(
                "surface not configured".into(),
            ));
        }
        if self.current_texture.is_none() {
            let output = self.surface.get_current_texture().map_err(|e| match e {
                wgpu::SurfaceError::Lost => BackendError::SurfaceLost,
                wgpu::SurfaceError::OutOfMemory => BackendError::OutOfMemory,
                other => BackendError::AcquireImageFailed(other.to_string()),
            })?;
            self.current_texture = Some(output);
        }
        let view = match self.current_texture.as_ref() {
            Some(texture) => texture
                .texture
                .create_view(&wgpu::TextureViewDescriptor::default()),
            None => return Err(BackendError::SurfaceLost),
        };
        let id = self.fresh_id();
        self.texture_views.insert(id, view);
        self.frame_view_ids.push(id);
        Ok(TextureViewHandle(id))
    }

    fn present_frame(&mut self) -> BackendResult<()> {
        // Per-frame surface views never outlive the frame.
        for id in self.frame_view_ids.drain(..) {
            self.texture_views.remove(&id);
        }
        if let Some(texture) = self.current_texture.take() {
            texture.present();
        }
        Ok(())
    }

    fn create_buffer_init(&mut self, usage: BufferUsage, data: &[u8]) -> BackendResult<BufferHandle> {
        let device = self.device()?;
        let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: None,
            contents: data,
            usage: Self::convert_buffer_usage(usage),
        });
        let id = self.fresh_id();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(buffer) = self.buffers.remove(&buffer.0) {
            buffer.destroy();
        }
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        let device = self.device()?;
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label.as_deref(),
            size: wgpu::Extent3d {
                width: desc.size.width,
                height: desc.size.height,
                depth_or_array_layers: desc.size.depth,
            },
            mip_level_count: desc.mip_levels,
            sample_count: desc.sample_count,
            dimension: wgpu::TextureDimension::D2,
            format: Self::convert_texture_format(desc.format),
            usage: Self::convert_texture_usage(desc.usage),
            view_formats: &[],
        });
        let id = self.fresh_id();
        self.textures.insert(id, texture);
        Ok(TextureHandle(id))
    }

    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle> {
        let texture = self
            .textures
            .get(&texture.0)
            .ok_or(BackendError::UnknownHandle("texture"))?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let id = self.fresh_id();
        self.texture_views.insert(id, view);
        Ok(TextureViewHandle(id))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some(texture) = self.textures.remove(&texture.0) {
            texture.destroy();
        }
    }

    fn destroy_texture_view(&mut self, view: TextureViewHandle) {
        self.texture_views.remove(&view.0);
    }

    fn create_shader_module(
        &mut self,
        source: &str,
    ) -> BackendResult<(ShaderModuleHandle, Vec<CompilationMessage>)> {
        let device = self.device()?;
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: None,
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        let id = self.fresh_id();
        self.shader_modules.insert(id, module);
        // Compilation problems surface through the uncaptured-error hook;
        // wgpu reports no synchronous per-module diagnostics.
        Ok((ShaderModuleHandle(id), Vec::new()))
    }

    fn destroy_shader_module(&mut self, module: ShaderModuleHandle) {
        self.shader_modules.remove(&module.0);
    }

    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle) {
        self.bind_groups.remove(&bind_group.0);
    }

    fn destroy_bind_group_layout(&mut self, layout: BindGroupLayoutHandle) {
        self.bind_group_layouts.remove(&layout.0);
    }

    fn destroy_pipeline_layout(&mut self, layout: PipelineLayoutHandle) {
        self.pipeline_layouts.remove(&layout.0);
    }

    fn destroy_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.render_pipelines.remove(&pipeline.0);
    }

    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        let device = self.device()?;
        let wgpu_entries: Vec<wgpu::BindGroupLayoutEntry> = entries
            .iter()
            .map(|entry| {
                let ty = match entry.kind {
                    BufferBindingKind::Uniform => wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    BufferBindingKind::Storage { read_only } => wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                };
                let mut visibility = wgpu::ShaderStages::empty();
                if entry.visibility.contains(ShaderStageFlags::VERTEX) {
                    visibility |= wgpu::ShaderStages::VERTEX;
                }
                if entry.visibility.contains(ShaderStageFlags::FRAGMENT) {
                    visibility |= wgpu::ShaderStages::FRAGMENT;
                }
                wgpu::BindGroupLayoutEntry {
                    binding: entry.binding,
                    visibility,
                    ty,
                    count: None,
                }
            })
            .collect();

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: None,
            entries: &wgpu_entries,
        });
        let id = self.fresh_id();
        self.bind_group_layouts.insert(id, layout);
        Ok(BindGroupLayoutHandle(id))
    }

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        let device = self.device.as_ref().ok_or(BackendError::DeviceNotReady)?;
        let layout = self
            .bind_group_layouts
            .get(&layout.0)
            .ok_or(BackendError::UnknownHandle("bind group layout"))?;

        let mut wgpu_entries = Vec::with_capacity(entries.len());
        for (binding, entry) in entries {
            let resource = match entry {
                BindGroupEntry::Buffer {
                    buffer,
                    offset,
                    size,
                } => {
                    let buffer = self
                        .buffers
                        .get(&buffer.0)
                        .ok_or(BackendError::UnknownHandle("buffer"))?;
                    wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer,
                        offset: *offset,
                        size: size.and_then(std::num::NonZeroU64::new),
                    })
                }
                BindGroupEntry::Texture(view) => {
                    let view = self
                        .texture_views
                        .get(&view.0)
                        .ok_or(BackendError::UnknownHandle("texture view"))?;
                    wgpu::BindingResource::TextureView(view)
                }
            };
            wgpu_entries.push(wgpu::BindGroupEntry {
                binding: *binding,
                resource,
            });
        }

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout,
            entries: &wgpu_entries,
        });
        let id = self.fresh_id();
        self.bind_groups.insert(id, bind_group);
        Ok(BindGroupHandle(id))
    }

    fn create_pipeline_layout(
        &mut self,
        layouts: &[BindGroupLayoutHandle],
    ) -> BackendResult<PipelineLayoutHandle> {
        let device = self.device.as_ref().ok_or(BackendError::DeviceNotReady)?;
        let mut refs = Vec::with_capacity(layouts.len());
        for layout in layouts {
            refs.push(
                self.bind_group_layouts
                    .get(&layout.0)
                    .ok_or(BackendError::UnknownHandle("bind group layout"))?,
            );
        }
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: None,
            bind_group_layouts: &refs,
            push_constant_ranges: &[],
        });
        let id = self.fresh_id();
        self.pipeline_layouts.insert(id, layout);
        Ok(PipelineLayoutHandle(id))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        let device = self.device.as_ref().ok_or(BackendError::DeviceNotReady)?;
        let vertex_module = self
            .shader_modules
            .get(&desc.vertex_module.0)
            .ok_or(BackendError::UnknownHandle("shader module"))?;
        let fragment_module = match desc.fragment_module {
            Some(handle) => Some(
                self.shader_modules
                    .get(&handle.0)
                    .ok_or(BackendError::UnknownHandle("shader module"))?,
            ),
            None => None,
        };
        let pipeline_layout = match desc.layout {
            Some(handle) => Some(
                self.pipeline_layouts
                    .get(&handle.0)
                    .ok_or(BackendError::UnknownHandle("pipeline layout"))?,
            ),
            None => None,
        };

        let vertex_attrs: Vec<Vec<wgpu::VertexAttribute>> = desc
            .vertex_layouts
            .iter()
            .map(|layout| {
                layout
                    .attributes
                    .iter()
                    .map(|a| wgpu::VertexAttribute {
                        format: Self::convert_vertex_format(a.format),
                        offset: a.offset,
                        shader_location: a.location,
                    })
                    .collect()
            })
            .collect();
        let vertex_buffers: Vec<wgpu::VertexBufferLayout> = desc
            .vertex_layouts
            .iter()
            .zip(vertex_attrs.iter())
            .map(|(layout, attrs)| wgpu::VertexBufferLayout {
                array_stride: layout.array_stride,
                step_mode: match layout.step_mode {
                    VertexStepMode::Vertex => wgpu::VertexStepMode::Vertex,
                    VertexStepMode::Instance => wgpu::VertexStepMode::Instance,
                },
                attributes: attrs,
            })
            .collect();

        let color_targets: Vec<Option<wgpu::ColorTargetState>> = desc
            .color_targets
            .iter()
            .map(|target| {
                Some(wgpu::ColorTargetState {
                    format: Self::convert_texture_format(target.format),
                    blend: target.blend.as_ref().map(Self::convert_blend_state),
                    write_mask: wgpu::ColorWrites::from_bits_truncate(target.write_mask.bits()),
                })
            })
            .collect();

        let primitive = wgpu::PrimitiveState {
            topology: match desc.primitive_topology {
                PrimitiveTopology::PointList => wgpu::PrimitiveTopology::PointList,
                PrimitiveTopology::LineList => wgpu::PrimitiveTopology::LineList,
                PrimitiveTopology::LineStrip => wgpu::PrimitiveTopology::LineStrip,
                PrimitiveTopology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
                PrimitiveTopology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
            },
            strip_index_format: None,
            front_face: match desc.front_face {
                FrontFace::Ccw => wgpu::FrontFace::Ccw,
                FrontFace::Cw => wgpu::FrontFace::Cw,
            },
            cull_mode: match desc.cull_mode {
                CullMode::None => None,
                CullMode::Front => Some(wgpu::Face::Front),
                CullMode::Back => Some(wgpu::Face::Back),
            },
            ..Default::default()
        };

        let depth_stencil = desc.depth_stencil.as_ref().map(|ds| wgpu::DepthStencilState {
            format: Self::convert_texture_format(ds.format),
            depth_write_enabled: ds.depth_write_enabled,
            depth_compare: Self::convert_compare_function(ds.depth_compare),
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        });

        let fragment = match (fragment_module, desc.fragment_entry_point.as_deref()) {
            (Some(module), Some(entry_point)) => Some(wgpu::FragmentState {
                module,
                entry_point,
                targets: &color_targets,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            _ => None,
        };

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: desc.label.as_deref(),
            layout: pipeline_layout,
            vertex: wgpu::VertexState {
                module: vertex_module,
                entry_point: &desc.vertex_entry_point,
                buffers: &vertex_buffers,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment,
            primitive,
            depth_stencil,
            multisample: wgpu::MultisampleState {
                count: desc.multisample.count,
                mask: desc.multisample.mask,
                alpha_to_coverage_enabled: desc.multisample.alpha_to_coverage_enabled,
            },
            multiview: None,
        });
        let id = self.fresh_id();
        self.render_pipelines.insert(id, pipeline);
        Ok(RenderPipelineHandle(id))
    }

    fn begin_render_bundle(&mut self, desc: &RenderBundleDescriptor) {
        self.pending_bundle = Some(PendingBundle {
            descriptor: desc.clone(),
            commands: Vec::new(),
        });
    }

    fn bundle_set_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        if let Some(pending) = self.pending_bundle.as_mut() {
            pending.commands.push(BundleCommand::SetPipeline(pipeline));
        }
    }

    fn bundle_set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle) {
        if let Some(pending) = self.pending_bundle.as_mut() {
            pending
                .commands
                .push(BundleCommand::SetVertexBuffer { slot, buffer });
        }
    }

    fn bundle_set_bind_group(&mut self, index: u32, bind_group: BindGroupHandle) {
        if let Some(pending) = self.pending_bundle.as_mut() {
            pending
                .commands
                .push(BundleCommand::SetBindGroup { index, bind_group });
        }
    }

    fn bundle_draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        if let Some(pending) = self.pending_bundle.as_mut() {
            pending
                .commands
                .push(BundleCommand::Draw { vertices, instances });
        }
    }

    fn finish_render_bundle(&mut self) -> BackendResult<RenderBundleHandle> {
        let pending = self
            .pending_bundle
            .take()
            .ok_or_else(|| BackendError::PipelineCreationFailed("no open bundle encoder".into()))?;
        let device = self.device.as_ref().ok_or(BackendError::DeviceNotReady)?;

        let color_formats: Vec<Option<wgpu::TextureFormat>> = pending
            .descriptor
            .color_formats
            .iter()
            .map(|f| Some(Self::convert_texture_format(*f)))
            .collect();
        let depth_stencil =
            pending
                .descriptor
                .depth_stencil_format
                .map(|f| wgpu::RenderBundleDepthStencil {
                    format: Self::convert_texture_format(f),
                    depth_read_only: false,
                    stencil_read_only: false,
                });

        let bundle = {
            let mut encoder =
                device.create_render_bundle_encoder(&wgpu::RenderBundleEncoderDescriptor {
                    label: pending.descriptor.label.as_deref(),
                    color_formats: &color_formats,
                    depth_stencil,
                    sample_count: pending.descriptor.sample_count,
                    multiview: None,
                });
            for command in &pending.commands {
                match command {
                    BundleCommand::SetPipeline(handle) => {
                        if let Some(pipeline) = self.render_pipelines.get(&handle.0) {
                            encoder.set_pipeline(pipeline);
                        }
                    }
                    BundleCommand::SetVertexBuffer { slot, buffer } => {
                        if let Some(buffer) = self.buffers.get(&buffer.0) {
                            encoder.set_vertex_buffer(*slot, buffer.slice(..));
                        }
                    }
                    BundleCommand::SetBindGroup { index, bind_group } => {
                        if let Some(bind_group) = self.bind_groups.get(&bind_group.0) {
                            encoder.set_bind_group(*index, bind_group, &[]);
                        }
                    }
                    BundleCommand::Draw {
                        vertices,
                        instances,
                    } => {
                        encoder.draw(vertices.clone(), instances.clone());
                    }
                }
            }
            encoder.finish(&wgpu::RenderBundleDescriptor { label: None })
        };

        let id = self.fresh_id();
        self.render_bundles.insert(id, bundle);
        Ok(RenderBundleHandle(id))
    }

    fn destroy_render_bundle(&mut self, bundle: RenderBundleHandle) {
        self.render_bundles.remove(&bundle.0);
    }

    fn begin_command_encoder(&mut self, label: Option<&str>) {
        let encoder = self
            .device
            .as_ref()
            .map(|device| device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label }));
        self.encoder = encoder;
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        self.pending_pass = Some(PendingPass {
            descriptor: desc.clone(),
            bundles: Vec::new(),
        });
    }

    fn execute_bundles(&mut self, bundles: &[RenderBundleHandle]) {
        if let Some(pending) = self.pending_pass.as_mut() {
            pending.bundles.extend_from_slice(bundles);
        }
    }

    fn end_render_pass(&mut self) {
        let Some(pending) = self.pending_pass.take() else {
            return;
        };
        let Some(encoder) = self.encoder.as_mut() else {
            return;
        };

        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = pending
            .descriptor
            .color_attachments
            .iter()
            .filter_map(|att| {
                let view = self.texture_views.get(&att.view.0)?;
                Some(Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: Self::convert_load_op(&att.load_op),
                        store: Self::convert_store_op(att.store_op),
                    },
                }))
            })
            .collect();

        let depth_attachment =
            pending
                .descriptor
                .depth_stencil_attachment
                .as_ref()
                .and_then(|att| {
                    let view = self.texture_views.get(&att.view.0)?;
                    let stencil_ops = (att.format == TextureFormat::Depth24PlusStencil8).then(
                        || wgpu::Operations {
                            load: match &att.stencil_load_op {
                                LoadOp::Clear(_) => wgpu::LoadOp::Clear(att.stencil_clear_value),
                                LoadOp::Load => wgpu::LoadOp::Load,
                            },
                            store: Self::convert_store_op(att.stencil_store_op),
                        },
                    );
                    Some(wgpu::RenderPassDepthStencilAttachment {
                        view,
                        depth_ops: Some(wgpu::Operations {
                            load: match &att.depth_load_op {
                                LoadOp::Clear(_) => wgpu::LoadOp::Clear(att.depth_clear_value),
                                LoadOp::Load => wgpu::LoadOp::Load,
                            },
                            store: Self::convert_store_op(att.depth_store_op),
                        }),
                        stencil_ops,
                    })
                });

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: pending.descriptor.label.as_deref(),
                color_attachments: &color_attachments,
                depth_stencil_attachment: depth_attachment,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            let bundles: Vec<&wgpu::RenderBundle> = pending
                .bundles
                .iter()
                .filter_map(|handle| self.render_bundles.get(&handle.0))
                .collect();
            pass.execute_bundles(bundles);
        }
    }

    fn finish_command_encoder(&mut self) -> BackendResult<CommandBufferHandle> {
        let encoder = self
            .encoder
            .take()
            .ok_or_else(|| BackendError::PipelineCreationFailed("no open command encoder".into()))?;
        let id = self.fresh_id();
        self.command_buffers.insert(id, encoder.finish());
        Ok(CommandBufferHandle(id))
    }

    fn submit(&mut self, buffers: Vec<CommandBufferHandle>) -> BackendResult<()> {
        let queue = self.queue.as_ref().ok_or(BackendError::DeviceNotReady)?;
        let buffers: Vec<wgpu::CommandBuffer> = buffers
            .into_iter()
            .filter_map(|handle| self.command_buffers.remove(&handle.0))
            .collect();
        queue.submit(buffers);
        Ok(())
    }
}
