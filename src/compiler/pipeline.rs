//! Pipeline and bind-group-layout compilation.

use crate::backend::traits::{
    BindGroupLayoutEntry, BindGroupLayoutHandle, ColorTargetState, ColorWrites,
    CompilationMessage, DepthStencilState, GpuBackend, MultisampleState,
    RenderPipelineDescriptor, RenderPipelineHandle, ShaderModuleHandle, VertexBufferLayout,
};
use crate::backend::types::TextureFormat;
use crate::error::{SceneError, SceneResult};
use crate::node::{MultisampleStateProps, NodeState};
use crate::schema::NodeKind;
use crate::tree::{NodeId, SceneTree};

use super::vertex_layout::resolve_vertex_layout;

/// A compiled pipeline plus everything the bundle assembler needs to replay
/// its draws.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedPipeline {
    pub handle: RenderPipelineHandle,
    pub draws: Vec<NodeId>,
    pub bind_group_layouts: Vec<BindGroupLayoutHandle>,
    pub sample_count: u32,
}

/// Pick the next unused index: explicit indices are honored, implicit ones
/// take the smallest index not yet used, in declaration order.
pub(crate) fn assign_index(explicit: Option<u32>, used: &mut Vec<u32>) -> u32 {
    let index = match explicit {
        Some(index) => index,
        None => {
            let mut candidate = 0;
            while used.contains(&candidate) {
                candidate += 1;
            }
            candidate
        }
    };
    if !used.contains(&index) {
        used.push(index);
    }
    index
}

/// Resolve a BindGroupLayout node. Returns the handle and whether it was
/// (re)computed by this call.
pub(crate) fn resolve_bind_group_layout<B: GpuBackend>(
    tree: &mut SceneTree,
    backend: &mut B,
    id: NodeId,
) -> SceneResult<(BindGroupLayoutHandle, bool)> {
    if let NodeState::BindGroupLayout(s) = tree.state(id) {
        if let Some(handle) = s.layout {
            return Ok((handle, false));
        }
    } else {
        return Err(SceneError::InvalidProps("expected a BindGroupLayout node"));
    }

    let mut entries = Vec::new();
    let mut used = Vec::new();
    for child in tree.children_of_kind(id, NodeKind::BindBuffer) {
        let props = match tree.state(child) {
            NodeState::BindBuffer(p) => p.clone(),
            _ => continue,
        };
        let binding = assign_index(props.binding, &mut used);
        entries.push(BindGroupLayoutEntry {
            binding,
            visibility: props.visibility,
            kind: props.kind,
        });
    }

    let handle = backend.create_bind_group_layout(&entries)?;
    if let NodeState::BindGroupLayout(s) = tree.state_mut(id) {
        s.layout = Some(handle);
    }
    Ok((handle, true))
}

fn multisample_props(tree: &SceneTree, pipeline: NodeId) -> MultisampleStateProps {
    tree.children_of_kind(pipeline, NodeKind::MultisampleState)
        .first()
        .and_then(|&id| match tree.state(id) {
            NodeState::MultisampleState(p) => Some(p.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

/// Resolve a RenderPipeline node against the owning pass's attachment
/// formats. While the cached handle is valid this only refreshes the cached
/// draw list (if a draw was added or removed); otherwise it performs the
/// full child walk, assembles the complete descriptor, and creates the
/// native pipeline.
pub(crate) fn resolve_pipeline<B: GpuBackend>(
    tree: &mut SceneTree,
    backend: &mut B,
    id: NodeId,
    pass_color_formats: &[TextureFormat],
    depth_stencil_format: Option<TextureFormat>,
) -> SceneResult<ResolvedPipeline> {
    let (cached_handle, draws_valid, cached_draws, cached_layouts, props) =
        match tree.state(id) {
            NodeState::RenderPipeline(s) => (
                s.pipeline,
                s.draws_valid,
                s.draw_calls.clone(),
                s.bind_group_layouts.clone(),
                s.props.clone(),
            ),
            _ => return Err(SceneError::InvalidProps("expected a RenderPipeline node")),
        };

    if let Some(handle) = cached_handle {
        let draws = if draws_valid {
            cached_draws
        } else {
            let draws = tree.children_of_kind(id, NodeKind::Draw);
            if let NodeState::RenderPipeline(s) = tree.state_mut(id) {
                s.draw_calls = draws.clone();
                s.draws_valid = true;
            }
            draws
        };
        return Ok(ResolvedPipeline {
            handle,
            draws,
            bind_group_layouts: cached_layouts,
            sample_count: multisample_props(tree, id).count,
        });
    }

    // Walk the children once, bucketing by kind.
    let mut shader_ids = Vec::new();
    let mut target_ids = Vec::new();
    let mut layout_ids = Vec::new();
    let mut bgl_ids = Vec::new();
    let mut ds_state_id = None;
    let mut draw_ids = Vec::new();
    for child in tree.child_ids(id) {
        match tree.kind(child) {
            NodeKind::ShaderModule => shader_ids.push(child),
            NodeKind::ColorTargetState => target_ids.push(child),
            NodeKind::VertexBufferLayout => layout_ids.push(child),
            NodeKind::BindGroupLayout => bgl_ids.push(child),
            NodeKind::DepthStencilState => ds_state_id = ds_state_id.or(Some(child)),
            NodeKind::Draw => draw_ids.push(child),
            _ => {}
        }
    }

    // Vertex buffer layouts (4.6).
    let mut vertex_layouts: Vec<VertexBufferLayout> = Vec::new();
    for layout in &layout_ids {
        vertex_layouts.push(resolve_vertex_layout(tree, *layout)?);
    }

    // Bind group layouts (4.5.1), in declaration order = group index order.
    let mut bgls = Vec::new();
    let mut bgls_recomputed = false;
    for bgl in &bgl_ids {
        let (handle, recomputed) = resolve_bind_group_layout(tree, backend, *bgl)?;
        bgls.push(handle);
        bgls_recomputed |= recomputed;
    }

    // Shader modules, pool-allocated by source text.
    struct Stage {
        module: ShaderModuleHandle,
        vertex_entry: Option<String>,
        fragment_entry: Option<String>,
    }
    let mut stages = Vec::new();
    for shader in &shader_ids {
        let (source, cached_module, vertex_entry, fragment_entry) = match tree.state(*shader) {
            NodeState::ShaderModule(s) => (
                s.props.source.clone(),
                s.module,
                s.props.vertex_entry_point.clone(),
                s.props.fragment_entry_point.clone(),
            ),
            _ => continue,
        };
        let module = match cached_module {
            Some(module) => module,
            None => {
                let mut on_diagnostics = |messages: &[CompilationMessage]| {
                    for message in messages {
                        log::warn!("shader compilation: {}", message.message);
                    }
                };
                let module = tree.shaders.alloc(
                    &source,
                    |src| backend.create_shader_module(src),
                    Some(&mut on_diagnostics),
                )?;
                if let NodeState::ShaderModule(s) = tree.state_mut(*shader) {
                    s.module = Some(module);
                }
                module
            }
        };
        stages.push(Stage {
            module,
            vertex_entry,
            fragment_entry,
        });
    }

    // The vertex shader is the module exposing a vertex entry point.
    let (vertex_module, vertex_entry_point) = stages
        .iter()
        .find_map(|s| s.vertex_entry.clone().map(|e| (s.module, e)))
        .ok_or(SceneError::InvalidProps("pipeline has no vertex entry point"))?;

    // Color targets: explicit ColorTargetState children resolve missing
    // formats against the pass; with no children, one default target per
    // pass color attachment.
    let mut color_targets = Vec::new();
    if target_ids.is_empty() {
        for format in pass_color_formats {
            color_targets.push(ColorTargetState {
                format: *format,
                blend: None,
                write_mask: ColorWrites::ALL,
            });
        }
    } else {
        for (index, target) in target_ids.iter().enumerate() {
            let props = match tree.state(*target) {
                NodeState::ColorTargetState(p) => p.clone(),
                _ => continue,
            };
            let format = match props.format.or_else(|| pass_color_formats.get(index).copied()) {
                Some(format) => format,
                None => {
                    return Err(SceneError::InvalidProps(
                        "color target has no format and no matching pass attachment",
                    ))
                }
            };
            color_targets.push(ColorTargetState {
                format,
                blend: props.blend,
                write_mask: props.write_mask,
            });
        }
    }

    // The fragment shader (required only when color targets exist) is the
    // module exposing a fragment entry point, possibly the vertex module.
    let (fragment_module, fragment_entry_point) = if color_targets.is_empty() {
        (None, None)
    } else {
        let found = stages
            .iter()
            .find_map(|s| s.fragment_entry.clone().map(|e| (s.module, e)));
        match found {
            Some((module, entry)) => (Some(module), Some(entry)),
            None => {
                return Err(SceneError::InvalidProps(
                    "pipeline has color targets but no fragment entry point",
                ))
            }
        }
    };

    let depth_stencil = depth_stencil_format.map(|format| {
        let ds_props = ds_state_id
            .and_then(|id| match tree.state(id) {
                NodeState::DepthStencilState(p) => Some(p.clone()),
                _ => None,
            })
            .unwrap_or_default();
        DepthStencilState {
            format,
            depth_write_enabled: ds_props.depth_write_enabled,
            depth_compare: ds_props.depth_compare,
        }
    });

    let ms_props = multisample_props(tree, id);
    let multisample = MultisampleState {
        count: ms_props.count,
        mask: ms_props.mask,
        alpha_to_coverage_enabled: ms_props.alpha_to_coverage_enabled,
    };

    // Omit the pipeline layout entirely when there are no bind group
    // layouts.
    let pipeline_layout = if bgls.is_empty() {
        None
    } else {
        Some(backend.create_pipeline_layout(&bgls)?)
    };

    let handle = backend.create_render_pipeline(&RenderPipelineDescriptor {
        label: None,
        layout: pipeline_layout,
        vertex_module,
        vertex_entry_point,
        fragment_module,
        fragment_entry_point,
        vertex_layouts,
        color_targets,
        depth_stencil,
        multisample,
        primitive_topology: props.topology,
        front_face: props.front_face,
        cull_mode: props.cull_mode,
    })?;
    log::debug!("compiled render pipeline with {} draw(s)", draw_ids.len());

    // Resolved bind groups depend on layout identity.
    if bgls_recomputed {
        for draw in &draw_ids {
            tree.mark_draw_dirty(*draw);
        }
    }

    if let NodeState::RenderPipeline(s) = tree.state_mut(id) {
        s.pipeline = Some(handle);
        s.pipeline_layout = pipeline_layout;
        s.bind_group_layouts = bgls.clone();
        s.draw_calls = draw_ids.clone();
        s.draws_valid = true;
    }

    Ok(ResolvedPipeline {
        handle,
        draws: draw_ids,
        bind_group_layouts: bgls,
        sample_count: ms_props.count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::traits::DeviceOptions;
    use crate::node::{Props, ShaderModuleProps};
    use std::sync::Arc;

    fn ready_backend() -> DummyBackend {
        let mut backend = DummyBackend::new();
        backend.begin_acquire(&DeviceOptions::default());
        let _ = backend.poll_acquire();
        backend
    }

    fn shader_both_entries() -> Props {
        Props::ShaderModule(ShaderModuleProps {
            source: Arc::from("@vertex fn vs() {} @fragment fn fs() {}"),
            vertex_entry_point: Some("vs".into()),
            fragment_entry_point: Some("fs".into()),
        })
    }

    #[test]
    fn test_assign_index_skips_used() {
        let mut used = vec![1];
        assert_eq!(assign_index(None, &mut used), 0);
        assert_eq!(assign_index(None, &mut used), 2);
        assert_eq!(assign_index(Some(7), &mut used), 7);
        assert_eq!(assign_index(None, &mut used), 3);
    }

    #[test]
    fn test_pipeline_without_vertex_entry_fails() {
        let mut tree = SceneTree::new();
        let mut backend = ready_backend();
        let pipeline = tree.create_node(Props::RenderPipeline(Default::default()));
        let shader = tree.create_node(Props::ShaderModule(ShaderModuleProps {
            source: Arc::from("@fragment fn fs() {}"),
            vertex_entry_point: None,
            fragment_entry_point: Some("fs".into()),
        }));
        tree.append_child(pipeline, shader).unwrap();

        let err = resolve_pipeline(
            &mut tree,
            &mut backend,
            pipeline,
            &[crate::backend::types::TextureFormat::Bgra8UnormSrgb],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, SceneError::InvalidProps(_)));
    }

    #[test]
    fn test_resolve_twice_returns_cached_handle() {
        let mut tree = SceneTree::new();
        let mut backend = ready_backend();
        let pipeline = tree.create_node(Props::RenderPipeline(Default::default()));
        let shader = tree.create_node(shader_both_entries());
        tree.append_child(pipeline, shader).unwrap();

        let formats = [crate::backend::types::TextureFormat::Bgra8UnormSrgb];
        let first = resolve_pipeline(&mut tree, &mut backend, pipeline, &formats, None).unwrap();
        let second = resolve_pipeline(&mut tree, &mut backend, pipeline, &formats, None).unwrap();

        assert_eq!(first.handle, second.handle);
        assert_eq!(backend.stats().render_pipelines_created, 1);
        assert_eq!(backend.stats().shader_modules_created, 1);
    }

    #[test]
    fn test_shader_edit_forces_new_handle() {
        let mut tree = SceneTree::new();
        let mut backend = ready_backend();
        let pipeline = tree.create_node(Props::RenderPipeline(Default::default()));
        let shader = tree.create_node(shader_both_entries());
        tree.append_child(pipeline, shader).unwrap();

        let formats = [crate::backend::types::TextureFormat::Bgra8UnormSrgb];
        let first = resolve_pipeline(&mut tree, &mut backend, pipeline, &formats, None).unwrap();

        tree.set_props(
            shader,
            Props::ShaderModule(ShaderModuleProps {
                source: Arc::from("@vertex fn vs() { var x = 1; } @fragment fn fs() {}"),
                vertex_entry_point: Some("vs".into()),
                fragment_entry_point: Some("fs".into()),
            }),
        )
        .unwrap();

        let second = resolve_pipeline(&mut tree, &mut backend, pipeline, &formats, None).unwrap();
        assert_ne!(first.handle, second.handle);
        assert_eq!(backend.stats().render_pipelines_created, 2);
    }

    #[test]
    fn test_no_pipeline_layout_without_bind_group_layouts() {
        let mut tree = SceneTree::new();
        let mut backend = ready_backend();
        let pipeline = tree.create_node(Props::RenderPipeline(Default::default()));
        let shader = tree.create_node(shader_both_entries());
        tree.append_child(pipeline, shader).unwrap();

        let formats = [crate::backend::types::TextureFormat::Bgra8UnormSrgb];
        resolve_pipeline(&mut tree, &mut backend, pipeline, &formats, None).unwrap();
        assert_eq!(backend.stats().pipeline_layouts_created, 0);

        match tree.state(pipeline) {
            NodeState::RenderPipeline(s) => assert!(s.pipeline_layout.is_none()),
            _ => unreachable!(),
        }
    }
}
