//! Render-bundle assembly.

use crate::backend::traits::{GpuBackend, RenderBundleDescriptor, RenderBundleHandle};
use crate::error::SceneResult;
use crate::node::NodeState;
use crate::schema::NodeKind;
use crate::tree::{NodeId, SceneTree};

use super::draw::resolve_draw;
use super::pipeline::resolve_pipeline;

/// Resolve a RenderBundle node against its owning pass.
///
/// An unchanged bundle is replayed every frame with zero re-encoding cost:
/// re-recording happens only when there is no cached bundle or the pass's
/// combined attachment format hash differs from the one the bundle was last
/// recorded against. Dirty draws (and draws invalidated by a bind-group
/// layout rebuild) are re-resolved during the re-record.
pub(crate) fn resolve_render_bundle<B: GpuBackend>(
    tree: &mut SceneTree,
    backend: &mut B,
    bundle: NodeId,
    pass: NodeId,
) -> SceneResult<RenderBundleHandle> {
    let (color_formats, depth_stencil_format, pass_hash) = match tree.state(pass) {
        NodeState::RenderPass(s) => (
            s.color_formats.clone(),
            s.depth_stencil_format,
            s.format_hash,
        ),
        _ => {
            return Err(crate::error::SceneError::InvalidProps(
                "expected a RenderPass node",
            ))
        }
    };

    let cached = match tree.state(bundle) {
        NodeState::RenderBundle(s) => {
            if let Some(handle) = s.bundle {
                if s.format_hash == pass_hash {
                    return Ok(handle);
                }
            }
            s.bundle
        }
        _ => {
            return Err(crate::error::SceneError::InvalidProps(
                "expected a RenderBundle node",
            ))
        }
    };
    if let Some(old) = cached {
        tree.retired.bundles.push(old);
        if let NodeState::RenderBundle(s) = tree.state_mut(bundle) {
            s.bundle = None;
        }
    }

    // Resolve pipelines and dirty draws before opening the encoder, so the
    // recording below is a pure replay of cached state.
    struct DrawRecord {
        vertex_buffers: Vec<(u32, crate::backend::traits::BufferHandle)>,
        bind_groups: Vec<(u32, crate::backend::traits::BindGroupHandle)>,
        vertices: std::ops::Range<u32>,
        instances: std::ops::Range<u32>,
    }
    let mut recordings = Vec::new();
    let mut sample_count = 1;
    for pipeline in tree.children_of_kind(bundle, NodeKind::RenderPipeline) {
        let resolved = resolve_pipeline(
            tree,
            backend,
            pipeline,
            &color_formats,
            depth_stencil_format,
        )?;
        sample_count = sample_count.max(resolved.sample_count);

        let mut draws = Vec::new();
        for draw in &resolved.draws {
            let dirty = matches!(tree.state(*draw), NodeState::Draw(s) if s.dirty);
            if dirty {
                resolve_draw(tree, backend, *draw, &resolved.bind_group_layouts)?;
            }
            if let NodeState::Draw(s) = tree.state(*draw) {
                draws.push(DrawRecord {
                    vertex_buffers: s.vertex_buffers.clone(),
                    bind_groups: s.bind_groups.clone(),
                    vertices: s.props.first_vertex..s.props.first_vertex + s.props.vertex_count,
                    instances: s.props.first_instance
                        ..s.props.first_instance + s.props.instance_count,
                });
            }
        }
        recordings.push((resolved.handle, draws));
    }

    backend.begin_render_bundle(&RenderBundleDescriptor {
        label: None,
        color_formats,
        depth_stencil_format,
        sample_count,
    });
    for (pipeline, draws) in &recordings {
        backend.bundle_set_pipeline(*pipeline);
        for draw in draws {
            for (slot, buffer) in &draw.vertex_buffers {
                backend.bundle_set_vertex_buffer(*slot, *buffer);
            }
            for (group, bind_group) in &draw.bind_groups {
                backend.bundle_set_bind_group(*group, *bind_group);
            }
            backend.bundle_draw(draw.vertices.clone(), draw.instances.clone());
        }
    }
    let handle = backend.finish_render_bundle()?;
    log::debug!(
        "recorded render bundle with {} pipeline(s)",
        recordings.len()
    );

    if let NodeState::RenderBundle(s) = tree.state_mut(bundle) {
        s.bundle = Some(handle);
        s.format_hash = pass_hash;
    }
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::traits::DeviceOptions;
    use crate::backend::types::TextureFormat;
    use crate::hash;
    use crate::node::{DrawProps, Props, ShaderModuleProps};
    use std::sync::Arc;

    fn ready_backend() -> DummyBackend {
        let mut backend = DummyBackend::new();
        backend.begin_acquire(&DeviceOptions::default());
        let _ = backend.poll_acquire();
        backend
    }

    fn pass_with_format(tree: &mut SceneTree, format: TextureFormat) -> NodeId {
        let pass = tree.create_node(Props::RenderPass);
        if let NodeState::RenderPass(s) = tree.state_mut(pass) {
            s.color_formats = vec![format];
            s.depth_stencil_format = None;
            s.format_hash = hash::hash_format(format.id());
        }
        pass
    }

    fn bundle_with_one_draw(tree: &mut SceneTree) -> NodeId {
        let bundle = tree.create_node(Props::RenderBundle);
        let pipeline = tree.create_node(Props::RenderPipeline(Default::default()));
        let shader = tree.create_node(Props::ShaderModule(ShaderModuleProps {
            source: Arc::from("@vertex fn vs() {} @fragment fn fs() {}"),
            vertex_entry_point: Some("vs".into()),
            fragment_entry_point: Some("fs".into()),
        }));
        let draw = tree.create_node(Props::Draw(DrawProps {
            vertex_count: 6,
            ..Default::default()
        }));
        tree.append_child(bundle, pipeline).unwrap();
        tree.append_child(pipeline, shader).unwrap();
        tree.append_child(pipeline, draw).unwrap();
        bundle
    }

    #[test]
    fn test_bundle_reused_while_formats_unchanged() {
        let mut tree = SceneTree::new();
        let mut backend = ready_backend();
        let pass = pass_with_format(&mut tree, TextureFormat::Bgra8UnormSrgb);
        let bundle = bundle_with_one_draw(&mut tree);

        let first = resolve_render_bundle(&mut tree, &mut backend, bundle, pass).unwrap();
        let second = resolve_render_bundle(&mut tree, &mut backend, bundle, pass).unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.stats().render_bundles_created, 1);
    }

    #[test]
    fn test_format_change_forces_re_record() {
        let mut tree = SceneTree::new();
        let mut backend = ready_backend();
        let pass = pass_with_format(&mut tree, TextureFormat::Bgra8UnormSrgb);
        let bundle = bundle_with_one_draw(&mut tree);

        let first = resolve_render_bundle(&mut tree, &mut backend, bundle, pass).unwrap();

        // The pass resolves to a different attachment format next frame.
        if let NodeState::RenderPass(s) = tree.state_mut(pass) {
            s.color_formats = vec![TextureFormat::Rgba16Float];
            s.format_hash = hash::hash_format(TextureFormat::Rgba16Float.id());
        }
        // The pipeline's color target no longer matches its compiled form.
        let second = resolve_render_bundle(&mut tree, &mut backend, bundle, pass).unwrap();

        assert_ne!(first, second);
        assert_eq!(backend.stats().render_bundles_created, 2);
        assert_eq!(tree.retired.bundles, vec![first]);
    }

    #[test]
    fn test_structural_edit_forces_re_record() {
        let mut tree = SceneTree::new();
        let mut backend = ready_backend();
        let pass = pass_with_format(&mut tree, TextureFormat::Bgra8UnormSrgb);
        let bundle = bundle_with_one_draw(&mut tree);

        let first = resolve_render_bundle(&mut tree, &mut backend, bundle, pass).unwrap();

        // Adding a second pipeline clears the bundle handle.
        let pipeline = tree.create_node(Props::RenderPipeline(Default::default()));
        let shader = tree.create_node(Props::ShaderModule(ShaderModuleProps {
            source: Arc::from("@vertex fn vs2() {} @fragment fn fs2() {}"),
            vertex_entry_point: Some("vs2".into()),
            fragment_entry_point: Some("fs2".into()),
        }));
        tree.append_child(pipeline, shader).unwrap();
        tree.append_child(bundle, pipeline).unwrap();

        let second = resolve_render_bundle(&mut tree, &mut backend, bundle, pass).unwrap();
        assert_ne!(first, second);
        assert_eq!(backend.stats().render_bundles_created, 2);
    }
}
