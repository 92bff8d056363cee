//! Per-draw binding resolution.

use crate::backend::traits::{BindGroupEntry, BindGroupLayoutHandle, GpuBackend};
use crate::backend::types::BufferUsage;
use crate::error::{SceneError, SceneResult};
use crate::node::NodeState;
use crate::schema::NodeKind;
use crate::tree::{NodeId, SceneTree};

use super::pipeline::assign_index;

/// Re-resolve a draw's vertex-buffer and bind-group argument lists: walk its
/// children in order, assigning each VertexBuffer the next unused slot and
/// each BindGroup the next binding set, allocating backing buffers through
/// the pool and (re)creating native bind groups against the matching
/// bind-group layout. Clears the dirty flag on success.
pub(crate) fn resolve_draw<B: GpuBackend>(
    tree: &mut SceneTree,
    backend: &mut B,
    draw: NodeId,
    bind_group_layouts: &[BindGroupLayoutHandle],
) -> SceneResult<()> {
    let mut vertex_buffers = Vec::new();
    let mut bind_groups = Vec::new();
    let mut used_slots = Vec::new();
    let mut next_group = 0u32;

    for child in tree.child_ids(draw) {
        match tree.kind(child) {
            NodeKind::VertexBuffer => {
                let (data, slot, cached) = match tree.state(child) {
                    NodeState::VertexBuffer(s) => {
                        (s.props.data.clone(), s.props.slot, s.buffer)
                    }
                    _ => continue,
                };
                let slot = assign_index(slot, &mut used_slots);
                let handle = match cached {
                    Some(handle) => handle,
                    None => {
                        let handle = tree.buffers.alloc(BufferUsage::VERTEX, &data, |bytes| {
                            backend.create_buffer_init(BufferUsage::VERTEX, bytes)
                        })?;
                        if let NodeState::VertexBuffer(s) = tree.state_mut(child) {
                            s.buffer = Some(handle);
                        }
                        handle
                    }
                };
                vertex_buffers.push((slot, handle));
            }
            NodeKind::BindGroup => {
                let group_index = next_group;
                next_group += 1;
                let layout = bind_group_layouts
                    .get(group_index as usize)
                    .copied()
                    .ok_or(SceneError::InvalidProps(
                        "draw has more bind groups than the pipeline has layouts",
                    ))?;

                let (cached_group, cached_layout) = match tree.state(child) {
                    NodeState::BindGroup(s) => (s.bind_group, s.layout),
                    _ => continue,
                };
                let handle = match cached_group {
                    Some(handle) if cached_layout == Some(layout) => handle,
                    _ => {
                        if let Some(old) = cached_group {
                            tree.retired.bind_groups.push(old);
                        }
                        // Resolve the group's uniform buffer bindings.
                        let mut entries = Vec::new();
                        let mut used_bindings = Vec::new();
                        for uniform in tree.children_of_kind(child, NodeKind::UniformBuffer) {
                            let (data, binding, cached_buffer) = match tree.state(uniform) {
                                NodeState::UniformBuffer(s) => {
                                    (s.props.data.clone(), s.props.binding, s.buffer)
                                }
                                _ => continue,
                            };
                            let binding = assign_index(binding, &mut used_bindings);
                            let buffer = match cached_buffer {
                                Some(buffer) => buffer,
                                None => {
                                    let buffer = tree.buffers.alloc(
                                        BufferUsage::UNIFORM,
                                        &data,
                                        |bytes| {
                                            backend
                                                .create_buffer_init(BufferUsage::UNIFORM, bytes)
                                        },
                                    )?;
                                    if let NodeState::UniformBuffer(s) = tree.state_mut(uniform)
                                    {
                                        s.buffer = Some(buffer);
                                    }
                                    buffer
                                }
                            };
                            entries.push((
                                binding,
                                BindGroupEntry::Buffer {
                                    buffer,
                                    offset: 0,
                                    size: None,
                                },
                            ));
                        }
                        let handle = backend.create_bind_group(layout, &entries)?;
                        if let NodeState::BindGroup(s) = tree.state_mut(child) {
                            s.bind_group = Some(handle);
                            s.layout = Some(layout);
                        }
                        handle
                    }
                };
                bind_groups.push((group_index, handle));
            }
            _ => {}
        }
    }

    if let NodeState::Draw(s) = tree.state_mut(draw) {
        s.vertex_buffers = vertex_buffers;
        s.bind_groups = bind_groups;
        s.dirty = false;
    }
    Ok(())
}
