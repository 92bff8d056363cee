//! Vertex buffer layout resolution.

use crate::backend::traits::{VertexAttribute, VertexBufferLayout};
use crate::error::{SceneError, SceneResult};
use crate::node::NodeState;
use crate::schema::NodeKind;
use crate::tree::{NodeId, SceneTree};

/// Resolve a VertexBufferLayout node: pack attribute offsets sequentially
/// by the byte size of the preceding sibling's format (unless explicit),
/// assign sequential shader locations (unless explicit), and compute the
/// array stride as the sum of attribute sizes (unless explicit).
pub(crate) fn resolve_vertex_layout(
    tree: &mut SceneTree,
    id: NodeId,
) -> SceneResult<VertexBufferLayout> {
    if let NodeState::VertexBufferLayout(s) = tree.state(id) {
        if let Some(resolved) = &s.resolved {
            return Ok(resolved.clone());
        }
    } else {
        return Err(SceneError::InvalidProps("expected a VertexBufferLayout node"));
    }

    let props = match tree.state(id) {
        NodeState::VertexBufferLayout(s) => s.props.clone(),
        _ => unreachable!("checked above"),
    };

    let mut attributes = Vec::new();
    let mut packed_offset = 0u64;
    let mut next_location = 0u32;
    let mut size_sum = 0u64;
    for child in tree.children_of_kind(id, NodeKind::VertexAttribute) {
        let attr = match tree.state(child) {
            NodeState::VertexAttribute(p) => p.clone(),
            _ => continue,
        };
        let offset = attr.offset.unwrap_or(packed_offset);
        let location = attr.shader_location.unwrap_or(next_location);
        attributes.push(VertexAttribute {
            location,
            format: attr.format,
            offset,
        });
        packed_offset = offset + attr.format.size();
        next_location = location + 1;
        size_sum += attr.format.size();
    }

    let layout = VertexBufferLayout {
        array_stride: props.array_stride.unwrap_or(size_sum),
        step_mode: props.step_mode,
        attributes,
    };

    if let NodeState::VertexBufferLayout(s) = tree.state_mut(id) {
        s.resolved = Some(layout.clone());
    }
    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::types::{VertexFormat, VertexStepMode};
    use crate::node::{Props, VertexAttributeProps, VertexBufferLayoutProps};

    fn attr(format: VertexFormat) -> Props {
        Props::VertexAttribute(VertexAttributeProps {
            format,
            offset: None,
            shader_location: None,
        })
    }

    #[test]
    fn test_offsets_pack_sequentially() {
        let mut tree = SceneTree::new();
        let layout = tree.create_node(Props::VertexBufferLayout(Default::default()));
        let position = tree.create_node(attr(VertexFormat::Float32x3));
        let uv = tree.create_node(attr(VertexFormat::Float32x2));
        tree.append_child(layout, position).unwrap();
        tree.append_child(layout, uv).unwrap();

        let resolved = resolve_vertex_layout(&mut tree, layout).unwrap();
        assert_eq!(resolved.array_stride, 20);
        assert_eq!(resolved.attributes.len(), 2);
        assert_eq!(resolved.attributes[0].offset, 0);
        assert_eq!(resolved.attributes[0].location, 0);
        assert_eq!(resolved.attributes[1].offset, 12);
        assert_eq!(resolved.attributes[1].location, 1);
    }

    #[test]
    fn test_explicit_fields_are_respected() {
        let mut tree = SceneTree::new();
        let layout = tree.create_node(Props::VertexBufferLayout(VertexBufferLayoutProps {
            array_stride: Some(32),
            step_mode: VertexStepMode::Instance,
        }));
        let a = tree.create_node(Props::VertexAttribute(VertexAttributeProps {
            format: VertexFormat::Float32x4,
            offset: Some(16),
            shader_location: Some(5),
        }));
        let b = tree.create_node(attr(VertexFormat::Float32));
        tree.append_child(layout, a).unwrap();
        tree.append_child(layout, b).unwrap();

        let resolved = resolve_vertex_layout(&mut tree, layout).unwrap();
        assert_eq!(resolved.array_stride, 32);
        assert_eq!(resolved.step_mode, VertexStepMode::Instance);
        assert_eq!(resolved.attributes[0].offset, 16);
        assert_eq!(resolved.attributes[0].location, 5);
        // Packs after the explicit sibling, sequential location follows it.
        assert_eq!(resolved.attributes[1].offset, 32);
        assert_eq!(resolved.attributes[1].location, 6);
    }

    #[test]
    fn test_resolution_is_cached_until_attribute_edit() {
        let mut tree = SceneTree::new();
        let layout = tree.create_node(Props::VertexBufferLayout(Default::default()));
        let a = tree.create_node(attr(VertexFormat::Float32x2));
        tree.append_child(layout, a).unwrap();

        let first = resolve_vertex_layout(&mut tree, layout).unwrap();
        let second = resolve_vertex_layout(&mut tree, layout).unwrap();
        assert_eq!(first, second);

        // Attribute edit clears the cache.
        tree.set_props(
            a,
            Props::VertexAttribute(VertexAttributeProps {
                format: VertexFormat::Float32x4,
                offset: None,
                shader_location: None,
            }),
        )
        .unwrap();
        let third = resolve_vertex_layout(&mut tree, layout).unwrap();
        assert_eq!(third.array_stride, 16);
    }
}
