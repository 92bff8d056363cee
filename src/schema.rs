//! Node kind enumeration and the schema table.
//!
//! The schema supplies, per kind, the default property values and the
//! parent-legality rule checked on every structural edit. The kind set is a
//! closed enum, so exhaustiveness is enforced by `match`; the test at the
//! bottom iterates [`NodeKind::ALL`] as a belt-and-suspenders check.

use crate::node::Props;

/// Every node kind understood by the scene tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Root,
    Limits,
    Feature,
    SwapChain,
    Command,
    RenderPass,
    ColorAttachment,
    DepthStencilAttachment,
    RenderBundle,
    Texture,
    RenderPipeline,
    ColorTargetState,
    MultisampleState,
    DepthStencilState,
    ShaderModule,
    BindGroupLayout,
    VertexBufferLayout,
    Draw,
    BindBuffer,
    VertexAttribute,
    VertexBuffer,
    BindGroup,
    UniformBuffer,
}

impl NodeKind {
    pub const ALL: [NodeKind; 23] = [
        NodeKind::Root,
        NodeKind::Limits,
        NodeKind::Feature,
        NodeKind::SwapChain,
        NodeKind::Command,
        NodeKind::RenderPass,
        NodeKind::ColorAttachment,
        NodeKind::DepthStencilAttachment,
        NodeKind::RenderBundle,
        NodeKind::Texture,
        NodeKind::RenderPipeline,
        NodeKind::ColorTargetState,
        NodeKind::MultisampleState,
        NodeKind::DepthStencilState,
        NodeKind::ShaderModule,
        NodeKind::BindGroupLayout,
        NodeKind::VertexBufferLayout,
        NodeKind::Draw,
        NodeKind::BindBuffer,
        NodeKind::VertexAttribute,
        NodeKind::VertexBuffer,
        NodeKind::BindGroup,
        NodeKind::UniformBuffer,
    ];
}

/// The parent kinds `child` may legally be attached under.
///
/// `Root` returns an empty slice: it is never a child.
pub fn allowed_parents(child: NodeKind) -> &'static [NodeKind] {
    match child {
        NodeKind::Root => &[],
        NodeKind::Limits => &[NodeKind::Root],
        NodeKind::Feature => &[NodeKind::Root],
        NodeKind::SwapChain => &[NodeKind::Root],
        NodeKind::Command => &[NodeKind::Root],
        NodeKind::RenderPass => &[NodeKind::Command],
        NodeKind::ColorAttachment => &[NodeKind::RenderPass],
        NodeKind::DepthStencilAttachment => &[NodeKind::RenderPass],
        NodeKind::RenderBundle => &[NodeKind::RenderPass],
        NodeKind::Texture => &[NodeKind::ColorAttachment, NodeKind::DepthStencilAttachment],
        NodeKind::RenderPipeline => &[NodeKind::RenderBundle],
        NodeKind::ColorTargetState => &[NodeKind::RenderPipeline],
        NodeKind::MultisampleState => &[NodeKind::RenderPipeline],
        NodeKind::DepthStencilState => &[NodeKind::RenderPipeline],
        NodeKind::ShaderModule => &[NodeKind::RenderPipeline],
        NodeKind::BindGroupLayout => &[NodeKind::RenderPipeline],
        NodeKind::VertexBufferLayout => &[NodeKind::RenderPipeline],
        NodeKind::Draw => &[NodeKind::RenderPipeline],
        NodeKind::BindBuffer => &[NodeKind::BindGroupLayout],
        NodeKind::VertexAttribute => &[NodeKind::VertexBufferLayout],
        NodeKind::VertexBuffer => &[NodeKind::Draw],
        NodeKind::BindGroup => &[NodeKind::Draw],
        NodeKind::UniformBuffer => &[NodeKind::BindGroup],
    }
}

/// Whether `parent` may hold a child of kind `child`.
pub fn parent_is_legal(child: NodeKind, parent: NodeKind) -> bool {
    allowed_parents(child).contains(&parent)
}

/// Default authored properties for a kind.
pub fn default_props(kind: NodeKind) -> Props {
    match kind {
        NodeKind::Root => Props::Root,
        NodeKind::Limits => Props::Limits(Default::default()),
        NodeKind::Feature => Props::Feature(Default::default()),
        NodeKind::SwapChain => Props::SwapChain(Default::default()),
        NodeKind::Command => Props::Command(Default::default()),
        NodeKind::RenderPass => Props::RenderPass,
        NodeKind::ColorAttachment => Props::ColorAttachment(Default::default()),
        NodeKind::DepthStencilAttachment => Props::DepthStencilAttachment(Default::default()),
        NodeKind::RenderBundle => Props::RenderBundle,
        NodeKind::Texture => Props::Texture(Default::default()),
        NodeKind::RenderPipeline => Props::RenderPipeline(Default::default()),
        NodeKind::ColorTargetState => Props::ColorTargetState(Default::default()),
        NodeKind::MultisampleState => Props::MultisampleState(Default::default()),
        NodeKind::DepthStencilState => Props::DepthStencilState(Default::default()),
        NodeKind::ShaderModule => Props::ShaderModule(Default::default()),
        NodeKind::BindGroupLayout => Props::BindGroupLayout,
        NodeKind::VertexBufferLayout => Props::VertexBufferLayout(Default::default()),
        NodeKind::Draw => Props::Draw(Default::default()),
        NodeKind::BindBuffer => Props::BindBuffer(Default::default()),
        NodeKind::VertexAttribute => Props::VertexAttribute(Default::default()),
        NodeKind::VertexBuffer => Props::VertexBuffer(Default::default()),
        NodeKind::BindGroup => Props::BindGroup,
        NodeKind::UniformBuffer => Props::UniformBuffer(Default::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_has_defaults_and_a_parent_rule() {
        for kind in NodeKind::ALL {
            let props = default_props(kind);
            assert_eq!(props.kind(), kind, "defaults for {kind:?} carry the wrong kind");
            let parents = allowed_parents(kind);
            if kind == NodeKind::Root {
                assert!(parents.is_empty());
            } else {
                assert!(!parents.is_empty(), "{kind:?} has no legal parent");
            }
        }
    }

    #[test]
    fn test_all_has_no_duplicates() {
        for (i, a) in NodeKind::ALL.iter().enumerate() {
            for b in &NodeKind::ALL[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_texture_attaches_under_both_attachment_kinds() {
        assert!(parent_is_legal(NodeKind::Texture, NodeKind::ColorAttachment));
        assert!(parent_is_legal(
            NodeKind::Texture,
            NodeKind::DepthStencilAttachment
        ));
        assert!(!parent_is_legal(NodeKind::Texture, NodeKind::RenderPass));
    }

    #[test]
    fn test_root_is_never_a_child() {
        for kind in NodeKind::ALL {
            assert!(!parent_is_legal(NodeKind::Root, kind));
        }
    }
}
