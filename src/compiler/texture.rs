//! Swap-chain and texture resolution.

use crate::backend::traits::{GpuBackend, TextureViewHandle};
use crate::backend::types::{
    Extent3d, FormatRequest, TextureDescriptor, TextureFormat, TextureUsage,
};
use crate::error::{SceneError, SceneResult};
use crate::hash::{self, FormatHash};
use crate::node::NodeState;
use crate::schema::NodeKind;
use crate::tree::{NodeId, SceneTree};

/// A resolved attachment: the view to render into this frame, plus the
/// format fingerprint bundles compare against.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedAttachment {
    pub view: TextureViewHandle,
    pub format: TextureFormat,
    pub format_hash: FormatHash,
}

/// Engine-owned swap-chain cache: the configured surface is reused until
/// invalidated, but the frame view is re-fetched every frame.
#[derive(Debug, Default)]
pub(crate) struct SwapChainSlot {
    pub configured: bool,
    pub format: Option<TextureFormat>,
    pub format_hash: FormatHash,
}

/// Engine-owned default depth/stencil attachment, supplied to passes whose
/// DepthStencilAttachment has no Texture child. Full-screen; rebuilt on
/// canvas resize.
#[derive(Debug, Default)]
pub(crate) struct DefaultDepthSlot {
    pub texture: Option<crate::backend::traits::TextureHandle>,
    pub view: Option<TextureViewHandle>,
}

pub(crate) const DEFAULT_DEPTH_FORMAT: TextureFormat = TextureFormat::Depth24PlusStencil8;

/// Resolve the presented surface: configure it if needed (mapping
/// `Preferred` through the adapter-reported format), recompute the format
/// hash only when the format actually changed, and always re-fetch the
/// current frame's view.
pub(crate) fn resolve_swap_chain<B: GpuBackend>(
    tree: &mut SceneTree,
    backend: &mut B,
    slot: &mut SwapChainSlot,
    canvas: (u32, u32),
) -> SceneResult<ResolvedAttachment> {
    if !slot.configured || tree.swap_chain_invalid() {
        let requested = tree
            .children_of_kind(tree.root(), NodeKind::SwapChain)
            .first()
            .map(|&id| match tree.state(id) {
                NodeState::SwapChain(s) => s.props.format,
                _ => FormatRequest::Preferred,
            })
            .unwrap_or(FormatRequest::Preferred);

        let resolved = backend.configure_surface(requested, canvas.0, canvas.1)?;
        if slot.format != Some(resolved) {
            slot.format_hash = hash::hash_format(resolved.id());
            slot.format = Some(resolved);
            log::debug!("swap chain configured as {resolved:?}");
        }
        slot.configured = true;
        tree.clear_swap_chain_invalid();
    }

    let format = slot
        .format
        .ok_or(SceneError::InvalidProps("swap-chain format unresolved"))?;
    let view = backend.current_frame_view()?;
    Ok(ResolvedAttachment {
        view,
        format,
        format_hash: slot.format_hash,
    })
}

/// Resolve a Texture node into an attachment view. Idempotent while the
/// cached view is valid; full-screen textures re-subscribe to the resize
/// event each time they are (re)created.
pub(crate) fn resolve_texture<B: GpuBackend>(
    tree: &mut SceneTree,
    backend: &mut B,
    id: NodeId,
    canvas: (u32, u32),
) -> SceneResult<ResolvedAttachment> {
    let (props, cached_view, hashed_format, format_hash) = match tree.state(id) {
        NodeState::Texture(s) => (
            s.props.clone(),
            s.view,
            s.hashed_format,
            s.format_hash,
        ),
        _ => return Err(SceneError::InvalidProps("expected a Texture node")),
    };

    if let Some(view) = cached_view {
        return Ok(ResolvedAttachment {
            view,
            format: props.format,
            format_hash,
        });
    }

    let size = if props.full_screen {
        Extent3d::new_2d(canvas.0.max(1), canvas.1.max(1))
    } else {
        props
            .size
            .ok_or(SceneError::InvalidProps(
                "texture needs an explicit size or full_screen",
            ))?
    };

    let texture = backend.create_texture(&TextureDescriptor {
        label: None,
        size,
        mip_levels: 1,
        sample_count: 1,
        format: props.format,
        usage: TextureUsage::RENDER_ATTACHMENT,
    })?;
    let view = backend.create_texture_view(texture)?;
    log::debug!(
        "created {}x{} texture attachment ({:?})",
        size.width,
        size.height,
        props.format
    );

    let new_hash = if hashed_format != Some(props.format) {
        hash::hash_format(props.format.id())
    } else {
        format_hash
    };

    if let NodeState::Texture(s) = tree.state_mut(id) {
        s.texture = Some(texture);
        s.view = Some(view);
        s.hashed_format = Some(props.format);
        s.format_hash = new_hash;
    }
    if props.full_screen {
        tree.resize.subscribe(id);
    }

    Ok(ResolvedAttachment {
        view,
        format: props.format,
        format_hash: new_hash,
    })
}

/// Resolve the engine's default full-screen depth/stencil attachment.
pub(crate) fn resolve_default_depth<B: GpuBackend>(
    backend: &mut B,
    slot: &mut DefaultDepthSlot,
    canvas: (u32, u32),
) -> SceneResult<ResolvedAttachment> {
    if slot.view.is_none() {
        let size = Extent3d::new_2d(canvas.0.max(1), canvas.1.max(1));
        let texture = backend.create_texture(&TextureDescriptor {
            label: Some("default depth/stencil".to_string()),
            size,
            mip_levels: 1,
            sample_count: 1,
            format: DEFAULT_DEPTH_FORMAT,
            usage: TextureUsage::RENDER_ATTACHMENT,
        })?;
        let view = backend.create_texture_view(texture)?;
        log::debug!(
            "created default depth/stencil of {}x{}",
            size.width,
            size.height
        );
        slot.texture = Some(texture);
        slot.view = Some(view);
    }
    let view = slot
        .view
        .ok_or(SceneError::InvalidProps("default depth view unresolved"))?;
    Ok(ResolvedAttachment {
        view,
        format: DEFAULT_DEPTH_FORMAT,
        format_hash: hash::hash_format(DEFAULT_DEPTH_FORMAT.id()),
    })
}
