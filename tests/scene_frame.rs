//! Whole-frame scenarios against the counting dummy backend.

use std::sync::Arc;

use scenegraph_engine::backend::types::{Extent3d, TextureFormat};
use scenegraph_engine::node::{
    DrawProps, Props, ShaderModuleProps, TextureProps,
};
use scenegraph_engine::{
    DeviceLifecycle, DummyBackend, Engine, NodeId, SceneError,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Scene {
    pass: NodeId,
    color: NodeId,
    bundle: NodeId,
    pipeline: NodeId,
    shader: NodeId,
    draw: NodeId,
}

/// Root -> Command -> RenderPass (one ColorAttachment defaulting to the
/// swap chain) -> RenderBundle -> RenderPipeline (one ShaderModule exposing
/// both entry points, one Draw with vertex-count 6).
fn build_basic_scene(engine: &mut Engine<DummyBackend>) -> Scene {
    let tree = engine.tree_mut();
    let root = tree.root();

    let command = tree.create_node(Props::Command(Default::default()));
    let pass = tree.create_node(Props::RenderPass);
    let color = tree.create_node(Props::ColorAttachment(Default::default()));
    let bundle = tree.create_node(Props::RenderBundle);
    let pipeline = tree.create_node(Props::RenderPipeline(Default::default()));
    let shader = tree.create_node(Props::ShaderModule(ShaderModuleProps {
        source: Arc::from(
            "@vertex fn vs_main() -> @builtin(position) vec4<f32> { return vec4<f32>(0.0); }\n\
             @fragment fn fs_main() -> @location(0) vec4<f32> { return vec4<f32>(1.0); }",
        ),
        vertex_entry_point: Some("vs_main".into()),
        fragment_entry_point: Some("fs_main".into()),
    }));
    let draw = tree.create_node(Props::Draw(DrawProps {
        vertex_count: 6,
        ..Default::default()
    }));

    tree.append_child(root, command).unwrap();
    tree.append_child(command, pass).unwrap();
    tree.append_child(pass, color).unwrap();
    tree.append_child(pass, bundle).unwrap();
    tree.append_child(bundle, pipeline).unwrap();
    tree.append_child(pipeline, shader).unwrap();
    tree.append_child(pipeline, draw).unwrap();

    Scene {
        pass,
        color,
        bundle,
        pipeline,
        shader,
        draw,
    }
}

#[test]
fn first_frame_does_no_gpu_work_then_submits_one_buffer() {
    init_logging();
    let mut backend = DummyBackend::new();
    backend.set_acquire_delay(1);
    let mut engine = Engine::new(backend, 800, 600);
    build_basic_scene(&mut engine);

    assert_eq!(engine.device_state(), DeviceLifecycle::Uninitialized);

    // Device is uninitialized: the frame is dropped, acquisition begins.
    engine.encode_and_submit().unwrap();
    assert_eq!(engine.device_state(), DeviceLifecycle::Acquiring);
    let stats = engine.backend().stats();
    assert_eq!(stats.submits, 0);
    assert_eq!(stats.surface_configures, 0);
    assert_eq!(stats.render_passes_begun, 0);
    assert_eq!(stats.render_pipelines_created, 0);

    // Acquisition resolves: exactly one command buffer, one pass, one
    // executed bundle.
    engine.encode_and_submit().unwrap();
    assert_eq!(engine.device_state(), DeviceLifecycle::Ready);
    let stats = engine.backend().stats();
    assert_eq!(stats.submits, 1);
    assert_eq!(stats.command_buffers_submitted, 1);
    assert_eq!(stats.render_passes_begun, 1);
    assert_eq!(stats.bundles_executed, 1);
    assert_eq!(stats.render_bundles_created, 1);
    assert_eq!(stats.render_pipelines_created, 1);
    assert_eq!(stats.shader_modules_created, 1);
    assert_eq!(stats.frames_presented, 1);
}

#[test]
fn acquisition_is_single_flight() {
    init_logging();
    let mut backend = DummyBackend::new();
    backend.set_acquire_delay(2);
    let mut engine = Engine::new(backend, 800, 600);

    // If every frame restarted acquisition, the countdown would reset and
    // never resolve.
    engine.encode_and_submit().unwrap();
    engine.encode_and_submit().unwrap();
    assert_eq!(engine.device_state(), DeviceLifecycle::Acquiring);
    engine.encode_and_submit().unwrap();
    assert_eq!(engine.device_state(), DeviceLifecycle::Ready);
}

#[test]
fn unchanged_bundle_is_reused_across_frames() {
    init_logging();
    let mut engine = Engine::new(DummyBackend::new(), 800, 600);
    let scene = build_basic_scene(&mut engine);

    engine.encode_and_submit().unwrap();
    engine.encode_and_submit().unwrap();
    engine.encode_and_submit().unwrap();

    let stats = engine.backend().stats();
    assert_eq!(stats.render_bundles_created, 1, "bundle re-recorded");
    assert_eq!(stats.bundles_executed, 3);
    let executed = &engine.backend().executed_bundles;
    assert_eq!(executed[0], executed[1]);
    assert_eq!(executed[1], executed[2]);

    // The pipeline was compiled exactly once, too.
    assert_eq!(stats.render_pipelines_created, 1);
    let _ = scene;
}

#[test]
fn attachment_format_change_forces_bundle_re_record() {
    init_logging();
    let mut engine = Engine::new(DummyBackend::new(), 800, 600);
    let scene = build_basic_scene(&mut engine);

    engine.encode_and_submit().unwrap();
    assert_eq!(engine.backend().stats().render_bundles_created, 1);

    // Attach an offscreen texture with a different pixel format to the
    // color attachment slot.
    let tree = engine.tree_mut();
    let texture = tree.create_node(Props::Texture(TextureProps {
        format: TextureFormat::Rgba16Float,
        full_screen: false,
        size: Some(Extent3d::new_2d(256, 256)),
    }));
    tree.append_child(scene.color, texture).unwrap();

    engine.encode_and_submit().unwrap();
    let stats = engine.backend().stats();
    assert_eq!(stats.render_bundles_created, 2);
    let executed = &engine.backend().executed_bundles;
    assert_ne!(executed[0], executed[1]);

    // And the new bundle is stable again on the following frame.
    engine.encode_and_submit().unwrap();
    assert_eq!(engine.backend().stats().render_bundles_created, 2);
}

#[test]
fn full_screen_depth_texture_recreated_exactly_once_per_resize() {
    init_logging();
    let mut engine = Engine::new(DummyBackend::new(), 800, 600);
    let scene = build_basic_scene(&mut engine);

    let tree = engine.tree_mut();
    let depth_attachment =
        tree.create_node(Props::DepthStencilAttachment(Default::default()));
    let depth_texture = tree.create_node(Props::Texture(TextureProps {
        format: TextureFormat::Depth24PlusStencil8,
        full_screen: true,
        size: None,
    }));
    tree.append_child(scene.pass, depth_attachment).unwrap();
    tree.append_child(depth_attachment, depth_texture).unwrap();

    engine.encode_and_submit().unwrap();
    engine.encode_and_submit().unwrap();
    assert_eq!(engine.backend().stats().textures_created, 1);

    engine.canvas_resized(1024, 768);
    engine.encode_and_submit().unwrap();
    assert_eq!(
        engine.backend().stats().textures_created,
        2,
        "resize must recreate the full-screen texture"
    );

    // No further recreation until the next resize.
    engine.encode_and_submit().unwrap();
    engine.encode_and_submit().unwrap();
    assert_eq!(engine.backend().stats().textures_created, 2);
}

#[test]
fn invalid_texture_props_surface_and_are_retryable() {
    init_logging();
    let mut engine = Engine::new(DummyBackend::new(), 800, 600);
    let scene = build_basic_scene(&mut engine);

    // A texture with neither an explicit extent nor full_screen cannot be
    // compiled.
    let tree = engine.tree_mut();
    let texture = tree.create_node(Props::Texture(TextureProps {
        format: TextureFormat::Rgba8UnormSrgb,
        full_screen: false,
        size: None,
    }));
    tree.append_child(scene.color, texture).unwrap();

    let err = engine.encode_and_submit().unwrap_err();
    assert!(matches!(err, SceneError::InvalidProps(_)));

    // Fixing the properties allows the next frame to succeed.
    engine
        .tree_mut()
        .set_props(
            texture,
            Props::Texture(TextureProps {
                format: TextureFormat::Rgba8UnormSrgb,
                full_screen: false,
                size: Some(Extent3d::new_2d(64, 64)),
            }),
        )
        .unwrap();
    engine.encode_and_submit().unwrap();
    assert!(engine.backend().stats().submits >= 1);
}

#[test]
fn shader_edit_recompiles_pipeline_and_bundle() {
    init_logging();
    let mut engine = Engine::new(DummyBackend::new(), 800, 600);
    let scene = build_basic_scene(&mut engine);

    engine.encode_and_submit().unwrap();
    let stats = engine.backend().stats();
    assert_eq!(stats.render_pipelines_created, 1);
    assert_eq!(stats.shader_modules_created, 1);

    engine
        .tree_mut()
        .set_props(
            scene.shader,
            Props::ShaderModule(ShaderModuleProps {
                source: Arc::from(
                    "@vertex fn vs_main() -> @builtin(position) vec4<f32> { return vec4<f32>(1.0); }\n\
                     @fragment fn fs_main() -> @location(0) vec4<f32> { return vec4<f32>(0.5); }",
                ),
                vertex_entry_point: Some("vs_main".into()),
                fragment_entry_point: Some("fs_main".into()),
            }),
        )
        .unwrap();

    engine.encode_and_submit().unwrap();
    let stats = engine.backend().stats();
    assert_eq!(stats.render_pipelines_created, 2);
    assert_eq!(stats.shader_modules_created, 2);
    assert_eq!(stats.render_bundles_created, 2);
    // The old module's last reference was released by the edit.
    assert_eq!(stats.shader_modules_destroyed, 1);
}

#[test]
fn removing_a_draw_re_records_without_it() {
    init_logging();
    let mut engine = Engine::new(DummyBackend::new(), 800, 600);
    let scene = build_basic_scene(&mut engine);

    engine.encode_and_submit().unwrap();
    assert_eq!(engine.backend().stats().render_bundles_created, 1);

    engine
        .tree_mut()
        .remove_child(scene.pipeline, scene.draw)
        .unwrap();

    engine.encode_and_submit().unwrap();
    let stats = engine.backend().stats();
    // The pipeline handle is still valid; only the bundle re-recorded.
    assert_eq!(stats.render_pipelines_created, 1);
    assert_eq!(stats.render_bundles_created, 2);
    let _ = scene.bundle;
}

#[test]
fn acquisition_failure_is_logged_and_retried() {
    init_logging();
    let mut backend = DummyBackend::new();
    backend.fail_next_acquire(
        scenegraph_engine::BackendError::InitializationFailed("no adapter".into()),
    );
    let mut engine = Engine::new(backend, 800, 600);
    build_basic_scene(&mut engine);

    engine.encode_and_submit().unwrap();
    assert_eq!(engine.device_state(), DeviceLifecycle::Uninitialized);
    assert_eq!(engine.backend().stats().submits, 0);

    // The retry succeeds and renders.
    engine.encode_and_submit().unwrap();
    assert_eq!(engine.device_state(), DeviceLifecycle::Ready);
    assert_eq!(engine.backend().stats().submits, 1);
}
