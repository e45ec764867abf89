//! End-to-end frames through the viewport layer on the recording device.

mod common;

use rstest::rstest;

use common::{config, SpyCamera, UiRegistry};
use sky_viewport::backend::{
    ClearAspect, Extent2D, ImageLayout, RecordedCommand, RecordingDevice, RenderDevice, TableHandle,
};
use sky_viewport::pipeline::{FrameState, SkyParams, SyncMode, ATMOSPHERE_DISPATCH, MATERIAL_SET};
use sky_viewport::resources::MeshSource;
use sky_viewport::scene::CameraSource;
use sky_viewport::target::{OffscreenTargetManager, OffscreenTargetSpec, SubmissionRing};
use sky_viewport::{SkyViewLayer, ViewerConfig};

fn layer(device: &mut RecordingDevice, config: &ViewerConfig) -> SkyViewLayer<SpyCamera> {
    SkyViewLayer::with_camera(device, config, SpyCamera::new()).unwrap()
}

// ============================================================================
// Offscreen target resizing
// ============================================================================

#[rstest]
#[case::same_size(1280, 720, false, Extent2D::new(1280, 720))]
#[case::smaller(800, 600, true, Extent2D::new(800, 600))]
#[case::one_pixel_taller(1280, 721, true, Extent2D::new(1280, 721))]
#[case::zero_clamps(0, 600, true, Extent2D::new(1, 600))]
#[case::negative_clamps(-20, -1, true, Extent2D::new(1, 1))]
fn test_resize(
    #[case] width: i32,
    #[case] height: i32,
    #[case] changed: bool,
    #[case] expected: Extent2D,
) {
    let mut device = RecordingDevice::new();
    let mut ring = SubmissionRing::new(1);
    let mut targets = OffscreenTargetManager::new(&mut device, OffscreenTargetSpec::default()).unwrap();
    let before = targets.display_image();
    let color_before = targets.target().color_image();

    assert_eq!(targets.resize(&mut device, &mut ring, width, height).unwrap(), changed);
    assert_eq!(targets.extent(), expected);

    let after = targets.display_image();
    if changed {
        assert_ne!(after.view, before.view);
        assert!(!device.is_image_alive(color_before));
        assert!(!device.is_view_alive(before.view));
    } else {
        assert_eq!(after, before);
        assert!(device.is_image_alive(color_before));
    }
    assert_eq!(device.live_image_count(), 2);
    assert_eq!(
        device.framebuffer_extent(targets.target().framebuffer()),
        Some(expected)
    );
}

/// A 1280x720 target shown in an 800x600 region is recreated once and the
/// camera follows it exactly once.
#[test]
fn test_viewport_region_resizes_camera_once() {
    let mut device = RecordingDevice::new();
    let mut registry = UiRegistry::default();
    let mut layer = layer(&mut device, &config(SyncMode::Blocking));
    assert_eq!(layer.camera().resizes, vec![(1280, 720)]);

    layer.present_viewport(&mut device, &mut registry, 800, 600).unwrap();
    assert_eq!(layer.targets().extent(), Extent2D::new(800, 600));
    assert_eq!(layer.camera().resizes, vec![(1280, 720), (800, 600)]);

    // Same region again: nothing to do
    layer.present_viewport(&mut device, &mut registry, 800, 600).unwrap();
    assert_eq!(layer.camera().resizes.len(), 2);
}

// ============================================================================
// Pass recording
// ============================================================================

#[test]
fn test_first_frame_dispatches_sky_then_draws_every_sub_mesh() {
    let mut device = RecordingDevice::new();
    let mut layer = layer(&mut device, &config(SyncMode::Blocking));

    assert!(layer.on_update(&mut device, 0.016).unwrap());
    assert_eq!(layer.sequencer().state(), FrameState::ComputeDispatched);
    layer.on_render(&mut device).unwrap();
    assert_eq!(layer.sequencer().state(), FrameState::Idle);

    let submission = device.last_submission().unwrap();
    assert!(submission.waited);
    let commands = &submission.commands;

    let [x, y, z] = ATMOSPHERE_DISPATCH;
    let dispatch = commands
        .iter()
        .position(|c| *c == RecordedCommand::Dispatch { x, y, z })
        .expect("atmosphere dispatch");
    assert_eq!(commands[dispatch + 1], RecordedCommand::ComputeToGraphicsBarrier);
    let begin = commands
        .iter()
        .position(|c| matches!(c, RecordedCommand::BeginPass { .. }))
        .expect("offscreen pass");
    assert!(dispatch < begin);
    assert_eq!(commands.last(), Some(&RecordedCommand::EndPass));

    // Each indexed draw directly follows the bind of its material table
    let mesh = layer.mesh();
    let draws: Vec<_> = commands
        .windows(2)
        .filter_map(|pair| match (&pair[0], &pair[1]) {
            (
                RecordedCommand::BindTable { set, table, .. },
                RecordedCommand::DrawIndexed {
                    index_count,
                    first_index,
                    vertex_offset,
                    ..
                },
            ) => Some((*set, *table, *index_count, *first_index, *vertex_offset)),
            _ => None,
        })
        .collect();
    let indexed_draws = commands
        .iter()
        .filter(|c| matches!(c, RecordedCommand::DrawIndexed { .. }))
        .count();
    assert_eq!(indexed_draws, mesh.sub_meshes().len());
    assert_eq!(draws.len(), mesh.sub_meshes().len());

    for (draw, sub_mesh) in draws.iter().zip(mesh.sub_meshes()) {
        let material = &mesh.materials()[sub_mesh.material_index as usize];
        assert_eq!(
            *draw,
            (
                MATERIAL_SET,
                material.descriptor_set().handle(),
                sub_mesh.index_count,
                sub_mesh.index_offset,
                sub_mesh.vertex_offset,
            )
        );
    }
}

#[test]
fn test_unchanged_sky_is_generated_once() {
    let mut device = RecordingDevice::new();
    let mut layer = layer(&mut device, &config(SyncMode::Blocking));

    assert!(layer.on_update(&mut device, 0.016).unwrap());
    layer.on_render(&mut device).unwrap();
    assert!(!layer.on_update(&mut device, 0.016).unwrap());
    layer.on_render(&mut device).unwrap();

    layer.set_sky_params(SkyParams {
        turbidity: 5.0,
        ..layer.sky_params()
    });
    assert!(layer.on_update(&mut device, 0.016).unwrap());
    layer.on_render(&mut device).unwrap();

    let dispatches: Vec<usize> = device
        .submissions()
        .iter()
        .map(|s| {
            s.commands
                .iter()
                .filter(|c| matches!(c, RecordedCommand::Dispatch { .. }))
                .count()
        })
        .collect();
    assert_eq!(dispatches, vec![1, 0, 1]);
    assert_eq!(layer.camera().updates, 3);
}

#[rstest]
#[case::clear_on_load(true, false)]
#[case::load_then_clear(false, true)]
fn test_explicit_clear_follows_load_behaviour(#[case] clear_on_load: bool, #[case] expected: bool) {
    let mut device = RecordingDevice::new();
    let mut viewer_config = config(SyncMode::Blocking);
    viewer_config.target.clear_on_load = clear_on_load;
    let mut layer = layer(&mut device, &viewer_config);

    layer.on_update(&mut device, 0.0).unwrap();
    layer.on_render(&mut device).unwrap();

    let clears: Vec<_> = device
        .last_submission()
        .unwrap()
        .commands
        .iter()
        .filter_map(|c| match c {
            RecordedCommand::ClearAttachments { attachments, rect } => Some((attachments, rect)),
            _ => None,
        })
        .collect();
    assert_eq!(!clears.is_empty(), expected);
    if let Some((attachments, rect)) = clears.first() {
        let aspects: Vec<_> = attachments.iter().map(|a| a.aspect).collect();
        assert_eq!(
            aspects,
            vec![ClearAspect::Color { attachment: 0 }, ClearAspect::DepthStencil]
        );
        assert_eq!(rect.extent, layer.targets().extent());
        assert_eq!((rect.base_array_layer, rect.layer_count), (0, 1));
    }
}

// ============================================================================
// Frame data and display
// ============================================================================

#[test]
fn test_camera_block_is_copied_verbatim() {
    let mut device = RecordingDevice::new();
    let mut registry = UiRegistry::default();
    let mut layer = layer(&mut device, &config(SyncMode::Blocking));

    layer.on_update(&mut device, 0.5).unwrap();
    layer.present_viewport(&mut device, &mut registry, 640, 480).unwrap();
    layer.on_render(&mut device).unwrap();

    let camera = layer.camera();
    let buffer = layer.uploader().buffer();
    assert!(!device.is_mapped(buffer));
    let contents = device.buffer_contents(buffer).unwrap();
    assert_eq!(&contents[0..64], bytemuck::bytes_of(&camera.view_projection()));
    assert_eq!(
        &contents[64..128],
        bytemuck::bytes_of(&camera.inverse_view_projection())
    );
    assert_eq!(&contents[128..140], bytemuck::bytes_of(&camera.position()));

    // The shared table reads this very buffer
    assert_eq!(
        device.table_slot(layer.shared_table().handle(), 0),
        Some(layer.uploader().binding())
    );
}

#[test]
fn test_display_handle_changes_once_per_target() {
    let mut device = RecordingDevice::new();
    let mut registry = UiRegistry::default();
    let mut layer = layer(&mut device, &config(SyncMode::Blocking));

    let first = layer.present_viewport(&mut device, &mut registry, 1280, 720).unwrap();
    let again = layer.present_viewport(&mut device, &mut registry, 1280, 720).unwrap();
    assert_eq!(first, again);
    assert_eq!(registry.registered.len(), 1);
    assert_eq!(registry.registered[0].layout, ImageLayout::ShaderReadOnly);

    let resized = layer.present_viewport(&mut device, &mut registry, 1024, 512).unwrap();
    assert_ne!(resized, first);
    assert_eq!(registry.registered.len(), 2);
    assert_eq!(registry.live, vec![resized]);
    assert!(device.is_view_alive(registry.registered[1].view));
    assert!(!device.is_view_alive(registry.registered[0].view));

    let steady = layer.present_viewport(&mut device, &mut registry, 1024, 512).unwrap();
    assert_eq!(steady, resized);
    assert_eq!(registry.registered.len(), 2);
}

// ============================================================================
// Submission modes
// ============================================================================

fn binds_table(commands: &[RecordedCommand], handle: TableHandle) -> bool {
    commands
        .iter()
        .any(|c| matches!(c, RecordedCommand::BindTable { table, .. } if *table == handle))
}

#[test]
fn test_ring_mode_overlaps_up_to_depth_frames() {
    let mut device = RecordingDevice::new();
    let mut registry = UiRegistry::default();
    let mut layer = layer(&mut device, &config(SyncMode::Ring { depth: 2 }));
    assert_eq!(layer.shared_tables().len(), 2);

    layer.on_update(&mut device, 0.016).unwrap();
    let first = layer.on_render(&mut device).unwrap();
    assert!(!device.last_submission().unwrap().waited);
    assert_eq!(device.pending_submissions(), 1);

    // The second frame writes the other camera slot and does not wait
    layer.on_update(&mut device, 0.016).unwrap();
    let second = layer.on_render(&mut device).unwrap();
    assert_ne!(first, second);
    assert_eq!(device.pending_submissions(), 2);
    assert_eq!(layer.in_flight().len(), 2);

    let tables: Vec<TableHandle> = layer.shared_tables().iter().map(|t| t.handle()).collect();
    let submissions = device.submissions();
    assert!(binds_table(&submissions[0].commands, tables[0]));
    assert!(!binds_table(&submissions[0].commands, tables[1]));
    assert!(binds_table(&submissions[1].commands, tables[1]));
    assert!(!binds_table(&submissions[1].commands, tables[0]));
    assert_eq!(
        device.table_slot(tables[1], 0),
        Some(layer.uploader().binding_at(1))
    );

    // The third frame reuses the first slot, so only the first frame is waited on
    layer.on_update(&mut device, 0.016).unwrap();
    let third = layer.on_render(&mut device).unwrap();
    assert!(device.is_submission_complete(first).unwrap());
    assert!(!device.is_submission_complete(second).unwrap());
    assert!(!device.is_submission_complete(third).unwrap());
    assert_eq!(layer.in_flight().len(), 2);

    // Recreating the target retires everything that rendered into it
    let old_color = layer.targets().target().color_image();
    layer.present_viewport(&mut device, &mut registry, 300, 200).unwrap();
    assert!(layer.in_flight().is_empty());
    assert_eq!(device.pending_submissions(), 0);
    assert!(!device.is_image_alive(old_color));
}

#[test]
fn test_blocking_mode_never_leaves_work_pending() {
    let mut device = RecordingDevice::new();
    let mut layer = layer(&mut device, &config(SyncMode::Blocking));

    for _ in 0..3 {
        layer.on_update(&mut device, 0.016).unwrap();
        layer.on_render(&mut device).unwrap();
        assert_eq!(device.pending_submissions(), 0);
    }
    assert!(layer.in_flight().is_empty());
    assert!(device.submissions().iter().all(|s| s.waited));
}

#[test]
fn test_destroy_releases_images_and_registration() {
    let mut device = RecordingDevice::new();
    let mut registry = UiRegistry::default();
    let mut layer = layer(&mut device, &config(SyncMode::Ring { depth: 3 }));

    layer.on_update(&mut device, 0.016).unwrap();
    layer.on_render(&mut device).unwrap();
    layer.present_viewport(&mut device, &mut registry, 512, 512).unwrap();
    let material_table = layer.mesh().materials()[0].descriptor_set().handle();

    layer.destroy(&mut device, &mut registry);

    assert_eq!(device.live_image_count(), 0);
    assert_eq!(device.live_framebuffer_count(), 0);
    assert_eq!(device.live_render_pass_count(), 0);
    assert_eq!(device.pending_submissions(), 0);
    assert!(!device.is_table_valid(material_table));
    assert!(registry.live.is_empty());
}
