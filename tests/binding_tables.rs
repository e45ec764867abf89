//! Binding pool accounting and write composition through reflected shaders.

mod common;

use rstest::rstest;

use common::layout;
use sky_viewport::backend::{BoundResource, DescriptorKind, ImageLayout, RecordingDevice};
use sky_viewport::binding::{BindingPool, PoolCapacities, WriteBatch};
use sky_viewport::pipeline::{AtmospherePipeline, SkyCube, SHARED_SET};
use sky_viewport::{FrameError, PoolLimit};

// ============================================================================
// Pool accounting
// ============================================================================

/// Three small tables fit in a pool of ten samplers and ten uniform buffers;
/// a fourth asking for eight more samplers does not.
#[test]
fn test_three_small_tables_then_greedy_request() {
    let mut device = RecordingDevice::new();
    let capacities = PoolCapacities::new(1000)
        .with(DescriptorKind::CombinedImageSampler, 10)
        .with(DescriptorKind::UniformBuffer, 10);
    let mut pool = BindingPool::new(&mut device, "scenario", capacities).unwrap();

    let small = layout(
        &mut device,
        0,
        &[DescriptorKind::CombinedImageSampler, DescriptorKind::UniformBuffer],
    );
    let tables: Vec<_> = (0..3)
        .map(|_| pool.allocate(&mut device, &small).unwrap())
        .collect();
    assert!(tables.iter().all(|t| device.is_table_valid(t.handle())));

    let greedy = layout(&mut device, 0, &[DescriptorKind::CombinedImageSampler; 8]);
    let err = pool.allocate(&mut device, &greedy).unwrap_err();
    assert!(matches!(
        err,
        FrameError::ExhaustedPool {
            limit: PoolLimit::Kind(DescriptorKind::CombinedImageSampler),
            requested: 8,
            remaining: 7,
        }
    ));
}

/// With capacity `capacity` and `per_table` slots per table, exactly the
/// allocation that crosses the capacity fails, and every one after it.
#[rstest]
#[case::uniform_buffers(DescriptorKind::UniformBuffer, 10, 3)]
#[case::samplers(DescriptorKind::Sampler, 10, 5)]
#[case::storage_images(DescriptorKind::StorageImage, 4, 1)]
#[case::sampled_images(DescriptorKind::SampledImage, 7, 2)]
#[case::single_table_too_big(DescriptorKind::CombinedImageSampler, 2, 3)]
fn test_crossing_allocation_fails(
    #[case] kind: DescriptorKind,
    #[case] capacity: u32,
    #[case] per_table: u32,
) {
    let mut device = RecordingDevice::new();
    let mut pool = BindingPool::new(
        &mut device,
        "crossing",
        PoolCapacities::new(1000).with(kind, capacity),
    )
    .unwrap();
    let table_layout = layout(&mut device, 0, &vec![kind; per_table as usize]);

    let fits = capacity / per_table;
    for n in 0..fits + 2 {
        let result = pool.allocate(&mut device, &table_layout);
        if n < fits {
            assert!(result.is_ok(), "allocation {} should fit", n);
        } else {
            assert!(
                matches!(
                    result,
                    Err(FrameError::ExhaustedPool { limit: PoolLimit::Kind(k), .. }) if k == kind
                ),
                "allocation {} should exhaust the pool",
                n
            );
        }
    }
    assert_eq!(pool.remaining(kind), capacity - fits * per_table);
    assert_eq!(pool.outstanding_tables(), fits);
}

#[rstest]
#[case(1)]
#[case(3)]
fn test_table_count_limit(#[case] max_tables: u32) {
    let mut device = RecordingDevice::new();
    let mut pool = BindingPool::new(
        &mut device,
        "limit",
        PoolCapacities::uniform(100, max_tables),
    )
    .unwrap();
    let one = layout(&mut device, 0, &[DescriptorKind::UniformBuffer]);

    for _ in 0..max_tables {
        pool.allocate(&mut device, &one).unwrap();
    }
    // Plenty of uniform buffers remain; only the table count runs out
    assert!(pool.remaining(DescriptorKind::UniformBuffer) > 0);
    assert!(matches!(
        pool.allocate(&mut device, &one),
        Err(FrameError::ExhaustedPool {
            limit: PoolLimit::Tables,
            requested: 1,
            remaining: 0,
        })
    ));
    assert_eq!(pool.outstanding_tables(), max_tables);
}

// ============================================================================
// Writes through reflected programs
// ============================================================================

#[test]
fn test_atmosphere_table_binds_the_storage_view() {
    let mut device = RecordingDevice::new();
    let atmosphere = AtmospherePipeline::new(&mut device).unwrap();
    let cube = SkyCube::new(&mut device, 64).unwrap();
    let mut pool = BindingPool::new(&mut device, "renderer", PoolCapacities::default()).unwrap();

    let slot = atmosphere.program().find_slot("sky_cube").unwrap().clone();
    assert_eq!(slot.kind, DescriptorKind::StorageImage);
    let table = atmosphere
        .program()
        .allocate_table(&mut device, &mut pool, slot.set)
        .unwrap();

    let storage = BoundResource::StorageImage {
        view: cube.storage_view(),
        layout: ImageLayout::General,
    };
    let mut batch = WriteBatch::new();
    batch.push(atmosphere.program().write_for("sky_cube", &table, storage).unwrap());
    batch.apply(&mut device).unwrap();

    assert_eq!(device.update_calls(), 1);
    assert_eq!(device.table_slot(table.handle(), slot.binding), Some(storage));
    assert_eq!(pool.remaining(DescriptorKind::StorageImage), 9);
}

#[test]
fn test_unknown_slot_is_reported_by_name() {
    let mut device = RecordingDevice::new();
    let atmosphere = AtmospherePipeline::new(&mut device).unwrap();
    let cube = SkyCube::new(&mut device, 64).unwrap();
    let mut pool = BindingPool::new(&mut device, "renderer", PoolCapacities::default()).unwrap();
    let table = atmosphere
        .program()
        .allocate_table(&mut device, &mut pool, 0)
        .unwrap();

    let err = atmosphere
        .program()
        .write_for("skybox", &table, BoundResource::Sampler(cube.sampler()))
        .unwrap_err();
    match err {
        FrameError::UnknownSlot { slot, .. } => assert_eq!(slot, "skybox"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_unknown_set_is_rejected() {
    let mut device = RecordingDevice::new();
    let atmosphere = AtmospherePipeline::new(&mut device).unwrap();
    let mut pool = BindingPool::new(&mut device, "renderer", PoolCapacities::default()).unwrap();

    assert!(matches!(
        atmosphere
            .program()
            .allocate_table(&mut device, &mut pool, SHARED_SET + 5),
        Err(FrameError::UnknownSet { set: 5, .. })
    ));
    assert_eq!(pool.outstanding_tables(), 0);
}
