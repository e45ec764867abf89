//! Composition and bulk application of binding table writes

use crate::backend::{BoundResource, RenderDevice, TableWrite};
use crate::binding::pool::BindingTable;
use crate::binding::reflection::ShaderReflection;
use crate::error::{FrameError, FrameResult};

/// A pending write of one resource into one table slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub slot: String,
    pub write: TableWrite,
}

/// Compose the write of `resource` into the slot named `slot` of `table`.
///
/// The slot must exist in `reflection`, belong to the table's set index and
/// have the same kind as `resource`.
pub fn write_for(
    reflection: &ShaderReflection,
    slot: &str,
    table: &BindingTable,
    resource: BoundResource,
) -> FrameResult<WriteRecord> {
    let descriptor = reflection.find_slot(slot)?;

    if descriptor.set != table.set() {
        return Err(FrameError::LayoutMismatch {
            slot: slot.to_string(),
            reason: format!(
                "slot lives in set {} but the table was allocated for set {}",
                descriptor.set,
                table.set()
            ),
        });
    }
    if descriptor.kind != resource.kind() {
        return Err(FrameError::LayoutMismatch {
            slot: slot.to_string(),
            reason: format!(
                "slot expects {:?}, got {:?}",
                descriptor.kind,
                resource.kind()
            ),
        });
    }

    Ok(WriteRecord {
        slot: slot.to_string(),
        write: TableWrite {
            table: table.handle(),
            binding: descriptor.binding,
            resource,
        },
    })
}

/// Write records waiting to be applied in one bulk update
#[derive(Debug, Default)]
pub struct WriteBatch {
    records: Vec<WriteRecord>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: WriteRecord) -> &mut Self {
        self.records.push(record);
        self
    }

    /// Compose a write and queue it
    pub fn write(
        &mut self,
        reflection: &ShaderReflection,
        slot: &str,
        table: &BindingTable,
        resource: BoundResource,
    ) -> FrameResult<&mut Self> {
        let record = write_for(reflection, slot, table, resource)?;
        Ok(self.push(record))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[WriteRecord] {
        &self.records
    }

    /// Issue every queued write in a single device update and clear the batch.
    pub fn apply<D: RenderDevice>(&mut self, device: &mut D) -> FrameResult<()> {
        if self.records.is_empty() {
            return Ok(());
        }
        let writes: Vec<TableWrite> = self.records.iter().map(|r| r.write).collect();
        log::debug!("Applying {} binding table writes", writes.len());
        device.update_tables(&writes)?;
        self.records.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        BufferDescriptor, BufferUsage, ImageLayout, RecordingDevice, SamplerDescriptor,
    };
    use crate::binding::pool::{BindingPool, PoolCapacities, TableLayout};
    use crate::binding::reflection::SlotLayout;
    use crate::backend::TableLayoutEntry;

    const SOURCE: &str = r#"
struct Globals {
    tint: vec4<f32>,
}

@group(0) @binding(0) var<uniform> globals: Globals;
@group(0) @binding(1) var albedo: texture_2d<f32>;
@group(1) @binding(0) var albedo_sampler: sampler;

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return textureSample(albedo, albedo_sampler, vec2<f32>(0.5, 0.5)) * globals.tint;
}
"#;

    struct Fixture {
        device: RecordingDevice,
        reflection: ShaderReflection,
        tables: Vec<BindingTable>,
    }

    fn entries(layout: &SlotLayout) -> Vec<TableLayoutEntry> {
        layout
            .slots
            .iter()
            .map(|slot| TableLayoutEntry {
                binding: slot.binding,
                kind: slot.kind,
                stages: slot.stages,
            })
            .collect()
    }

    fn fixture() -> Fixture {
        let module = naga::front::wgsl::parse_str(SOURCE).unwrap();
        let info = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .unwrap();
        let reflection = ShaderReflection::from_module("writes", &module, &info).unwrap();

        let mut device = RecordingDevice::new();
        let mut pool =
            BindingPool::new(&mut device, "writes", PoolCapacities::default()).unwrap();
        let tables = reflection
            .slot_layouts()
            .iter()
            .map(|layout| {
                let layout = TableLayout::new(&mut device, layout.set, entries(layout)).unwrap();
                pool.allocate(&mut device, &layout).unwrap()
            })
            .collect();

        Fixture {
            device,
            reflection,
            tables,
        }
    }

    fn uniform(device: &mut RecordingDevice) -> BoundResource {
        let buffer = device
            .create_buffer(&BufferDescriptor {
                label: None,
                size: 16,
                usage: BufferUsage::UNIFORM | BufferUsage::MAP_WRITE,
            })
            .unwrap();
        BoundResource::UniformBuffer {
            buffer,
            offset: 0,
            range: 16,
        }
    }

    #[test]
    fn test_batch_applies_in_one_update() {
        let mut f = fixture();
        let ubo = uniform(&mut f.device);
        let sampler = f.device.create_sampler(&SamplerDescriptor::default()).unwrap();

        let mut batch = WriteBatch::new();
        batch
            .write(&f.reflection, "globals", &f.tables[0], ubo)
            .unwrap()
            .write(&f.reflection, "albedo_sampler", &f.tables[1], BoundResource::Sampler(sampler))
            .unwrap();
        assert_eq!(batch.len(), 2);

        batch.apply(&mut f.device).unwrap();
        assert_eq!(f.device.update_calls(), 1);
        assert!(batch.is_empty());
        assert_eq!(f.device.table_slot(f.tables[0].handle(), 0), Some(ubo));
        assert_eq!(
            f.device.table_slot(f.tables[1].handle(), 0),
            Some(BoundResource::Sampler(sampler))
        );
    }

    #[test]
    fn test_empty_batch_issues_nothing() {
        let mut f = fixture();
        WriteBatch::new().apply(&mut f.device).unwrap();
        assert_eq!(f.device.update_calls(), 0);
    }

    #[test]
    fn test_unknown_slot() {
        let mut f = fixture();
        let ubo = uniform(&mut f.device);
        assert!(matches!(
            write_for(&f.reflection, "camera", &f.tables[0], ubo),
            Err(FrameError::UnknownSlot { .. })
        ));
    }

    #[test]
    fn test_set_and_kind_mismatches() {
        let mut f = fixture();
        let ubo = uniform(&mut f.device);
        assert!(matches!(
            write_for(&f.reflection, "globals", &f.tables[1], ubo),
            Err(FrameError::LayoutMismatch { .. })
        ));

        let sampler = f.device.create_sampler(&SamplerDescriptor::default()).unwrap();
        assert!(matches!(
            write_for(&f.reflection, "albedo", &f.tables[0], BoundResource::Sampler(sampler)),
            Err(FrameError::LayoutMismatch { .. })
        ));
    }

    #[test]
    fn test_writes_to_same_table_do_not_interfere() {
        let mut f = fixture();
        let ubo = uniform(&mut f.device);
        let image = f
            .device
            .create_image(&crate::backend::ImageDescriptor {
                width: 2,
                height: 2,
                ..Default::default()
            })
            .unwrap();
        let view = f
            .device
            .create_image_view(image, crate::backend::ImageViewKind::D2)
            .unwrap();
        let sampled = BoundResource::SampledImage {
            view,
            layout: ImageLayout::ShaderReadOnly,
        };

        let mut batch = WriteBatch::new();
        batch.write(&f.reflection, "albedo", &f.tables[0], sampled).unwrap();
        batch.write(&f.reflection, "globals", &f.tables[0], ubo).unwrap();
        batch.apply(&mut f.device).unwrap();

        assert_eq!(f.device.table_slot(f.tables[0].handle(), 0), Some(ubo));
        assert_eq!(f.device.table_slot(f.tables[0].handle(), 1), Some(sampled));
    }
}
