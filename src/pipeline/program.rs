//! Shader programs compiled from WGSL
//!
//! A program owns the SPIR-V, the reflected slot interface and one table
//! layout per set index.

use crate::backend::{
    BoundResource, PushConstantRange, RenderDevice, ShaderStages, TableLayoutEntry,
    TableLayoutHandle,
};
use crate::binding::{
    write_for, BindingPool, BindingTable, ShaderReflection, SlotDescriptor, SlotLayout,
    TableLayout, WriteRecord,
};
use crate::error::{FrameError, FrameResult};

/// Parse, validate and translate a WGSL source to SPIR-V.
///
/// Returns the SPIR-V words together with the reflected interface.
pub fn compile_wgsl(label: &str, source: &str) -> FrameResult<(Vec<u32>, ShaderReflection)> {
    let failed = |reason: String| FrameError::ShaderCompilation {
        shader: label.to_string(),
        reason,
    };

    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| failed(format!("WGSL parse error: {}", e.emit_to_string(source))))?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    let info = validator
        .validate(&module)
        .map_err(|e| failed(format!("Validation error: {e}")))?;

    let reflection = ShaderReflection::from_module(label, &module, &info)?;

    // No coordinate space adjustment: the viewport keeps the Vulkan
    // convention and the display flips the image instead.
    let options = naga::back::spv::Options {
        lang_version: (1, 3),
        flags: naga::back::spv::WriterFlags::empty(),
        ..Default::default()
    };

    let spirv = naga::back::spv::write_vec(&module, &info, &options, None)
        .map_err(|e| failed(format!("SPIR-V generation error: {e}")))?;

    Ok((spirv, reflection))
}

/// A compiled shader with its table layouts
pub struct ShaderProgram {
    label: String,
    spirv: Vec<u32>,
    reflection: ShaderReflection,
    layouts: Vec<TableLayout>,
}

impl ShaderProgram {
    /// Compile `source` and create a table layout for every set index.
    pub fn from_wgsl<D: RenderDevice>(
        device: &mut D,
        label: &str,
        source: &str,
    ) -> FrameResult<Self> {
        let (spirv, reflection) = compile_wgsl(label, source)?;

        // Layout entries are visible to every stage of the program so two
        // programs declaring the same set produce compatible layouts.
        let visibility = reflection.program_stages();
        let mut layouts = Vec::new();
        for slot_layout in reflection.slot_layouts() {
            let entries = slot_layout
                .slots
                .iter()
                .map(|slot| TableLayoutEntry {
                    binding: slot.binding,
                    kind: slot.kind,
                    stages: visibility,
                })
                .collect();
            layouts.push(TableLayout::new(device, slot_layout.set, entries)?);
        }

        log::debug!(
            "Compiled shader '{}': {} words, {} slots in {} sets",
            label,
            spirv.len(),
            reflection.slots().len(),
            layouts.len()
        );

        Ok(Self {
            label: label.to_string(),
            spirv,
            reflection,
            layouts,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn spirv(&self) -> &[u32] {
        &self.spirv
    }

    pub fn reflection(&self) -> &ShaderReflection {
        &self.reflection
    }

    /// Reflected slots grouped by set index
    pub fn slot_layouts(&self) -> Vec<SlotLayout> {
        self.reflection.slot_layouts()
    }

    pub fn find_slot(&self, name: &str) -> FrameResult<&SlotDescriptor> {
        self.reflection.find_slot(name)
    }

    pub fn table_layout(&self, set: u32) -> FrameResult<&TableLayout> {
        self.layouts
            .get(set as usize)
            .ok_or_else(|| FrameError::UnknownSet {
                shader: self.label.clone(),
                set,
            })
    }

    /// Layout handles in set order, as a pipeline layout expects them
    pub fn layout_handles(&self) -> Vec<TableLayoutHandle> {
        self.layouts.iter().map(|layout| layout.handle()).collect()
    }

    pub fn push_constants(&self) -> Option<PushConstantRange> {
        self.reflection.push_constants()
    }

    pub fn entry_point(&self, stage: ShaderStages) -> FrameResult<&str> {
        self.reflection.entry_point(stage)
    }

    /// Allocate a table for set index `set` from `pool`.
    pub fn allocate_table<D: RenderDevice>(
        &self,
        device: &mut D,
        pool: &mut BindingPool,
        set: u32,
    ) -> FrameResult<BindingTable> {
        let layout = self.table_layout(set)?;
        pool.allocate(device, layout)
    }

    /// Compose a write into one of this program's slots
    pub fn write_for(
        &self,
        slot: &str,
        table: &BindingTable,
        resource: BoundResource,
    ) -> FrameResult<WriteRecord> {
        write_for(&self.reflection, slot, table, resource)
    }

    pub fn destroy<D: RenderDevice>(self, device: &mut D) {
        for layout in self.layouts {
            layout.destroy(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DescriptorKind, RecordingDevice};
    use crate::binding::PoolCapacities;

    const SOURCE: &str = r#"
struct Tint {
    color: vec4<f32>,
}

@group(1) @binding(0) var<uniform> tint: Tint;

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    return vec4<f32>(f32(index), 0.0, 0.0, 1.0);
}

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return tint.color;
}
"#;

    #[test]
    fn test_compile_produces_spirv() {
        let (spirv, reflection) = compile_wgsl("tint", SOURCE).unwrap();
        assert_eq!(spirv[0], 0x0723_0203);
        assert_eq!(reflection.slots().len(), 1);
    }

    #[test]
    fn test_compile_error_names_shader() {
        let err = compile_wgsl("broken", "fn main( {").unwrap_err();
        assert!(matches!(err, FrameError::ShaderCompilation { ref shader, .. } if shader == "broken"));
    }

    #[test]
    fn test_layouts_cover_gaps_and_allocate() {
        let mut device = RecordingDevice::new();
        let program = ShaderProgram::from_wgsl(&mut device, "tint", SOURCE).unwrap();
        assert_eq!(program.layout_handles().len(), 2);
        assert!(program.table_layout(0).unwrap().entries().is_empty());

        let layout = program.table_layout(1).unwrap();
        assert_eq!(layout.count(DescriptorKind::UniformBuffer), 1);
        assert_eq!(layout.entries()[0].stages, ShaderStages::VERTEX_FRAGMENT);
        assert!(matches!(
            program.table_layout(2),
            Err(FrameError::UnknownSet { set: 2, .. })
        ));

        let mut pool =
            BindingPool::new(&mut device, "program", PoolCapacities::default()).unwrap();
        let table = program.allocate_table(&mut device, &mut pool, 1).unwrap();
        assert_eq!(table.set(), 1);
        assert_eq!(pool.remaining(DescriptorKind::UniformBuffer), 9);
    }
}
