//! Resource slot discovery from a validated naga module

use crate::backend::{DescriptorKind, PushConstantRange, ShaderStages};
use crate::error::{FrameError, FrameResult};

/// A named resource slot declared by a shader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotDescriptor {
    pub name: String,
    pub set: u32,
    pub binding: u32,
    pub kind: DescriptorKind,
    /// Entry points that actually read or write the slot
    pub stages: ShaderStages,
}

/// All slots of one set index, ordered by binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotLayout {
    pub set: u32,
    pub slots: Vec<SlotDescriptor>,
}

/// Resource interface of a shader program
#[derive(Debug, Clone)]
pub struct ShaderReflection {
    shader: String,
    slots: Vec<SlotDescriptor>,
    push_constants: Option<PushConstantRange>,
    entry_points: Vec<(String, ShaderStages)>,
}

fn stage_flags(stage: naga::ShaderStage) -> ShaderStages {
    match stage {
        naga::ShaderStage::Vertex => ShaderStages::VERTEX,
        naga::ShaderStage::Fragment => ShaderStages::FRAGMENT,
        naga::ShaderStage::Compute => ShaderStages::COMPUTE,
    }
}

fn handle_kind(inner: &naga::TypeInner) -> Option<DescriptorKind> {
    match inner {
        naga::TypeInner::Image {
            class: naga::ImageClass::Storage { .. },
            ..
        } => Some(DescriptorKind::StorageImage),
        naga::TypeInner::Image { .. } => Some(DescriptorKind::SampledImage),
        naga::TypeInner::Sampler { .. } => Some(DescriptorKind::Sampler),
        _ => None,
    }
}

impl ShaderReflection {
    /// Reflect every bound global and push-constant block of `module`.
    pub fn from_module(
        shader: &str,
        module: &naga::Module,
        info: &naga::valid::ModuleInfo,
    ) -> FrameResult<Self> {
        let entry_points: Vec<(String, ShaderStages)> = module
            .entry_points
            .iter()
            .map(|ep| (ep.name.clone(), stage_flags(ep.stage)))
            .collect();
        let program_stages = entry_points
            .iter()
            .fold(ShaderStages::NONE, |acc, (_, stages)| acc | *stages);

        let mut slots = Vec::new();
        let mut push_constants = None;

        for (handle, var) in module.global_variables.iter() {
            let mut stages = ShaderStages::NONE;
            for (index, (_, entry_stages)) in entry_points.iter().enumerate() {
                if !info.get_entry_point(index)[handle].is_empty() {
                    stages |= *entry_stages;
                }
            }
            // Declared but unused globals stay visible to the whole program
            if stages.is_empty() {
                stages = program_stages;
            }

            let name = var.name.clone().unwrap_or_default();

            if var.space == naga::AddressSpace::PushConstant {
                let size = module.types[var.ty].inner.size(module.to_ctx());
                push_constants = Some(PushConstantRange {
                    stages,
                    offset: 0,
                    size,
                });
                continue;
            }

            let Some(binding) = &var.binding else {
                continue;
            };

            let kind = match var.space {
                naga::AddressSpace::Uniform => DescriptorKind::UniformBuffer,
                naga::AddressSpace::Storage { .. } => DescriptorKind::StorageBuffer,
                naga::AddressSpace::Handle => handle_kind(&module.types[var.ty].inner)
                    .ok_or_else(|| FrameError::ShaderCompilation {
                        shader: shader.to_string(),
                        reason: format!("unsupported resource type for '{}'", name),
                    })?,
                other => {
                    return Err(FrameError::ShaderCompilation {
                        shader: shader.to_string(),
                        reason: format!("'{}' is bound in address space {:?}", name, other),
                    })
                }
            };

            slots.push(SlotDescriptor {
                name,
                set: binding.group,
                binding: binding.binding,
                kind,
                stages,
            });
        }

        slots.sort_by_key(|slot| (slot.set, slot.binding));

        Ok(Self {
            shader: shader.to_string(),
            slots,
            push_constants,
            entry_points,
        })
    }

    /// Name of the shader this was reflected from
    pub fn shader(&self) -> &str {
        &self.shader
    }

    pub fn slots(&self) -> &[SlotDescriptor] {
        &self.slots
    }

    pub fn find_slot(&self, name: &str) -> FrameResult<&SlotDescriptor> {
        self.slots
            .iter()
            .find(|slot| slot.name == name)
            .ok_or_else(|| FrameError::UnknownSlot {
                shader: self.shader.clone(),
                slot: name.to_string(),
            })
    }

    /// Number of set indices, counting unused gaps below the highest one
    pub fn set_count(&self) -> u32 {
        self.slots.iter().map(|slot| slot.set + 1).max().unwrap_or(0)
    }

    /// Slots grouped by set index. Every set below the highest declared
    /// one is present, possibly empty.
    pub fn slot_layouts(&self) -> Vec<SlotLayout> {
        (0..self.set_count())
            .map(|set| SlotLayout {
                set,
                slots: self
                    .slots
                    .iter()
                    .filter(|slot| slot.set == set)
                    .cloned()
                    .collect(),
            })
            .collect()
    }

    pub fn push_constants(&self) -> Option<PushConstantRange> {
        self.push_constants
    }

    /// Name of the entry point for `stage`
    pub fn entry_point(&self, stage: ShaderStages) -> FrameResult<&str> {
        self.entry_points
            .iter()
            .find(|(_, stages)| *stages == stage)
            .map(|(name, _)| name.as_str())
            .ok_or_else(|| FrameError::ShaderCompilation {
                shader: self.shader.clone(),
                reason: format!("no entry point for {:?}", stage),
            })
    }

    /// Union of the stages of every entry point
    pub fn program_stages(&self) -> ShaderStages {
        self.entry_points
            .iter()
            .fold(ShaderStages::NONE, |acc, (_, stages)| acc | *stages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reflect(source: &str) -> ShaderReflection {
        let module = naga::front::wgsl::parse_str(source).unwrap();
        let info = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .unwrap();
        ShaderReflection::from_module("test", &module, &info).unwrap()
    }

    const SOURCE: &str = r#"
struct Globals {
    tint: vec4<f32>,
}

struct Offset {
    value: vec2<f32>,
}

var<push_constant> offset: Offset;

@group(0) @binding(0) var<uniform> globals: Globals;
@group(0) @binding(1) var albedo: texture_2d<f32>;
@group(0) @binding(2) var albedo_sampler: sampler;
@group(2) @binding(0) var<storage, read> weights: array<f32>;

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    return vec4<f32>(f32(index) + offset.value.x, offset.value.y, 0.0, 1.0);
}

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    let sampled = textureSample(albedo, albedo_sampler, vec2<f32>(0.5, 0.5));
    return sampled * globals.tint * weights[0];
}
"#;

    #[test]
    fn test_slots_are_discovered_with_kinds() {
        let reflection = reflect(SOURCE);
        let globals = reflection.find_slot("globals").unwrap();
        assert_eq!((globals.set, globals.binding), (0, 0));
        assert_eq!(globals.kind, DescriptorKind::UniformBuffer);
        assert_eq!(globals.stages, ShaderStages::FRAGMENT);

        assert_eq!(
            reflection.find_slot("albedo").unwrap().kind,
            DescriptorKind::SampledImage
        );
        assert_eq!(
            reflection.find_slot("albedo_sampler").unwrap().kind,
            DescriptorKind::Sampler
        );
        assert_eq!(
            reflection.find_slot("weights").unwrap().kind,
            DescriptorKind::StorageBuffer
        );
    }

    #[test]
    fn test_unknown_slot() {
        let reflection = reflect(SOURCE);
        assert!(matches!(
            reflection.find_slot("normal_map"),
            Err(FrameError::UnknownSlot { slot, .. }) if slot == "normal_map"
        ));
    }

    #[test]
    fn test_layouts_fill_gaps() {
        let reflection = reflect(SOURCE);
        let layouts = reflection.slot_layouts();
        assert_eq!(layouts.len(), 3);
        assert_eq!(layouts[0].slots.len(), 3);
        assert!(layouts[1].slots.is_empty());
        assert_eq!(layouts[2].slots[0].name, "weights");
    }

    #[test]
    fn test_push_constants_and_entry_points() {
        let reflection = reflect(SOURCE);
        let range = reflection.push_constants().unwrap();
        assert_eq!(range.size, 8);
        assert_eq!(range.stages, ShaderStages::VERTEX);
        assert_eq!(reflection.entry_point(ShaderStages::VERTEX).unwrap(), "vs_main");
        assert_eq!(
            reflection.entry_point(ShaderStages::FRAGMENT).unwrap(),
            "fs_main"
        );
        assert!(reflection.entry_point(ShaderStages::COMPUTE).is_err());
        assert_eq!(reflection.program_stages(), ShaderStages::VERTEX_FRAGMENT);
    }
}
