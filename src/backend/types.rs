//! Common types shared between backends

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3, Vec4};

use super::traits::{
    BufferHandle, ComputePipelineHandle, GraphicsPipelineHandle, ImageViewHandle, RenderPassHandle,
    SamplerHandle, TableHandle, TableLayoutHandle,
};

/// Image format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8UnormSrgb,
    Rgba16Float,
    Rgba32Float,
    Depth32Float,
    Depth24PlusStencil8,
}

impl ImageFormat {
    pub fn is_depth(&self) -> bool {
        matches!(
            self,
            ImageFormat::Depth32Float | ImageFormat::Depth24PlusStencil8
        )
    }

    pub fn has_stencil(&self) -> bool {
        matches!(self, ImageFormat::Depth24PlusStencil8)
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            ImageFormat::Rgba8Unorm
            | ImageFormat::Rgba8UnormSrgb
            | ImageFormat::Bgra8UnormSrgb
            | ImageFormat::Depth32Float
            | ImageFormat::Depth24PlusStencil8 => 4,
            ImageFormat::Rgba16Float => 8,
            ImageFormat::Rgba32Float => 16,
        }
    }
}

/// Image usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageUsage(u32);

impl ImageUsage {
    pub const COPY_SRC: Self = Self(1 << 0);
    pub const COPY_DST: Self = Self(1 << 1);
    pub const SAMPLED: Self = Self(1 << 2);
    pub const STORAGE: Self = Self(1 << 3);
    pub const RENDER_ATTACHMENT: Self = Self(1 << 4);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for ImageUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Buffer usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferUsage(u32);

impl BufferUsage {
    pub const MAP_WRITE: Self = Self(1 << 0);
    pub const COPY_SRC: Self = Self(1 << 1);
    pub const COPY_DST: Self = Self(1 << 2);
    pub const INDEX: Self = Self(1 << 3);
    pub const VERTEX: Self = Self(1 << 4);
    pub const UNIFORM: Self = Self(1 << 5);
    pub const STORAGE: Self = Self(1 << 6);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for BufferUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Shader stage visibility flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ShaderStages(u32);

impl ShaderStages {
    pub const NONE: Self = Self(0);
    pub const VERTEX: Self = Self(1 << 0);
    pub const FRAGMENT: Self = Self(1 << 1);
    pub const COMPUTE: Self = Self(1 << 2);
    pub const VERTEX_FRAGMENT: Self = Self((1 << 0) | (1 << 1));

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for ShaderStages {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for ShaderStages {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Kind of resource a binding slot holds
///
/// Binding pools keep a separate capacity counter for every kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorKind {
    CombinedImageSampler,
    SampledImage,
    Sampler,
    StorageImage,
    UniformBuffer,
    StorageBuffer,
}

impl DescriptorKind {
    pub const ALL: [DescriptorKind; 6] = [
        DescriptorKind::CombinedImageSampler,
        DescriptorKind::SampledImage,
        DescriptorKind::Sampler,
        DescriptorKind::StorageImage,
        DescriptorKind::UniformBuffer,
        DescriptorKind::StorageBuffer,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            DescriptorKind::CombinedImageSampler => 0,
            DescriptorKind::SampledImage => 1,
            DescriptorKind::Sampler => 2,
            DescriptorKind::StorageImage => 3,
            DescriptorKind::UniformBuffer => 4,
            DescriptorKind::StorageBuffer => 5,
        }
    }
}

/// One binding of a table layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableLayoutEntry {
    pub binding: u32,
    pub kind: DescriptorKind,
    pub stages: ShaderStages,
}

/// Image layout a bound image is expected to be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    General,
    ShaderReadOnly,
    ColorAttachment,
    DepthStencilAttachment,
}

/// Concrete resource referenced by a table write
///
/// Handles are held by value so a write never points into caller-owned
/// temporaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundResource {
    UniformBuffer {
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    },
    StorageBuffer {
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    },
    CombinedImageSampler {
        sampler: SamplerHandle,
        view: ImageViewHandle,
        layout: ImageLayout,
    },
    SampledImage {
        view: ImageViewHandle,
        layout: ImageLayout,
    },
    Sampler(SamplerHandle),
    StorageImage {
        view: ImageViewHandle,
        layout: ImageLayout,
    },
}

impl BoundResource {
    pub fn kind(&self) -> DescriptorKind {
        match self {
            BoundResource::UniformBuffer { .. } => DescriptorKind::UniformBuffer,
            BoundResource::StorageBuffer { .. } => DescriptorKind::StorageBuffer,
            BoundResource::CombinedImageSampler { .. } => DescriptorKind::CombinedImageSampler,
            BoundResource::SampledImage { .. } => DescriptorKind::SampledImage,
            BoundResource::Sampler(_) => DescriptorKind::Sampler,
            BoundResource::StorageImage { .. } => DescriptorKind::StorageImage,
        }
    }
}

/// A single slot update as the device applies it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableWrite {
    pub table: TableHandle,
    pub binding: u32,
    pub resource: BoundResource,
}

/// Width and height of an image or pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height.max(1) as f32
    }
}

/// Dimensionality of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageDimension {
    D2,
    /// Six square array layers usable as a cube map
    Cube,
}

/// How an image view interprets its image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageViewKind {
    D2,
    D2Array,
    Cube,
}

/// Image descriptor
#[derive(Debug, Clone)]
pub struct ImageDescriptor {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub usage: ImageUsage,
    pub dimension: ImageDimension,
    /// Layout the image is transitioned to right after creation
    pub initial_layout: ImageLayout,
}

impl Default for ImageDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            width: 1,
            height: 1,
            format: ImageFormat::Rgba8Unorm,
            usage: ImageUsage::SAMPLED | ImageUsage::COPY_DST,
            dimension: ImageDimension::D2,
            initial_layout: ImageLayout::Undefined,
        }
    }
}

impl ImageDescriptor {
    pub fn array_layers(&self) -> u32 {
        match self.dimension {
            ImageDimension::D2 => 1,
            ImageDimension::Cube => 6,
        }
    }
}

/// Buffer descriptor
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub size: u64,
    pub usage: BufferUsage,
}

/// Filter mode for samplers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Nearest,
    Linear,
}

/// Address mode for samplers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    ClampToEdge,
    Repeat,
}

/// Sampler descriptor
#[derive(Debug, Clone)]
pub struct SamplerDescriptor {
    pub label: Option<String>,
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub address_mode: AddressMode,
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            address_mode: AddressMode::ClampToEdge,
        }
    }
}

/// Render pass descriptor: attachment formats and load behaviour
#[derive(Debug, Clone)]
pub struct RenderPassDescriptor {
    pub label: Option<String>,
    pub color_formats: Vec<ImageFormat>,
    pub depth_format: Option<ImageFormat>,
    /// Clear attachments when the pass begins; otherwise previous contents are loaded
    pub clear_on_load: bool,
}

/// Clear value for one attachment
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

/// Which aspect of which attachment a clear targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearAspect {
    Color { attachment: u32 },
    Depth,
    DepthStencil,
}

/// An explicit in-pass attachment clear
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearAttachment {
    pub aspect: ClearAspect,
    pub value: ClearValue,
}

/// Region cleared by an explicit clear
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearRect {
    pub extent: Extent2D,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

/// Viewport transform
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn from_extent(extent: Extent2D) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// Vertex attribute format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Float32x2,
    Float32x3,
    Float32x4,
}

impl VertexFormat {
    pub fn size(&self) -> u64 {
        match self {
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
        }
    }
}

/// Vertex attribute description
#[derive(Debug, Clone)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u64,
}

/// Vertex buffer layout
#[derive(Debug, Clone)]
pub struct VertexBufferLayout {
    pub array_stride: u64,
    pub attributes: Vec<VertexAttribute>,
}

/// Standard vertex with position, normal, UV, and tangent
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
    pub tangent: Vec4,
}

impl Vertex {
    pub fn layout() -> VertexBufferLayout {
        let attribute = |location, format, offset| VertexAttribute {
            location,
            format,
            offset,
        };
        VertexBufferLayout {
            array_stride: std::mem::size_of::<Self>() as u64,
            attributes: vec![
                attribute(0, VertexFormat::Float32x3, 0),
                attribute(1, VertexFormat::Float32x3, 12),
                attribute(2, VertexFormat::Float32x2, 24),
                attribute(3, VertexFormat::Float32x4, 32),
            ],
        }
    }
}

/// Index element type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

/// Cull mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullMode {
    None,
    Front,
    Back,
}

/// Compare function for depth testing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareFunction {
    Less,
    LessEqual,
    Always,
}

/// Depth test configuration of a graphics pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthState {
    pub test: bool,
    pub write: bool,
    pub compare: CompareFunction,
}

impl Default for DepthState {
    fn default() -> Self {
        Self {
            test: true,
            write: true,
            compare: CompareFunction::LessEqual,
        }
    }
}

/// A push-constant block visible to some stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushConstantRange {
    pub stages: ShaderStages,
    pub offset: u32,
    pub size: u32,
}

/// Graphics pipeline descriptor
#[derive(Debug, Clone)]
pub struct GraphicsPipelineDescriptor {
    pub label: Option<String>,
    pub spirv: Vec<u32>,
    pub vertex_entry: String,
    pub fragment_entry: String,
    /// One layout per set index, starting at set 0
    pub table_layouts: Vec<TableLayoutHandle>,
    pub push_constants: Option<PushConstantRange>,
    /// `None` for pipelines that generate their vertices procedurally
    pub vertex_layout: Option<VertexBufferLayout>,
    pub render_pass: RenderPassHandle,
    pub cull_mode: CullMode,
    pub depth: DepthState,
}

/// Compute pipeline descriptor
#[derive(Debug, Clone)]
pub struct ComputePipelineDescriptor {
    pub label: Option<String>,
    pub spirv: Vec<u32>,
    pub entry: String,
    pub table_layouts: Vec<TableLayoutHandle>,
    pub push_constants: Option<PushConstantRange>,
}

/// A pipeline of either kind, used where binds and push constants need the bind point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineRef {
    Graphics(GraphicsPipelineHandle),
    Compute(ComputePipelineHandle),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_layout_matches_struct() {
        let layout = Vertex::layout();
        assert_eq!(layout.array_stride, 48);
        let last = layout.attributes.last().unwrap();
        assert_eq!(last.offset + last.format.size(), layout.array_stride);
    }

    #[test]
    fn test_stage_flags() {
        let stages = ShaderStages::VERTEX | ShaderStages::FRAGMENT;
        assert_eq!(stages, ShaderStages::VERTEX_FRAGMENT);
        assert!(stages.contains(ShaderStages::FRAGMENT));
        assert!(!stages.contains(ShaderStages::COMPUTE));
        assert!(ShaderStages::NONE.is_empty());
    }

    #[test]
    fn test_descriptor_kind_indices_are_dense() {
        for (i, kind) in DescriptorKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }
}
