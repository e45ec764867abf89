//! Atmosphere generation: a Preetham sky written into a cube map by compute

use bytemuck::{Pod, Zeroable};

use crate::backend::{
    ComputePipelineDescriptor, ComputePipelineHandle, FilterMode, ImageDescriptor,
    ImageDimension, ImageFormat, ImageHandle, ImageLayout, ImageUsage, ImageViewHandle,
    ImageViewKind, PipelineRef, RenderDevice, SamplerDescriptor, SamplerHandle, ShaderStages,
};
use crate::error::FrameResult;
use crate::pipeline::program::ShaderProgram;

/// Workgroup grid covering all six faces of a 2048x2048 cube at 32x32 texels per group
pub const ATMOSPHERE_DISPATCH: [u32; 3] = [64, 64, 6];

/// Largest cube face the fixed dispatch grid covers
pub const MAX_CUBE_SIZE: u32 = ATMOSPHERE_DISPATCH[0] * 32;

pub const SKY_CUBE_FORMAT: ImageFormat = ImageFormat::Rgba16Float;

/// The three sky tunables, pushed as constants with every dispatch
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SkyParams {
    pub turbidity: f32,
    pub azimuth: f32,
    pub inclination: f32,
}

impl Default for SkyParams {
    fn default() -> Self {
        Self {
            turbidity: 3.14,
            azimuth: 0.0,
            inclination: 0.0,
        }
    }
}

/// Cube map the atmosphere pass writes and the sky and geometry passes sample
///
/// The image lives in the general layout for its whole life so it can be
/// written as storage and sampled without transitions.
pub struct SkyCube {
    image: ImageHandle,
    storage_view: ImageViewHandle,
    cube_view: ImageViewHandle,
    sampler: SamplerHandle,
    size: u32,
}

impl SkyCube {
    pub fn new<D: RenderDevice>(device: &mut D, size: u32) -> FrameResult<Self> {
        if size > MAX_CUBE_SIZE {
            log::warn!(
                "Sky cube size {} exceeds the dispatch grid, using {}",
                size,
                MAX_CUBE_SIZE
            );
        }
        let size = size.clamp(1, MAX_CUBE_SIZE);
        let image = device.create_image(&ImageDescriptor {
            label: Some("Sky Cube".into()),
            width: size,
            height: size,
            format: SKY_CUBE_FORMAT,
            usage: ImageUsage::STORAGE | ImageUsage::SAMPLED,
            dimension: ImageDimension::Cube,
            initial_layout: ImageLayout::General,
        })?;
        let storage_view = device.create_image_view(image, ImageViewKind::D2Array)?;
        let cube_view = device.create_image_view(image, ImageViewKind::Cube)?;
        let sampler = device.create_sampler(&SamplerDescriptor {
            label: Some("Sky Cube Sampler".into()),
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            ..Default::default()
        })?;

        log::debug!("Created {}x{} sky cube", size, size);

        Ok(Self {
            image,
            storage_view,
            cube_view,
            sampler,
            size,
        })
    }

    pub fn image(&self) -> ImageHandle {
        self.image
    }

    /// Six-layer array view for storage writes
    pub fn storage_view(&self) -> ImageViewHandle {
        self.storage_view
    }

    /// Cube view for sampling
    pub fn cube_view(&self) -> ImageViewHandle {
        self.cube_view
    }

    pub fn sampler(&self) -> SamplerHandle {
        self.sampler
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn layout(&self) -> ImageLayout {
        ImageLayout::General
    }

    pub fn destroy<D: RenderDevice>(self, device: &mut D) {
        device.destroy_sampler(self.sampler);
        device.destroy_image_view(self.cube_view);
        device.destroy_image_view(self.storage_view);
        device.destroy_image(self.image);
    }
}

/// Compute pipeline generating the sky cube
pub struct AtmospherePipeline {
    program: ShaderProgram,
    pipeline: ComputePipelineHandle,
}

impl AtmospherePipeline {
    pub fn new<D: RenderDevice>(device: &mut D) -> FrameResult<Self> {
        let program = ShaderProgram::from_wgsl(device, "atmosphere", ATMOSPHERE_SHADER)?;
        let pipeline = device.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("Atmosphere Pipeline".into()),
            spirv: program.spirv().to_vec(),
            entry: program.entry_point(ShaderStages::COMPUTE)?.to_string(),
            table_layouts: program.layout_handles(),
            push_constants: program.push_constants(),
        })?;
        Ok(Self { program, pipeline })
    }

    pub fn program(&self) -> &ShaderProgram {
        &self.program
    }

    pub fn pipeline(&self) -> PipelineRef {
        PipelineRef::Compute(self.pipeline)
    }

    pub fn destroy<D: RenderDevice>(self, device: &mut D) {
        device.destroy_compute_pipeline(self.pipeline);
        self.program.destroy(device);
    }
}

pub const ATMOSPHERE_SHADER: &str = r#"
const PI: f32 = 3.14159265;

struct SkyParams {
    turbidity: f32,
    azimuth: f32,
    inclination: f32,
}

var<push_constant> params: SkyParams;

@group(0) @binding(0) var sky_cube: texture_storage_2d_array<rgba16float, write>;

fn perez(theta: f32, gamma: f32, a: f32, b: f32, c: f32, d: f32, e: f32) -> f32 {
    let cos_gamma = cos(gamma);
    return (1.0 + a * exp(b / max(cos(theta), 0.01))) * (1.0 + c * exp(d * gamma) + e * cos_gamma * cos_gamma);
}

fn channel(theta: f32, gamma: f32, theta_sun: f32, zenith: f32, a: f32, b: f32, c: f32, d: f32, e: f32) -> f32 {
    return zenith * perez(theta, gamma, a, b, c, d, e) / perez(0.0, theta_sun, a, b, c, d, e);
}

fn face_direction(face: u32, uv: vec2<f32>) -> vec3<f32> {
    var direction: vec3<f32>;
    switch face {
        case 0u: {
            direction = vec3<f32>(1.0, -uv.y, -uv.x);
        }
        case 1u: {
            direction = vec3<f32>(-1.0, -uv.y, uv.x);
        }
        case 2u: {
            direction = vec3<f32>(uv.x, 1.0, uv.y);
        }
        case 3u: {
            direction = vec3<f32>(uv.x, -1.0, -uv.y);
        }
        case 4u: {
            direction = vec3<f32>(uv.x, -uv.y, 1.0);
        }
        default: {
            direction = vec3<f32>(-uv.x, -uv.y, -1.0);
        }
    }
    return normalize(direction);
}

@compute @workgroup_size(32, 32, 1)
fn cs_main(@builtin(global_invocation_id) id: vec3<u32>) {
    let size = textureDimensions(sky_cube);
    if id.x >= size.x || id.y >= size.y {
        return;
    }

    let uv = (vec2<f32>(id.xy) + vec2<f32>(0.5)) / vec2<f32>(size) * 2.0 - 1.0;
    let direction = face_direction(id.z, uv);

    let theta_sun = params.inclination;
    let sun = vec3<f32>(
        sin(theta_sun) * cos(params.azimuth),
        cos(theta_sun),
        sin(theta_sun) * sin(params.azimuth),
    );
    let theta = acos(clamp(direction.y, 0.001, 1.0));
    let gamma = acos(clamp(dot(direction, sun), -1.0, 1.0));

    let t = params.turbidity;
    let ts = theta_sun;
    let ts2 = ts * ts;
    let ts3 = ts2 * ts;

    let chi = (4.0 / 9.0 - t / 120.0) * (PI - 2.0 * ts);
    let zenith_luminance = (4.0453 * t - 4.9710) * tan(chi) - 0.2155 * t + 2.4192;
    let zenith_x = t * t * (0.00166 * ts3 - 0.00375 * ts2 + 0.00209 * ts)
        + t * (-0.02903 * ts3 + 0.06377 * ts2 - 0.03202 * ts + 0.00394)
        + (0.11693 * ts3 - 0.21196 * ts2 + 0.06052 * ts + 0.25886);
    let zenith_y = t * t * (0.00275 * ts3 - 0.00610 * ts2 + 0.00317 * ts)
        + t * (-0.04214 * ts3 + 0.08970 * ts2 - 0.04153 * ts + 0.00516)
        + (0.15346 * ts3 - 0.26756 * ts2 + 0.06670 * ts + 0.26688);

    let luminance = channel(theta, gamma, ts, zenith_luminance,
        0.1787 * t - 1.4630, -0.3554 * t + 0.4275, -0.0227 * t + 5.3251, 0.1206 * t - 2.5771, -0.0670 * t + 0.3703);
    let chroma_x = channel(theta, gamma, ts, zenith_x,
        -0.0193 * t - 0.2592, -0.0665 * t + 0.0008, -0.0004 * t + 0.2125, -0.0641 * t - 0.8989, -0.0033 * t + 0.0452);
    let chroma_y = channel(theta, gamma, ts, zenith_y,
        -0.0167 * t - 0.2608, -0.0950 * t + 0.0092, -0.0079 * t + 0.2102, -0.0441 * t - 1.6537, -0.0109 * t + 0.0529);

    // Yxy to XYZ to linear sRGB
    let big_y = luminance * 0.05;
    let safe_y = max(chroma_y, 0.0001);
    let big_x = chroma_x * big_y / safe_y;
    let big_z = (1.0 - chroma_x - chroma_y) * big_y / safe_y;
    var color = vec3<f32>(
        3.2406 * big_x - 1.5372 * big_y - 0.4986 * big_z,
        -0.9689 * big_x + 1.8758 * big_y + 0.0415 * big_z,
        0.0557 * big_x - 0.2040 * big_y + 1.0570 * big_z,
    );
    color = max(color, vec3<f32>(0.0));

    if direction.y < 0.0 {
        color = mix(color, vec3<f32>(0.1, 0.09, 0.08), clamp(-direction.y * 8.0, 0.0, 1.0));
    }

    textureStore(sky_cube, vec2<i32>(id.xy), i32(id.z), vec4<f32>(color, 1.0));
}
"#;
