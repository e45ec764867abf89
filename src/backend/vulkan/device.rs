//! `RenderDevice` implementation for the Vulkan backend

use std::ffi::CString;

use ash::vk;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::conversion::*;
use super::{VkBuffer, VkImage, VkPipeline, VkSubmission, VkTable, VulkanDevice};
use crate::backend::traits::*;
use crate::backend::types::*;

enum DescriptorInfo {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
}

fn unknown(kind: &'static str, id: u64) -> DeviceError {
    DeviceError::UnknownHandle { kind, id }
}

impl VulkanDevice {
    fn buffer(&self, handle: BufferHandle) -> DeviceResult<vk::Buffer> {
        self.buffers
            .get(&handle.0)
            .map(|b| b.buffer)
            .ok_or_else(|| unknown("buffer", handle.0))
    }

    fn view(&self, handle: ImageViewHandle) -> DeviceResult<vk::ImageView> {
        self.views
            .get(&handle.0)
            .copied()
            .ok_or_else(|| unknown("image view", handle.0))
    }

    fn sampler(&self, handle: SamplerHandle) -> DeviceResult<vk::Sampler> {
        self.samplers
            .get(&handle.0)
            .copied()
            .ok_or_else(|| unknown("sampler", handle.0))
    }

    fn command_buffer(&self, stream: CommandStream) -> DeviceResult<vk::CommandBuffer> {
        self.streams
            .get(&stream.0)
            .copied()
            .ok_or_else(|| unknown("command stream", stream.0))
    }

    fn pipeline(&self, pipeline: PipelineRef) -> DeviceResult<(&VkPipeline, vk::PipelineBindPoint)> {
        match pipeline {
            PipelineRef::Graphics(handle) => self
                .graphics_pipelines
                .get(&handle.0)
                .map(|p| (p, vk::PipelineBindPoint::GRAPHICS))
                .ok_or_else(|| unknown("graphics pipeline", handle.0)),
            PipelineRef::Compute(handle) => self
                .compute_pipelines
                .get(&handle.0)
                .map(|p| (p, vk::PipelineBindPoint::COMPUTE))
                .ok_or_else(|| unknown("compute pipeline", handle.0)),
        }
    }

    fn set_layouts(&self, handles: &[TableLayoutHandle]) -> DeviceResult<Vec<vk::DescriptorSetLayout>> {
        handles
            .iter()
            .map(|h| {
                self.table_layouts
                    .get(&h.0)
                    .copied()
                    .ok_or_else(|| unknown("table layout", h.0))
            })
            .collect()
    }

    fn create_pipeline_layout(
        &self,
        table_layouts: &[TableLayoutHandle],
        push_constants: Option<PushConstantRange>,
    ) -> DeviceResult<vk::PipelineLayout> {
        let set_layouts = self.set_layouts(table_layouts)?;
        let ranges: Vec<vk::PushConstantRange> = push_constants
            .into_iter()
            .map(|range| vk::PushConstantRange {
                stage_flags: convert_shader_stages(range.stages),
                offset: range.offset,
                size: range.size,
            })
            .collect();

        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&ranges);

        unsafe { self.device.create_pipeline_layout(&info, None) }
            .map_err(|e| DeviceError::PipelineCreationFailed(e.to_string()))
    }

    fn create_shader_module(&self, spirv: &[u32]) -> DeviceResult<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::default().code(spirv);
        unsafe { self.device.create_shader_module(&info, None) }
            .map_err(|e| DeviceError::PipelineCreationFailed(e.to_string()))
    }

    fn allocate_memory(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> DeviceResult<gpu_allocator::vulkan::Allocation> {
        self.allocator
            .as_ref()
            .ok_or_else(|| DeviceError::BufferCreationFailed("Allocator not available".into()))?
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| DeviceError::BufferCreationFailed(e.to_string()))
    }

    fn record<F>(&self, stream: CommandStream, f: F) -> DeviceResult<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let cmd = self.command_buffer(stream)?;
        f(&self.device, cmd);
        Ok(())
    }

    fn take_fence(&mut self) -> DeviceResult<vk::Fence> {
        if let Some(fence) = self.free_fences.pop() {
            return Ok(fence);
        }
        unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None) }
            .map_err(|e| DeviceError::SubmitFailed(e.to_string()))
    }
}

fn submit_error(e: vk::Result) -> DeviceError {
    match e {
        vk::Result::ERROR_DEVICE_LOST => DeviceError::DeviceLost,
        _ => DeviceError::SubmitFailed(e.to_string()),
    }
}

impl RenderDevice for VulkanDevice {
    // === Binding tables ===

    fn create_binding_pool(
        &mut self,
        sizes: &[(DescriptorKind, u32)],
        max_tables: u32,
    ) -> DeviceResult<BindingPoolHandle> {
        let pool_sizes: Vec<vk::DescriptorPoolSize> = sizes
            .iter()
            .filter(|(_, count)| *count > 0)
            .map(|&(kind, descriptor_count)| vk::DescriptorPoolSize {
                ty: convert_descriptor_kind(kind),
                descriptor_count,
            })
            .collect();

        let info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(max_tables);

        let pool = unsafe { self.device.create_descriptor_pool(&info, None) }
            .map_err(|e| DeviceError::DescriptorFailed(e.to_string()))?;

        let id = self.next_id();
        self.pools.insert(id, pool);
        Ok(BindingPoolHandle(id))
    }

    fn reset_binding_pool(&mut self, pool: BindingPoolHandle) -> DeviceResult<()> {
        let raw = *self
            .pools
            .get(&pool.0)
            .ok_or_else(|| unknown("binding pool", pool.0))?;
        unsafe {
            self.device
                .reset_descriptor_pool(raw, vk::DescriptorPoolResetFlags::empty())
        }
        .map_err(|e| DeviceError::DescriptorFailed(e.to_string()))?;
        self.tables.retain(|_, table| table.pool != pool.0);
        Ok(())
    }

    fn destroy_binding_pool(&mut self, pool: BindingPoolHandle) {
        if let Some(raw) = self.pools.remove(&pool.0) {
            self.tables.retain(|_, table| table.pool != pool.0);
            unsafe { self.device.destroy_descriptor_pool(raw, None) };
        }
    }

    fn create_table_layout(
        &mut self,
        entries: &[TableLayoutEntry],
    ) -> DeviceResult<TableLayoutHandle> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = entries
            .iter()
            .map(|entry| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(entry.binding)
                    .descriptor_type(convert_descriptor_kind(entry.kind))
                    .descriptor_count(1)
                    .stage_flags(convert_shader_stages(entry.stages))
            })
            .collect();

        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let layout = unsafe { self.device.create_descriptor_set_layout(&info, None) }
            .map_err(|e| DeviceError::DescriptorFailed(e.to_string()))?;

        let id = self.next_id();
        self.table_layouts.insert(id, layout);
        Ok(TableLayoutHandle(id))
    }

    fn destroy_table_layout(&mut self, layout: TableLayoutHandle) {
        if let Some(raw) = self.table_layouts.remove(&layout.0) {
            unsafe { self.device.destroy_descriptor_set_layout(raw, None) };
        }
    }

    fn allocate_table(
        &mut self,
        pool: BindingPoolHandle,
        layout: TableLayoutHandle,
    ) -> DeviceResult<TableHandle> {
        let raw_pool = *self
            .pools
            .get(&pool.0)
            .ok_or_else(|| unknown("binding pool", pool.0))?;
        let layouts = self.set_layouts(&[layout])?;

        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(raw_pool)
            .set_layouts(&layouts);
        let set = unsafe { self.device.allocate_descriptor_sets(&info) }
            .map_err(|e| DeviceError::DescriptorFailed(e.to_string()))?[0];

        let id = self.next_id();
        self.tables.insert(id, VkTable { set, pool: pool.0 });
        Ok(TableHandle(id))
    }

    fn update_tables(&mut self, writes: &[TableWrite]) -> DeviceResult<()> {
        // Infos are collected first so the write structs can borrow them
        let mut infos = Vec::with_capacity(writes.len());
        for write in writes {
            let info = match write.resource {
                BoundResource::UniformBuffer {
                    buffer,
                    offset,
                    range,
                }
                | BoundResource::StorageBuffer {
                    buffer,
                    offset,
                    range,
                } => DescriptorInfo::Buffer(vk::DescriptorBufferInfo {
                    buffer: self.buffer(buffer)?,
                    offset,
                    range,
                }),
                BoundResource::CombinedImageSampler {
                    sampler,
                    view,
                    layout,
                } => DescriptorInfo::Image(vk::DescriptorImageInfo {
                    sampler: self.sampler(sampler)?,
                    image_view: self.view(view)?,
                    image_layout: convert_image_layout(layout),
                }),
                BoundResource::SampledImage { view, layout }
                | BoundResource::StorageImage { view, layout } => {
                    DescriptorInfo::Image(vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: self.view(view)?,
                        image_layout: convert_image_layout(layout),
                    })
                }
                BoundResource::Sampler(sampler) => DescriptorInfo::Image(vk::DescriptorImageInfo {
                    sampler: self.sampler(sampler)?,
                    image_view: vk::ImageView::null(),
                    image_layout: vk::ImageLayout::UNDEFINED,
                }),
            };
            infos.push(info);
        }

        let mut vk_writes = Vec::with_capacity(writes.len());
        for (write, info) in writes.iter().zip(infos.iter()) {
            let set = self
                .tables
                .get(&write.table.0)
                .map(|t| t.set)
                .ok_or_else(|| unknown("table", write.table.0))?;
            let base = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(write.binding)
                .dst_array_element(0)
                .descriptor_type(convert_descriptor_kind(write.resource.kind()));
            let vk_write = match info {
                DescriptorInfo::Buffer(buffer) => base.buffer_info(std::slice::from_ref(buffer)),
                DescriptorInfo::Image(image) => base.image_info(std::slice::from_ref(image)),
            };
            vk_writes.push(vk_write);
        }

        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
        Ok(())
    }

    // === Buffers ===

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> DeviceResult<BufferHandle> {
        let info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(convert_buffer_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&info, None) }
            .map_err(|e| DeviceError::BufferCreationFailed(e.to_string()))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let location = if desc.usage.contains(BufferUsage::MAP_WRITE) {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };

        let allocation = match self.allocate_memory(
            desc.label.as_deref().unwrap_or("buffer"),
            requirements,
            location,
            true,
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        }
        .map_err(|e| DeviceError::BufferCreationFailed(e.to_string()))?;

        let id = self.next_id();
        self.buffers.insert(id, VkBuffer { buffer, allocation });
        Ok(BufferHandle(id))
    }

    fn map_buffer(&mut self, buffer: BufferHandle) -> DeviceResult<&mut [u8]> {
        let entry = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| unknown("buffer", buffer.0))?;
        // CpuToGpu allocations stay persistently mapped
        entry
            .allocation
            .mapped_slice_mut()
            .ok_or(DeviceError::NotHostVisible(buffer))
    }

    fn unmap_buffer(&mut self, _buffer: BufferHandle) {}

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(vk_buffer) = self.buffers.remove(&buffer.0) {
            unsafe { self.device.destroy_buffer(vk_buffer.buffer, None) };
            if let Some(ref allocator) = self.allocator {
                let _ = allocator.lock().free(vk_buffer.allocation);
            }
        }
    }

    // === Images ===

    fn create_image(&mut self, desc: &ImageDescriptor) -> DeviceResult<ImageHandle> {
        let format = convert_image_format(desc.format);
        let array_layers = desc.array_layers();
        let flags = match desc.dimension {
            ImageDimension::D2 => vk::ImageCreateFlags::empty(),
            ImageDimension::Cube => vk::ImageCreateFlags::CUBE_COMPATIBLE,
        };

        let info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(array_layers)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(convert_image_usage(desc.usage, desc.format))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::TYPE_1);

        let image = unsafe { self.device.create_image(&info, None) }
            .map_err(|e| DeviceError::ImageCreationFailed(e.to_string()))?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.allocate_memory(
            desc.label.as_deref().unwrap_or("image"),
            requirements,
            MemoryLocation::GpuOnly,
            false,
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        }
        .map_err(|e| DeviceError::ImageCreationFailed(e.to_string()))?;

        if desc.initial_layout != ImageLayout::Undefined {
            let new_layout = convert_image_layout(desc.initial_layout);
            let range = vk::ImageSubresourceRange {
                aspect_mask: aspect_flags(desc.format),
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: array_layers,
            };
            let transitioned = self.immediate_submit(|device, cmd| {
                let barrier = vk::ImageMemoryBarrier::default()
                    .old_layout(vk::ImageLayout::UNDEFINED)
                    .new_layout(new_layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image)
                    .subresource_range(range)
                    .src_access_mask(vk::AccessFlags::empty())
                    .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE);
                unsafe {
                    device.cmd_pipeline_barrier(
                        cmd,
                        vk::PipelineStageFlags::TOP_OF_PIPE,
                        vk::PipelineStageFlags::ALL_COMMANDS,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[barrier],
                    );
                }
            });
            if let Err(e) = transitioned {
                unsafe { self.device.destroy_image(image, None) };
                if let Some(ref allocator) = self.allocator {
                    let _ = allocator.lock().free(allocation);
                }
                return Err(e);
            }
        }

        let id = self.next_id();
        self.images.insert(
            id,
            VkImage {
                image,
                allocation,
                format: desc.format,
                array_layers,
            },
        );
        log::debug!(
            "Created image {} ({}x{} {:?}, {} layers)",
            desc.label.as_deref().unwrap_or("unnamed"),
            desc.width,
            desc.height,
            desc.format,
            array_layers
        );
        Ok(ImageHandle(id))
    }

    fn create_image_view(
        &mut self,
        image: ImageHandle,
        kind: ImageViewKind,
    ) -> DeviceResult<ImageViewHandle> {
        let vk_image = self
            .images
            .get(&image.0)
            .ok_or_else(|| unknown("image", image.0))?;

        let (view_type, layer_count) = match kind {
            ImageViewKind::D2 => (vk::ImageViewType::TYPE_2D, 1),
            ImageViewKind::D2Array => (vk::ImageViewType::TYPE_2D_ARRAY, vk_image.array_layers),
            ImageViewKind::Cube => (vk::ImageViewType::CUBE, 6),
        };

        let info = vk::ImageViewCreateInfo::default()
            .image(vk_image.image)
            .view_type(view_type)
            .format(convert_image_format(vk_image.format))
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect_flags(vk_image.format),
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count,
            });

        let view = unsafe { self.device.create_image_view(&info, None) }
            .map_err(|e| DeviceError::ImageCreationFailed(e.to_string()))?;

        let id = self.next_id();
        self.views.insert(id, view);
        Ok(ImageViewHandle(id))
    }

    fn destroy_image_view(&mut self, view: ImageViewHandle) {
        if let Some(raw) = self.views.remove(&view.0) {
            unsafe { self.device.destroy_image_view(raw, None) };
        }
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        if let Some(vk_image) = self.images.remove(&image.0) {
            unsafe { self.device.destroy_image(vk_image.image, None) };
            if let Some(ref allocator) = self.allocator {
                let _ = allocator.lock().free(vk_image.allocation);
            }
        }
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> DeviceResult<SamplerHandle> {
        let address_mode = convert_address_mode(desc.address_mode);
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(convert_filter(desc.mag_filter))
            .min_filter(convert_filter(desc.min_filter))
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);

        let sampler = unsafe { self.device.create_sampler(&info, None) }
            .map_err(|e| DeviceError::ImageCreationFailed(e.to_string()))?;

        let id = self.next_id();
        self.samplers.insert(id, sampler);
        Ok(SamplerHandle(id))
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        if let Some(raw) = self.samplers.remove(&sampler.0) {
            unsafe { self.device.destroy_sampler(raw, None) };
        }
    }

    // === Passes ===

    fn create_render_pass(
        &mut self,
        desc: &RenderPassDescriptor,
    ) -> DeviceResult<RenderPassHandle> {
        let load_op = if desc.clear_on_load {
            vk::AttachmentLoadOp::CLEAR
        } else {
            vk::AttachmentLoadOp::LOAD
        };

        // Color images live in the shader-read layout between passes
        let mut attachments: Vec<vk::AttachmentDescription> = desc
            .color_formats
            .iter()
            .map(|&format| {
                vk::AttachmentDescription::default()
                    .format(convert_image_format(format))
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(load_op)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .final_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            })
            .collect();

        let color_refs: Vec<vk::AttachmentReference> = (0..desc.color_formats.len() as u32)
            .map(|attachment| vk::AttachmentReference {
                attachment,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect();

        let depth_ref = desc.depth_format.map(|format| {
            let stencil_load_op = if format.has_stencil() {
                load_op
            } else {
                vk::AttachmentLoadOp::DONT_CARE
            };
            attachments.push(
                vk::AttachmentDescription::default()
                    .format(convert_image_format(format))
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(load_op)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(stencil_load_op)
                    .stencil_store_op(vk::AttachmentStoreOp::STORE)
                    .initial_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
            );
            vk::AttachmentReference {
                attachment: color_refs.len() as u32,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            }
        });

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if let Some(ref depth_ref) = depth_ref {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }
        let subpasses = [subpass];

        let attachment_stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        let attachment_access = vk::AccessFlags::COLOR_ATTACHMENT_READ
            | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        let dependencies = [
            // Earlier UI sampling and attachment writes finish before this pass writes
            vk::SubpassDependency {
                src_subpass: vk::SUBPASS_EXTERNAL,
                dst_subpass: 0,
                src_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER | attachment_stages,
                dst_stage_mask: attachment_stages,
                src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                dst_access_mask: attachment_access,
                dependency_flags: vk::DependencyFlags::empty(),
            },
            // Color writes are visible to later sampling by the UI
            vk::SubpassDependency {
                src_subpass: 0,
                dst_subpass: vk::SUBPASS_EXTERNAL,
                src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
                src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                dst_access_mask: vk::AccessFlags::SHADER_READ,
                dependency_flags: vk::DependencyFlags::empty(),
            },
        ];

        let info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let pass = unsafe { self.device.create_render_pass(&info, None) }
            .map_err(|e| DeviceError::PipelineCreationFailed(e.to_string()))?;

        let id = self.next_id();
        self.render_passes.insert(id, pass);
        Ok(RenderPassHandle(id))
    }

    fn destroy_render_pass(&mut self, pass: RenderPassHandle) {
        if let Some(raw) = self.render_passes.remove(&pass.0) {
            unsafe { self.device.destroy_render_pass(raw, None) };
        }
    }

    fn create_framebuffer(
        &mut self,
        pass: RenderPassHandle,
        attachments: &[ImageViewHandle],
        extent: Extent2D,
    ) -> DeviceResult<FramebufferHandle> {
        let render_pass = *self
            .render_passes
            .get(&pass.0)
            .ok_or_else(|| unknown("render pass", pass.0))?;
        let views = attachments
            .iter()
            .map(|&view| self.view(view))
            .collect::<DeviceResult<Vec<_>>>()?;

        let info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let framebuffer = unsafe { self.device.create_framebuffer(&info, None) }
            .map_err(|e| DeviceError::ImageCreationFailed(e.to_string()))?;

        let id = self.next_id();
        self.framebuffers.insert(id, framebuffer);
        Ok(FramebufferHandle(id))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if let Some(raw) = self.framebuffers.remove(&framebuffer.0) {
            unsafe { self.device.destroy_framebuffer(raw, None) };
        }
    }

    // === Pipelines ===

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDescriptor,
    ) -> DeviceResult<GraphicsPipelineHandle> {
        let render_pass = *self
            .render_passes
            .get(&desc.render_pass.0)
            .ok_or_else(|| unknown("render pass", desc.render_pass.0))?;
        let entry_err = |e: std::ffi::NulError| DeviceError::PipelineCreationFailed(e.to_string());
        let vertex_entry = CString::new(desc.vertex_entry.as_str()).map_err(entry_err)?;
        let fragment_entry = CString::new(desc.fragment_entry.as_str()).map_err(entry_err)?;

        let layout = self.create_pipeline_layout(&desc.table_layouts, desc.push_constants)?;
        let module = match self.create_shader_module(&desc.spirv) {
            Ok(module) => module,
            Err(e) => {
                unsafe { self.device.destroy_pipeline_layout(layout, None) };
                return Err(e);
            }
        };

        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(module)
                .name(&vertex_entry),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(module)
                .name(&fragment_entry),
        ];

        let (bindings, attributes): (
            Vec<vk::VertexInputBindingDescription>,
            Vec<vk::VertexInputAttributeDescription>,
        ) = match &desc.vertex_layout {
            Some(layout) => (
                vec![vk::VertexInputBindingDescription::default()
                    .binding(0)
                    .stride(layout.array_stride as u32)
                    .input_rate(vk::VertexInputRate::VERTEX)],
                layout
                    .attributes
                    .iter()
                    .map(|attr| {
                        vk::VertexInputAttributeDescription::default()
                            .location(attr.location)
                            .binding(0)
                            .format(convert_vertex_format(attr.format))
                            .offset(attr.offset as u32)
                    })
                    .collect(),
            ),
            None => (Vec::new(), Vec::new()),
        };

        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Dynamic viewport and scissor
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(convert_cull_mode(desc.cull_mode))
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(desc.depth.test)
            .depth_write_enable(desc.depth.write)
            .depth_compare_op(convert_compare_function(desc.depth.compare))
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)];
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0);

        let result = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        unsafe { self.device.destroy_shader_module(module, None) };

        let pipeline = match result {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                unsafe { self.device.destroy_pipeline_layout(layout, None) };
                return Err(DeviceError::PipelineCreationFailed(format!(
                    "{}: {}",
                    desc.label.as_deref().unwrap_or("graphics pipeline"),
                    e
                )));
            }
        };

        let id = self.next_id();
        self.graphics_pipelines
            .insert(id, VkPipeline { pipeline, layout });
        Ok(GraphicsPipelineHandle(id))
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> DeviceResult<ComputePipelineHandle> {
        let entry = CString::new(desc.entry.as_str())
            .map_err(|e| DeviceError::PipelineCreationFailed(e.to_string()))?;

        let layout = self.create_pipeline_layout(&desc.table_layouts, desc.push_constants)?;
        let module = match self.create_shader_module(&desc.spirv) {
            Ok(module) => module,
            Err(e) => {
                unsafe { self.device.destroy_pipeline_layout(layout, None) };
                return Err(e);
            }
        };

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&entry);
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);

        let result = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        unsafe { self.device.destroy_shader_module(module, None) };

        let pipeline = match result {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                unsafe { self.device.destroy_pipeline_layout(layout, None) };
                return Err(DeviceError::PipelineCreationFailed(format!(
                    "{}: {}",
                    desc.label.as_deref().unwrap_or("compute pipeline"),
                    e
                )));
            }
        };

        let id = self.next_id();
        self.compute_pipelines
            .insert(id, VkPipeline { pipeline, layout });
        Ok(ComputePipelineHandle(id))
    }

    fn destroy_graphics_pipeline(&mut self, pipeline: GraphicsPipelineHandle) {
        if let Some(raw) = self.graphics_pipelines.remove(&pipeline.0) {
            unsafe {
                self.device.destroy_pipeline(raw.pipeline, None);
                self.device.destroy_pipeline_layout(raw.layout, None);
            }
        }
    }

    fn destroy_compute_pipeline(&mut self, pipeline: ComputePipelineHandle) {
        if let Some(raw) = self.compute_pipelines.remove(&pipeline.0) {
            unsafe {
                self.device.destroy_pipeline(raw.pipeline, None);
                self.device.destroy_pipeline_layout(raw.layout, None);
            }
        }
    }

    // === Submission ===

    fn create_command_stream(&mut self, begin_immediately: bool) -> DeviceResult<CommandStream> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.device.allocate_command_buffers(&info) }
            .map_err(|e| DeviceError::RecordingFailed(e.to_string()))?[0];

        let id = self.next_id();
        self.streams.insert(id, cmd);
        let stream = CommandStream(id);
        if begin_immediately {
            self.begin_command_stream(stream)?;
        }
        Ok(stream)
    }

    fn begin_command_stream(&mut self, stream: CommandStream) -> DeviceResult<()> {
        let cmd = self.command_buffer(stream)?;
        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cmd, &info) }
            .map_err(|e| DeviceError::RecordingFailed(e.to_string()))
    }

    fn discard_command_stream(&mut self, stream: CommandStream) {
        if let Some(cmd) = self.streams.remove(&stream.0) {
            log::debug!("Discarding unsubmitted stream {}", stream.0);
            // Never submitted, so it cannot be pending
            unsafe { self.device.free_command_buffers(self.command_pool, &[cmd]) };
        }
    }

    fn submit(&mut self, stream: CommandStream, wait: bool) -> DeviceResult<SubmissionId> {
        let cmd = self
            .streams
            .remove(&stream.0)
            .ok_or_else(|| unknown("command stream", stream.0))?;
        if let Err(e) = unsafe { self.device.end_command_buffer(cmd) } {
            unsafe { self.device.free_command_buffers(self.command_pool, &[cmd]) };
            return Err(DeviceError::RecordingFailed(e.to_string()));
        }

        let fence = self.take_fence()?;
        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], fence)
        }
        .map_err(submit_error)?;

        let id = self.next_id();
        self.submissions.insert(
            id,
            VkSubmission {
                command_buffer: cmd,
                fence,
            },
        );
        let submission = SubmissionId(id);
        log::trace!("Submitted stream {} as submission {}", stream.0, id);

        if wait {
            self.wait_submission(submission)?;
        }
        Ok(submission)
    }

    fn is_submission_complete(&mut self, submission: SubmissionId) -> DeviceResult<bool> {
        let Some(entry) = self.submissions.get(&submission.0) else {
            // Already retired
            return Ok(true);
        };
        let complete = unsafe { self.device.get_fence_status(entry.fence) }.map_err(submit_error)?;
        if complete {
            self.release_submission(submission.0);
        }
        Ok(complete)
    }

    fn wait_submission(&mut self, submission: SubmissionId) -> DeviceResult<()> {
        let Some(entry) = self.submissions.get(&submission.0) else {
            return Ok(());
        };
        unsafe {
            self.device
                .wait_for_fences(&[entry.fence], true, u64::MAX)
        }
        .map_err(submit_error)?;
        self.release_submission(submission.0);
        Ok(())
    }

    fn wait_idle(&mut self) -> DeviceResult<()> {
        unsafe { self.device.device_wait_idle() }.map_err(submit_error)?;
        let retired: Vec<u64> = self.submissions.keys().copied().collect();
        for id in retired {
            self.release_submission(id);
        }
        Ok(())
    }

    // === Recording ===

    fn cmd_bind_pipeline(
        &mut self,
        stream: CommandStream,
        pipeline: PipelineRef,
    ) -> DeviceResult<()> {
        let (raw, bind_point) = self.pipeline(pipeline)?;
        let raw = raw.pipeline;
        self.record(stream, |device, cmd| unsafe {
            device.cmd_bind_pipeline(cmd, bind_point, raw)
        })
    }

    fn cmd_bind_table(
        &mut self,
        stream: CommandStream,
        pipeline: PipelineRef,
        set: u32,
        table: TableHandle,
    ) -> DeviceResult<()> {
        let (raw, bind_point) = self.pipeline(pipeline)?;
        let layout = raw.layout;
        let descriptor_set = self
            .tables
            .get(&table.0)
            .map(|t| t.set)
            .ok_or_else(|| unknown("table", table.0))?;
        self.record(stream, |device, cmd| unsafe {
            device.cmd_bind_descriptor_sets(cmd, bind_point, layout, set, &[descriptor_set], &[])
        })
    }

    fn cmd_push_constants(
        &mut self,
        stream: CommandStream,
        pipeline: PipelineRef,
        stages: ShaderStages,
        offset: u32,
        data: &[u8],
    ) -> DeviceResult<()> {
        let layout = self.pipeline(pipeline)?.0.layout;
        let stage_flags = convert_shader_stages(stages);
        self.record(stream, |device, cmd| unsafe {
            device.cmd_push_constants(cmd, layout, stage_flags, offset, data)
        })
    }

    fn cmd_dispatch(&mut self, stream: CommandStream, x: u32, y: u32, z: u32) -> DeviceResult<()> {
        self.record(stream, |device, cmd| unsafe { device.cmd_dispatch(cmd, x, y, z) })
    }

    fn cmd_compute_to_graphics_barrier(&mut self, stream: CommandStream) -> DeviceResult<()> {
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::SHADER_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ);
        self.record(stream, |device, cmd| unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            )
        })
    }

    fn cmd_begin_pass(
        &mut self,
        stream: CommandStream,
        pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        extent: Extent2D,
        clear_values: &[ClearValue],
    ) -> DeviceResult<()> {
        let render_pass = *self
            .render_passes
            .get(&pass.0)
            .ok_or_else(|| unknown("render pass", pass.0))?;
        let framebuffer = *self
            .framebuffers
            .get(&framebuffer.0)
            .ok_or_else(|| unknown("framebuffer", framebuffer.0))?;
        let clear_values: Vec<vk::ClearValue> =
            clear_values.iter().copied().map(convert_clear_value).collect();

        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: convert_extent(extent),
            })
            .clear_values(&clear_values);

        self.record(stream, |device, cmd| unsafe {
            device.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE)
        })
    }

    fn cmd_set_viewport(&mut self, stream: CommandStream, viewport: &Viewport) -> DeviceResult<()> {
        let viewport = vk::Viewport {
            x: viewport.x,
            y: viewport.y,
            width: viewport.width,
            height: viewport.height,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        };
        self.record(stream, |device, cmd| unsafe {
            device.cmd_set_viewport(cmd, 0, &[viewport])
        })
    }

    fn cmd_set_scissor(&mut self, stream: CommandStream, extent: Extent2D) -> DeviceResult<()> {
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: convert_extent(extent),
        };
        self.record(stream, |device, cmd| unsafe {
            device.cmd_set_scissor(cmd, 0, &[scissor])
        })
    }

    fn cmd_clear_attachments(
        &mut self,
        stream: CommandStream,
        attachments: &[ClearAttachment],
        rect: &ClearRect,
    ) -> DeviceResult<()> {
        let attachments: Vec<vk::ClearAttachment> =
            attachments.iter().map(convert_clear_attachment).collect();
        let rect = vk::ClearRect {
            rect: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: convert_extent(rect.extent),
            },
            base_array_layer: rect.base_array_layer,
            layer_count: rect.layer_count,
        };
        self.record(stream, |device, cmd| unsafe {
            device.cmd_clear_attachments(cmd, &attachments, &[rect])
        })
    }

    fn cmd_draw(
        &mut self,
        stream: CommandStream,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> DeviceResult<()> {
        self.record(stream, |device, cmd| unsafe {
            device.cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance)
        })
    }

    fn cmd_bind_vertex_buffer(
        &mut self,
        stream: CommandStream,
        buffer: BufferHandle,
        offset: u64,
    ) -> DeviceResult<()> {
        let buffer = self.buffer(buffer)?;
        self.record(stream, |device, cmd| unsafe {
            device.cmd_bind_vertex_buffers(cmd, 0, &[buffer], &[offset])
        })
    }

    fn cmd_bind_index_buffer(
        &mut self,
        stream: CommandStream,
        buffer: BufferHandle,
        offset: u64,
        format: IndexFormat,
    ) -> DeviceResult<()> {
        let buffer = self.buffer(buffer)?;
        let index_type = convert_index_format(format);
        self.record(stream, |device, cmd| unsafe {
            device.cmd_bind_index_buffer(cmd, buffer, offset, index_type)
        })
    }

    fn cmd_draw_indexed(
        &mut self,
        stream: CommandStream,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> DeviceResult<()> {
        self.record(stream, |device, cmd| unsafe {
            device.cmd_draw_indexed(
                cmd,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        })
    }

    fn cmd_end_pass(&mut self, stream: CommandStream) -> DeviceResult<()> {
        self.record(stream, |device, cmd| unsafe { device.cmd_end_render_pass(cmd) })
    }
}
