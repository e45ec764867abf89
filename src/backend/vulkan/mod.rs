//! Vulkan backend implementation using ash
//!
//! `VulkanDevice` implements [`RenderDevice`](crate::backend::RenderDevice)
//! for the offscreen passes and additionally owns the swapchain and the
//! per-frame command buffer the UI pass is recorded into.

mod conversion;
mod device;

use crate::backend::traits::*;
use ash::khr::{surface, swapchain};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::collections::HashMap;
use std::sync::Arc;
use winit::window::Window;

use crate::backend::types::ImageFormat;

struct VkBuffer {
    buffer: vk::Buffer,
    allocation: Allocation,
}

struct VkImage {
    image: vk::Image,
    allocation: Allocation,
    format: ImageFormat,
    array_layers: u32,
}

struct VkTable {
    set: vk::DescriptorSet,
    pool: u64,
}

struct VkPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

struct VkSubmission {
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

/// The swapchain image and command buffer of the frame being presented
#[derive(Debug, Clone, Copy)]
pub struct PresentFrame {
    pub command_buffer: vk::CommandBuffer,
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
}

/// Vulkan device, queue, swapchain and every object created through
/// [`RenderDevice`]
pub struct VulkanDevice {
    _entry: ash::Entry,
    instance: ash::Instance,
    surface_fn: surface::Instance,
    swapchain_fn: swapchain::Device,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    graphics_queue: vk::Queue,
    graphics_queue_family: u32,
    allocator: Option<Arc<Mutex<Allocator>>>,

    // Swapchain
    swapchain: vk::SwapchainKHR,
    swapchain_images: Vec<vk::Image>,
    swapchain_image_views: Vec<vk::ImageView>,
    swapchain_framebuffers: Vec<vk::Framebuffer>,
    swapchain_format: vk::Format,
    swapchain_extent: vk::Extent2D,
    current_image_index: u32,
    vsync: bool,

    // Presentation
    image_available_semaphore: vk::Semaphore,
    render_finished_semaphore: vk::Semaphore,
    in_flight_fence: vk::Fence,
    command_pool: vk::CommandPool,
    present_command_buffer: vk::CommandBuffer,
    ui_render_pass: vk::RenderPass,

    // Objects by handle id
    next_id: u64,
    buffers: HashMap<u64, VkBuffer>,
    images: HashMap<u64, VkImage>,
    views: HashMap<u64, vk::ImageView>,
    samplers: HashMap<u64, vk::Sampler>,
    pools: HashMap<u64, vk::DescriptorPool>,
    table_layouts: HashMap<u64, vk::DescriptorSetLayout>,
    tables: HashMap<u64, VkTable>,
    render_passes: HashMap<u64, vk::RenderPass>,
    framebuffers: HashMap<u64, vk::Framebuffer>,
    graphics_pipelines: HashMap<u64, VkPipeline>,
    compute_pipelines: HashMap<u64, VkPipeline>,
    streams: HashMap<u64, vk::CommandBuffer>,
    submissions: HashMap<u64, VkSubmission>,
    free_fences: Vec<vk::Fence>,
}

impl VulkanDevice {
    /// Create the instance, surface, device and swapchain for `window`.
    pub fn new(window: &Window, vsync: bool) -> DeviceResult<Self> {
        let init_err = |e: vk::Result| DeviceError::InitializationFailed(e.to_string());

        unsafe {
            let entry = ash::Entry::load()
                .map_err(|e| DeviceError::InitializationFailed(e.to_string()))?;

            let app_info = vk::ApplicationInfo::default()
                .application_name(c"Sky Viewport")
                .application_version(vk::make_api_version(0, 1, 0, 0))
                .engine_name(c"Sky Viewport")
                .engine_version(vk::make_api_version(0, 1, 0, 0))
                .api_version(vk::API_VERSION_1_2);

            let display_handle = window
                .display_handle()
                .map_err(|e| DeviceError::InitializationFailed(e.to_string()))?;
            let window_handle = window
                .window_handle()
                .map_err(|e| DeviceError::InitializationFailed(e.to_string()))?;

            let extensions = ash_window::enumerate_required_extensions(display_handle.as_raw())
                .map_err(init_err)?
                .to_vec();

            let instance_info = vk::InstanceCreateInfo::default()
                .application_info(&app_info)
                .enabled_extension_names(&extensions);

            let instance = entry
                .create_instance(&instance_info, None)
                .map_err(init_err)?;

            let surface_fn = surface::Instance::new(&entry, &instance);
            let surface = ash_window::create_surface(
                &entry,
                &instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
            .map_err(|e| DeviceError::SurfaceCreationFailed(e.to_string()))?;

            let physical_device = instance
                .enumerate_physical_devices()
                .map_err(init_err)?
                .into_iter()
                .find(|&pd| Self::find_queue_family(&instance, pd, &surface_fn, surface).is_some())
                .ok_or_else(|| {
                    DeviceError::InitializationFailed("No suitable physical device".into())
                })?;

            let graphics_queue_family =
                Self::find_queue_family(&instance, physical_device, &surface_fn, surface)
                    .ok_or_else(|| {
                        DeviceError::InitializationFailed("No suitable queue family".into())
                    })?;

            let properties = instance.get_physical_device_properties(physical_device);
            let name = properties
                .device_name_as_c_str()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            log::info!("Using Vulkan device: {}", name);

            let queue_priorities = [1.0f32];
            let queue_infos = [vk::DeviceQueueCreateInfo::default()
                .queue_family_index(graphics_queue_family)
                .queue_priorities(&queue_priorities)];

            let device_extensions = [swapchain::NAME.as_ptr()];
            let device_features = vk::PhysicalDeviceFeatures::default();

            let device_info = vk::DeviceCreateInfo::default()
                .queue_create_infos(&queue_infos)
                .enabled_extension_names(&device_extensions)
                .enabled_features(&device_features);

            let device = instance
                .create_device(physical_device, &device_info, None)
                .map_err(init_err)?;

            let graphics_queue = device.get_device_queue(graphics_queue_family, 0);

            let allocator = Allocator::new(&AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            })
            .map_err(|e| DeviceError::InitializationFailed(e.to_string()))?;

            let swapchain_fn = swapchain::Device::new(&instance, &device);

            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(graphics_queue_family)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            let command_pool = device
                .create_command_pool(&pool_info, None)
                .map_err(init_err)?;

            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let present_command_buffer = device
                .allocate_command_buffers(&alloc_info)
                .map_err(init_err)?[0];

            let semaphore_info = vk::SemaphoreCreateInfo::default();
            let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);

            let image_available_semaphore = device
                .create_semaphore(&semaphore_info, None)
                .map_err(init_err)?;
            let render_finished_semaphore = device
                .create_semaphore(&semaphore_info, None)
                .map_err(init_err)?;
            let in_flight_fence = device.create_fence(&fence_info, None).map_err(init_err)?;

            let mut backend = Self {
                _entry: entry,
                instance,
                surface_fn,
                swapchain_fn,
                surface,
                physical_device,
                device,
                graphics_queue,
                graphics_queue_family,
                allocator: Some(Arc::new(Mutex::new(allocator))),
                swapchain: vk::SwapchainKHR::null(),
                swapchain_images: Vec::new(),
                swapchain_image_views: Vec::new(),
                swapchain_framebuffers: Vec::new(),
                swapchain_format: vk::Format::B8G8R8A8_SRGB,
                swapchain_extent: vk::Extent2D::default(),
                current_image_index: 0,
                vsync,
                image_available_semaphore,
                render_finished_semaphore,
                in_flight_fence,
                command_pool,
                present_command_buffer,
                ui_render_pass: vk::RenderPass::null(),
                next_id: 1,
                buffers: HashMap::new(),
                images: HashMap::new(),
                views: HashMap::new(),
                samplers: HashMap::new(),
                pools: HashMap::new(),
                table_layouts: HashMap::new(),
                tables: HashMap::new(),
                render_passes: HashMap::new(),
                framebuffers: HashMap::new(),
                graphics_pipelines: HashMap::new(),
                compute_pipelines: HashMap::new(),
                streams: HashMap::new(),
                submissions: HashMap::new(),
                free_fences: Vec::new(),
            };

            let size = window.inner_size();
            backend.create_swapchain(size.width.max(1), size.height.max(1))?;
            backend.ui_render_pass =
                Self::create_ui_render_pass(&backend.device, backend.swapchain_format)?;
            backend.create_swapchain_framebuffers()?;

            Ok(backend)
        }
    }

    /// The logical device
    pub fn logical_device(&self) -> &ash::Device {
        &self.device
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }

    /// Render pass the UI is drawn with, targeting the swapchain
    pub fn ui_render_pass(&self) -> vk::RenderPass {
        self.ui_render_pass
    }

    pub fn swapchain_extent(&self) -> vk::Extent2D {
        self.swapchain_extent
    }

    /// Raw descriptor set behind a table handle
    pub fn raw_table(&self, table: TableHandle) -> Option<vk::DescriptorSet> {
        self.tables.get(&table.0).map(|t| t.set)
    }

    /// Recreate the swapchain after the window surface changed size.
    pub fn resize_surface(&mut self, width: u32, height: u32) -> DeviceResult<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        self.create_swapchain(width, height)?;
        self.create_swapchain_framebuffers()?;
        log::info!(
            "Swapchain recreated at {}x{}",
            self.swapchain_extent.width,
            self.swapchain_extent.height
        );
        Ok(())
    }

    /// Acquire the next swapchain image and begin the presentation command buffer.
    ///
    /// Returns [`DeviceError::SurfaceLost`] when the swapchain is out of date.
    pub fn begin_frame(&mut self) -> DeviceResult<PresentFrame> {
        unsafe {
            self.device
                .wait_for_fences(&[self.in_flight_fence], true, u64::MAX)
                .map_err(|e| DeviceError::AcquireImageFailed(e.to_string()))?;

            let (image_index, _) = self
                .swapchain_fn
                .acquire_next_image(
                    self.swapchain,
                    u64::MAX,
                    self.image_available_semaphore,
                    vk::Fence::null(),
                )
                .map_err(|e| match e {
                    vk::Result::ERROR_OUT_OF_DATE_KHR => DeviceError::SurfaceLost,
                    _ => DeviceError::AcquireImageFailed(e.to_string()),
                })?;

            self.current_image_index = image_index;

            self.device
                .reset_fences(&[self.in_flight_fence])
                .map_err(|e| DeviceError::AcquireImageFailed(e.to_string()))?;
            self.device
                .reset_command_buffer(
                    self.present_command_buffer,
                    vk::CommandBufferResetFlags::empty(),
                )
                .map_err(|e| DeviceError::RecordingFailed(e.to_string()))?;
            self.device
                .begin_command_buffer(
                    self.present_command_buffer,
                    &vk::CommandBufferBeginInfo::default(),
                )
                .map_err(|e| DeviceError::RecordingFailed(e.to_string()))?;

            Ok(PresentFrame {
                command_buffer: self.present_command_buffer,
                render_pass: self.ui_render_pass,
                framebuffer: self.swapchain_framebuffers[image_index as usize],
                extent: self.swapchain_extent,
            })
        }
    }

    /// Submit the presentation command buffer and present the image.
    pub fn end_frame(&mut self) -> DeviceResult<()> {
        unsafe {
            self.device
                .end_command_buffer(self.present_command_buffer)
                .map_err(|e| DeviceError::RecordingFailed(e.to_string()))?;

            let wait_semaphores = [self.image_available_semaphore];
            let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
            let signal_semaphores = [self.render_finished_semaphore];
            let command_buffers = [self.present_command_buffer];

            let submit_info = vk::SubmitInfo::default()
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages)
                .command_buffers(&command_buffers)
                .signal_semaphores(&signal_semaphores);

            self.device
                .queue_submit(self.graphics_queue, &[submit_info], self.in_flight_fence)
                .map_err(|e| DeviceError::SubmitFailed(e.to_string()))?;

            let swapchains = [self.swapchain];
            let image_indices = [self.current_image_index];
            let present_info = vk::PresentInfoKHR::default()
                .wait_semaphores(&signal_semaphores)
                .swapchains(&swapchains)
                .image_indices(&image_indices);

            match self.swapchain_fn.queue_present(self.graphics_queue, &present_info) {
                Ok(_) => Ok(()),
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(DeviceError::SurfaceLost),
                Err(e) => Err(DeviceError::PresentFailed(e.to_string())),
            }
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn find_queue_family(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        surface_fn: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Option<u32> {
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        queue_families
            .iter()
            .enumerate()
            .find(|(index, family)| {
                let supports_compute_and_graphics = family
                    .queue_flags
                    .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE);
                let supports_surface = unsafe {
                    surface_fn
                        .get_physical_device_surface_support(
                            physical_device,
                            *index as u32,
                            surface,
                        )
                        .unwrap_or(false)
                };
                supports_compute_and_graphics && supports_surface
            })
            .map(|(index, _)| index as u32)
    }

    /// Render pass for the UI: clears the swapchain image and leaves it presentable
    fn create_ui_render_pass(
        device: &ash::Device,
        format: vk::Format,
    ) -> DeviceResult<vk::RenderPass> {
        let attachments = [vk::AttachmentDescription::default()
            .format(format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)];

        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];

        let subpasses = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)];

        let dependencies = [vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            src_access_mask: vk::AccessFlags::empty(),
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dependency_flags: vk::DependencyFlags::empty(),
        }];

        let render_pass_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        unsafe { device.create_render_pass(&render_pass_info, None) }
            .map_err(|e| DeviceError::InitializationFailed(e.to_string()))
    }

    fn destroy_swapchain_objects(&mut self) {
        unsafe {
            for framebuffer in self.swapchain_framebuffers.drain(..) {
                self.device.destroy_framebuffer(framebuffer, None);
            }
            for view in self.swapchain_image_views.drain(..) {
                self.device.destroy_image_view(view, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                self.swapchain_fn.destroy_swapchain(self.swapchain, None);
                self.swapchain = vk::SwapchainKHR::null();
            }
        }
    }

    fn create_swapchain(&mut self, width: u32, height: u32) -> DeviceResult<()> {
        let swapchain_err = |e: vk::Result| DeviceError::SwapchainCreationFailed(e.to_string());

        unsafe {
            self.device.device_wait_idle().map_err(swapchain_err)?;
            self.destroy_swapchain_objects();

            let capabilities = self
                .surface_fn
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
                .map_err(swapchain_err)?;
            let formats = self
                .surface_fn
                .get_physical_device_surface_formats(self.physical_device, self.surface)
                .map_err(swapchain_err)?;
            let present_modes = self
                .surface_fn
                .get_physical_device_surface_present_modes(self.physical_device, self.surface)
                .map_err(swapchain_err)?;

            // Prefer sRGB
            let format = formats
                .iter()
                .find(|f| {
                    f.format == vk::Format::B8G8R8A8_SRGB
                        && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
                })
                .or_else(|| formats.first())
                .copied()
                .ok_or_else(|| {
                    DeviceError::SwapchainCreationFailed("Surface reports no formats".into())
                })?;

            let present_mode = if self.vsync {
                vk::PresentModeKHR::FIFO
            } else {
                present_modes
                    .iter()
                    .copied()
                    .find(|&m| m == vk::PresentModeKHR::MAILBOX)
                    .unwrap_or(vk::PresentModeKHR::FIFO)
            };

            let extent = if capabilities.current_extent.width != u32::MAX {
                capabilities.current_extent
            } else {
                vk::Extent2D {
                    width: width.clamp(
                        capabilities.min_image_extent.width,
                        capabilities.max_image_extent.width,
                    ),
                    height: height.clamp(
                        capabilities.min_image_extent.height,
                        capabilities.max_image_extent.height,
                    ),
                }
            };

            let image_count = if capabilities.max_image_count > 0 {
                (capabilities.min_image_count + 1).min(capabilities.max_image_count)
            } else {
                capabilities.min_image_count + 1
            };

            let swapchain_info = vk::SwapchainCreateInfoKHR::default()
                .surface(self.surface)
                .min_image_count(image_count)
                .image_format(format.format)
                .image_color_space(format.color_space)
                .image_extent(extent)
                .image_array_layers(1)
                .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
                .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
                .pre_transform(capabilities.current_transform)
                .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                .present_mode(present_mode)
                .clipped(true);

            self.swapchain = self
                .swapchain_fn
                .create_swapchain(&swapchain_info, None)
                .map_err(swapchain_err)?;
            self.swapchain_images = self
                .swapchain_fn
                .get_swapchain_images(self.swapchain)
                .map_err(swapchain_err)?;
            self.swapchain_format = format.format;
            self.swapchain_extent = extent;

            self.swapchain_image_views = self
                .swapchain_images
                .iter()
                .map(|&image| {
                    let view_info = vk::ImageViewCreateInfo::default()
                        .image(image)
                        .view_type(vk::ImageViewType::TYPE_2D)
                        .format(format.format)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            base_mip_level: 0,
                            level_count: 1,
                            base_array_layer: 0,
                            layer_count: 1,
                        });
                    self.device.create_image_view(&view_info, None)
                })
                .collect::<Result<Vec<_>, _>>()
                .map_err(swapchain_err)?;

            Ok(())
        }
    }

    fn create_swapchain_framebuffers(&mut self) -> DeviceResult<()> {
        let extent = self.swapchain_extent;
        let render_pass = self.ui_render_pass;
        self.swapchain_framebuffers = self
            .swapchain_image_views
            .iter()
            .map(|view| {
                let attachments = [*view];
                let info = vk::FramebufferCreateInfo::default()
                    .render_pass(render_pass)
                    .attachments(&attachments)
                    .width(extent.width)
                    .height(extent.height)
                    .layers(1);
                unsafe { self.device.create_framebuffer(&info, None) }
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DeviceError::SwapchainCreationFailed(e.to_string()))?;
        Ok(())
    }

    /// Record and run a one-off command buffer, blocking until it finishes.
    fn immediate_submit<F>(&self, record: F) -> DeviceResult<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let submit_err = |e: vk::Result| DeviceError::SubmitFailed(e.to_string());

        unsafe {
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(self.command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cmd = self
                .device
                .allocate_command_buffers(&alloc_info)
                .map_err(submit_err)?[0];

            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(submit_err)?;

            record(&self.device, cmd);

            self.device.end_command_buffer(cmd).map_err(submit_err)?;

            let command_buffers = [cmd];
            let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
            let result = self
                .device
                .queue_submit(self.graphics_queue, &[submit_info], vk::Fence::null())
                .and_then(|_| self.device.queue_wait_idle(self.graphics_queue));

            self.device.free_command_buffers(self.command_pool, &command_buffers);
            result.map_err(submit_err)
        }
    }

    fn release_submission(&mut self, id: u64) {
        if let Some(submission) = self.submissions.remove(&id) {
            unsafe {
                self.device
                    .free_command_buffers(self.command_pool, &[submission.command_buffer]);
                if self.device.reset_fences(&[submission.fence]).is_ok() {
                    self.free_fences.push(submission.fence);
                } else {
                    self.device.destroy_fence(submission.fence, None);
                }
            }
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            let submissions: Vec<u64> = self.submissions.keys().copied().collect();
            for id in submissions {
                self.release_submission(id);
            }
            for (_, cmd) in self.streams.drain() {
                self.device.free_command_buffers(self.command_pool, &[cmd]);
            }
            for fence in self.free_fences.drain(..) {
                self.device.destroy_fence(fence, None);
            }

            for (_, pipeline) in self
                .graphics_pipelines
                .drain()
                .chain(self.compute_pipelines.drain())
            {
                self.device.destroy_pipeline(pipeline.pipeline, None);
                self.device.destroy_pipeline_layout(pipeline.layout, None);
            }
            for (_, framebuffer) in self.framebuffers.drain() {
                self.device.destroy_framebuffer(framebuffer, None);
            }
            for (_, pass) in self.render_passes.drain() {
                self.device.destroy_render_pass(pass, None);
            }

            self.tables.clear();
            for (_, pool) in self.pools.drain() {
                self.device.destroy_descriptor_pool(pool, None);
            }
            for (_, layout) in self.table_layouts.drain() {
                self.device.destroy_descriptor_set_layout(layout, None);
            }

            for (_, sampler) in self.samplers.drain() {
                self.device.destroy_sampler(sampler, None);
            }
            for (_, view) in self.views.drain() {
                self.device.destroy_image_view(view, None);
            }

            if let Some(ref allocator) = self.allocator {
                for (_, buffer) in self.buffers.drain() {
                    self.device.destroy_buffer(buffer.buffer, None);
                    let _ = allocator.lock().free(buffer.allocation);
                }
                for (_, image) in self.images.drain() {
                    self.device.destroy_image(image.image, None);
                    let _ = allocator.lock().free(image.allocation);
                }
            }

            // The allocator must go before the device
            drop(self.allocator.take());

            self.device.destroy_command_pool(self.command_pool, None);
            self.device
                .destroy_semaphore(self.image_available_semaphore, None);
            self.device
                .destroy_semaphore(self.render_finished_semaphore, None);
            self.device.destroy_fence(self.in_flight_fence, None);

            self.destroy_swapchain_objects();
            self.device.destroy_render_pass(self.ui_render_pass, None);

            self.device.destroy_device(None);
            self.surface_fn.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}
