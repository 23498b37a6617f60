//! ash/Vulkan implementation of [`GraphicsBackend`].
//!
//! Requires Vulkan 1.3 with dynamic rendering. Ids crossing the seam are the
//! raw Vulkan handles.

mod convert;
mod device;
mod pipeline;
mod record;
mod swapchain;

use self::convert::{raw, typed};
use self::record::Recorder;
use self::swapchain::{Swapchain, SwapchainParams};
use super::{
    AcquireStatus, BufferId, BufferUsageBits, CommandBufferId, DescriptorBinding,
    DescriptorPoolId, DescriptorPoolSizes, DescriptorResource, DescriptorSetId,
    DescriptorSetLayoutId, DescriptorWrite, DeviceCommand, DeviceMemory, DeviceProperties,
    FenceId, GraphicsBackend, GraphicsPipelineDesc, ImageAspect, ImageCreateInfo, ImageId,
    ImageViewId, MemoryId, MemoryRequest, MemoryRequirements, PipelineId, PipelineLayoutId,
    PresentStatus, QueryPoolId, SamplerId, SemaphoreId, ShaderStages, SubmitInfo,
    SwapChainImages, SwapChainRequest, SwapchainId, WindowSource,
};
use crate::config::{BackendKind, GraphicsConfig};
use crate::error::{GfxError, Result};
use ash::vk;
use hashbrown::HashMap;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::CStr;
use std::ptr::NonNull;
use tinker_core::{DescriptorType, ImageFormat};
use tracing::{debug, info, warn};

/// How long an acquire may block before the frame is skipped.
const ACQUIRE_TIMEOUT_NS: u64 = 1_000_000_000;

struct MemoryBlock {
    size: u64,
    mapped: bool,
}

struct SurfaceChain {
    surface: vk::SurfaceKHR,
    chain: Swapchain,
}

/// Vulkan device plus the presentation state it owns.
pub struct VulkanBackend {
    entry: ash::Entry,
    instance: ash::Instance,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    debug_labels: Option<ash::ext::debug_utils::Device>,
    surface_loader: Option<ash::khr::surface::Instance>,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue_family: u32,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    swapchain_loader: ash::khr::swapchain::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    properties: DeviceProperties,
    memories: HashMap<u64, MemoryBlock>,
    layout_dynamic_counts: HashMap<u64, u32>,
    set_dynamic_counts: HashMap<u64, u32>,
    swapchains: HashMap<u64, SurfaceChain>,
    next_swapchain: u64,
}

impl VulkanBackend {
    /// Load the Vulkan library and create the device. Surface extensions are
    /// only enabled when a window is given.
    pub fn new(config: &GraphicsConfig, window: Option<&dyn WindowSource>) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| GfxError::Loader(e.to_string()))?;

        let display = window
            .map(|w| {
                w.display_handle()
                    .map(|h| h.as_raw())
                    .map_err(|e| GfxError::SurfaceCreation(e.to_string()))
            })
            .transpose()?;

        let bundle =
            unsafe { device::create_instance(&entry, &config.app_name, config.validation, display)? };
        let instance = bundle.instance;

        let selected = match unsafe { device::select_physical_device(&instance) } {
            Ok(selected) => selected,
            Err(e) => {
                unsafe { destroy_instance(&instance, bundle.debug_utils.as_ref()) };
                return Err(e);
            }
        };
        let (device, queue) = match unsafe { device::create_device(&instance, &selected) } {
            Ok(created) => created,
            Err(e) => {
                unsafe { destroy_instance(&instance, bundle.debug_utils.as_ref()) };
                return Err(e);
            }
        };

        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(selected.queue_family);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None)? };

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(selected.physical_device) };
        let limits = &selected.properties.limits;
        let properties = DeviceProperties {
            device_name: selected
                .properties
                .device_name_as_c_str()
                .map(CStr::to_string_lossy)
                .unwrap_or_default()
                .into_owned(),
            non_coherent_atom_size: limits.non_coherent_atom_size.max(1),
            timestamp_period: limits.timestamp_period,
            max_push_constants_size: limits.max_push_constants_size,
        };

        let surface_loader = window.map(|_| ash::khr::surface::Instance::new(&entry, &instance));
        let swapchain_loader = ash::khr::swapchain::Device::new(&instance, &device);
        let debug_labels = bundle
            .debug_utils
            .as_ref()
            .map(|_| ash::ext::debug_utils::Device::new(&instance, &device));

        info!(device = %properties.device_name, "Vulkan backend ready");

        Ok(Self {
            entry,
            instance,
            debug_utils: bundle.debug_utils,
            debug_labels,
            surface_loader,
            physical_device: selected.physical_device,
            device,
            queue_family: selected.queue_family,
            queue,
            command_pool,
            swapchain_loader,
            memory_properties,
            properties,
            memories: HashMap::new(),
            layout_dynamic_counts: HashMap::new(),
            set_dynamic_counts: HashMap::new(),
            swapchains: HashMap::new(),
            next_swapchain: 1,
        })
    }

    fn surface_loader(&self) -> Result<&ash::khr::surface::Instance> {
        self.surface_loader.as_ref().ok_or_else(|| {
            GfxError::SurfaceCreation("backend was created without a window".into())
        })
    }

    unsafe fn swapchain_params(
        &self,
        surface: vk::SurfaceKHR,
        request: &SwapChainRequest,
    ) -> Result<SwapchainParams> {
        let loader = self.surface_loader()?;
        let pd = self.physical_device;
        let (capabilities, formats, modes) = unsafe {
            (
                loader.get_physical_device_surface_capabilities(pd, surface)?,
                loader.get_physical_device_surface_formats(pd, surface)?,
                loader.get_physical_device_surface_present_modes(pd, surface)?,
            )
        };
        let surface_format = swapchain::select_surface_format(&formats).ok_or_else(|| {
            GfxError::SwapChainCreation("surface offers no supported color format".into())
        })?;
        Ok(SwapchainParams {
            surface,
            capabilities,
            surface_format,
            present_mode: swapchain::select_present_mode(&modes, request.vsync),
            extent: swapchain::calculate_extent(&capabilities, request.width, request.height),
            desired_image_count: request.image_count,
            queue_family: self.queue_family,
        })
    }

    fn chain_images(swapchain: SwapchainId, chain: &Swapchain) -> Result<SwapChainImages> {
        let format = convert::image_format(chain.format).ok_or_else(|| {
            GfxError::SwapChainCreation(format!("unexpected format {:?}", chain.format))
        })?;
        Ok(SwapChainImages {
            swapchain,
            format,
            width: chain.extent.width,
            height: chain.extent.height,
            images: chain
                .images
                .iter()
                .zip(&chain.image_views)
                .map(|(&image, &view)| (ImageId(raw(image)), ImageViewId(raw(view))))
                .collect(),
        })
    }
}

unsafe fn destroy_instance(
    instance: &ash::Instance,
    debug_utils: Option<&(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
) {
    unsafe {
        if let Some((loader, messenger)) = debug_utils {
            loader.destroy_debug_utils_messenger(*messenger, None);
        }
        instance.destroy_instance(None);
    }
}

fn requirements(req: vk::MemoryRequirements) -> MemoryRequirements {
    MemoryRequirements {
        size: req.size,
        alignment: req.alignment,
        memory_type_bits: req.memory_type_bits,
    }
}

const fn align_down(value: u64, align: u64) -> u64 {
    value / align * align
}

const fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

impl GraphicsBackend for VulkanBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Vulkan
    }

    fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    fn wait_idle(&mut self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    fn allocate_memory(&mut self, request: &MemoryRequest) -> Result<DeviceMemory> {
        let flags = if request.host_visible {
            vk::MemoryPropertyFlags::HOST_VISIBLE
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        };
        let type_index =
            device::find_memory_type(&self.memory_properties, request.memory_type_bits, flags)
                .ok_or_else(|| GfxError::Other(format!("no memory type with {flags:?}")))?;

        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(request.size)
            .memory_type_index(type_index);
        let memory = unsafe { self.device.allocate_memory(&info, None)? };

        let mapped = if request.host_visible {
            let ptr = unsafe {
                self.device
                    .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            };
            match ptr {
                Ok(ptr) => NonNull::new(ptr.cast::<u8>()),
                Err(e) => {
                    unsafe { self.device.free_memory(memory, None) };
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        self.memories.insert(
            raw(memory),
            MemoryBlock {
                size: request.size,
                mapped: mapped.is_some(),
            },
        );
        debug!(size = request.size, type_index, "Allocated device memory");
        Ok(DeviceMemory {
            memory: MemoryId(raw(memory)),
            mapped,
        })
    }

    fn free_memory(&mut self, memory: MemoryId) {
        let handle: vk::DeviceMemory = typed(memory.0);
        if let Some(block) = self.memories.remove(&memory.0) {
            unsafe {
                if block.mapped {
                    self.device.unmap_memory(handle);
                }
                self.device.free_memory(handle, None);
            }
        }
    }

    fn flush_mapped_range(&mut self, memory: MemoryId, offset: u64, size: u64) -> Result<()> {
        let block = self
            .memories
            .get(&memory.0)
            .ok_or_else(|| GfxError::InvalidState(format!("unknown memory {memory:?}")))?;
        let atom = self.properties.non_coherent_atom_size;
        let start = align_down(offset, atom);
        let end = align_up(offset + size, atom);
        let flush_size = if end >= block.size {
            vk::WHOLE_SIZE
        } else {
            end - start
        };
        let range = vk::MappedMemoryRange::default()
            .memory(typed(memory.0))
            .offset(start)
            .size(flush_size);
        unsafe { self.device.flush_mapped_memory_ranges(&[range])? };
        Ok(())
    }

    fn create_buffer(&mut self, size: u64, usage: BufferUsageBits) -> Result<BufferId> {
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(convert::buffer_usage(usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None)? };
        Ok(BufferId(raw(buffer)))
    }

    fn buffer_memory_requirements(&self, buffer: BufferId) -> MemoryRequirements {
        requirements(unsafe { self.device.get_buffer_memory_requirements(typed(buffer.0)) })
    }

    fn bind_buffer_memory(&mut self, buffer: BufferId, memory: MemoryId, offset: u64) -> Result<()> {
        unsafe {
            self.device
                .bind_buffer_memory(typed(buffer.0), typed(memory.0), offset)?;
        }
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        unsafe { self.device.destroy_buffer(typed(buffer.0), None) };
    }

    fn create_image(&mut self, info: &ImageCreateInfo) -> Result<ImageId> {
        let format = convert::format(info.format)
            .ok_or_else(|| GfxError::InvalidState(format!("cannot create {:?} image", info.format)))?;
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: info.width,
                height: info.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(info.array_layers.max(1))
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert::image_usage(info.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&create_info, None)? };
        Ok(ImageId(raw(image)))
    }

    fn image_memory_requirements(&self, image: ImageId) -> MemoryRequirements {
        requirements(unsafe { self.device.get_image_memory_requirements(typed(image.0)) })
    }

    fn bind_image_memory(&mut self, image: ImageId, memory: MemoryId, offset: u64) -> Result<()> {
        unsafe {
            self.device
                .bind_image_memory(typed(image.0), typed(memory.0), offset)?;
        }
        Ok(())
    }

    fn create_image_view(
        &mut self,
        image: ImageId,
        format: ImageFormat,
        array_layers: u32,
    ) -> Result<ImageViewId> {
        let vk_format = convert::format(format)
            .ok_or_else(|| GfxError::InvalidState(format!("cannot view {format:?} image")))?;
        let view_type = if array_layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let info = vk::ImageViewCreateInfo::default()
            .image(typed(image.0))
            .view_type(view_type)
            .format(vk_format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(convert::aspect(ImageAspect::for_format(format)))
                    .level_count(1)
                    .layer_count(array_layers.max(1)),
            );
        let view = unsafe { self.device.create_image_view(&info, None)? };
        Ok(ImageViewId(raw(view)))
    }

    fn destroy_image_view(&mut self, view: ImageViewId) {
        unsafe { self.device.destroy_image_view(typed(view.0), None) };
    }

    fn destroy_image(&mut self, image: ImageId) {
        unsafe { self.device.destroy_image(typed(image.0), None) };
    }

    fn create_linear_sampler(&mut self) -> Result<SamplerId> {
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .compare_op(vk::CompareOp::ALWAYS)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK);
        let sampler = unsafe { self.device.create_sampler(&info, None)? };
        Ok(SamplerId(raw(sampler)))
    }

    fn destroy_sampler(&mut self, sampler: SamplerId) {
        unsafe { self.device.destroy_sampler(typed(sampler.0), None) };
    }

    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[DescriptorBinding],
    ) -> Result<DescriptorSetLayoutId> {
        let vk_bindings: Vec<_> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(convert::descriptor_type(b.ty))
                    .descriptor_count(b.count)
                    .stage_flags(vk::ShaderStageFlags::ALL)
            })
            .collect();
        let binding_flags: Vec<_> = bindings
            .iter()
            .map(|b| {
                if b.ty == DescriptorType::ArrayOfTextures {
                    vk::DescriptorBindingFlags::PARTIALLY_BOUND
                } else {
                    vk::DescriptorBindingFlags::empty()
                }
            })
            .collect();
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&vk_bindings)
            .push_next(&mut flags_info);
        let layout = unsafe { self.device.create_descriptor_set_layout(&info, None)? };

        let dynamic: u32 = bindings
            .iter()
            .filter(|b| b.ty == DescriptorType::DynamicBuffer)
            .map(|b| b.count)
            .sum();
        if dynamic > 0 {
            self.layout_dynamic_counts.insert(raw(layout), dynamic);
        }
        Ok(DescriptorSetLayoutId(raw(layout)))
    }

    fn destroy_descriptor_set_layout(&mut self, layout: DescriptorSetLayoutId) {
        self.layout_dynamic_counts.remove(&layout.0);
        unsafe {
            self.device
                .destroy_descriptor_set_layout(typed(layout.0), None);
        }
    }

    fn create_descriptor_pool(&mut self, sizes: &DescriptorPoolSizes) -> Result<DescriptorPoolId> {
        let pool_sizes: Vec<_> = [
            (vk::DescriptorType::UNIFORM_BUFFER, sizes.uniform_buffers),
            (vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, sizes.dynamic_uniform_buffers),
            (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, sizes.sampled_images),
            (vk::DescriptorType::STORAGE_BUFFER, sizes.storage_buffers),
            (vk::DescriptorType::STORAGE_IMAGE, sizes.storage_images),
        ]
        .into_iter()
        .filter(|&(_, count)| count > 0)
        .map(|(ty, descriptor_count)| vk::DescriptorPoolSize {
            ty,
            descriptor_count,
        })
        .collect();
        let info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(sizes.max_sets())
            .pool_sizes(&pool_sizes);
        let pool = unsafe { self.device.create_descriptor_pool(&info, None)? };
        Ok(DescriptorPoolId(raw(pool)))
    }

    fn destroy_descriptor_pool(&mut self, pool: DescriptorPoolId) {
        unsafe { self.device.destroy_descriptor_pool(typed(pool.0), None) };
    }

    fn allocate_descriptor_sets(
        &mut self,
        pool: DescriptorPoolId,
        layout: DescriptorSetLayoutId,
        count: u32,
    ) -> Result<Vec<DescriptorSetId>> {
        let layouts = vec![typed::<vk::DescriptorSetLayout>(layout.0); count as usize];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(typed(pool.0))
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&info) }.map_err(|e| match e {
            vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                GfxError::DescriptorPoolExhausted
            }
            other => GfxError::Vulkan(other),
        })?;

        let dynamic = self.layout_dynamic_counts.get(&layout.0).copied();
        Ok(sets
            .into_iter()
            .map(|set| {
                if let Some(count) = dynamic {
                    self.set_dynamic_counts.insert(raw(set), count);
                }
                DescriptorSetId(raw(set))
            })
            .collect())
    }

    fn free_descriptor_sets(
        &mut self,
        pool: DescriptorPoolId,
        sets: &[DescriptorSetId],
    ) -> Result<()> {
        let handles: Vec<vk::DescriptorSet> = sets
            .iter()
            .map(|set| {
                self.set_dynamic_counts.remove(&set.0);
                typed(set.0)
            })
            .collect();
        unsafe {
            self.device
                .free_descriptor_sets(typed(pool.0), &handles)?;
        }
        Ok(())
    }

    fn update_descriptor_sets(&mut self, writes: &[DescriptorWrite]) {
        enum Info {
            Buffer(usize),
            Image(usize),
        }

        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        let mut infos = Vec::with_capacity(writes.len());
        for write in writes {
            let (ty, info) = match write.resource {
                DescriptorResource::UniformBuffer { buffer, range }
                | DescriptorResource::DynamicUniformBuffer { buffer, range }
                | DescriptorResource::StorageBuffer { buffer, range } => {
                    buffer_infos.push(
                        vk::DescriptorBufferInfo::default()
                            .buffer(typed(buffer.0))
                            .offset(0)
                            .range(range),
                    );
                    let ty = match write.resource {
                        DescriptorResource::UniformBuffer { .. } => {
                            vk::DescriptorType::UNIFORM_BUFFER
                        }
                        DescriptorResource::DynamicUniformBuffer { .. } => {
                            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
                        }
                        _ => vk::DescriptorType::STORAGE_BUFFER,
                    };
                    (ty, Info::Buffer(buffer_infos.len() - 1))
                }
                DescriptorResource::SampledImage { view, sampler } => {
                    image_infos.push(
                        vk::DescriptorImageInfo::default()
                            .image_view(typed(view.0))
                            .sampler(typed(sampler.0))
                            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
                    );
                    (
                        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                        Info::Image(image_infos.len() - 1),
                    )
                }
                DescriptorResource::StorageImage { view } => {
                    image_infos.push(
                        vk::DescriptorImageInfo::default()
                            .image_view(typed(view.0))
                            .image_layout(vk::ImageLayout::GENERAL),
                    );
                    (
                        vk::DescriptorType::STORAGE_IMAGE,
                        Info::Image(image_infos.len() - 1),
                    )
                }
            };
            infos.push((ty, info));
        }

        let vk_writes: Vec<_> = writes
            .iter()
            .zip(&infos)
            .map(|(write, (ty, info))| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(typed(write.set.0))
                    .dst_binding(write.binding)
                    .dst_array_element(write.array_element)
                    .descriptor_type(*ty);
                match *info {
                    Info::Buffer(i) => base.buffer_info(std::slice::from_ref(&buffer_infos[i])),
                    Info::Image(i) => base.image_info(std::slice::from_ref(&image_infos[i])),
                }
            })
            .collect();
        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
    }

    fn create_pipeline_layout(
        &mut self,
        set_layouts: &[DescriptorSetLayoutId],
        push_constant_size: u32,
        push_constant_stages: ShaderStages,
    ) -> Result<PipelineLayoutId> {
        let layouts: Vec<vk::DescriptorSetLayout> =
            set_layouts.iter().map(|l| typed(l.0)).collect();
        let ranges: Vec<_> = (push_constant_size > 0)
            .then(|| {
                vk::PushConstantRange::default()
                    .stage_flags(convert::shader_stages(push_constant_stages))
                    .offset(0)
                    .size(push_constant_size)
            })
            .into_iter()
            .collect();
        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&layouts)
            .push_constant_ranges(&ranges);
        let layout = unsafe {
            self.device
                .create_pipeline_layout(&info, None)
                .map_err(|e| GfxError::PipelineCreation(e.to_string()))?
        };
        Ok(PipelineLayoutId(raw(layout)))
    }

    fn destroy_pipeline_layout(&mut self, layout: PipelineLayoutId) {
        unsafe { self.device.destroy_pipeline_layout(typed(layout.0), None) };
    }

    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc<'_>) -> Result<PipelineId> {
        let pipeline = unsafe { pipeline::create_graphics_pipeline(&self.device, desc)? };
        Ok(PipelineId(raw(pipeline)))
    }

    fn create_compute_pipeline(
        &mut self,
        layout: PipelineLayoutId,
        code: &[u32],
    ) -> Result<PipelineId> {
        let pipeline =
            unsafe { pipeline::create_compute_pipeline(&self.device, typed(layout.0), code)? };
        Ok(PipelineId(raw(pipeline)))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineId) {
        unsafe { self.device.destroy_pipeline(typed(pipeline.0), None) };
    }

    fn create_fence(&mut self, signaled: bool) -> Result<FenceId> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        let fence = unsafe { self.device.create_fence(&info, None)? };
        Ok(FenceId(raw(fence)))
    }

    fn destroy_fence(&mut self, fence: FenceId) {
        unsafe { self.device.destroy_fence(typed(fence.0), None) };
    }

    fn wait_for_fence(&mut self, fence: FenceId) -> Result<()> {
        unsafe {
            self.device
                .wait_for_fences(&[typed(fence.0)], true, u64::MAX)?;
        }
        Ok(())
    }

    fn reset_fence(&mut self, fence: FenceId) -> Result<()> {
        unsafe { self.device.reset_fences(&[typed(fence.0)])? };
        Ok(())
    }

    fn create_semaphore(&mut self) -> Result<SemaphoreId> {
        let info = vk::SemaphoreCreateInfo::default();
        let semaphore = unsafe { self.device.create_semaphore(&info, None)? };
        Ok(SemaphoreId(raw(semaphore)))
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreId) {
        unsafe { self.device.destroy_semaphore(typed(semaphore.0), None) };
    }

    fn allocate_command_buffer(&mut self) -> Result<CommandBufferId> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info)? };
        buffers
            .first()
            .map(|&cmd| CommandBufferId(raw(cmd)))
            .ok_or_else(|| GfxError::Other("no command buffer returned".into()))
    }

    fn free_command_buffer(&mut self, command_buffer: CommandBufferId) {
        unsafe {
            self.device
                .free_command_buffers(self.command_pool, &[typed(command_buffer.0)]);
        }
    }

    fn begin_command_buffer(&mut self, command_buffer: CommandBufferId) -> Result<()> {
        let cmd: vk::CommandBuffer = typed(command_buffer.0);
        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            self.device.begin_command_buffer(cmd, &info)?;
        }
        Ok(())
    }

    fn end_command_buffer(&mut self, command_buffer: CommandBufferId) -> Result<()> {
        unsafe { self.device.end_command_buffer(typed(command_buffer.0))? };
        Ok(())
    }

    fn record(&mut self, command_buffer: CommandBufferId, command: &DeviceCommand) {
        let recorder = Recorder {
            device: &self.device,
            debug_utils: self.debug_labels.as_ref(),
            dynamic_counts: &self.set_dynamic_counts,
        };
        unsafe { recorder.record(typed(command_buffer.0), command) };
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn submit(&mut self, info: &SubmitInfo) -> Result<()> {
        let command_buffers = [typed::<vk::CommandBuffer>(info.command_buffer.0)];
        let (wait_semaphores, wait_stages): (Vec<vk::Semaphore>, Vec<vk::PipelineStageFlags>) =
            info.wait
                .iter()
                .map(|&(sem, stages)| (typed::<vk::Semaphore>(sem.0), convert::wait_stages(stages)))
                .unzip();
        let signal_semaphores: Vec<vk::Semaphore> =
            info.signal.iter().map(|sem| typed(sem.0)).collect();

        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        let fence = info
            .fence
            .map_or_else(vk::Fence::null, |fence| typed(fence.0));
        unsafe { self.device.queue_submit(self.queue, &[submit], fence)? };
        Ok(())
    }

    fn queue_wait_idle(&mut self) -> Result<()> {
        unsafe { self.device.queue_wait_idle(self.queue)? };
        Ok(())
    }

    fn create_timestamp_query_pool(&mut self, count: u32) -> Result<QueryPoolId> {
        let info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(count);
        let pool = unsafe { self.device.create_query_pool(&info, None)? };
        Ok(QueryPoolId(raw(pool)))
    }

    fn destroy_query_pool(&mut self, pool: QueryPoolId) {
        unsafe { self.device.destroy_query_pool(typed(pool.0), None) };
    }

    fn timestamp_results(&mut self, pool: QueryPoolId, first: u32, out: &mut [u64]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        unsafe {
            self.device.get_query_pool_results(
                typed(pool.0),
                first,
                out,
                vk::QueryResultFlags::WAIT | vk::QueryResultFlags::TYPE_64,
            )?;
        }
        Ok(())
    }

    fn create_swap_chain(
        &mut self,
        request: &SwapChainRequest,
        window: Option<&dyn WindowSource>,
    ) -> Result<SwapChainImages> {
        let window = window
            .ok_or_else(|| GfxError::SurfaceCreation("a window is required for a swap chain".into()))?;
        let display = window
            .display_handle()
            .map_err(|e| GfxError::SurfaceCreation(e.to_string()))?;
        let handle = window
            .window_handle()
            .map_err(|e| GfxError::SurfaceCreation(e.to_string()))?;
        let surface = unsafe {
            ash_window::create_surface(
                &self.entry,
                &self.instance,
                display.as_raw(),
                handle.as_raw(),
                None,
            )
            .map_err(|e| GfxError::SurfaceCreation(e.to_string()))?
        };

        let created = unsafe {
            let loader = self.surface_loader()?;
            let supported = loader.get_physical_device_surface_support(
                self.physical_device,
                self.queue_family,
                surface,
            )?;
            if supported {
                self.swapchain_params(surface, request).and_then(|params| {
                    Swapchain::new(
                        &self.device,
                        &self.swapchain_loader,
                        &params,
                        vk::SwapchainKHR::null(),
                    )
                })
            } else {
                Err(GfxError::SurfaceCreation(
                    "graphics queue cannot present to this surface".into(),
                ))
            }
        };
        let chain = match created {
            Ok(chain) => chain,
            Err(e) => {
                if let Some(loader) = &self.surface_loader {
                    unsafe { loader.destroy_surface(surface, None) };
                }
                return Err(e);
            }
        };

        let id = SwapchainId(self.next_swapchain);
        self.next_swapchain += 1;
        let images = Self::chain_images(id, &chain)?;
        info!(
            width = images.width,
            height = images.height,
            images = images.images.len(),
            format = ?images.format,
            "Swap chain created"
        );
        self.swapchains.insert(id.0, SurfaceChain { surface, chain });
        Ok(images)
    }

    fn resize_swap_chain(
        &mut self,
        swapchain: SwapchainId,
        request: &SwapChainRequest,
    ) -> Result<SwapChainImages> {
        let (surface, old) = self
            .swapchains
            .get(&swapchain.0)
            .map(|sc| (sc.surface, sc.chain.swapchain))
            .ok_or_else(|| GfxError::SwapChainCreation(format!("unknown {swapchain:?}")))?;

        let params = unsafe { self.swapchain_params(surface, request)? };
        let chain = unsafe { Swapchain::new(&self.device, &self.swapchain_loader, &params, old)? };
        let images = Self::chain_images(swapchain, &chain)?;
        if let Some(previous) = self
            .swapchains
            .insert(swapchain.0, SurfaceChain { surface, chain })
        {
            unsafe { previous.chain.destroy(&self.device, &self.swapchain_loader) };
        }
        debug!(width = images.width, height = images.height, "Swap chain resized");
        Ok(images)
    }

    fn destroy_swap_chain(&mut self, swapchain: SwapchainId) {
        let Some(sc) = self.swapchains.remove(&swapchain.0) else {
            warn!("Destroying unknown {swapchain:?}");
            return;
        };
        unsafe {
            sc.chain.destroy(&self.device, &self.swapchain_loader);
            if let Some(loader) = &self.surface_loader {
                loader.destroy_surface(sc.surface, None);
            }
        }
        info!("Swap chain destroyed");
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn acquire_next_image(
        &mut self,
        swapchain: SwapchainId,
        signal: SemaphoreId,
    ) -> Result<AcquireStatus> {
        let sc = self
            .swapchains
            .get(&swapchain.0)
            .ok_or_else(|| GfxError::InvalidState(format!("unknown {swapchain:?}")))?;
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                sc.chain.swapchain,
                ACQUIRE_TIMEOUT_NS,
                typed(signal.0),
                vk::Fence::null(),
            )
        };
        match result {
            Ok((index, false)) => Ok(AcquireStatus::Acquired(index)),
            Ok((index, true)) => Ok(AcquireStatus::Suboptimal(index)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireStatus::OutOfDate),
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => Ok(AcquireStatus::NotReady),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn present(
        &mut self,
        swapchain: SwapchainId,
        image_index: u32,
        wait: SemaphoreId,
    ) -> Result<PresentStatus> {
        let sc = self
            .swapchains
            .get(&swapchain.0)
            .ok_or_else(|| GfxError::InvalidState(format!("unknown {swapchain:?}")))?;
        let swapchains = [sc.chain.swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [typed::<vk::Semaphore>(wait.0)];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.swapchain_loader.queue_present(self.queue, &present_info) } {
            Ok(false) => Ok(PresentStatus::Presented),
            Ok(true) => Ok(PresentStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                warn!("wait idle failed during teardown: {e}");
            }
            for (_, sc) in self.swapchains.drain() {
                sc.chain.destroy(&self.device, &self.swapchain_loader);
                if let Some(loader) = &self.surface_loader {
                    loader.destroy_surface(sc.surface, None);
                }
            }
            for (memory, block) in self.memories.drain() {
                let handle: vk::DeviceMemory = typed(memory);
                if block.mapped {
                    self.device.unmap_memory(handle);
                }
                self.device.free_memory(handle, None);
            }
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            destroy_instance(&self.instance, self.debug_utils.as_ref());
        }
        info!("Vulkan backend destroyed");
    }
}
