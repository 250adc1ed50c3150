//! Vulkan implementation of the [`Driver`] surface.
//!
//! [`VulkanDriver`] adapts a logical `ash::Device`, one of its queues and
//! the swapchain extension loader to the narrow [`Driver`] trait the
//! pipeline consumes. It owns no instance or device lifetime: the caller
//! keeps the device alive for as long as the driver (and any scheduler built
//! on it) exists, and destroys it afterwards.
//!
//! Queue submission and presentation are serialized behind an internal lock,
//! since Vulkan queues require external synchronization.

use std::sync::Mutex;

use ash::prelude::VkResult;
use ash::vk;
use smallvec::SmallVec;

use crate::driver::{Driver, SubmitBatch};

pub struct VulkanDriver {
    device: ash::Device,
    swapchain_loader: ash::khr::swapchain::Device,
    queue: Mutex<vk::Queue>,
    queue_family_index: u32,
}

impl VulkanDriver {
    /// Wraps `device` and `queue` for use by a scheduler.
    ///
    /// `queue` must belong to `queue_family_index` and must support the
    /// operations recorded into the command buffers, plus present when swap
    /// chains are used.
    pub fn new(
        instance: &ash::Instance,
        device: ash::Device,
        queue: vk::Queue,
        queue_family_index: u32,
    ) -> Self {
        let swapchain_loader = ash::khr::swapchain::Device::new(instance, &device);
        Self {
            device,
            swapchain_loader,
            queue: Mutex::new(queue),
            queue_family_index,
        }
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }
}

impl Driver for VulkanDriver {
    fn create_command_pool(&self) -> VkResult<vk::CommandPool> {
        unsafe {
            self.device.create_command_pool(
                &vk::CommandPoolCreateInfo {
                    flags: vk::CommandPoolCreateFlags::TRANSIENT,
                    queue_family_index: self.queue_family_index,
                    ..Default::default()
                },
                None,
            )
        }
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()> {
        unsafe {
            self.device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())
        }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe {
            self.device.destroy_command_pool(pool, None);
        }
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        unsafe {
            self.device
                .allocate_command_buffers(&vk::CommandBufferAllocateInfo {
                    command_pool: pool,
                    level: vk::CommandBufferLevel::PRIMARY,
                    command_buffer_count: count,
                    ..Default::default()
                })
        }
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe {
            self.device.begin_command_buffer(
                command_buffer,
                &vk::CommandBufferBeginInfo {
                    flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                    ..Default::default()
                },
            )
        }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer) }
    }

    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device.cmd_end_render_pass(command_buffer);
        }
    }

    fn create_fence(&self) -> VkResult<vk::Fence> {
        unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default(), None)
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe {
            self.device.destroy_fence(fence, None);
        }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe {
            self.device.destroy_semaphore(semaphore, None);
        }
    }

    fn queue_submit(&self, batch: &SubmitBatch) -> VkResult<()> {
        let buffer_infos: SmallVec<[vk::CommandBufferSubmitInfo; 2]> = batch
            .command_buffers
            .iter()
            .map(|&command_buffer| vk::CommandBufferSubmitInfo {
                command_buffer,
                ..Default::default()
            })
            .collect();
        let wait_infos: SmallVec<[vk::SemaphoreSubmitInfo; 1]> = batch
            .wait_semaphore
            .iter()
            .map(|&(semaphore, stage_mask)| vk::SemaphoreSubmitInfo {
                semaphore,
                stage_mask,
                ..Default::default()
            })
            .collect();
        let signal_infos: SmallVec<[vk::SemaphoreSubmitInfo; 1]> = batch
            .signal_semaphore
            .iter()
            .map(|&semaphore| vk::SemaphoreSubmitInfo {
                semaphore,
                stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
                ..Default::default()
            })
            .collect();

        let queue = self.queue.lock().unwrap();
        unsafe {
            self.device.queue_submit2(
                *queue,
                &[vk::SubmitInfo2::default()
                    .command_buffer_infos(&buffer_infos)
                    .wait_semaphore_infos(&wait_infos)
                    .signal_semaphore_infos(&signal_infos)],
                batch.fence,
            )
        }
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> vk::Result {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let queue = self.queue.lock().unwrap();
        match unsafe { self.swapchain_loader.queue_present(*queue, &present_info) } {
            Ok(false) => vk::Result::SUCCESS,
            Ok(true) => vk::Result::SUBOPTIMAL_KHR,
            Err(res) => res,
        }
    }

    fn create_descriptor_pool(&self, max_sets: u32) -> VkResult<vk::DescriptorPool> {
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                descriptor_count: max_sets,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: max_sets * 2,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
                descriptor_count: max_sets,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: max_sets,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: max_sets,
            },
        ];
        unsafe {
            self.device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo {
                    max_sets,
                    ..Default::default()
                }
                .pool_sizes(&pool_sizes),
                None,
            )
        }
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()> {
        unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
        }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe {
            self.device.destroy_descriptor_pool(pool, None);
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        unsafe {
            let mut descriptor = vk::DescriptorSet::null();
            (self.device.fp_v1_0().allocate_descriptor_sets)(
                self.device.handle(),
                &vk::DescriptorSetAllocateInfo {
                    descriptor_pool: pool,
                    descriptor_set_count: 1,
                    p_set_layouts: &layout,
                    ..Default::default()
                },
                &mut descriptor,
            )
            .result()?;
            Ok(descriptor)
        }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe {
            self.device.destroy_buffer(buffer, None);
        }
    }

    fn destroy_buffer_view(&self, view: vk::BufferView) {
        unsafe {
            self.device.destroy_buffer_view(view, None);
        }
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe {
            self.device.destroy_image(image, None);
        }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe {
            self.device.destroy_image_view(view, None);
        }
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe {
            self.device.destroy_framebuffer(framebuffer, None);
        }
    }

    fn free_device_memory(&self, memory: vk::DeviceMemory) {
        unsafe {
            self.device.free_memory(memory, None);
        }
    }
}
