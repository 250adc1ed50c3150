//! The driver surface consumed by the submission pipeline.
//!
//! The scheduler is a transport: it never interprets the commands it carries,
//! it only needs a narrow slice of the underlying graphics API to move them
//! along. That slice is the [`Driver`] trait: command pool and buffer
//! lifecycle, fences and semaphores, queue submission and presentation, and
//! descriptor pool management. The production implementation is
//! [`VulkanDriver`](crate::device::VulkanDriver); tests substitute a mock.
//!
//! All handle and result types are plain [`ash::vk`] values so the pipeline,
//! the production driver and any test double speak the same vocabulary.

use ash::prelude::VkResult;
use ash::vk;

/// One queue submission as assembled by the submission worker.
///
/// `command_buffers` is ordered: when an init (upload) buffer was used it
/// precedes the draw buffer, and the driver must submit them as a single
/// batch in array order.
pub struct SubmitBatch<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    /// Semaphore to wait on before executing the batch (typically the
    /// swap-chain acquire semaphore), with the stage mask to block.
    pub wait_semaphore: Option<(vk::Semaphore, vk::PipelineStageFlags2)>,
    /// Semaphore signalled when the batch finishes; set when the submission
    /// will be followed by a present that has to wait for it.
    pub signal_semaphore: Option<vk::Semaphore>,
    /// Fence signalled on completion; watched by the fence worker.
    pub fence: vk::Fence,
}

/// Graphics-driver operations the pipeline depends on.
///
/// Implementations must be callable from any of the pipeline's threads. Queue
/// operations (`queue_submit`, `queue_present`) are serialized by the
/// pipeline itself: at most one thread performs them at a time per scheduler,
/// but implementations that share a queue with other code must add their own
/// external synchronization.
pub trait Driver: Send + Sync {
    fn create_command_pool(&self) -> VkResult<vk::CommandPool>;
    fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>>;
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer);

    fn create_fence(&self) -> VkResult<vk::Fence>;
    /// Blocks until `fence` is signalled. `timeout` is in nanoseconds;
    /// the pipeline always passes `u64::MAX`.
    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    fn destroy_fence(&self, fence: vk::Fence);

    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn queue_submit(&self, batch: &SubmitBatch) -> VkResult<()>;
    /// Presents `image_index` of `swapchain` after `wait_semaphore` fires.
    ///
    /// Returns the raw result code: [`vk::Result::SUCCESS`] and
    /// [`vk::Result::SUBOPTIMAL_KHR`] count as successful presents, anything
    /// else is a present failure the producer recovers from by recreating
    /// the swap chain.
    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> vk::Result;

    fn create_descriptor_pool(&self, max_sets: u32) -> VkResult<vk::DescriptorPool>;
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet>;

    // Destruction entry points used by deferred cleanup.
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn destroy_buffer_view(&self, view: vk::BufferView);
    fn destroy_image(&self, image: vk::Image);
    fn destroy_image_view(&self, view: vk::ImageView);
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);
    fn free_device_memory(&self, memory: vk::DeviceMemory);
}
