//! # Scoria
//!
//! A deferred GPU command scheduler for Vulkan-style drivers.
//!
//! Scoria decouples the thread that produces GPU work (a renderer or an
//! emulator's CPU thread) from the threads that talk to the driver. Work is
//! recorded as closures into bump-allocated arena chunks; a worker thread
//! replays completed chunks against a ring of per-flight command buffers,
//! and further workers handle queue submission, presentation and fence
//! tracking so the producer never blocks on the driver.
//!
//! ## Key Concepts
//!
//! - **Command**: a move-only closure taking the
//!   [`CommandBufferManager`](manager::CommandBufferManager). Commands are
//!   replayed exactly once, in recording order, across chunk and submit
//!   boundaries.
//! - **Chunk**: a fixed-size arena ([`CHUNK_BYTES`]) embedding an intrusive
//!   list of recorded commands; recording costs an aligned in-place write,
//!   drained chunks are pooled and reused.
//! - **Fence counter**: a monotonic generation assigned to each submission.
//!   When the completed counter reaches `n`, the GPU has finished all work
//!   submitted with generation `n`. This is the only synchronization
//!   producers need.
//! - **Flight slot**: one of [`NUM_COMMAND_BUFFERS`] entries holding a
//!   command pool, an init and a draw command buffer, a fence and a list of
//!   deferred-destruction callbacks that run once the slot's generation
//!   completes.
//! - **Deferred destruction**: driver objects still referenced by in-flight
//!   command buffers are handed to the manager, which destroys them only
//!   after the GPU passes the current slot's fence.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use scoria::{Scheduler, VulkanDriver};
//! # fn demo(instance: &ash::Instance, device: ash::Device,
//! #         queue: ash::vk::Queue, queue_family_index: u32) {
//! let driver = Arc::new(VulkanDriver::new(instance, device, queue, queue_family_index));
//! let mut scheduler = Scheduler::new(driver).unwrap();
//!
//! scheduler.record(|cmd_buffer_mgr| {
//!     let _draw = cmd_buffer_mgr.current_command_buffer();
//!     // record draw commands
//! });
//! scheduler.submit_command_buffer(true, false, None);
//! # }
//! ```
//!
//! The driver surface is the [`Driver`](driver::Driver) trait, so the whole
//! pipeline runs unmodified against a test double.

mod arena;
pub mod device;
pub mod driver;
pub mod manager;
pub mod scheduler;

pub use arena::CHUNK_BYTES;
pub use device::VulkanDriver;
pub use driver::{Driver, SubmitBatch};
pub use manager::{
    CommandBufferManager, StateTracker, DESCRIPTOR_SETS_PER_POOL, NUM_COMMAND_BUFFERS,
    NUM_FRAMES_IN_FLIGHT,
};
pub use scheduler::Scheduler;

pub use ash;
