//! Command buffer lifecycle, queue submission and fence tracking.
//!
//! The [`CommandBufferManager`] owns a ring of per-flight command buffer
//! slots. The recording worker replays command closures against it; one of
//! those closures eventually calls [`submit_command_buffer`], which hands the
//! finished buffers to the **submission worker** so queue submission and
//! presentation never stall replay. Each submission carries a monotonic
//! *fence counter* generation; the **fence worker** waits on the driver
//! fences in FIFO order, advances the completed counter and runs the
//! deferred-destruction callbacks that became safe.
//!
//! # Fence counters
//!
//! If the completed fence counter is greater than or equal to `n`, the GPU
//! has finished all work submitted with generation `n`. Producers obtain
//! generations from the [`Scheduler`](crate::scheduler::Scheduler) and may
//! poll [`ManagerShared::completed_fence_counter`] from any thread.
//!
//! # Slot lifecycle
//!
//! `Recording → Submitted → InFlight → Retired → Recording`. A slot is only
//! recorded into again once its previous generation has been observed
//! complete and its cleanup callbacks have run.
//!
//! [`submit_command_buffer`]: CommandBufferManager::submit_command_buffer

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use ash::prelude::VkResult;
use ash::vk;
use smallvec::SmallVec;

use crate::driver::{Driver, SubmitBatch};

/// Number of per-flight command buffer slots.
pub const NUM_COMMAND_BUFFERS: usize = 4;
/// Number of frames whose descriptor pools may be in flight simultaneously.
pub const NUM_FRAMES_IN_FLIGHT: usize = 2;
/// Descriptor sets per pool; an exhausted frame grows its pool list.
pub const DESCRIPTOR_SETS_PER_POOL: u32 = 1024;

const BUFFERS_PER_FRAME: usize = NUM_COMMAND_BUFFERS / NUM_FRAMES_IN_FLIGHT;

type CleanupFn = Box<dyn FnOnce() + Send>;

/// Mutable portion of a per-flight slot, shared between the recording
/// thread (stamping, deferral), the submission worker (batch assembly) and
/// the fence worker (cleanup execution).
struct SlotState {
    /// Generation stamped at submit; zero until the slot is first used.
    fence_counter: u64,
    /// True from submit until the slot is next prepared for recording.
    /// Guards cleanup callbacks against running for a slot that is merely
    /// being recorded into.
    submitted: bool,
    init_command_buffer_used: bool,
    /// Swap-chain acquire semaphore for this submission; null when unused.
    wait_semaphore: vk::Semaphore,
    cleanup_resources: Vec<CleanupFn>,
}

impl Default for SlotState {
    fn default() -> Self {
        Self {
            fence_counter: 0,
            submitted: false,
            init_command_buffer_used: false,
            wait_semaphore: vk::Semaphore::null(),
            cleanup_resources: Vec::new(),
        }
    }
}

/// One entry in the per-flight ring: a command pool, an init (upload) and a
/// draw command buffer, and the fence the GPU signals for this slot.
struct CmdBufferResources {
    command_pool: vk::CommandPool,
    /// `[0]` init (upload) command buffer, `[1]` draw command buffer.
    command_buffers: [vk::CommandBuffer; 2],
    fence: vk::Fence,
    frame_index: usize,
    state: Mutex<SlotState>,
}

/// Per-frame descriptor pool list with a cursor into the pool currently
/// being allocated from. Touched only by the recording thread.
#[derive(Default)]
struct FrameResources {
    descriptor_pools: Vec<vk::DescriptorPool>,
    current_descriptor_pool: usize,
}

struct PendingSubmit {
    command_buffer_index: usize,
    present: Option<(vk::SwapchainKHR, u32)>,
}

struct PendingFence {
    fence: vk::Fence,
    counter: u64,
}

struct SubmitQueue {
    pending: VecDeque<PendingSubmit>,
    worker_idle: bool,
    running: bool,
}

struct FenceQueue {
    pending: VecDeque<PendingFence>,
    running: bool,
}

/// State reachable from every pipeline thread: the slot ring, the pending
/// submit and fence queues, the completed counter and the one-shot status
/// flags.
pub struct ManagerShared {
    driver: Arc<dyn Driver>,
    command_buffers: Vec<CmdBufferResources>,
    /// Signalled by each presenting submission, waited on by the present.
    present_semaphore: vk::Semaphore,

    completed_fence_counter: AtomicU64,

    submit: Mutex<SubmitQueue>,
    submit_wake: Condvar,
    submit_idle: Condvar,

    fences: Mutex<FenceQueue>,
    fence_wake: Condvar,
    fence_reached: Condvar,

    last_present_failed: AtomicBool,
    last_present_done: AtomicBool,
    last_submit_failed: AtomicBool,
    last_present_result: AtomicI32,
}

impl ManagerShared {
    /// Last fence counter generation the GPU has completed.
    ///
    /// Thread safe.
    pub fn completed_fence_counter(&self) -> u64 {
        self.completed_fence_counter.load(Ordering::Acquire)
    }

    /// Blocks until the completed fence counter reaches `counter`.
    ///
    /// The corresponding submission must already be in the pipeline, or this
    /// never returns; the scheduler guarantees that by draining the
    /// recording worker first.
    pub fn wait_for_fence_counter(&self, counter: u64) {
        if self.completed_fence_counter() >= counter {
            return;
        }
        let mut fences = self.fences.lock().unwrap();
        while self.completed_fence_counter() < counter {
            fences = self.fence_reached.wait(fences).unwrap();
        }
    }

    /// Blocks until the submission worker has drained its queue and gone
    /// idle.
    pub fn wait_for_submit_worker_idle(&self) {
        let mut queue = self.submit.lock().unwrap();
        while !(queue.pending.is_empty() && queue.worker_idle) {
            queue = self.submit_idle.wait(queue).unwrap();
        }
    }

    /// Did the last present fail? Clears the flag on read.
    pub fn check_last_present_failed(&self) -> bool {
        self.last_present_failed.swap(false, Ordering::AcqRel)
    }

    /// Has a present completed since this was last checked? Clears the flag
    /// on read.
    pub fn check_last_present_done(&self) -> bool {
        self.last_present_done.swap(false, Ordering::AcqRel)
    }

    /// Did a queue submission fail (device loss)? Clears the flag on read.
    pub fn check_last_submit_failed(&self) -> bool {
        self.last_submit_failed.swap(false, Ordering::AcqRel)
    }

    pub fn last_present_result(&self) -> vk::Result {
        vk::Result::from_raw(self.last_present_result.load(Ordering::Acquire))
    }

    fn enqueue_submit(&self, submit: PendingSubmit) {
        let mut queue = self.submit.lock().unwrap();
        queue.worker_idle = false;
        queue.pending.push_back(submit);
        self.submit_wake.notify_one();
    }

    fn enqueue_fence(&self, fence: vk::Fence, counter: u64) {
        let mut fences = self.fences.lock().unwrap();
        fences.pending.push_back(PendingFence { fence, counter });
        self.fence_wake.notify_one();
    }

    /// Performs one queue submission (and optional present) on the calling
    /// thread. Invoked by the submission worker, or inline when the
    /// submission was requested off-worker.
    fn execute_submit(&self, submit: &PendingSubmit) {
        let slot = &self.command_buffers[submit.command_buffer_index];

        let mut buffers = SmallVec::<[vk::CommandBuffer; 2]>::new();
        let (wait_semaphore, counter) = {
            let state = slot.state.lock().unwrap();
            if state.init_command_buffer_used {
                buffers.push(slot.command_buffers[0]);
            }
            buffers.push(slot.command_buffers[1]);
            let wait = (state.wait_semaphore != vk::Semaphore::null()).then(|| {
                (
                    state.wait_semaphore,
                    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                )
            });
            (wait, state.fence_counter)
        };

        let batch = SubmitBatch {
            command_buffers: &buffers,
            wait_semaphore,
            signal_semaphore: submit.present.is_some().then_some(self.present_semaphore),
            fence: slot.fence,
        };
        if let Err(res) = self.driver.queue_submit(&batch) {
            tracing::error!("queue submit failed, assuming lost device: {:?}", res);
            self.last_submit_failed.store(true, Ordering::Release);
        }

        if let Some((swapchain, image_index)) = submit.present {
            let result = self
                .driver
                .queue_present(swapchain, image_index, self.present_semaphore);
            self.last_present_result
                .store(result.as_raw(), Ordering::Release);
            self.last_present_done.store(true, Ordering::Release);
            if result != vk::Result::SUCCESS && result != vk::Result::SUBOPTIMAL_KHR {
                tracing::warn!("queue present failed: {:?}", result);
                self.last_present_failed.store(true, Ordering::Release);
            }
        }

        self.enqueue_fence(slot.fence, counter);
    }

    /// Submission worker: drains pending submits one at a time, marking
    /// idle whenever the queue empties.
    pub(crate) fn submit_worker_loop(&self) {
        loop {
            let submit = {
                let mut queue = self.submit.lock().unwrap();
                loop {
                    if let Some(submit) = queue.pending.pop_front() {
                        break submit;
                    }
                    if !queue.running {
                        return;
                    }
                    queue.worker_idle = true;
                    self.submit_idle.notify_all();
                    queue = self.submit_wake.wait(queue).unwrap();
                }
            };

            self.execute_submit(&submit);

            let mut queue = self.submit.lock().unwrap();
            if queue.pending.is_empty() {
                queue.worker_idle = true;
                self.submit_idle.notify_all();
            }
        }
    }

    /// Fence worker: waits on each pending fence in FIFO order, advances
    /// the completed counter and runs cleanup callbacks whose generation
    /// has passed.
    pub(crate) fn fence_worker_loop(&self) {
        loop {
            let pending = {
                let mut fences = self.fences.lock().unwrap();
                loop {
                    if let Some(pending) = fences.pending.pop_front() {
                        break pending;
                    }
                    if !fences.running {
                        return;
                    }
                    fences = self.fence_wake.wait(fences).unwrap();
                }
            };

            if let Err(res) = self.driver.wait_for_fence(pending.fence, u64::MAX) {
                tracing::error!("fence wait failed, assuming lost device: {:?}", res);
                self.last_submit_failed.store(true, Ordering::Release);
            }

            // Cleanups run before the counter is published: a thread
            // returning from a fence-counter wait must find every deferred
            // destruction for that generation already done.
            self.run_cleanups_up_to(pending.counter);

            // Single writer; pending fences arrive in submission order but
            // guard against an inline submit racing ahead of the queue.
            if pending.counter > self.completed_fence_counter.load(Ordering::Relaxed) {
                self.completed_fence_counter
                    .store(pending.counter, Ordering::Release);
            }

            let _fences = self.fences.lock().unwrap();
            self.fence_reached.notify_all();
        }
    }

    /// Runs and clears cleanup callbacks of every submitted slot whose
    /// generation is covered by `counter`. Each slot's callbacks run while
    /// its lock is held, so the recording thread cannot start reusing a slot
    /// whose cleanup is still in progress. Callbacks must not reach back
    /// into the pipeline.
    fn run_cleanups_up_to(&self, counter: u64) {
        for slot in &self.command_buffers {
            let mut state = slot.state.lock().unwrap();
            if state.submitted && state.fence_counter <= counter {
                for cleanup in state.cleanup_resources.drain(..) {
                    cleanup();
                }
            }
        }
    }

    pub(crate) fn stop_submit_worker(&self) {
        let mut queue = self.submit.lock().unwrap();
        queue.running = false;
        self.submit_wake.notify_all();
    }

    pub(crate) fn stop_fence_worker(&self) {
        let mut fences = self.fences.lock().unwrap();
        fences.running = false;
        self.fence_wake.notify_all();
    }
}

impl Drop for ManagerShared {
    fn drop(&mut self) {
        // Workers are joined before the last reference drops; anything still
        // deferred runs now, then the driver objects go away.
        for slot in &self.command_buffers {
            let cleanups = std::mem::take(&mut slot.state.lock().unwrap().cleanup_resources);
            for cleanup in cleanups {
                cleanup();
            }
            self.driver.destroy_command_pool(slot.command_pool);
            self.driver.destroy_fence(slot.fence);
        }
        self.driver.destroy_semaphore(self.present_semaphore);
    }
}

/// Tracks whether a render pass is open on the current draw command buffer
/// so it can be ended before the buffer is submitted.
#[derive(Default)]
pub struct StateTracker {
    render_pass_open: bool,
}

impl StateTracker {
    /// Marks a render pass as begun on the current draw command buffer.
    pub fn begin_render_pass(&mut self) {
        self.render_pass_open = true;
    }

    pub fn is_in_render_pass(&self) -> bool {
        self.render_pass_open
    }
}

/// Recording-thread face of the submission pipeline.
///
/// Exactly one thread (the recording worker) holds this mutably; everything
/// cross-thread lives behind [`ManagerShared`].
pub struct CommandBufferManager {
    driver: Arc<dyn Driver>,
    shared: Arc<ManagerShared>,

    frame_resources: [FrameResources; NUM_FRAMES_IN_FLIGHT],
    current_frame: usize,
    current_cmd_buffer: usize,

    state_tracker: StateTracker,
}

impl CommandBufferManager {
    pub fn new(driver: Arc<dyn Driver>) -> VkResult<Self> {
        let mut command_buffers = Vec::with_capacity(NUM_COMMAND_BUFFERS);
        for index in 0..NUM_COMMAND_BUFFERS {
            let command_pool = driver.create_command_pool()?;
            let buffers = driver.allocate_command_buffers(command_pool, 2)?;
            let fence = driver.create_fence()?;
            command_buffers.push(CmdBufferResources {
                command_pool,
                command_buffers: [buffers[0], buffers[1]],
                fence,
                frame_index: index / BUFFERS_PER_FRAME,
                state: Mutex::new(SlotState::default()),
            });
        }
        let present_semaphore = driver.create_semaphore()?;

        // The first slot starts out recording.
        driver.begin_command_buffer(command_buffers[0].command_buffers[0])?;
        driver.begin_command_buffer(command_buffers[0].command_buffers[1])?;

        let shared = Arc::new(ManagerShared {
            driver: driver.clone(),
            command_buffers,
            present_semaphore,
            completed_fence_counter: AtomicU64::new(0),
            submit: Mutex::new(SubmitQueue {
                pending: VecDeque::new(),
                worker_idle: true,
                running: true,
            }),
            submit_wake: Condvar::new(),
            submit_idle: Condvar::new(),
            fences: Mutex::new(FenceQueue {
                pending: VecDeque::new(),
                running: true,
            }),
            fence_wake: Condvar::new(),
            fence_reached: Condvar::new(),
            last_present_failed: AtomicBool::new(false),
            last_present_done: AtomicBool::new(false),
            last_submit_failed: AtomicBool::new(false),
            last_present_result: AtomicI32::new(vk::Result::SUCCESS.as_raw()),
        });

        Ok(Self {
            driver,
            shared,
            frame_resources: Default::default(),
            current_frame: 0,
            current_cmd_buffer: 0,
            state_tracker: StateTracker::default(),
        })
    }

    pub(crate) fn shared(&self) -> Arc<ManagerShared> {
        self.shared.clone()
    }

    /// The draw command buffer currently being recorded into. Valid until
    /// the next submit.
    pub fn current_command_buffer(&self) -> vk::CommandBuffer {
        self.shared.command_buffers[self.current_cmd_buffer].command_buffers[1]
    }

    /// The init (upload) command buffer for the current slot. Marks it used,
    /// so it will be submitted ahead of the draw buffer in the same batch.
    pub fn current_init_command_buffer(&self) -> vk::CommandBuffer {
        let slot = &self.shared.command_buffers[self.current_cmd_buffer];
        slot.state.lock().unwrap().init_command_buffer_used = true;
        slot.command_buffers[0]
    }

    /// Stamps the swap-chain acquire semaphore the current slot's submission
    /// must wait on before rendering to the acquired image.
    pub fn set_wait_semaphore_for_current_command_buffer(&self, semaphore: vk::Semaphore) {
        let slot = &self.shared.command_buffers[self.current_cmd_buffer];
        slot.state.lock().unwrap().wait_semaphore = semaphore;
    }

    pub fn state_tracker(&mut self) -> &mut StateTracker {
        &mut self.state_tracker
    }

    /// Ends any render pass left open on the current draw command buffer.
    /// Called before every submit.
    pub fn end_render_pass(&mut self) {
        if self.state_tracker.render_pass_open {
            self.driver.cmd_end_render_pass(self.current_command_buffer());
            self.state_tracker.render_pass_open = false;
        }
    }

    /// Allocates a descriptor set from the current frame's pools, growing
    /// the pool list when the current pool is exhausted.
    pub fn allocate_descriptor_set(
        &mut self,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let frame = &mut self.frame_resources[self.current_frame];
        if frame.descriptor_pools.is_empty() {
            frame
                .descriptor_pools
                .push(self.driver.create_descriptor_pool(DESCRIPTOR_SETS_PER_POOL)?);
        }

        let mut grew = false;
        loop {
            let pool = frame.descriptor_pools[frame.current_descriptor_pool];
            match self.driver.allocate_descriptor_set(pool, layout) {
                Ok(set) => return Ok(set),
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
                | Err(vk::Result::ERROR_FRAGMENTED_POOL)
                    if !grew =>
                {
                    if frame.current_descriptor_pool + 1 < frame.descriptor_pools.len() {
                        frame.current_descriptor_pool += 1;
                    } else {
                        tracing::debug!(
                            frame = self.current_frame,
                            pools = frame.descriptor_pools.len(),
                            "descriptor pool exhausted, growing pool list"
                        );
                        frame
                            .descriptor_pools
                            .push(self.driver.create_descriptor_pool(DESCRIPTOR_SETS_PER_POOL)?);
                        frame.current_descriptor_pool = frame.descriptor_pools.len() - 1;
                        grew = true;
                    }
                }
                Err(res) => {
                    tracing::error!("descriptor set allocation failed: {:?}", res);
                    return Err(res);
                }
            }
        }
    }

    /// Defers `cleanup` until the GPU has passed the fence generation of the
    /// current slot's next submission.
    pub fn defer_cleanup(&mut self, cleanup: impl FnOnce() + Send + 'static) {
        let slot = &self.shared.command_buffers[self.current_cmd_buffer];
        slot.state
            .lock()
            .unwrap()
            .cleanup_resources
            .push(Box::new(cleanup));
    }

    pub fn defer_buffer_destruction(&mut self, buffer: vk::Buffer) {
        let driver = self.driver.clone();
        self.defer_cleanup(move || driver.destroy_buffer(buffer));
    }

    pub fn defer_buffer_view_destruction(&mut self, view: vk::BufferView) {
        let driver = self.driver.clone();
        self.defer_cleanup(move || driver.destroy_buffer_view(view));
    }

    pub fn defer_image_destruction(&mut self, image: vk::Image) {
        let driver = self.driver.clone();
        self.defer_cleanup(move || driver.destroy_image(image));
    }

    pub fn defer_image_view_destruction(&mut self, view: vk::ImageView) {
        let driver = self.driver.clone();
        self.defer_cleanup(move || driver.destroy_image_view(view));
    }

    pub fn defer_framebuffer_destruction(&mut self, framebuffer: vk::Framebuffer) {
        let driver = self.driver.clone();
        self.defer_cleanup(move || driver.destroy_framebuffer(framebuffer));
    }

    pub fn defer_device_memory_free(&mut self, memory: vk::DeviceMemory) {
        let driver = self.driver.clone();
        self.defer_cleanup(move || driver.free_device_memory(memory));
    }

    /// Finishes the current slot and hands it to the submission pipeline.
    ///
    /// `fence_counter` is the generation assigned by the scheduler. With
    /// `submit_on_worker_thread` the submission is queued for the submission
    /// worker (optionally blocking until that worker drains); otherwise the
    /// queue submission runs inline on the calling thread. `present`
    /// optionally names a swap-chain image to present after the submission.
    ///
    /// Errors from the driver do not propagate: they are logged and latched
    /// into the one-shot status flags, matching the rest of the pipeline.
    pub fn submit_command_buffer(
        &mut self,
        fence_counter: u64,
        submit_on_worker_thread: bool,
        wait_for_completion: bool,
        present: Option<(vk::SwapchainKHR, u32)>,
    ) {
        let index = self.current_cmd_buffer;
        let slot = &self.shared.command_buffers[index];

        {
            let mut state = slot.state.lock().unwrap();
            if state.init_command_buffer_used {
                if let Err(res) = self.driver.end_command_buffer(slot.command_buffers[0]) {
                    tracing::error!("failed to end init command buffer: {:?}", res);
                    self.shared.last_submit_failed.store(true, Ordering::Release);
                }
            }
            if let Err(res) = self.driver.end_command_buffer(slot.command_buffers[1]) {
                tracing::error!("failed to end draw command buffer: {:?}", res);
                self.shared.last_submit_failed.store(true, Ordering::Release);
            }
            state.fence_counter = fence_counter;
            state.submitted = true;
        }

        let submit = PendingSubmit {
            command_buffer_index: index,
            present,
        };
        if submit_on_worker_thread {
            self.shared.enqueue_submit(submit);
            if wait_for_completion {
                self.shared.wait_for_submit_worker_idle();
            }
        } else {
            self.shared.execute_submit(&submit);
        }

        self.current_cmd_buffer = (index + 1) % NUM_COMMAND_BUFFERS;
        if self.current_cmd_buffer % BUFFERS_PER_FRAME == 0 {
            self.current_frame = (self.current_frame + 1) % NUM_FRAMES_IN_FLIGHT;
            self.frame_resources[self.current_frame].current_descriptor_pool = 0;
        }

        self.begin_next_command_buffer();
    }

    /// Prepares the new current slot for recording: waits out its previous
    /// generation, runs leftover cleanups, resets its pool and fence and
    /// begins its command buffers. On a frame boundary the frame's
    /// descriptor pools are reclaimed as well.
    fn begin_next_command_buffer(&mut self) {
        let index = self.current_cmd_buffer;
        let slot = &self.shared.command_buffers[index];
        let frame_index = slot.frame_index;

        let counter = slot.state.lock().unwrap().fence_counter;
        if counter > self.shared.completed_fence_counter() {
            self.shared.wait_for_fence_counter(counter);
        }

        // The fence worker usually got here first; anything left runs now,
        // before the slot is recorded into again.
        let cleanups = {
            let mut state = slot.state.lock().unwrap();
            state.submitted = false;
            std::mem::take(&mut state.cleanup_resources)
        };
        for cleanup in cleanups {
            cleanup();
        }

        if let Err(res) = self.driver.reset_fence(slot.fence) {
            tracing::error!("failed to reset slot fence: {:?}", res);
        }
        if let Err(res) = self.driver.reset_command_pool(slot.command_pool) {
            tracing::error!("failed to reset command pool: {:?}", res);
        }
        for buffer in slot.command_buffers {
            if let Err(res) = self.driver.begin_command_buffer(buffer) {
                tracing::error!("failed to begin command buffer: {:?}", res);
            }
        }
        {
            let mut state = slot.state.lock().unwrap();
            state.init_command_buffer_used = false;
            state.wait_semaphore = vk::Semaphore::null();
        }

        if index % BUFFERS_PER_FRAME == 0 {
            self.reclaim_frame_descriptor_pools(frame_index);
        }
    }

    /// Resets a frame's descriptor pools once every slot of that frame has
    /// retired. Waiting only for the entered slot's own fence would permit a
    /// reset while the frame's later slot still executes, so the highest
    /// generation stamped by any of the frame's slots gates the reset.
    fn reclaim_frame_descriptor_pools(&mut self, frame_index: usize) {
        let newest = self
            .shared
            .command_buffers
            .iter()
            .filter(|slot| slot.frame_index == frame_index)
            .map(|slot| slot.state.lock().unwrap().fence_counter)
            .max()
            .unwrap_or(0);
        if newest > self.shared.completed_fence_counter() {
            self.shared.wait_for_fence_counter(newest);
        }

        let frame = &mut self.frame_resources[frame_index];
        for pool in &frame.descriptor_pools {
            if let Err(res) = self.driver.reset_descriptor_pool(*pool) {
                tracing::error!("failed to reset descriptor pool: {:?}", res);
            }
        }
        frame.current_descriptor_pool = 0;
    }
}

impl Drop for CommandBufferManager {
    fn drop(&mut self) {
        for frame in &self.frame_resources {
            for pool in &frame.descriptor_pools {
                self.driver.destroy_descriptor_pool(*pool);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::{DriverEvent, MockDriver};
    use std::thread;

    struct Pipeline {
        cmd_buffer_mgr: CommandBufferManager,
        shared: Arc<ManagerShared>,
        submit_worker: thread::JoinHandle<()>,
        fence_worker: thread::JoinHandle<()>,
    }

    fn spawn_pipeline(mock: &Arc<MockDriver>) -> Pipeline {
        let cmd_buffer_mgr = CommandBufferManager::new(mock.clone()).unwrap();
        let shared = cmd_buffer_mgr.shared();
        let submit_worker = thread::spawn({
            let shared = shared.clone();
            move || shared.submit_worker_loop()
        });
        let fence_worker = thread::spawn({
            let shared = shared.clone();
            move || shared.fence_worker_loop()
        });
        Pipeline {
            cmd_buffer_mgr,
            shared,
            submit_worker,
            fence_worker,
        }
    }

    impl Pipeline {
        fn teardown(self) {
            self.shared.wait_for_submit_worker_idle();
            self.shared.stop_submit_worker();
            self.shared.stop_fence_worker();
            self.submit_worker.join().unwrap();
            self.fence_worker.join().unwrap();
            drop(self.cmd_buffer_mgr);
        }
    }

    #[test]
    fn fence_counters_advance_monotonically() {
        let mock = Arc::new(MockDriver::new());
        let mut pipeline = spawn_pipeline(&mock);

        for generation in 1..=6u64 {
            pipeline
                .cmd_buffer_mgr
                .submit_command_buffer(generation, true, false, None);
        }
        pipeline.shared.wait_for_fence_counter(6);
        assert!(pipeline.shared.completed_fence_counter() >= 6);
        pipeline.teardown();
    }

    #[test]
    fn init_buffer_precedes_draw_buffer_in_one_batch() {
        let mock = Arc::new(MockDriver::new());
        let mut pipeline = spawn_pipeline(&mock);

        let init = pipeline.cmd_buffer_mgr.current_init_command_buffer();
        let draw = pipeline.cmd_buffer_mgr.current_command_buffer();
        pipeline.cmd_buffer_mgr.submit_command_buffer(1, true, true, None);

        use ash::vk::Handle;
        let batches: Vec<_> = mock
            .events()
            .into_iter()
            .filter_map(|event| match event {
                DriverEvent::QueueSubmit {
                    command_buffers, ..
                } => Some(command_buffers),
                _ => None,
            })
            .collect();
        assert_eq!(batches, vec![vec![init.as_raw(), draw.as_raw()]]);
        pipeline.teardown();
    }

    #[test]
    fn unused_init_buffer_is_not_submitted() {
        let mock = Arc::new(MockDriver::new());
        let mut pipeline = spawn_pipeline(&mock);

        let draw = pipeline.cmd_buffer_mgr.current_command_buffer();
        pipeline.cmd_buffer_mgr.submit_command_buffer(1, true, true, None);

        use ash::vk::Handle;
        let batch = mock
            .events()
            .into_iter()
            .find_map(|event| match event {
                DriverEvent::QueueSubmit {
                    command_buffers, ..
                } => Some(command_buffers),
                _ => None,
            })
            .unwrap();
        assert_eq!(batch, vec![draw.as_raw()]);
        pipeline.teardown();
    }

    #[test]
    fn open_render_pass_is_ended_before_submit() {
        let mock = Arc::new(MockDriver::new());
        let mut pipeline = spawn_pipeline(&mock);

        let draw = pipeline.cmd_buffer_mgr.current_command_buffer();
        pipeline.cmd_buffer_mgr.state_tracker().begin_render_pass();
        pipeline.cmd_buffer_mgr.end_render_pass();
        assert!(!pipeline.cmd_buffer_mgr.state_tracker().is_in_render_pass());
        pipeline.cmd_buffer_mgr.submit_command_buffer(1, true, true, None);

        use ash::vk::Handle;
        let events = mock.events();
        let end_rp = events
            .iter()
            .position(|e| *e == DriverEvent::EndRenderPass(draw.as_raw()))
            .unwrap();
        let submit = events
            .iter()
            .position(|e| matches!(e, DriverEvent::QueueSubmit { .. }))
            .unwrap();
        assert!(end_rp < submit);
        pipeline.teardown();
    }

    #[test]
    fn deferred_cleanup_runs_once_after_fence_passes() {
        let mock = Arc::new(MockDriver::new());
        let mut pipeline = spawn_pipeline(&mock);

        {
            let mock = mock.clone();
            pipeline
                .cmd_buffer_mgr
                .defer_cleanup(move || mock.marker("cleanup"));
        }
        pipeline.cmd_buffer_mgr.submit_command_buffer(1, true, false, None);
        pipeline.shared.wait_for_fence_counter(1);

        // Cycle the ring so the same slot is submitted again.
        for generation in 2..=(NUM_COMMAND_BUFFERS as u64 + 1) {
            pipeline
                .cmd_buffer_mgr
                .submit_command_buffer(generation, true, false, None);
        }
        pipeline
            .shared
            .wait_for_fence_counter(NUM_COMMAND_BUFFERS as u64 + 1);

        let markers = mock
            .events()
            .into_iter()
            .filter(|e| *e == DriverEvent::Marker("cleanup"))
            .count();
        assert_eq!(markers, 1);
        pipeline.teardown();
    }

    #[test]
    fn cleanup_runs_before_slot_is_recorded_again() {
        let mock = Arc::new(MockDriver::new());
        let mut pipeline = spawn_pipeline(&mock);

        let first_pool = mock
            .events()
            .iter()
            .find_map(|e| match e {
                DriverEvent::CreateCommandPool(raw) => Some(*raw),
                _ => None,
            })
            .unwrap();

        {
            let mock = mock.clone();
            pipeline
                .cmd_buffer_mgr
                .defer_cleanup(move || mock.marker("slot0 cleanup"));
        }
        for generation in 1..=(NUM_COMMAND_BUFFERS as u64) {
            pipeline
                .cmd_buffer_mgr
                .submit_command_buffer(generation, true, false, None);
        }
        // Slot 0 has been prepared for its second recording by now.
        let events = mock.events();
        let cleanup = events
            .iter()
            .position(|e| *e == DriverEvent::Marker("slot0 cleanup"))
            .unwrap();
        let reuse_reset = events
            .iter()
            .position(|e| *e == DriverEvent::ResetCommandPool(first_pool))
            .unwrap();
        assert!(cleanup < reuse_reset);
        pipeline.teardown();
    }

    #[test]
    fn present_failure_is_latched_once() {
        let mock = Arc::new(MockDriver::new());
        let mut pipeline = spawn_pipeline(&mock);

        let swapchain = vk::SwapchainKHR::null();
        mock.push_present_result(vk::Result::ERROR_OUT_OF_DATE_KHR);
        pipeline
            .cmd_buffer_mgr
            .submit_command_buffer(1, true, true, Some((swapchain, 0)));

        assert!(pipeline.shared.check_last_present_done());
        assert!(pipeline.shared.check_last_present_failed());
        assert!(!pipeline.shared.check_last_present_failed());
        assert_eq!(
            pipeline.shared.last_present_result(),
            vk::Result::ERROR_OUT_OF_DATE_KHR
        );

        // A successful present afterwards leaves the failure flag clear.
        pipeline
            .cmd_buffer_mgr
            .submit_command_buffer(2, true, true, Some((swapchain, 0)));
        assert!(pipeline.shared.check_last_present_done());
        assert!(!pipeline.shared.check_last_present_failed());
        assert_eq!(pipeline.shared.last_present_result(), vk::Result::SUCCESS);
        pipeline.teardown();
    }

    #[test]
    fn submit_failure_is_latched_once_and_pipeline_continues() {
        let mock = Arc::new(MockDriver::new());
        let mut pipeline = spawn_pipeline(&mock);

        mock.push_submit_result(vk::Result::ERROR_DEVICE_LOST);
        pipeline.cmd_buffer_mgr.submit_command_buffer(1, true, true, None);
        assert!(pipeline.shared.check_last_submit_failed());
        assert!(!pipeline.shared.check_last_submit_failed());

        pipeline.cmd_buffer_mgr.submit_command_buffer(2, true, true, None);
        assert!(!pipeline.shared.check_last_submit_failed());
        pipeline.teardown();
    }

    #[test]
    fn typed_deferred_destruction_goes_through_the_driver() {
        let mock = Arc::new(MockDriver::new());
        let mut pipeline = spawn_pipeline(&mock);

        pipeline
            .cmd_buffer_mgr
            .defer_image_view_destruction(vk::ImageView::null());
        pipeline.cmd_buffer_mgr.submit_command_buffer(1, true, false, None);
        pipeline.shared.wait_for_fence_counter(1);

        assert!(mock
            .events()
            .contains(&DriverEvent::Marker("destroy_image_view")));
        pipeline.teardown();
    }

    #[test]
    fn suboptimal_present_is_not_a_failure() {
        let mock = Arc::new(MockDriver::new());
        let mut pipeline = spawn_pipeline(&mock);

        mock.push_present_result(vk::Result::SUBOPTIMAL_KHR);
        pipeline
            .cmd_buffer_mgr
            .submit_command_buffer(1, true, true, Some((vk::SwapchainKHR::null(), 0)));
        assert!(pipeline.shared.check_last_present_done());
        assert!(!pipeline.shared.check_last_present_failed());
        assert_eq!(
            pipeline.shared.last_present_result(),
            vk::Result::SUBOPTIMAL_KHR
        );
        pipeline.teardown();
    }

    #[test]
    fn wait_semaphore_is_forwarded_and_cleared() {
        let mock = Arc::new(MockDriver::new());
        let mut pipeline = spawn_pipeline(&mock);

        use ash::vk::Handle;
        let acquire = vk::Semaphore::from_raw(0xdead);
        pipeline
            .cmd_buffer_mgr
            .set_wait_semaphore_for_current_command_buffer(acquire);
        pipeline.cmd_buffer_mgr.submit_command_buffer(1, true, true, None);
        pipeline.cmd_buffer_mgr.submit_command_buffer(2, true, true, None);

        let waits: Vec<_> = mock
            .events()
            .into_iter()
            .filter_map(|event| match event {
                DriverEvent::QueueSubmit { wait_semaphore, .. } => Some(wait_semaphore),
                _ => None,
            })
            .collect();
        assert_eq!(waits, vec![Some(acquire.as_raw()), None]);
        pipeline.teardown();
    }

    #[test]
    fn descriptor_allocation_grows_the_pool_list() {
        let mock = Arc::new(MockDriver::new());
        mock.limit_descriptor_pools(2);
        let mut pipeline = spawn_pipeline(&mock);

        let layout = vk::DescriptorSetLayout::null();
        for _ in 0..5 {
            pipeline.cmd_buffer_mgr.allocate_descriptor_set(layout).unwrap();
        }
        let pools_created = mock
            .events()
            .iter()
            .filter(|e| matches!(e, DriverEvent::CreateDescriptorPool(_)))
            .count();
        assert_eq!(pools_created, 3);
        pipeline.teardown();
    }

    #[test]
    fn frame_descriptor_pools_are_reset_on_reclaim() {
        let mock = Arc::new(MockDriver::new());
        let mut pipeline = spawn_pipeline(&mock);

        let layout = vk::DescriptorSetLayout::null();
        pipeline.cmd_buffer_mgr.allocate_descriptor_set(layout).unwrap();

        // Cycle through every slot and back to frame 0's first slot.
        for generation in 1..=(NUM_COMMAND_BUFFERS as u64) {
            pipeline
                .cmd_buffer_mgr
                .submit_command_buffer(generation, true, false, None);
        }
        let resets = mock
            .events()
            .iter()
            .filter(|e| matches!(e, DriverEvent::ResetDescriptorPool(_)))
            .count();
        assert_eq!(resets, 1);
        pipeline.teardown();
    }

    #[test]
    fn teardown_destroys_every_created_object() {
        let mock = Arc::new(MockDriver::new());
        let mut pipeline = spawn_pipeline(&mock);
        pipeline
            .cmd_buffer_mgr
            .allocate_descriptor_set(vk::DescriptorSetLayout::null())
            .unwrap();
        pipeline.cmd_buffer_mgr.submit_command_buffer(1, true, true, None);
        pipeline.teardown();
        assert_eq!(mock.live_objects(), 0);
    }
}
