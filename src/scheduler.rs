//! The producer-facing command scheduler.
//!
//! A [`Scheduler`] decouples the thread that *produces* GPU work from the
//! threads that *execute* it. Producers record closures; the scheduler packs
//! them into arena chunks and hands full chunks to a dedicated recording
//! worker, which replays them against the
//! [`CommandBufferManager`]. Submission and presentation happen on further
//! workers downstream, so recording never blocks on the driver.
//!
//! # Overview
//!
//! - [`record`](Scheduler::record) appends a closure to the current chunk,
//!   flushing and retrying once when the chunk is full. It never blocks on
//!   GPU progress.
//! - [`flush`](Scheduler::flush) publishes the current chunk to the worker.
//! - [`submit_command_buffer`](Scheduler::submit_command_buffer) assigns the
//!   next fence counter generation and records a closure that finishes and
//!   submits the current command buffer, optionally presenting a swap-chain
//!   image.
//! - [`wait_for_fence_counter`](Scheduler::wait_for_fence_counter) blocks
//!   until the GPU has completed a generation.
//!
//! Commands replay in exactly the order they were recorded, across chunk
//! boundaries and across submits; that is the only ordering guarantee.
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use scoria::{Scheduler, driver::Driver};
//! # fn demo(driver: Arc<dyn Driver>) {
//! let mut scheduler = Scheduler::new(driver).unwrap();
//! scheduler.record(|cmd_buffer_mgr| {
//!     let _draw = cmd_buffer_mgr.current_command_buffer();
//!     // record driver commands into the buffer
//! });
//! scheduler.submit_command_buffer(true, false, None);
//! let generation = scheduler.current_fence_counter();
//! scheduler.wait_for_fence_counter(generation);
//! scheduler.shutdown();
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use ash::prelude::VkResult;
use ash::vk;

use crate::arena::{ChunkPool, CommandChunk};
use crate::driver::Driver;
use crate::manager::{CommandBufferManager, ManagerShared};

struct WorkQueue {
    queue: VecDeque<CommandChunk>,
    worker_idle: bool,
    running: bool,
}

struct WorkerShared {
    work: Mutex<WorkQueue>,
    /// Wakes the recording worker when work arrives or shutdown begins.
    wake: Condvar,
    /// Broadcast when the worker observes an empty queue.
    idle: Condvar,
}

/// Deferred command scheduler with a threaded execution pipeline.
///
/// Owns three workers: the recording worker replaying command chunks, the
/// submission worker feeding the driver queue, and the fence worker watching
/// completion. All of them stop and join on [`shutdown`](Scheduler::shutdown)
/// (or on drop).
///
/// The scheduler itself is single-producer: record, flush, submit and the
/// wait operations must be called from one thread. The fence counter
/// accessors and present-status polls are safe from any thread via the
/// values they read.
pub struct Scheduler {
    shared: Arc<WorkerShared>,
    cmd_buffer_shared: Arc<ManagerShared>,
    chunk_reserve: Arc<ChunkPool>,
    chunk: CommandChunk,

    /// Generation handed to the most recent submit. Strictly monotonic,
    /// incremented only by the producer thread.
    current_fence_counter: AtomicU64,

    worker: Option<thread::JoinHandle<()>>,
    submit_worker: Option<thread::JoinHandle<()>>,
    fence_worker: Option<thread::JoinHandle<()>>,
}

impl Scheduler {
    /// Creates the command buffer ring on `driver` and starts the worker
    /// threads.
    pub fn new(driver: Arc<dyn Driver>) -> VkResult<Self> {
        let cmd_buffer_mgr = CommandBufferManager::new(driver)?;
        let cmd_buffer_shared = cmd_buffer_mgr.shared();

        let chunk_reserve = Arc::new(ChunkPool::new());
        let shared = Arc::new(WorkerShared {
            work: Mutex::new(WorkQueue {
                queue: VecDeque::new(),
                worker_idle: true,
                running: true,
            }),
            wake: Condvar::new(),
            idle: Condvar::new(),
        });

        let worker = thread::Builder::new()
            .name("scoria command stream".to_string())
            .spawn({
                let shared = shared.clone();
                let chunk_reserve = chunk_reserve.clone();
                move || worker_thread(&shared, &chunk_reserve, cmd_buffer_mgr)
            })
            .unwrap();
        let submit_worker = thread::Builder::new()
            .name("scoria submit".to_string())
            .spawn({
                let shared = cmd_buffer_shared.clone();
                move || shared.submit_worker_loop()
            })
            .unwrap();
        let fence_worker = thread::Builder::new()
            .name("scoria fence".to_string())
            .spawn({
                let shared = cmd_buffer_shared.clone();
                move || shared.fence_worker_loop()
            })
            .unwrap();

        Ok(Self {
            shared,
            cmd_buffer_shared,
            chunk: chunk_reserve.acquire(),
            chunk_reserve,
            current_fence_counter: AtomicU64::new(0),
            worker: Some(worker),
            submit_worker: Some(submit_worker),
            fence_worker: Some(fence_worker),
        })
    }

    /// Records a command closure for deferred execution on the worker.
    ///
    /// The closure runs exactly once, with exclusive access to the
    /// [`CommandBufferManager`], in recording order. If the current chunk is
    /// full it is flushed and the record retried; the retry cannot fail
    /// because an empty chunk accepts any closure that passed the
    /// compile-time size bound.
    ///
    /// # Panics
    ///
    /// Panics if called after [`shutdown`](Scheduler::shutdown).
    pub fn record<F>(&mut self, command: F)
    where
        F: FnOnce(&mut CommandBufferManager) + Send + 'static,
    {
        assert!(
            self.worker.is_some(),
            "Scheduler::record called after shutdown"
        );
        let Err(command) = self.chunk.record(command) else {
            return;
        };
        self.flush();
        if self.chunk.record(command).is_err() {
            unreachable!("an empty chunk accepts any correctly sized command");
        }
    }

    /// Publishes the current chunk to the recording worker and starts a
    /// fresh one. No-op when nothing has been recorded since the last flush.
    pub fn flush(&mut self) {
        if self.chunk.is_empty() {
            return;
        }
        let mut work = self.shared.work.lock().unwrap();
        work.worker_idle = false;
        work.queue
            .push_back(std::mem::replace(&mut self.chunk, self.chunk_reserve.acquire()));
        self.shared.wake.notify_one();
    }

    /// Flushes, then blocks until the recording worker has drained the work
    /// queue and gone idle. Every closure recorded before the call has
    /// executed once this returns.
    pub fn sync_worker(&mut self) {
        self.flush();
        let mut work = self.shared.work.lock().unwrap();
        while !work.worker_idle {
            work = self.shared.idle.wait(work).unwrap();
        }
    }

    /// [`sync_worker`](Scheduler::sync_worker), then additionally waits for
    /// the submission worker to drain its queue and finish any in-flight
    /// queue submission.
    pub fn synchronize_submission_thread(&mut self) {
        self.sync_worker();
        self.cmd_buffer_shared.wait_for_submit_worker_idle();
    }

    /// Assigns the next fence counter generation and schedules submission of
    /// the current command buffer.
    ///
    /// The recorded closure ends any open render pass, finishes the buffers
    /// and hands them to the submission pipeline. With `wait_for_completion`
    /// the call blocks until the GPU signals the new generation; otherwise
    /// the chunk is flushed immediately so the submission is not starved
    /// behind future records.
    pub fn submit_command_buffer(
        &mut self,
        submit_on_worker_thread: bool,
        wait_for_completion: bool,
        present: Option<(vk::SwapchainKHR, u32)>,
    ) {
        let fence_counter = self.current_fence_counter.fetch_add(1, Ordering::AcqRel) + 1;
        self.record(move |cmd_buffer_mgr| {
            cmd_buffer_mgr.end_render_pass();
            cmd_buffer_mgr.submit_command_buffer(
                fence_counter,
                submit_on_worker_thread,
                wait_for_completion,
                present,
            );
        });

        if wait_for_completion {
            self.wait_for_fence_counter(fence_counter);
        } else {
            self.flush();
        }
    }

    /// Blocks until the GPU has completed fence counter generation
    /// `counter`. Returns immediately when it already has.
    pub fn wait_for_fence_counter(&mut self, counter: u64) {
        if self.cmd_buffer_shared.completed_fence_counter() >= counter {
            return;
        }
        self.sync_worker();
        self.cmd_buffer_shared.wait_for_fence_counter(counter);
    }

    /// Last fence counter generation the GPU has completed. Thread safe.
    pub fn completed_fence_counter(&self) -> u64 {
        self.cmd_buffer_shared.completed_fence_counter()
    }

    /// Generation assigned to the most recent submit. Thread safe.
    pub fn current_fence_counter(&self) -> u64 {
        self.current_fence_counter.load(Ordering::Acquire)
    }

    /// Did the last present fail (swap chain needs recreating)? Clears the
    /// flag on read.
    pub fn check_last_present_failed(&self) -> bool {
        self.cmd_buffer_shared.check_last_present_failed()
    }

    /// Has a present completed since this was last checked? Clears the flag
    /// on read.
    pub fn check_last_present_done(&self) -> bool {
        self.cmd_buffer_shared.check_last_present_done()
    }

    /// Did a queue submission fail? Clears the flag on read.
    pub fn check_last_submit_failed(&self) -> bool {
        self.cmd_buffer_shared.check_last_submit_failed()
    }

    pub fn last_present_result(&self) -> vk::Result {
        self.cmd_buffer_shared.last_present_result()
    }

    /// Drains both pipelines, then stops and joins every worker thread.
    ///
    /// Recording after shutdown is a precondition violation and panics.
    /// Idempotent; also invoked by `Drop`.
    pub fn shutdown(&mut self) {
        if self.worker.is_none() {
            return;
        }
        self.sync_worker();
        self.synchronize_submission_thread();

        {
            let mut work = self.shared.work.lock().unwrap();
            work.running = false;
            self.shared.wake.notify_one();
        }
        if self.worker.take().unwrap().join().is_err() {
            tracing::error!("recording worker panicked during shutdown");
        }

        self.cmd_buffer_shared.stop_submit_worker();
        if self.submit_worker.take().unwrap().join().is_err() {
            tracing::error!("submission worker panicked during shutdown");
        }
        self.cmd_buffer_shared.stop_fence_worker();
        if self.fence_worker.take().unwrap().join().is_err() {
            tracing::error!("fence worker panicked during shutdown");
        }
    }

    #[cfg(test)]
    pub(crate) fn chunk_reserve_len(&self) -> usize {
        self.chunk_reserve.len()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Recording worker loop: sleep until woken, replay one chunk at a time,
/// return drained chunks to the reserve.
///
/// The worker marks itself idle both when it finds the queue empty at the
/// top of the loop and after draining a chunk that left the queue empty;
/// producers observe the transition through the idle condvar.
fn worker_thread(
    shared: &WorkerShared,
    chunk_reserve: &ChunkPool,
    mut cmd_buffer_mgr: CommandBufferManager,
) {
    loop {
        let mut chunk = {
            let mut work = shared.work.lock().unwrap();
            loop {
                if let Some(chunk) = work.queue.pop_front() {
                    break chunk;
                }
                if !work.running {
                    return;
                }
                work.worker_idle = true;
                shared.idle.notify_all();
                work = shared.wake.wait(work).unwrap();
            }
        };

        chunk.execute_all(&mut cmd_buffer_mgr);
        chunk_reserve.release(chunk);

        let mut work = shared.work.lock().unwrap();
        if work.queue.is_empty() {
            work.worker_idle = true;
            shared.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::MockDriver;

    fn shared_log() -> Arc<Mutex<Vec<usize>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn new_scheduler() -> (Arc<MockDriver>, Scheduler) {
        let mock = Arc::new(MockDriver::new());
        let scheduler = Scheduler::new(mock.clone()).unwrap();
        (mock, scheduler)
    }

    #[test]
    fn replays_a_thousand_commands_in_order_from_one_chunk() {
        let (_mock, mut scheduler) = new_scheduler();
        let log = shared_log();
        for i in 0..1000usize {
            let log = log.clone();
            scheduler.record(move |_| log.lock().unwrap().push(i));
        }
        scheduler.flush();
        scheduler.sync_worker();

        assert_eq!(*log.lock().unwrap(), (0..1000).collect::<Vec<_>>());
        // Small captures pack into a single chunk, drained back to the pool.
        assert_eq!(scheduler.chunk_reserve_len(), 1);
        scheduler.shutdown();
    }

    #[test]
    fn spills_across_chunks_preserving_order() {
        let (_mock, mut scheduler) = new_scheduler();
        let log = shared_log();

        // Hold the worker on the first command so every spilled chunk has to
        // come from a fresh allocation, not from reuse of a drained one.
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        {
            let gate = gate.clone();
            scheduler.record(move |_| {
                let (lock, condvar) = &*gate;
                let mut open = lock.lock().unwrap();
                while !*open {
                    open = condvar.wait(open).unwrap();
                }
            });
        }

        // Payload sized so only three commands fit per 32 KiB chunk.
        for i in 0..7usize {
            let log = log.clone();
            let pad = [0u8; 10200];
            scheduler.record(move |_| {
                let _ = &pad;
                log.lock().unwrap().push(i);
            });
        }
        scheduler.flush();

        {
            let (lock, condvar) = &*gate;
            *lock.lock().unwrap() = true;
            condvar.notify_all();
        }
        scheduler.sync_worker();

        assert_eq!(*log.lock().unwrap(), (0..7).collect::<Vec<_>>());
        assert_eq!(scheduler.chunk_reserve_len(), 3);
        scheduler.shutdown();
    }

    #[test]
    fn sync_worker_executes_everything_recorded_before_it() {
        let (_mock, mut scheduler) = new_scheduler();
        let log = shared_log();
        for i in 0..10usize {
            let log = log.clone();
            scheduler.record(move |_| log.lock().unwrap().push(i));
        }
        // No explicit flush: sync_worker must flush on its own.
        scheduler.sync_worker();
        assert_eq!(log.lock().unwrap().len(), 10);
        scheduler.shutdown();
    }

    #[test]
    fn fence_generations_complete_in_order() {
        let (_mock, mut scheduler) = new_scheduler();
        let log = shared_log();

        for batch in 0..3usize {
            let log = log.clone();
            scheduler.record(move |_| log.lock().unwrap().push(batch));
            scheduler.submit_command_buffer(true, false, None);
        }
        assert_eq!(scheduler.current_fence_counter(), 3);
        scheduler.wait_for_fence_counter(3);

        assert!(scheduler.completed_fence_counter() >= 3);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
        scheduler.shutdown();
    }

    #[test]
    fn wait_for_completed_generation_returns_immediately() {
        let (_mock, mut scheduler) = new_scheduler();
        scheduler.submit_command_buffer(true, true, None);
        assert!(scheduler.completed_fence_counter() >= 1);
        // Already complete; must not require another sync round.
        scheduler.wait_for_fence_counter(1);
        scheduler.shutdown();
    }

    #[test]
    fn chunk_allocations_stabilize_under_steady_load() {
        let (_mock, mut scheduler) = new_scheduler();
        for _round in 0..20usize {
            let log = shared_log();
            for i in 0..50usize {
                let log = log.clone();
                scheduler.record(move |_| log.lock().unwrap().push(i));
            }
            scheduler.sync_worker();
            assert_eq!(scheduler.chunk_reserve_len(), 1);
        }
        scheduler.shutdown();
    }

    #[test]
    fn present_failure_surfaces_through_the_scheduler() {
        let (mock, mut scheduler) = new_scheduler();
        mock.push_present_result(vk::Result::ERROR_OUT_OF_DATE_KHR);

        scheduler.submit_command_buffer(true, false, Some((vk::SwapchainKHR::null(), 0)));
        scheduler.synchronize_submission_thread();

        assert!(scheduler.check_last_present_done());
        assert!(scheduler.check_last_present_failed());
        assert!(!scheduler.check_last_present_failed());
        assert_eq!(
            scheduler.last_present_result(),
            vk::Result::ERROR_OUT_OF_DATE_KHR
        );
        assert!(!scheduler.check_last_submit_failed());
        scheduler.shutdown();
    }

    #[test]
    fn shutdown_drains_recorded_work_before_joining() {
        let (mock, mut scheduler) = new_scheduler();
        let log = shared_log();
        for i in 0..100usize {
            let log = log.clone();
            scheduler.record(move |_| log.lock().unwrap().push(i));
        }
        scheduler.submit_command_buffer(true, false, None);
        scheduler.shutdown();

        assert_eq!(*log.lock().unwrap(), (0..100).collect::<Vec<_>>());
        drop(scheduler);
        assert_eq!(mock.live_objects(), 0);
    }

    #[test]
    #[should_panic(expected = "after shutdown")]
    fn recording_after_shutdown_panics() {
        let (_mock, mut scheduler) = new_scheduler();
        scheduler.shutdown();
        scheduler.record(|_| {});
    }

    #[test]
    fn drop_without_shutdown_tears_down_cleanly() {
        let (mock, scheduler) = new_scheduler();
        drop(scheduler);
        assert_eq!(mock.live_objects(), 0);
    }

    #[test]
    fn deferred_destruction_completes_before_fence_wait_returns() {
        let (mock, mut scheduler) = new_scheduler();
        let destroyed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        {
            let destroyed = destroyed.clone();
            scheduler.record(move |cmd_buffer_mgr| {
                cmd_buffer_mgr.defer_cleanup(move || {
                    destroyed.store(true, Ordering::SeqCst);
                });
            });
        }
        scheduler.submit_command_buffer(true, false, None);
        scheduler.wait_for_fence_counter(1);
        scheduler.sync_worker();
        assert!(destroyed.load(Ordering::SeqCst));
        drop(mock);
        scheduler.shutdown();
    }
}
