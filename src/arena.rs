//! Bump-allocated storage for recorded command closures.
//!
//! Commands recorded on the producer thread are not executed immediately.
//! They are packed into a [`CommandChunk`], a fixed-size arena that embeds an
//! intrusive singly-linked list of type-erased closures, and the whole chunk
//! is later handed to the worker thread and replayed in insertion order.
//!
//! Recording a command costs one aligned in-place write plus one pointer
//! store. There is no per-command heap allocation; drained chunks return to a
//! [`ChunkPool`] and are reused.

use std::mem::{ManuallyDrop, MaybeUninit};
use std::ptr;
use std::sync::Mutex;

use crate::manager::CommandBufferManager;

/// Capacity of a single [`CommandChunk`] in bytes.
pub const CHUNK_BYTES: usize = 32 * 1024;

/// Header embedded at the front of every command stored in a chunk.
///
/// `invoke` both executes and destroys the payload: called with
/// `Some(manager)` during replay, or with `None` to drop an unexecuted
/// payload when a chunk is torn down.
#[repr(C)]
struct CommandHeader {
    next: *mut CommandHeader,
    invoke: unsafe fn(*mut CommandHeader, Option<&mut CommandBufferManager>),
}

#[repr(C, align(16))]
struct CommandNode<F> {
    header: CommandHeader,
    command: ManuallyDrop<F>,
}

unsafe fn invoke_node<F: FnOnce(&mut CommandBufferManager)>(
    node: *mut CommandHeader,
    cmd_buffer_mgr: Option<&mut CommandBufferManager>,
) {
    let node = node.cast::<CommandNode<F>>();
    let command = unsafe { ManuallyDrop::take(&mut (*node).command) };
    match cmd_buffer_mgr {
        Some(cmd_buffer_mgr) => command(cmd_buffer_mgr),
        None => drop(command),
    }
}

/// Backing storage, aligned so that any reasonable command payload can be
/// placed at an aligned offset relative to the buffer start.
#[repr(C, align(64))]
struct ChunkStorage {
    bytes: [MaybeUninit<u8>; CHUNK_BYTES],
}

/// A fixed-capacity arena holding a linked sequence of recorded commands.
///
/// The chunk owns its commands exclusively. Once [`execute_all`] runs, every
/// stored closure has been invoked and destroyed exactly once and the chunk
/// is empty again.
///
/// The storage is boxed so the embedded `next` pointers stay valid when the
/// `CommandChunk` itself is moved between the producer, the work queue and
/// the reserve pool.
///
/// [`execute_all`]: CommandChunk::execute_all
pub(crate) struct CommandChunk {
    storage: Box<ChunkStorage>,
    write_offset: usize,
    first: *mut CommandHeader,
    last: *mut CommandHeader,
}

// The chunk is moved to the worker thread as a unit; the raw pointers only
// ever point into `storage`, and `record` requires `F: Send`.
unsafe impl Send for CommandChunk {}

impl Default for CommandChunk {
    fn default() -> Self {
        Self {
            storage: Box::new(ChunkStorage {
                bytes: [MaybeUninit::uninit(); CHUNK_BYTES],
            }),
            write_offset: 0,
            first: ptr::null_mut(),
            last: ptr::null_mut(),
        }
    }
}

impl CommandChunk {
    /// Places `command` into the chunk, linking it after the previously
    /// recorded command.
    ///
    /// Returns the closure back unchanged if it does not fit in the remaining
    /// space, leaving the chunk untouched. A closure that could never fit in
    /// an *empty* chunk is rejected at compile time.
    pub(crate) fn record<F>(&mut self, command: F) -> Result<(), F>
    where
        F: FnOnce(&mut CommandBufferManager) + Send + 'static,
    {
        const {
            assert!(
                std::mem::size_of::<CommandNode<F>>() <= CHUNK_BYTES,
                "command closure is too large for a chunk"
            );
            assert!(
                std::mem::align_of::<CommandNode<F>>() <= 64,
                "command closure alignment exceeds chunk storage alignment"
            );
        }

        let offset = self
            .write_offset
            .next_multiple_of(std::mem::align_of::<CommandNode<F>>());
        if offset + std::mem::size_of::<CommandNode<F>>() > CHUNK_BYTES {
            return Err(command);
        }

        unsafe {
            let node = self
                .storage
                .bytes
                .as_mut_ptr()
                .cast::<u8>()
                .add(offset)
                .cast::<CommandNode<F>>();
            node.write(CommandNode {
                header: CommandHeader {
                    next: ptr::null_mut(),
                    invoke: invoke_node::<F>,
                },
                command: ManuallyDrop::new(command),
            });

            let header = node.cast::<CommandHeader>();
            if self.last.is_null() {
                self.first = header;
            } else {
                (*self.last).next = header;
            }
            self.last = header;
        }
        self.write_offset = offset + std::mem::size_of::<CommandNode<F>>();
        Ok(())
    }

    /// Replays every stored command in insertion order, running each
    /// closure's destructor, then resets the chunk to empty.
    pub(crate) fn execute_all(&mut self, cmd_buffer_mgr: &mut CommandBufferManager) {
        let mut command = self.first;
        while !command.is_null() {
            unsafe {
                let next = (*command).next;
                ((*command).invoke)(command, Some(&mut *cmd_buffer_mgr));
                command = next;
            }
        }
        self.write_offset = 0;
        self.first = ptr::null_mut();
        self.last = ptr::null_mut();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.write_offset == 0
    }
}

impl Drop for CommandChunk {
    fn drop(&mut self) {
        // Normally chunks are drained before being dropped; this path only
        // runs destructors for commands abandoned by an aborted teardown.
        let mut command = self.first;
        while !command.is_null() {
            unsafe {
                let next = (*command).next;
                ((*command).invoke)(command, None);
                command = next;
            }
        }
    }
}

/// A LIFO reserve of drained chunks.
///
/// The producer pops when it needs a fresh chunk, the worker pushes after
/// draining one. LIFO keeps the most recently touched storage in cache. The
/// lock is only ever held for the push or pop itself.
pub(crate) struct ChunkPool {
    reserve: Mutex<Vec<CommandChunk>>,
}

impl ChunkPool {
    pub(crate) fn new() -> Self {
        Self {
            reserve: Mutex::new(Vec::new()),
        }
    }

    /// Pops a reserved chunk, or allocates a fresh one if the pool is empty.
    pub(crate) fn acquire(&self) -> CommandChunk {
        self.reserve.lock().unwrap().pop().unwrap_or_default()
    }

    pub(crate) fn release(&self, chunk: CommandChunk) {
        debug_assert!(chunk.is_empty());
        self.reserve.lock().unwrap().push(chunk);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.reserve.lock().unwrap().len()
    }
}
