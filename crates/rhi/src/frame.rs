//! One slot of the device's frame ring.

use tracing::debug;

use crate::backend::{Backend, NativeFence, NativeSemaphore, QueueSubmit};
use crate::command_list::CommandList;
use crate::command_pool::ThreadedCommandPool;
use crate::error::RhiResult;
use crate::handle::{DeviceResourceHandle, ResourceType};
use crate::types::QueueType;

/// Order in which expired handles are released: views before the textures
/// they look into, swapchains last since they own backbuffer entries.
pub(crate) const RELEASE_ORDER: [ResourceType; ResourceType::COUNT] = [
    ResourceType::TextureView,
    ResourceType::Texture,
    ResourceType::Sampler,
    ResourceType::Buffer,
    ResourceType::Shader,
    ResourceType::PipelineLayout,
    ResourceType::Swapchain,
];

/// Per-slot pools, synchronization and deferred destruction queues.
#[derive(Debug)]
pub(crate) struct Frame {
    pub(crate) pool: ThreadedCommandPool,
    /// Ended lists waiting for submission, per queue type.
    pending: [Vec<CommandList>; QueueType::COUNT],
    /// Submitted lists, handed back to the pool once the fences are observed.
    in_flight: Vec<CommandList>,
    fences: [NativeFence; QueueType::COUNT],
    render_finished: NativeSemaphore,
    /// Fences submitted this cycle.
    wait_fences: Vec<NativeFence>,
    /// Swapchain acquire semaphores the next graphics submission waits on.
    acquire_semaphores: Vec<NativeSemaphore>,
    /// Whether `render_finished` will be signaled by this cycle's graphics
    /// submission.
    render_finished_pending: bool,
    /// Queues that executed lists this cycle without a fence.
    unfenced: [bool; QueueType::COUNT],
    /// Any list was submitted this cycle.
    pub(crate) submitted_work: bool,
    pub(crate) graphics_submitted: bool,
    expired: [Vec<DeviceResourceHandle>; ResourceType::COUNT],
}

impl Frame {
    pub(crate) fn new(backend: &dyn Backend) -> RhiResult<Self> {
        let fences = [
            backend.fence_create(false)?,
            backend.fence_create(false)?,
            backend.fence_create(false)?,
        ];
        let render_finished = backend.semaphore_create()?;
        Ok(Self {
            pool: ThreadedCommandPool::new(),
            pending: Default::default(),
            in_flight: Vec::new(),
            fences,
            render_finished,
            wait_fences: Vec::new(),
            acquire_semaphores: Vec::new(),
            render_finished_pending: false,
            unfenced: [false; QueueType::COUNT],
            submitted_work: false,
            graphics_submitted: false,
            expired: Default::default(),
        })
    }

    pub(crate) fn push_pending(&mut self, list: CommandList) {
        self.pending[list.queue_type().slot()].push(list);
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.pending.iter().any(|lists| !lists.is_empty())
    }

    pub(crate) fn push_acquire(&mut self, semaphore: NativeSemaphore) {
        self.acquire_semaphores.push(semaphore);
    }

    /// Semaphore to wait on before presenting, if this cycle's graphics
    /// submission signals it.
    pub(crate) fn render_finished(&self) -> Option<NativeSemaphore> {
        self.render_finished_pending.then_some(self.render_finished)
    }

    /// Submits the pending lists of `queue`.
    ///
    /// A fenced submission goes out even without lists so the fence covers
    /// earlier unfenced work; it also consumes the acquire semaphores and
    /// signals `render_finished` on the graphics queue.
    pub(crate) fn submit_queue(&mut self, backend: &dyn Backend, queue: QueueType, fenced: bool) -> RhiResult<()> {
        let slot = queue.slot();
        let lists = std::mem::take(&mut self.pending[slot]);
        if lists.is_empty() && !(fenced && self.unfenced[slot]) {
            return Ok(());
        }

        let fence = fenced.then_some(self.fences[slot]);
        if let Some(fence) = fence
            && self.wait_fences.contains(&fence)
        {
            // Fenced twice in one cycle: drain the first use before reuse.
            backend.fence_wait_for(&[fence])?;
            backend.fence_reset(&[fence])?;
            self.wait_fences.retain(|f| *f != fence);
        }

        let graphics = queue == QueueType::Graphics && !lists.is_empty();
        let acquire: Vec<NativeSemaphore> = if graphics {
            std::mem::take(&mut self.acquire_semaphores)
        } else {
            Vec::new()
        };
        let signal: Vec<NativeSemaphore> = if !acquire.is_empty() {
            vec![self.render_finished]
        } else {
            Vec::new()
        };
        let natives: Vec<_> = lists.iter().map(CommandList::native).collect();

        let result = backend.queue_execute(
            queue,
            &QueueSubmit {
                lists: &natives,
                wait_semaphores: &acquire,
                signal_semaphores: &signal,
                fence,
            },
        );
        // Lists go in flight even on failure; the pool reset recycles them.
        self.in_flight.extend(lists);
        result?;

        if let Some(fence) = fence {
            self.wait_fences.push(fence);
        }
        if !signal.is_empty() {
            self.render_finished_pending = true;
        }
        self.unfenced[slot] = !fenced && (!natives.is_empty() || self.unfenced[slot]);
        if !natives.is_empty() {
            self.submitted_work = true;
            self.graphics_submitted |= queue == QueueType::Graphics;
        }
        debug!(
            "Submitted {} command lists to {:?} (fenced: {})",
            natives.len(),
            queue,
            fenced
        );
        Ok(())
    }

    /// Blocks until the fences submitted last cycle signal, then resets them.
    pub(crate) fn wait_fences(&mut self, backend: &dyn Backend) -> RhiResult<()> {
        if self.wait_fences.is_empty() {
            return Ok(());
        }
        backend.fence_wait_for(&self.wait_fences)?;
        backend.fence_reset(&self.wait_fences)?;
        self.wait_fences.clear();
        Ok(())
    }

    /// Drops the fences without waiting, after the device went idle.
    pub(crate) fn forget_fences(&mut self, backend: &dyn Backend) -> RhiResult<()> {
        if !self.wait_fences.is_empty() {
            backend.fence_reset(&self.wait_fences)?;
            self.wait_fences.clear();
        }
        Ok(())
    }

    /// Hands every in-flight list back to its pool. Returns how many.
    pub(crate) fn reclaim(&mut self) -> usize {
        let count = self.in_flight.len();
        for list in self.in_flight.drain(..) {
            self.pool.reclaim(list);
        }
        count
    }

    /// Parks a list that could not be submitted until the next reclaim.
    pub(crate) fn retire(&mut self, list: CommandList) {
        self.in_flight.push(list);
    }

    pub(crate) fn expire(&mut self, handle: DeviceResourceHandle) {
        let Some(ty) = handle.resource_type() else {
            panic!("expired handle {handle:?} has no resource type");
        };
        debug_assert!(
            !self.expired.iter().flatten().any(|h| *h == handle),
            "{handle:?} destroyed twice"
        );
        self.expired[ty as usize].push(handle);
    }

    /// Removes every expired handle, in [`RELEASE_ORDER`].
    pub(crate) fn take_expired(&mut self) -> Vec<DeviceResourceHandle> {
        RELEASE_ORDER
            .iter()
            .flat_map(|ty| std::mem::take(&mut self.expired[*ty as usize]))
            .collect()
    }

    pub(crate) fn expired_count(&self) -> usize {
        self.expired.iter().map(Vec::len).sum()
    }

    pub(crate) fn reset_flags(&mut self) {
        self.submitted_work = false;
        self.graphics_submitted = false;
        self.render_finished_pending = false;
        self.unfenced = [false; QueueType::COUNT];
        self.acquire_semaphores.clear();
    }

    /// Destroys the pools and synchronization primitives. Pending lists are
    /// dropped without submission.
    pub(crate) fn destroy(&mut self, backend: &dyn Backend) {
        for lists in &mut self.pending {
            for list in lists.drain(..) {
                self.in_flight.push(list);
            }
        }
        self.reclaim();
        self.pool.destroy(backend);
        for fence in self.fences {
            backend.fence_destroy(fence);
        }
        backend.semaphore_destroy(self.render_finished);
    }
}
