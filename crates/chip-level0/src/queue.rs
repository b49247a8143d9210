//! Command queues
//!
//! Every operation records into a command list drawn from a pool, closes
//! it and submits it with a fence drawn from a second pool. Submissions
//! complete in FIFO order; completed ones are retired from the front of the
//! in-flight list whenever the queue is touched, so both pools stay bounded
//! by the amount of outstanding work.
//!
//! ```text
//! Idle ──record──▶ Recording ──execute──▶ Submitted ──retire all──▶ Idle
//!                      │
//!                      └──failure──▶ previous state
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chip_ze::{
    CommandListHandle, CommandQueueDesc, CommandQueueHandle, CommandQueueMode, FenceHandle,
    WAIT_INFINITE, ZeDriver, ZeResult,
};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::context::Level0Context;
use crate::device::Level0Device;
use crate::error::{Error, Result};
use crate::exec::ExecItem;
use crate::kernel::ParamKind;
use crate::result::{LzResultExt, lz_process};

const POLL_SLICE: Duration = Duration::from_millis(1);

/// Queue lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Nothing in flight
    Idle,
    /// A command list is being recorded
    Recording,
    /// Work has been submitted and not yet retired
    Submitted,
}

#[derive(Debug, Clone, Copy)]
struct Submission {
    list: CommandListHandle,
    fence: FenceHandle,
    /// A caller is blocked on this fence; it must not be recycled yet
    waited_on: bool,
    /// The fence has been observed signalled
    done: bool,
}

#[derive(Debug)]
struct QueueInner {
    handle: CommandQueueHandle,
    state: QueueState,
    in_flight: VecDeque<Submission>,
    free_lists: Vec<CommandListHandle>,
    free_fences: Vec<FenceHandle>,
    destroyed: bool,
}

/// An asynchronous command queue bound to one device and its context
pub struct Level0Queue {
    driver: Arc<dyn ZeDriver>,
    context: Arc<Level0Context>,
    device: Arc<Level0Device>,
    inner: Mutex<QueueInner>,
    submissions: AtomicU64,
}

impl Level0Queue {
    /// Create an asynchronous native queue on `device`
    pub fn create(
        driver: Arc<dyn ZeDriver>,
        context: Arc<Level0Context>,
        device: Arc<Level0Device>,
    ) -> Result<Arc<Self>> {
        let handle = create_native(driver.as_ref(), &context, &device)?;
        Ok(Arc::new(Self {
            driver,
            context,
            device,
            inner: Mutex::new(QueueInner {
                handle,
                state: QueueState::Idle,
                in_flight: VecDeque::new(),
                free_lists: Vec::new(),
                free_fences: Vec::new(),
                destroyed: false,
            }),
            submissions: AtomicU64::new(0),
        }))
    }

    /// Current native queue; changes when a faulted queue is reset
    pub fn handle(&self) -> CommandQueueHandle {
        self.inner.lock().handle
    }

    pub fn device(&self) -> &Arc<Level0Device> {
        &self.device
    }

    pub fn context(&self) -> &Arc<Level0Context> {
        &self.context
    }

    pub fn state(&self) -> QueueState {
        self.inner.lock().state
    }

    /// Submissions accepted since creation
    pub fn submission_count(&self) -> u64 {
        self.submissions.load(Ordering::Relaxed)
    }

    /// Submissions whose fence has not been observed signalled
    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight.iter().filter(|s| !s.done).count()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }

    fn recycle(&self, inner: &mut QueueInner, list: CommandListHandle, fence: FenceHandle) {
        match self.driver.command_list_reset(list) {
            Ok(()) => inner.free_lists.push(list),
            Err(status) => {
                warn!(list = %list, %status, "Dropping command list that failed to reset");
                let _ = self.driver.command_list_destroy(list);
            }
        }
        match self.driver.fence_reset(fence) {
            Ok(()) => inner.free_fences.push(fence),
            Err(status) => {
                warn!(fence = %fence, %status, "Dropping fence that failed to reset");
                let _ = self.driver.fence_destroy(fence);
            }
        }
    }

    /// Pop completed submissions off the front of the FIFO
    ///
    /// A completed submission with a blocked waiter stays listed, marked
    /// done, until that waiter retires it.
    fn retire(&self, inner: &mut QueueInner) {
        let mut held = Vec::new();
        while let Some(mut front) = inner.in_flight.pop_front() {
            if !front.done {
                match self.driver.fence_query_status(front.fence) {
                    ZeResult::NotReady => {
                        inner.in_flight.push_front(front);
                        break;
                    }
                    ZeResult::Success => {}
                    status => {
                        warn!(queue = %inner.handle, %status, "Submission completed with error");
                    }
                }
                front.done = true;
            }
            if front.waited_on {
                held.push(front);
                continue;
            }
            self.recycle(inner, front.list, front.fence);
            trace!(queue = %inner.handle, fence = %front.fence, "Submission retired");
        }
        for submission in held.into_iter().rev() {
            inner.in_flight.push_front(submission);
        }
        if inner.in_flight.iter().all(|s| s.done) && inner.state == QueueState::Submitted {
            inner.state = QueueState::Idle;
        }
    }

    fn acquire(&self, inner: &mut QueueInner) -> Result<(CommandListHandle, FenceHandle)> {
        let list = match inner.free_lists.pop() {
            Some(list) => list,
            None => self
                .driver
                .command_list_create(self.context.handle(), self.device.handle())
                .lz_context("zeCommandListCreate")?,
        };
        let fence = match inner.free_fences.pop() {
            Some(fence) => fence,
            None => match self.driver.fence_create(inner.handle) {
                Ok(fence) => fence,
                Err(status) => {
                    inner.free_lists.push(list);
                    return Err(status).lz_context("zeFenceCreate");
                }
            },
        };
        Ok((list, fence))
    }

    /// Record with `record`, close and submit under a fresh fence
    fn submit<F>(&self, waited_on: bool, record: F) -> Result<Submission>
    where
        F: FnOnce(CommandListHandle) -> Result<()>,
    {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return Err(Error::Destroyed("queue"));
        }
        self.retire(&mut inner);
        let (list, fence) = self.acquire(&mut inner)?;

        let previous = inner.state;
        inner.state = QueueState::Recording;
        let outcome = record(list)
            .and_then(|()| {
                self.driver
                    .command_list_close(list)
                    .lz_context("zeCommandListClose")
            })
            .and_then(|()| {
                self.driver
                    .command_queue_execute_command_lists(inner.handle, &[list], Some(fence))
                    .lz_context("zeCommandQueueExecuteCommandLists")
            });

        match outcome {
            Ok(()) => {
                let submission = Submission {
                    list,
                    fence,
                    waited_on,
                    done: false,
                };
                inner.in_flight.push_back(submission);
                inner.state = QueueState::Submitted;
                self.submissions.fetch_add(1, Ordering::Relaxed);
                Ok(submission)
            }
            Err(e) => {
                self.recycle(&mut inner, list, fence);
                inner.state = previous;
                Err(e)
            }
        }
    }

    /// Block on one submission's fence without holding the queue lock
    fn wait(&self, submission: Submission) -> Result<()> {
        let status = self
            .driver
            .fence_host_synchronize(submission.fence, WAIT_INFINITE);
        let mut inner = self.inner.lock();
        if let Some(entry) = inner
            .in_flight
            .iter_mut()
            .find(|s| s.fence == submission.fence)
        {
            entry.waited_on = false;
        }
        self.retire(&mut inner);
        drop(inner);
        lz_process(status, "zeFenceHostSynchronize")
    }

    fn validate_geometry(&self, item: &ExecItem) -> Result<()> {
        let props = self.device.properties();
        let (grid, block) = (item.grid.as_array(), item.block.as_array());
        if grid.contains(&0) || block.contains(&0) {
            return Err(Error::invalid_configuration(format!(
                "zero extent in grid {} or block {}",
                item.grid, item.block
            )));
        }
        if item.block.volume() > u64::from(props.max_threads_per_block) {
            return Err(Error::invalid_configuration(format!(
                "block {} exceeds {} threads",
                item.block, props.max_threads_per_block
            )));
        }
        for axis in 0..3 {
            if block[axis] > props.max_block_dims[axis] {
                return Err(Error::invalid_configuration(format!(
                    "block {} exceeds per-dimension limit {:?}",
                    item.block, props.max_block_dims
                )));
            }
            if grid[axis] > props.max_grid_dims[axis] {
                return Err(Error::invalid_configuration(format!(
                    "grid {} exceeds per-dimension limit {:?}",
                    item.grid, props.max_grid_dims
                )));
            }
        }
        if item.shared_mem > props.shared_mem_per_block as usize {
            return Err(Error::invalid_configuration(format!(
                "{} bytes of shared memory exceed the {} byte limit",
                item.shared_mem, props.shared_mem_per_block
            )));
        }
        Ok(())
    }

    /// Enqueue a kernel launch; returns without waiting
    pub fn launch(&self, item: &ExecItem) -> Result<()> {
        let kernel = &item.kernel;
        if kernel.device() != self.device.handle() {
            return Err(Error::IncompatibleDevice {
                kernel: kernel.name().to_string(),
                kernel_device: kernel.device(),
                queue_device: self.device.handle(),
            });
        }
        self.validate_geometry(item)?;

        let info = kernel.function_info();
        if info.has_image_params() {
            return Err(Error::unimplemented(format!(
                "image and sampler arguments of kernel '{}'",
                kernel.name()
            )));
        }
        if item.args.len() < info.packed_size() {
            return Err(Error::invalid_value(format!(
                "kernel '{}' takes {} bytes of arguments, got {}",
                kernel.name(),
                info.packed_size(),
                item.args.len()
            )));
        }

        let _guard = kernel.lock_launch();
        self.submit(false, |list| {
            self.driver
                .kernel_set_group_size(kernel.handle(), item.block.into())
                .lz_context("zeKernelSetGroupSize")?;
            for (index, param) in info.params().iter().enumerate() {
                let set = match param.kind {
                    ParamKind::LocalMemory => self.driver.kernel_set_argument_value(
                        kernel.handle(),
                        index as u32,
                        item.shared_mem,
                        None,
                    ),
                    _ => self.driver.kernel_set_argument_value(
                        kernel.handle(),
                        index as u32,
                        param.size,
                        Some(&item.args[param.offset..param.offset + param.size]),
                    ),
                };
                set.lz_context("zeKernelSetArgumentValue")?;
            }
            self.driver
                .command_list_append_launch_kernel(list, kernel.handle(), item.grid.into())
                .lz_context("zeCommandListAppendLaunchKernel")
        })?;
        trace!(kernel = kernel.name(), grid = %item.grid, block = %item.block, "Launch submitted");
        Ok(())
    }

    /// Enqueue a copy; returns without waiting
    ///
    /// # Safety
    /// `src` must be readable and `dst` writable for `size` bytes until the
    /// copy has completed.
    pub unsafe fn mem_copy_async(&self, dst: *mut u8, src: *const u8, size: usize) -> Result<()> {
        self.submit(false, |list| {
            // SAFETY: forwarded from the caller.
            unsafe {
                self.driver
                    .command_list_append_memory_copy(list, dst, src, size)
            }
            .lz_context("zeCommandListAppendMemoryCopy")
        })
        .map(|_| ())
    }

    /// Copy and wait for completion, after all earlier work on this queue
    ///
    /// # Safety
    /// `src` must be readable and `dst` writable for `size` bytes.
    pub unsafe fn mem_copy(&self, dst: *mut u8, src: *const u8, size: usize) -> Result<()> {
        let submission = self.submit(true, |list| {
            // SAFETY: forwarded from the caller; the wait below outlives the copy.
            unsafe {
                self.driver
                    .command_list_append_memory_copy(list, dst, src, size)
            }
            .lz_context("zeCommandListAppendMemoryCopy")
        })?;
        self.wait(submission)
    }

    /// Enqueue a fill of `size` bytes with a repeated `pattern`
    ///
    /// # Safety
    /// `dst` must be writable for `size` bytes until the fill has completed.
    pub unsafe fn mem_fill_async(&self, dst: *mut u8, pattern: &[u8], size: usize) -> Result<()> {
        self.submit(false, |list| {
            // SAFETY: forwarded from the caller.
            unsafe {
                self.driver
                    .command_list_append_memory_fill(list, dst, pattern, size)
            }
            .lz_context("zeCommandListAppendMemoryFill")
        })
        .map(|_| ())
    }

    /// Fill and wait for completion
    ///
    /// # Safety
    /// `dst` must be writable for `size` bytes.
    pub unsafe fn mem_fill(&self, dst: *mut u8, pattern: &[u8], size: usize) -> Result<()> {
        let submission = self.submit(true, |list| {
            // SAFETY: forwarded from the caller.
            unsafe {
                self.driver
                    .command_list_append_memory_fill(list, dst, pattern, size)
            }
            .lz_context("zeCommandListAppendMemoryFill")
        })?;
        self.wait(submission)
    }

    /// Live native queue, or [`Error::Destroyed`]
    fn live_handle(&self) -> Result<CommandQueueHandle> {
        let inner = self.inner.lock();
        if inner.destroyed {
            return Err(Error::Destroyed("queue"));
        }
        Ok(inner.handle)
    }

    /// Block until every submission has completed
    ///
    /// Leaves the queue [`Idle`](QueueState::Idle). Submissions another
    /// thread is still blocked on in [`mem_copy`](Self::mem_copy) are
    /// complete at that point and are recycled by that thread.
    pub fn finish(&self) -> Result<()> {
        let handle = self.live_handle()?;
        let status = self.driver.command_queue_synchronize(handle, WAIT_INFINITE);
        self.retire(&mut self.inner.lock());
        lz_process(status, "zeCommandQueueSynchronize")
    }

    /// `true` if all submitted work has completed; never blocks
    pub fn query(&self) -> Result<bool> {
        let handle = self.live_handle()?;
        match self.driver.command_queue_synchronize(handle, 0) {
            ZeResult::NotReady => Ok(false),
            status => {
                self.retire(&mut self.inner.lock());
                lz_process(status, "zeCommandQueueSynchronize").map(|()| true)
            }
        }
    }

    /// Wait up to `timeout` for the queue to drain
    ///
    /// Returns `false` if work is still pending at the deadline. A timeout
    /// too large to represent waits without a deadline.
    pub fn finish_timeout(&self, timeout: Duration) -> Result<bool> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.finish().map(|()| true);
        };
        loop {
            if self.query()? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let slice = (deadline - now).min(POLL_SLICE);
            match self
                .driver
                .command_queue_synchronize(self.handle(), slice.as_nanos() as u64)
            {
                ZeResult::NotReady => {}
                status => {
                    self.retire(&mut self.inner.lock());
                    return lz_process(status, "zeCommandQueueSynchronize").map(|()| true);
                }
            }
        }
    }

    /// Drain the queue and release every native object it owns
    ///
    /// Continues past failures and returns the first one. Repeated calls
    /// are no-ops; other operations fail with [`Error::Destroyed`].
    pub fn destroy(&self) -> Result<()> {
        let handle = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return Ok(());
            }
            inner.destroyed = true;
            inner.handle
        };
        let status = self.driver.command_queue_synchronize(handle, WAIT_INFINITE);
        let mut first_error = lz_process(status, "zeCommandQueueSynchronize").err();

        let mut inner = self.inner.lock();
        if let Err(e) = self.release_native(&mut inner) {
            first_error.get_or_insert(e);
        }
        drop(inner);
        info!(
            queue = %handle,
            submissions = self.submission_count(),
            "Queue destroyed"
        );
        first_error.map_or(Ok(()), Err)
    }

    /// Replace a faulted native queue with a fresh one
    ///
    /// Every pooled and in-flight command list and fence is destroyed along
    /// with the old queue. If the new queue cannot be created the queue is
    /// left destroyed.
    pub(crate) fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return Err(Error::Destroyed("queue"));
        }
        let old = inner.handle;
        if let Err(e) = self.release_native(&mut inner) {
            warn!(queue = %old, error = %e, "Faulted queue not fully released");
        }
        match create_native(self.driver.as_ref(), &self.context, &self.device) {
            Ok(handle) => {
                inner.handle = handle;
                info!(old = %old, queue = %handle, "Queue reset");
                Ok(())
            }
            Err(e) => {
                inner.destroyed = true;
                Err(e)
            }
        }
    }

    /// Destroy every list, fence and the native queue; returns the first error
    fn release_native(&self, inner: &mut QueueInner) -> Result<()> {
        let mut first_error = None;
        let mut lists = std::mem::take(&mut inner.free_lists);
        let mut fences = std::mem::take(&mut inner.free_fences);
        for submission in inner.in_flight.drain(..) {
            lists.push(submission.list);
            fences.push(submission.fence);
        }
        inner.state = QueueState::Idle;

        for list in lists {
            if let Err(e) = self
                .driver
                .command_list_destroy(list)
                .lz_context("zeCommandListDestroy")
            {
                first_error.get_or_insert(e);
            }
        }
        for fence in fences {
            if let Err(e) = self.driver.fence_destroy(fence).lz_context("zeFenceDestroy") {
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self
            .driver
            .command_queue_destroy(inner.handle)
            .lz_context("zeCommandQueueDestroy")
        {
            first_error.get_or_insert(e);
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn create_native(
    driver: &dyn ZeDriver,
    context: &Level0Context,
    device: &Level0Device,
) -> Result<CommandQueueHandle> {
    let desc = CommandQueueDesc {
        mode: CommandQueueMode::Asynchronous,
        ..CommandQueueDesc::default()
    };
    let handle = driver
        .command_queue_create(context.handle(), device.handle(), &desc)
        .lz_context("zeCommandQueueCreate")?;
    debug!(queue = %handle, device = %device.handle(), "Queue created");
    Ok(handle)
}

impl Drop for Level0Queue {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            warn!(queue = %self.handle(), error = %e, "Queue dropped with teardown errors");
        }
    }
}

impl std::fmt::Debug for Level0Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Level0Queue")
            .field("handle", &inner.handle)
            .field("device", &self.device.handle())
            .field("state", &inner.state)
            .field("in_flight", &inner.in_flight.len())
            .finish()
    }
}
