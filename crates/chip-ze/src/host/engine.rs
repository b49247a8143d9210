//! Command execution for the host driver
//!
//! Each command queue owns one worker thread that drains submitted jobs in
//! FIFO order, so completion order equals submission order. Kernel dispatches
//! run their work-groups data-parallel on the rayon pool. A panicking kernel
//! marks the queue lost; every later wait on it reports `ERROR_DEVICE_LOST`.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;
use tracing::{error, trace};

use super::kernel::{HostKernelFn, KernelArgs, WorkGroup};
use crate::driver::WAIT_INFINITE;
use crate::result::ZeResult;
use crate::types::{GroupCount, GroupSize};

/// A recorded command
#[derive(Clone)]
pub(crate) enum Command {
    Copy {
        dst: usize,
        src: usize,
        size: usize,
    },
    Fill {
        dst: usize,
        pattern: Vec<u8>,
        size: usize,
    },
    Launch(Launch),
    Barrier,
}

/// A kernel dispatch with its arguments captured at record time
#[derive(Clone)]
pub(crate) struct Launch {
    pub kernel: String,
    pub func: Arc<HostKernelFn>,
    pub group_size: GroupSize,
    pub group_count: GroupCount,
    pub args: Arc<KernelArgs>,
}

/// Counters shared by every queue of a driver
#[derive(Debug, Default)]
pub(crate) struct EngineStats {
    pub submissions: AtomicU64,
    pub immediate_commands: AtomicU64,
    pub kernel_launches: AtomicU64,
    pub copies: AtomicU64,
    pub fills: AtomicU64,
    pub bytes_copied: AtomicU64,
}

/// Run commands in order on the calling thread
///
/// Returns `false` if a command panicked.
pub(crate) fn execute(commands: &[Command], stats: &EngineStats) -> bool {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        for command in commands {
            run_one(command, stats);
        }
    }));
    if outcome.is_err() {
        error!("Command execution panicked; device marked lost");
    }
    outcome.is_ok()
}

fn run_one(command: &Command, stats: &EngineStats) {
    match command {
        Command::Copy { dst, src, size } => {
            if *size > 0 {
                // SAFETY: the appender promised both ranges stay valid until
                // execution; `copy` tolerates overlap.
                unsafe { std::ptr::copy(*src as *const u8, *dst as *mut u8, *size) };
            }
            stats.copies.fetch_add(1, Ordering::Relaxed);
            stats.bytes_copied.fetch_add(*size as u64, Ordering::Relaxed);
        }
        Command::Fill { dst, pattern, size } => {
            let mut offset = 0;
            while offset < *size {
                let n = pattern.len().min(size - offset);
                // SAFETY: `dst..dst + size` is writable per the appender's contract.
                unsafe {
                    std::ptr::copy_nonoverlapping(pattern.as_ptr(), (*dst + offset) as *mut u8, n)
                };
                offset += n;
            }
            stats.fills.fetch_add(1, Ordering::Relaxed);
        }
        Command::Launch(launch) => {
            trace!(
                kernel = launch.kernel.as_str(),
                groups = launch.group_count.volume(),
                "Dispatching host kernel"
            );
            let size = launch.group_size;
            let count = launch.group_count;
            (0..count.volume()).into_par_iter().for_each(|linear| {
                let group = WorkGroup::from_linear(linear, size, count);
                (launch.func)(&group, &launch.args);
            });
            stats.kernel_launches.fetch_add(1, Ordering::Relaxed);
        }
        Command::Barrier => {}
    }
}

fn deadline(timeout_ns: u64) -> Option<Instant> {
    if timeout_ns == WAIT_INFINITE {
        return None;
    }
    Instant::now().checked_add(Duration::from_nanos(timeout_ns))
}

#[derive(Debug, Default)]
struct FenceState {
    signaled: bool,
    lost: bool,
}

/// Host side of a native fence
#[derive(Debug, Default)]
pub(crate) struct HostFence {
    state: Mutex<FenceState>,
    cv: Condvar,
}

impl HostFence {
    fn signal(&self, lost: bool) {
        let mut state = self.state.lock();
        state.signaled = true;
        state.lost |= lost;
        self.cv.notify_all();
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.signaled = false;
        state.lost = false;
    }

    pub fn status(&self) -> ZeResult {
        let state = self.state.lock();
        Self::status_of(&state)
    }

    fn status_of(state: &FenceState) -> ZeResult {
        match (state.signaled, state.lost) {
            (_, true) => ZeResult::ErrorDeviceLost,
            (true, false) => ZeResult::Success,
            (false, false) => ZeResult::NotReady,
        }
    }

    pub fn wait(&self, timeout_ns: u64) -> ZeResult {
        let mut state = self.state.lock();
        if timeout_ns == 0 {
            return Self::status_of(&state);
        }
        let until = deadline(timeout_ns);
        while !state.signaled {
            match until {
                None => self.cv.wait(&mut state),
                Some(at) => {
                    if self.cv.wait_until(&mut state, at).timed_out() {
                        break;
                    }
                }
            }
        }
        Self::status_of(&state)
    }
}

struct Job {
    lists: Vec<Arc<Vec<Command>>>,
    fence: Option<Arc<HostFence>>,
}

#[derive(Default)]
struct QueueWork {
    jobs: VecDeque<Job>,
    running: bool,
    shutdown: bool,
    lost: bool,
}

impl QueueWork {
    fn is_idle(&self) -> bool {
        self.jobs.is_empty() && !self.running
    }
}

struct QueueShared {
    work: Mutex<QueueWork>,
    work_ready: Condvar,
    idle: Condvar,
    stats: Arc<EngineStats>,
}

/// Host side of a native command queue
pub(crate) struct HostQueue {
    shared: Arc<QueueShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HostQueue {
    pub fn spawn(label: String, stats: Arc<EngineStats>) -> std::io::Result<Self> {
        let shared = Arc::new(QueueShared {
            work: Mutex::new(QueueWork::default()),
            work_ready: Condvar::new(),
            idle: Condvar::new(),
            stats,
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(label)
            .spawn(move || Self::worker_loop(&worker_shared))?;
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn worker_loop(shared: &QueueShared) {
        loop {
            let job = {
                let mut work = shared.work.lock();
                while work.jobs.is_empty() && !work.shutdown {
                    shared.work_ready.wait(&mut work);
                }
                match work.jobs.pop_front() {
                    Some(job) => {
                        work.running = true;
                        job
                    }
                    None => break,
                }
            };

            let lost = shared.work.lock().lost;
            let mut ok = !lost;
            if ok {
                for list in &job.lists {
                    if !execute(list, &shared.stats) {
                        ok = false;
                        break;
                    }
                }
            }
            if let Some(fence) = &job.fence {
                fence.signal(!ok);
            }

            let mut work = shared.work.lock();
            work.running = false;
            work.lost |= !ok;
            if work.is_idle() {
                shared.idle.notify_all();
            }
        }
    }

    pub fn submit(&self, lists: Vec<Arc<Vec<Command>>>, fence: Option<Arc<HostFence>>) -> ZeResult {
        let mut work = self.shared.work.lock();
        if work.lost {
            return ZeResult::ErrorDeviceLost;
        }
        work.jobs.push_back(Job { lists, fence });
        self.shared.work_ready.notify_one();
        ZeResult::Success
    }

    pub fn synchronize(&self, timeout_ns: u64) -> ZeResult {
        let mut work = self.shared.work.lock();
        if timeout_ns != 0 {
            let until = deadline(timeout_ns);
            while !work.is_idle() {
                match until {
                    None => self.shared.idle.wait(&mut work),
                    Some(at) => {
                        if self.shared.idle.wait_until(&mut work, at).timed_out() {
                            break;
                        }
                    }
                }
            }
        }
        match (work.is_idle(), work.lost) {
            (_, true) => ZeResult::ErrorDeviceLost,
            (true, false) => ZeResult::Success,
            (false, false) => ZeResult::NotReady,
        }
    }
}

impl Drop for HostQueue {
    fn drop(&mut self) {
        {
            let mut work = self.shared.work.lock();
            work.shutdown = true;
            self.shared.work_ready.notify_all();
        }
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}
