//! Task pool for parallel-for work during octree construction
//!
//! Work is submitted as *task groups*: a closure plus a slice count. Workers
//! pull slices from a shared FIFO. Submitters either block in
//! [`TaskGroup::wait`] or drain the queue themselves with
//! [`ThreadPool::yield_until`] so a worker submitting nested work cannot
//! deadlock the pool.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::core::error::Error;
use crate::core::types::Result;

/// Slice function: (slice index, slice count, worker id)
pub type TaskFunc = dyn Fn(u32, u32, u32) + Send + Sync + 'static;

/// Raw pointer wrapper for pool tasks writing disjoint regions of a shared
/// buffer. The caller is responsible for keeping the slices disjoint.
#[derive(Clone, Copy)]
pub(crate) struct SharedMut<T>(pub *mut T);

unsafe impl<T> Send for SharedMut<T> {}
unsafe impl<T> Sync for SharedMut<T> {}

/// A parallel-for submission tracked from enqueue to completion
pub struct TaskGroup {
    func: Box<TaskFunc>,
    num_sub_tasks: u32,
    started: AtomicU32,
    finished: AtomicU32,
    aborting: AtomicBool,
    state: Mutex<GroupState>,
    done_cond: Condvar,
}

#[derive(Default)]
struct GroupState {
    done: bool,
    panic_message: Option<String>,
}

impl TaskGroup {
    fn new(func: Box<TaskFunc>, num_sub_tasks: u32) -> Self {
        Self {
            func,
            num_sub_tasks,
            started: AtomicU32::new(0),
            finished: AtomicU32::new(0),
            aborting: AtomicBool::new(false),
            state: Mutex::new(GroupState::default()),
            done_cond: Condvar::new(),
        }
    }

    /// Run one slice, capturing panics so they resurface in `wait()`
    fn run(&self, sub_task: u32, thread_id: u32) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            (self.func)(sub_task, self.num_sub_tasks, thread_id)
        }));
        if let Err(payload) = result {
            let mut state = self.state.lock().unwrap();
            state.panic_message.get_or_insert(panic_message(&payload));
        }

        let finished = self.finished.fetch_add(1, Ordering::AcqRel) + 1;
        let started = self.started.load(Ordering::Acquire);
        if finished == self.num_sub_tasks || (self.aborting.load(Ordering::Acquire) && finished == started) {
            self.finish();
        }
    }

    fn finish(&self) {
        let mut state = self.state.lock().unwrap();
        state.done = true;
        self.done_cond.notify_all();
    }

    /// Mark the group done if no dispatched slice is still in flight
    fn finish_if_idle(&self) {
        if self.started.load(Ordering::Acquire) == self.finished.load(Ordering::Acquire) {
            self.finish();
        }
    }

    /// Whether every slice has completed (or the group was aborted)
    pub fn is_done(&self) -> bool {
        self.state.lock().unwrap().done
    }

    /// Skip all slices that have not started yet; in-flight slices finish
    pub fn abort(&self) {
        self.aborting.store(true, Ordering::Release);
        self.finish_if_idle();
    }

    /// Whether `abort` has been requested
    pub fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::Acquire)
    }

    /// Number of slices that actually ran to completion
    pub fn finished_count(&self) -> u32 {
        self.finished.load(Ordering::Acquire)
    }

    /// Block until the group completes. A panic from any slice is rethrown
    /// here as [`Error::TaskPanic`].
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        while !state.done {
            state = self.done_cond.wait(state).unwrap();
        }
        match state.panic_message.take() {
            Some(message) => Err(Error::TaskPanic(message)),
            None => Ok(()),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

struct PoolShared {
    queue: Mutex<VecDeque<Arc<TaskGroup>>>,
    work_cond: Condvar,
    terminate: AtomicBool,
}

/// Fixed-size worker pool draining task groups from a FIFO
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
    thread_count: u32,
}

impl ThreadPool {
    /// Spawn `thread_count` workers. A pool with zero workers is legal; all
    /// work then runs on threads calling [`ThreadPool::yield_until`].
    pub fn new(thread_count: u32) -> Self {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            work_cond: Condvar::new(),
            terminate: AtomicBool::new(false),
        });

        let workers = (0..thread_count)
            .map(|thread_id| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || Self::run_worker(&shared, thread_id))
            })
            .collect();

        Self {
            shared,
            workers,
            thread_count,
        }
    }

    pub fn thread_count(&self) -> u32 {
        self.thread_count
    }

    fn run_worker(shared: &PoolShared, thread_id: u32) {
        while !shared.terminate.load(Ordering::Acquire) {
            if let Some((group, sub_task)) = Self::acquire_task(shared, true) {
                group.run(sub_task, thread_id);
            }
        }
    }

    /// Pop the next undispatched slice. Fully dispatched and aborted groups
    /// are dropped from the queue as a side effect.
    fn acquire_task(shared: &PoolShared, block: bool) -> Option<(Arc<TaskGroup>, u32)> {
        let mut queue = shared.queue.lock().unwrap();
        loop {
            while let Some(front) = queue.front().cloned() {
                if front.is_aborting() {
                    queue.pop_front();
                    front.finish_if_idle();
                    continue;
                }

                let sub_task = front.started.fetch_add(1, Ordering::AcqRel);
                if sub_task + 1 >= front.num_sub_tasks {
                    queue.pop_front();
                }
                return Some((front, sub_task));
            }

            if !block || shared.terminate.load(Ordering::Acquire) {
                return None;
            }
            queue = shared.work_cond.wait(queue).unwrap();
        }
    }

    /// Submit a task group with `num_sub_tasks` slices
    pub fn enqueue<F>(&self, num_sub_tasks: u32, func: F) -> Arc<TaskGroup>
    where
        F: Fn(u32, u32, u32) + Send + Sync + 'static,
    {
        self.enqueue_boxed(Box::new(func), num_sub_tasks)
    }

    fn enqueue_boxed(&self, func: Box<TaskFunc>, num_sub_tasks: u32) -> Arc<TaskGroup> {
        let group = Arc::new(TaskGroup::new(func, num_sub_tasks));
        if num_sub_tasks == 0 {
            group.finish();
            return group;
        }

        let mut queue = self.shared.queue.lock().unwrap();
        queue.push_back(Arc::clone(&group));
        drop(queue);
        self.shared.work_cond.notify_all();

        group
    }

    /// Wait for `group`, executing queued slices on the calling thread while
    /// it is not done. Callers that are themselves pool workers must use this
    /// instead of [`TaskGroup::wait`].
    pub fn yield_until(&self, group: &TaskGroup) -> Result<()> {
        while !group.is_done() {
            match Self::acquire_task(&self.shared, false) {
                // The submitter is an extra lane beyond the worker ids
                Some((task, sub_task)) => task.run(sub_task, self.thread_count),
                None => break,
            }
        }
        group.wait()
    }

    /// Run `func` once per slice and block until every slice has completed.
    /// The closure may borrow from the caller's frame: the group is fully
    /// drained before this returns, so the borrow cannot escape.
    pub fn parallel_for<'scope, F>(&self, num_sub_tasks: u32, func: F) -> Result<()>
    where
        F: Fn(u32, u32, u32) + Send + Sync + 'scope,
    {
        let boxed: Box<dyn Fn(u32, u32, u32) + Send + Sync + 'scope> = Box::new(func);
        // SAFETY: every slice finishes inside yield_until below, and the
        // group handle never leaves this frame.
        let boxed: Box<TaskFunc> = unsafe { std::mem::transmute(boxed) };
        let group = self.enqueue_boxed(boxed, num_sub_tasks);
        self.yield_until(&group)
    }

    /// Stop accepting work and join all workers
    pub fn stop(&mut self) {
        self.shared.terminate.store(true, Ordering::Release);
        self.shared.work_cond.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn test_parallel_for_runs_every_slice() {
        let pool = ThreadPool::new(4);
        let hits = Arc::new(Mutex::new(vec![0u32; 64]));

        let hits_ref = Arc::clone(&hits);
        pool.parallel_for(64, move |slice, count, _thread| {
            assert_eq!(count, 64);
            hits_ref.lock().unwrap()[slice as usize] += 1;
        })
        .unwrap();

        assert!(hits.lock().unwrap().iter().all(|&h| h == 1));
    }

    #[test]
    fn test_panic_surfaces_in_wait() {
        let pool = ThreadPool::new(2);
        let group = pool.enqueue(8, |slice, _count, _thread| {
            if slice == 3 {
                panic!("slice exploded");
            }
        });

        match group.wait() {
            Err(Error::TaskPanic(message)) => assert!(message.contains("slice exploded")),
            other => panic!("expected TaskPanic, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_yield_runs_work_without_workers() {
        // Zero workers: the submitting thread must execute all slices itself
        let pool = ThreadPool::new(0);
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_ref = Arc::clone(&counter);
        let group = pool.enqueue(16, move |_slice, _count, _thread| {
            counter_ref.fetch_add(1, Ordering::SeqCst);
        });
        pool.yield_until(&group).unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn test_abort_skips_unstarted_slices() {
        // One worker kept busy by a gated task, so the second group cannot
        // start before it is aborted.
        let pool = ThreadPool::new(1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();

        let gate_rx = Mutex::new(gate_rx);
        let blocker = pool.enqueue(1, move |_slice, _count, _thread| {
            gate_rx.lock().unwrap().recv().unwrap();
        });

        let aborted = pool.enqueue(100, |_slice, _count, _thread| {});
        aborted.abort();
        gate_tx.send(()).unwrap();

        blocker.wait().unwrap();
        aborted.wait().unwrap();
        assert_eq!(aborted.finished_count(), 0);
    }
}
