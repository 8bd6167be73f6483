//! Worker pools.
//!
//! Two shapes, for two kinds of work:
//!
//! - [`EventLoopPool`]: N independent event loops, each bound 1:1 to a worker
//!   thread, handed out round-robin so connections spread across threads. A
//!   connection stays on the loop that adopted it for its whole lifetime.
//! - [`TaskPool`]: the inverse shape, one shared job queue drained by N
//!   threads. For work that is not pinned to any connection, typically
//!   handler work too slow for the single dispatch thread.
//!
//! Both are explicitly constructed, explicitly owned services: built once at
//! process start, shut down once at process end, passed around by handle.

use crate::dispatch::DispatchHandle;
use crate::runtime::event_loop::{ContextHandle, EventLoop};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Pool of single-threaded event loops with round-robin assignment.
pub struct EventLoopPool {
    contexts: Vec<ContextHandle>,
    threads: Vec<JoinHandle<()>>,
    next: AtomicUsize,
}

impl EventLoopPool {
    /// Start `size` event loops (0 = available parallelism), each on its own
    /// named worker thread. Threads live exactly as long as the pool.
    pub fn new(size: usize, dispatch: DispatchHandle, max_body_len: usize) -> io::Result<Self> {
        let size = if size == 0 {
            default_parallelism()
        } else {
            size
        };

        let mut contexts = Vec::with_capacity(size);
        let mut threads = Vec::with_capacity(size);

        for index in 0..size {
            let (event_loop, handle) = EventLoop::new(index, dispatch.clone(), max_body_len)?;
            let thread = thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || event_loop.run())?;
            contexts.push(handle);
            threads.push(thread);
        }

        info!(workers = size, "Event loop pool started");
        Ok(Self {
            contexts,
            threads,
            next: AtomicUsize::new(0),
        })
    }

    /// Number of event loops in the pool.
    pub fn size(&self) -> usize {
        self.contexts.len()
    }

    /// Next context in rotation: 0, 1, ..., N-1, 0, 1, ...
    ///
    /// The cursor is a monotonically increasing atomic, so acquisition is
    /// safe from any thread.
    pub fn acquire(&self) -> &ContextHandle {
        let next = self.next.fetch_add(1, Ordering::Relaxed);
        &self.contexts[next % self.contexts.len()]
    }

    /// Stop every event loop and join every worker thread.
    ///
    /// Does not return until all threads have exited. Idempotent: the join
    /// handles are drained on the first call, later calls are no-ops. After
    /// shutdown, registering with any of the pool's contexts fails.
    pub fn shutdown(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        for ctx in &self.contexts {
            ctx.stop();
        }
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                error!("Worker thread panicked");
            }
        }
        info!("Event loop pool stopped");
    }
}

impl Drop for EventLoopPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct TaskState {
    jobs: VecDeque<Job>,
    stopping: bool,
}

struct TaskShared {
    state: Mutex<TaskState>,
    ready: Condvar,
}

/// Cloneable submission handle for the task pool.
#[derive(Clone)]
pub struct TaskPoolHandle {
    shared: Arc<TaskShared>,
}

impl TaskPoolHandle {
    /// Enqueue a job and wake one pool thread.
    ///
    /// Jobs submitted after shutdown began are dropped.
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock();
            if state.stopping {
                debug!("Task pool stopping, job dropped");
                return;
            }
            state.jobs.push_back(Box::new(job));
        }
        self.shared.ready.notify_one();
    }
}

/// Fixed-size pool of threads draining one shared job queue.
pub struct TaskPool {
    shared: Arc<TaskShared>,
    threads: Vec<JoinHandle<()>>,
}

impl TaskPool {
    /// Start `size` task threads (0 = available parallelism).
    pub fn new(size: usize) -> io::Result<Self> {
        let size = if size == 0 {
            default_parallelism()
        } else {
            size
        };

        let shared = Arc::new(TaskShared {
            state: Mutex::new(TaskState {
                jobs: VecDeque::new(),
                stopping: false,
            }),
            ready: Condvar::new(),
        });

        let mut threads = Vec::with_capacity(size);
        for index in 0..size {
            let thread = thread::Builder::new().name(format!("task-{index}")).spawn({
                let shared = Arc::clone(&shared);
                move || task_loop(shared, index)
            })?;
            threads.push(thread);
        }

        info!(threads = size, "Task pool started");
        Ok(Self { shared, threads })
    }

    /// Get a submission handle.
    pub fn handle(&self) -> TaskPoolHandle {
        TaskPoolHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Stop all threads and join them. The thread finishing its current job
    /// exits without picking up another; jobs still queued are discarded.
    /// Idempotent.
    pub fn shutdown(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        {
            self.shared.state.lock().stopping = true;
        }
        self.shared.ready.notify_all();
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                error!("Task thread panicked");
            }
        }
        info!("Task pool stopped");
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn task_loop(shared: Arc<TaskShared>, index: usize) {
    debug!(task = index, "Task thread started");
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if state.stopping {
                    debug!(task = index, "Task thread stopped");
                    return;
                }
                if let Some(job) = state.jobs.pop_front() {
                    break job;
                }
                shared.ready.wait(&mut state);
            }
        };
        job();
    }
}

fn default_parallelism() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchQueue;
    use crate::registry::CallbackRegistry;
    use crate::runtime::ConnHandle;
    use std::sync::mpsc;
    use std::time::Duration;

    fn test_pool(size: usize) -> (EventLoopPool, DispatchQueue) {
        let dispatch = DispatchQueue::start(CallbackRegistry::new()).unwrap();
        let pool = EventLoopPool::new(size, dispatch.handle(), 1024).unwrap();
        (pool, dispatch)
    }

    #[test]
    fn test_acquire_rotates_round_robin() {
        let (mut pool, mut dispatch) = test_pool(3);

        let order: Vec<usize> = (0..7).map(|_| pool.acquire().index()).collect();
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2, 0]);

        pool.shutdown();
        dispatch.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (mut pool, mut dispatch) = test_pool(2);
        pool.shutdown();
        pool.shutdown();
        dispatch.shutdown();
    }

    #[test]
    fn test_no_scheduling_after_shutdown() {
        let (mut pool, mut dispatch) = test_pool(2);
        let ctx = pool.acquire().clone();
        pool.shutdown();

        let conn = ConnHandle::stub(1, ctx);
        match conn.send(1, b"nope") {
            Err(crate::runtime::SendError::Closed) => {}
            other => panic!("unexpected: {other:?}"),
        }
        dispatch.shutdown();
    }

    #[test]
    fn test_task_pool_runs_jobs() {
        let mut pool = TaskPool::new(2).unwrap();
        let handle = pool.handle();

        let (tx, rx) = mpsc::channel();
        for i in 0..4 {
            let tx = tx.clone();
            handle.spawn(move || {
                tx.send(i).expect("receiver alive");
            });
        }

        let mut received: Vec<i32> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("job ran"))
            .collect();
        received.sort_unstable();
        assert_eq!(received, vec![0, 1, 2, 3]);

        pool.shutdown();
    }

    #[test]
    fn test_task_pool_drops_jobs_after_shutdown() {
        let mut pool = TaskPool::new(1).unwrap();
        let handle = pool.handle();
        pool.shutdown();

        let (tx, rx) = mpsc::channel::<()>();
        handle.spawn(move || {
            tx.send(()).expect("receiver alive");
        });
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
