//! A single-threaded cooperative executor.
//!
//! Every top-level wait creates its own engine. Tasks are polled on the thread
//! that created the engine; their wakers are thread-safe and unpark that thread
//! so that connections driven by other threads can resume them.

mod ae_queue;
mod ae_task;
mod ae_timeout;

pub use {ae_task::SpawnedFuture, ae_timeout::Timeout};
use {
    crate::utils::numcell::NumCell,
    ae_queue::ReadyQueue,
    ae_task::{Task, TaskMap},
    ae_timeout::Timers,
    std::{
        cell::RefCell,
        future::Future,
        rc::Rc,
        sync::Arc,
        thread,
        time::{Duration, Instant},
    },
};

thread_local! {
    static THREAD_DEFAULT: RefCell<Vec<Rc<AsyncEngine>>> = const { RefCell::new(Vec::new()) };
}

pub struct AsyncEngine {
    queue: Arc<ReadyQueue>,
    tasks: Rc<TaskMap>,
    timers: Rc<Timers>,
    next_task: NumCell<u64>,
}

impl AsyncEngine {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            queue: Arc::new(ReadyQueue::new(thread::current())),
            tasks: Default::default(),
            timers: Default::default(),
            next_task: NumCell::new(1),
        })
    }

    /// The engine that is currently running on this thread, if any.
    pub fn thread_default() -> Option<Rc<AsyncEngine>> {
        THREAD_DEFAULT.with(|s| s.borrow().last().cloned())
    }

    /// Makes this engine the thread-default engine until the guard is dropped.
    pub fn push_thread_default(self: &Rc<Self>) -> ThreadDefaultGuard {
        THREAD_DEFAULT.with(|s| s.borrow_mut().push(self.clone()));
        ThreadDefaultGuard { _priv: () }
    }

    pub fn spawn<T: 'static, F: Future<Output = T> + 'static>(&self, f: F) -> SpawnedFuture<T> {
        let id = self.next_task.fetch_add(1);
        let (task, future) = Task::new(id, &self.tasks, f);
        self.tasks.insert(id, task);
        self.queue.push(id);
        future
    }

    /// Spawns a task without a handle. The task runs until it completes or
    /// until the engine is cleared.
    pub fn spawn_detached<F: Future<Output = ()> + 'static>(&self, f: F) {
        let id = self.next_task.fetch_add(1);
        self.tasks.insert(id, Task::detached(id, f));
        self.queue.push(id);
    }

    pub fn timeout(&self, ms: u64) -> Timeout {
        self.timeout_at(Instant::now() + Duration::from_millis(ms))
    }

    pub fn timeout_at(&self, deadline: Instant) -> Timeout {
        self.timers.add(deadline)
    }

    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn num_timers(&self) -> usize {
        self.timers.len()
    }

    /// Polls every task that has been woken. Returns whether any task ran.
    pub fn dispatch(&self) -> bool {
        let mut ran = false;
        loop {
            let ids = self.queue.take();
            if ids.is_empty() {
                break;
            }
            for id in ids {
                if let Some(task) = self.tasks.get(id) {
                    ran = true;
                    task.run(&self.tasks, &self.queue);
                }
            }
        }
        ran
    }

    /// Runs one iteration of the loop: expires timers and runs ready tasks.
    /// If there was nothing to do, parks the thread until the next timer, a
    /// waker or `deadline`, whichever comes first.
    pub fn iterate(&self, deadline: Option<Instant>) {
        self.timers.expire(Instant::now());
        if self.dispatch() {
            return;
        }
        let next = match (self.timers.next_deadline(), deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if self.queue.is_empty() {
            match next {
                Some(next) => {
                    let now = Instant::now();
                    if next > now {
                        thread::park_timeout(next - now);
                    }
                }
                None => thread::park(),
            }
        }
    }

    /// Drops every task and timer. Tasks are cancelled without being polled
    /// again.
    pub fn clear(&self) {
        self.tasks.clear();
        self.timers.clear();
        self.queue.take();
    }
}

impl Drop for AsyncEngine {
    fn drop(&mut self) {
        self.clear();
    }
}

#[must_use]
pub struct ThreadDefaultGuard {
    _priv: (),
}

impl Drop for ThreadDefaultGuard {
    fn drop(&mut self) {
        THREAD_DEFAULT.with(|s| s.borrow_mut().pop());
    }
}
