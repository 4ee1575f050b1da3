use {
    crate::async_engine::ae_queue::ReadyQueue,
    ahash::AHashMap,
    std::{
        cell::{Cell, RefCell},
        future::Future,
        mem,
        pin::Pin,
        rc::{Rc, Weak},
        sync::Arc,
        task::{Context, Poll, Waker},
    },
};

type BoxedTask = Pin<Box<dyn Future<Output = ()>>>;

#[derive(Default)]
pub(super) struct TaskMap {
    tasks: RefCell<AHashMap<u64, Rc<Task>>>,
}

impl TaskMap {
    pub(super) fn insert(&self, id: u64, task: Rc<Task>) {
        self.tasks.borrow_mut().insert(id, task);
    }

    pub(super) fn get(&self, id: u64) -> Option<Rc<Task>> {
        self.tasks.borrow().get(&id).cloned()
    }

    fn contains(&self, id: u64) -> bool {
        self.tasks.borrow().contains_key(&id)
    }

    fn remove(&self, id: u64) {
        // Dropping the task can drop the handles of other tasks which re-enter
        // this map.
        let task = self.tasks.borrow_mut().remove(&id);
        drop(task);
    }

    pub(super) fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub(super) fn clear(&self) {
        let tasks = mem::take(&mut *self.tasks.borrow_mut());
        drop(tasks);
    }
}

pub(super) struct Task {
    id: u64,
    future: RefCell<Option<BoxedTask>>,
}

struct SpawnSlot<T> {
    result: Cell<Option<T>>,
    waker: Cell<Option<Waker>>,
}

impl Task {
    pub(super) fn new<T: 'static, F: Future<Output = T> + 'static>(
        id: u64,
        tasks: &Rc<TaskMap>,
        f: F,
    ) -> (Rc<Task>, SpawnedFuture<T>) {
        let slot = Rc::new(SpawnSlot {
            result: Cell::new(None),
            waker: Cell::new(None),
        });
        let future = {
            let slot = slot.clone();
            async move {
                let res = f.await;
                slot.result.set(Some(res));
                if let Some(waker) = slot.waker.take() {
                    waker.wake();
                }
            }
        };
        let task = Rc::new(Task {
            id,
            future: RefCell::new(Some(Box::pin(future))),
        });
        let handle = SpawnedFuture {
            id,
            slot,
            tasks: Rc::downgrade(tasks),
        };
        (task, handle)
    }

    pub(super) fn detached<F: Future<Output = ()> + 'static>(id: u64, f: F) -> Rc<Task> {
        Rc::new(Task {
            id,
            future: RefCell::new(Some(Box::pin(f))),
        })
    }

    pub(super) fn run(&self, tasks: &TaskMap, queue: &Arc<ReadyQueue>) {
        // The future is moved out while it is polled so that it can cancel
        // itself or other tasks without observing a borrowed cell.
        let Some(mut future) = self.future.borrow_mut().take() else {
            return;
        };
        let waker = queue.waker(self.id);
        let mut ctx = Context::from_waker(&waker);
        match future.as_mut().poll(&mut ctx) {
            Poll::Ready(()) => {
                drop(future);
                tasks.remove(self.id);
            }
            Poll::Pending => {
                if tasks.contains(self.id) {
                    *self.future.borrow_mut() = Some(future);
                }
            }
        }
    }
}

/// The handle of a spawned task. Dropping it cancels the task.
#[must_use]
pub struct SpawnedFuture<T: 'static> {
    id: u64,
    slot: Rc<SpawnSlot<T>>,
    tasks: Weak<TaskMap>,
}

impl<T> Future for SpawnedFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(res) = self.slot.result.take() {
            Poll::Ready(res)
        } else {
            self.slot.waker.set(Some(cx.waker().clone()));
            Poll::Pending
        }
    }
}

impl<T> Drop for SpawnedFuture<T> {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.upgrade() {
            tasks.remove(self.id);
        }
    }
}
