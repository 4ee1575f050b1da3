use {
    parking_lot::Mutex,
    std::{
        mem,
        sync::Arc,
        task::{Wake, Waker},
        thread::Thread,
    },
};

/// The ids of tasks that have been woken since the last dispatch.
pub(super) struct ReadyQueue {
    ids: Mutex<Vec<u64>>,
    thread: Thread,
}

impl ReadyQueue {
    pub(super) fn new(thread: Thread) -> Self {
        Self {
            ids: Mutex::new(vec![]),
            thread,
        }
    }

    pub(super) fn push(&self, id: u64) {
        {
            let mut ids = self.ids.lock();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        self.thread.unpark();
    }

    pub(super) fn take(&self) -> Vec<u64> {
        mem::take(&mut *self.ids.lock())
    }

    pub(super) fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }

    pub(super) fn waker(self: &Arc<Self>, id: u64) -> Waker {
        Waker::from(Arc::new(TaskWaker {
            id,
            queue: self.clone(),
        }))
    }
}

struct TaskWaker {
    id: u64,
    queue: Arc<ReadyQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.queue.push(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.queue.push(self.id);
    }
}
