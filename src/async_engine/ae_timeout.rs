use {
    crate::utils::numcell::NumCell,
    ahash::AHashMap,
    std::{
        cell::{Cell, RefCell},
        cmp::Reverse,
        collections::BinaryHeap,
        future::Future,
        mem,
        pin::Pin,
        rc::{Rc, Weak},
        task::{Context, Poll, Waker},
        time::Instant,
    },
};

#[derive(Default)]
pub(super) struct Timers {
    next_id: NumCell<u64>,
    expirations: RefCell<BinaryHeap<Reverse<(Instant, u64)>>>,
    pending: RefCell<AHashMap<u64, Rc<TimeoutData>>>,
}

struct TimeoutData {
    expired: Cell<bool>,
    waker: Cell<Option<Waker>>,
}

impl Timers {
    pub(super) fn add(self: &Rc<Self>, deadline: Instant) -> Timeout {
        let id = self.next_id.fetch_add(1);
        let data = Rc::new(TimeoutData {
            expired: Cell::new(false),
            waker: Cell::new(None),
        });
        self.pending.borrow_mut().insert(id, data.clone());
        self.expirations.borrow_mut().push(Reverse((deadline, id)));
        Timeout {
            id,
            timers: Rc::downgrade(self),
            data,
        }
    }

    /// Completes every timeout whose deadline is not after `now`.
    pub(super) fn expire(&self, now: Instant) {
        loop {
            let id = {
                let mut expirations = self.expirations.borrow_mut();
                let (deadline, id) = match expirations.peek() {
                    Some(Reverse(entry)) => *entry,
                    None => break,
                };
                if deadline > now {
                    break;
                }
                expirations.pop();
                id
            };
            let data = self.pending.borrow_mut().remove(&id);
            if let Some(data) = data {
                data.expired.set(true);
                if let Some(waker) = data.waker.take() {
                    waker.wake();
                }
            }
        }
    }

    pub(super) fn next_deadline(&self) -> Option<Instant> {
        let mut expirations = self.expirations.borrow_mut();
        let pending = self.pending.borrow();
        loop {
            let (deadline, id) = match expirations.peek() {
                Some(Reverse(entry)) => *entry,
                None => return None,
            };
            if pending.contains_key(&id) {
                return Some(deadline);
            }
            expirations.pop();
        }
    }

    pub(super) fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    pub(super) fn clear(&self) {
        let pending = mem::take(&mut *self.pending.borrow_mut());
        drop(pending);
        self.expirations.borrow_mut().clear();
    }
}

/// Completes once its deadline has passed. Dropping it removes the timer.
pub struct Timeout {
    id: u64,
    timers: Weak<Timers>,
    data: Rc<TimeoutData>,
}

impl Future for Timeout {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.data.expired.get() {
            Poll::Ready(())
        } else {
            self.data.waker.set(Some(cx.waker().clone()));
            Poll::Pending
        }
    }
}

impl Drop for Timeout {
    fn drop(&mut self) {
        if let Some(timers) = self.timers.upgrade() {
            timers.pending.borrow_mut().remove(&self.id);
        }
    }
}
