use std::{
    cell::RefCell,
    collections::VecDeque,
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};


/// A FIFO whose `pop` suspends until an element is available.
pub struct AsyncQueue<T> {
    data: RefCell<VecDeque<T>>,
    waiters: RefCell<Vec<Waker>>,
}

impl<T> Default for AsyncQueue<T> {
    fn default() -> Self {
        Self {
            data: Default::default(),
            waiters: Default::default(),
        }
    }
}

impl<T> AsyncQueue<T> {
    pub fn push(&self, t: T) {
        self.data.borrow_mut().push_back(t);
        let waiters = std::mem::take(&mut *self.waiters.borrow_mut());
        for waiter in waiters {
            waiter.wake();
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.data.borrow_mut().pop_front()
    }

    pub fn pop(&self) -> AsyncQueuePop<'_, T> {
        AsyncQueuePop { queue: self }
    }

    pub fn any(&self, f: impl Fn(&T) -> bool) -> bool {
        self.data.borrow().iter().any(f)
    }
}

pub struct AsyncQueuePop<'a, T> {
    queue: &'a AsyncQueue<T>,
}

impl<T> Future for AsyncQueuePop<'_, T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(t) = self.queue.try_pop() {
            return Poll::Ready(t);
        }
        let mut waiters = self.queue.waiters.borrow_mut();
        if !waiters.iter().any(|w| w.will_wake(cx.waker())) {
            waiters.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
