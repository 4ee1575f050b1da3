use {
    crate::utils::numcell::NumCell,
    std::{
        cell::Cell,
        future::Future,
        pin::Pin,
        task::{Context, Poll, Waker},
    },
};

/// A level-triggered wakeup. Triggers that happen while nobody waits are
/// coalesced and consumed by the next wait.
#[derive(Default)]
pub struct AsyncEvent {
    triggers: NumCell<u32>,
    waker: Cell<Option<Waker>>,
}

impl AsyncEvent {
    pub fn trigger(&self) {
        self.triggers.fetch_add(1);
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }

    pub fn triggered(&self) -> AsyncEventTriggered<'_> {
        AsyncEventTriggered { ae: self }
    }
}

pub struct AsyncEventTriggered<'a> {
    ae: &'a AsyncEvent,
}

impl Future for AsyncEventTriggered<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.ae.triggers.get() == 0 {
            self.ae.waker.set(Some(cx.waker().clone()));
            Poll::Pending
        } else {
            self.ae.triggers.set(0);
            Poll::Ready(())
        }
    }
}
