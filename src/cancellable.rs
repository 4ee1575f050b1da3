
use {
    crate::dbus::DbusError,
    std::{
        cell::{Cell, RefCell},
        fmt::{Debug, Formatter},
        future::Future,
        mem,
        pin::Pin,
        rc::Rc,
        task::{Context, Poll, Waker},
    },
};

/// A cancellation token shared between the owner of an operation and the
/// operation itself.
#[derive(Clone, Default)]
pub struct Cancellable {
    data: Rc<CancellableData>,
}

#[derive(Default)]
struct CancellableData {
    cancelled: Cell<bool>,
    waiters: RefCell<Vec<Waker>>,
}

impl Cancellable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if self.data.cancelled.replace(true) {
            return;
        }
        let waiters = mem::take(&mut *self.data.waiters.borrow_mut());
        for waiter in waiters {
            waiter.wake();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.data.cancelled.get()
    }

    pub fn check(&self) -> Result<(), DbusError> {
        match self.is_cancelled() {
            true => Err(DbusError::Cancelled),
            false => Ok(()),
        }
    }

    /// Resolves once the token has been cancelled.
    pub fn cancelled(&self) -> Cancelled {
        Cancelled { c: self.clone() }
    }
}

impl Debug for Cancellable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cancellable")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

pub struct Cancelled {
    c: Cancellable,
}

impl Future for Cancelled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.c.is_cancelled() {
            return Poll::Ready(());
        }
        let mut waiters = self.c.data.waiters.borrow_mut();
        if !waiters.iter().any(|w| w.will_wake(cx.waker())) {
            waiters.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

/// Cancels its token when dropped. Operations started within a scope are
/// thereby cancelled when the scope is left early.
#[must_use]
pub struct CancelOnDrop {
    c: Cancellable,
}

impl CancelOnDrop {
    pub fn new() -> Self {
        Self {
            c: Cancellable::new(),
        }
    }

    pub fn cancellable(&self) -> &Cancellable {
        &self.c
    }
}

impl Default for CancelOnDrop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.c.cancel();
    }
}
