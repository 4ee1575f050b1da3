use std::{cell::Cell, ops::Add};

#[derive(Default)]
pub struct NumCell<T> {
    t: Cell<T>,
}

impl<T: Copy> NumCell<T> {
    pub fn new(t: T) -> Self {
        Self { t: Cell::new(t) }
    }

    pub fn get(&self) -> T {
        self.t.get()
    }

    pub fn set(&self, n: T) {
        self.t.set(n);
    }

    pub fn fetch_add(&self, n: T) -> T
    where
        T: Add<T, Output = T>,
    {
        let res = self.t.get();
        self.t.set(res + n);
        res
    }
}
