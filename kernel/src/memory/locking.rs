//! Mutex wrapper turning a single-context heap into an MT-safe one.

use spin::Mutex;

use super::heap::Heap;

pub struct Locking<H> {
    lock: Mutex<()>,
    inner: H,
}

impl<H: Heap> Locking<H> {
    pub fn new(inner: H) -> Locking<H> {
        Locking {
            lock: Mutex::new(()),
            inner,
        }
    }
}

impl<H: Heap> Heap for Locking<H> {
    fn alloc(&self, size: u64) -> Option<u64> {
        let _guard = self.lock.lock();
        self.inner.alloc(size)
    }

    fn dealloc(&self, base: u64, size: u64) {
        let _guard = self.lock.lock();
        self.inner.dealloc(base, size);
    }

    fn pagesize(&self) -> u64 {
        self.inner.pagesize()
    }

    fn thread_safe(&self) -> bool {
        true
    }
}
