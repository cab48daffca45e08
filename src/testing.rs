//! Instrumented [`SystemMemory`] used by the tests to count every region the
//! pool takes from and gives back to the system.

use std::{cell::RefCell, collections::HashMap, ptr::NonNull, rc::Rc};

use crate::kernel::{Kernel, SystemMemory};

#[derive(Debug, Default)]
pub(crate) struct Ledger {
    /// Successful `request_memory` calls.
    pub requests: usize,
    /// `return_memory` calls.
    pub releases: usize,
    /// Regions currently handed out, address to length.
    pub outstanding: HashMap<usize, usize>,
    /// How many more requests may succeed, unlimited when `None`.
    pub budget: Option<usize>,
}

/// Wraps [`Kernel`] and records its traffic in a shared [`Ledger`] that
/// outlives the pool.
pub(crate) struct CountingMemory {
    inner: Kernel,
    ledger: Rc<RefCell<Ledger>>,
}

impl CountingMemory {
    pub fn new() -> (Self, Rc<RefCell<Ledger>>) {
        let ledger = Rc::new(RefCell::new(Ledger::default()));
        let memory = Self {
            inner: Kernel,
            ledger: Rc::clone(&ledger),
        };
        (memory, ledger)
    }
}

unsafe impl SystemMemory for CountingMemory {
    fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>> {
        let mut ledger = self.ledger.borrow_mut();
        if ledger.budget == Some(0) {
            return None;
        }

        let addr = self.inner.request_memory(len)?;
        ledger.requests += 1;
        if let Some(budget) = ledger.budget.as_mut() {
            *budget -= 1;
        }
        ledger.outstanding.insert(addr.as_ptr() as usize, len);

        Some(addr)
    }

    unsafe fn return_memory(&mut self, addr: NonNull<u8>, len: usize) {
        {
            let mut ledger = self.ledger.borrow_mut();
            ledger.releases += 1;

            let known = ledger.outstanding.remove(&(addr.as_ptr() as usize));
            assert_eq!(known, Some(len), "region returned twice or with a wrong length");
        }

        unsafe { self.inner.return_memory(addr, len) };
    }
}
