use crate::cpu::IrqSave;
use std::ops::{Deref, DerefMut};

/// A spinlock whose critical section also runs with asynchronous delivery
/// masked on the current thread: spin_lock_irqsave()/spin_unlock_irqrestore().
///
/// The protected value is only reachable through the guard.
pub struct IrqSpinLock<T> {
    inner: spin::Mutex<T>,
}

/// Field order matters: the lock is released before signals are unmasked.
pub struct IrqSpinLockGuard<'a, T> {
    guard: spin::MutexGuard<'a, T>,
    _irq: IrqSave,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(val: T) -> IrqSpinLock<T> {
        IrqSpinLock {
            inner: spin::Mutex::new(val),
        }
    }

    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let irq = IrqSave::new();
        IrqSpinLockGuard {
            guard: self.inner.lock(),
            _irq: irq,
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<'a, T> Deref for IrqSpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> DerefMut for IrqSpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn serializes_threads() {
        let lock = Arc::new(IrqSpinLock::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(4000, *lock.lock());
    }

    #[test]
    fn into_inner_returns_value() {
        let lock = IrqSpinLock::new(vec![1, 2]);
        lock.lock().push(3);
        assert_eq!(vec![1, 2, 3], lock.into_inner());
    }
}
