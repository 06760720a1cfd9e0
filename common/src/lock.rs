use std::{
    sync::{Mutex, MutexGuard, TryLockError},
    thread,
    time::{Duration, Instant},
};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Mutex whose acquisition gives up after a deadline instead of blocking
/// indefinitely. A poisoned lock is recovered, since the guarded data is
/// only ever replaced field by field.
#[derive(Debug, Default)]
pub struct TimedMutex<T> {
    inner: Mutex<T>,
}

impl<T> TimedMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn lock_for(&self, timeout: Duration) -> Option<MutexGuard<'_, T>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.inner.try_lock() {
                Ok(guard) => return Some(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{mpsc, Arc};

    #[test]
    fn acquires_free_lock_immediately() {
        let lock = TimedMutex::new(5);
        let guard = lock.lock_for(Duration::from_millis(10)).unwrap();
        assert_eq!(*guard, 5);
    }

    #[test]
    fn times_out_while_held_elsewhere() {
        let lock = Arc::new(TimedMutex::new(0_u32));
        let (held_tx, held_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let _guard = lock.lock();
                held_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
        };

        held_rx.recv().unwrap();
        let started = Instant::now();
        assert!(lock.lock_for(Duration::from_millis(20)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(lock.lock_for(Duration::from_millis(20)).is_some());
    }

    #[test]
    fn recovers_from_poisoning() {
        let lock = Arc::new(TimedMutex::new(1_u32));
        let poisoner = Arc::clone(&lock);
        let _ = thread::spawn(move || {
            let mut guard = poisoner.lock();
            *guard = 2;
            panic!("poison the lock");
        })
        .join();

        assert_eq!(*lock.lock_for(Duration::from_millis(10)).unwrap(), 2);
    }
}
