/*
Pluggable synchronisation for compound endpoint operations such as connect,
disconnect and framed sends. The policy is chosen once when the endpoint is
constructed and cannot change afterwards.
*/
use serde::Deserialize;
use std::{
    hint,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
    thread,
};

const SPIN_LIMIT: u32 = 64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockPolicy {
    /// No serialisation. Only for endpoints driven from a single thread.
    None,
    /// Lightweight intra-process spin lock that yields when contended
    Spin,
    /// Blocking OS mutex
    #[default]
    Mutex,
}

pub struct PolicyLock {
    policy: LockPolicy,
    spin: AtomicBool,
    mutex: Mutex<()>,
}

/// Held while a compound operation runs. Dropping it releases the lock.
pub enum PolicyGuard<'a> {
    Unlocked,
    Spin(&'a AtomicBool),
    Mutex(MutexGuard<'a, ()>),
}

impl PolicyLock {
    pub fn new(policy: LockPolicy) -> Self {
        Self {
            policy,
            spin: AtomicBool::new(false),
            mutex: Mutex::new(()),
        }
    }

    pub fn policy(self: &Self) -> LockPolicy {
        self.policy
    }

    pub fn lock(self: &Self) -> PolicyGuard<'_> {
        match self.policy {
            LockPolicy::None => PolicyGuard::Unlocked,
            LockPolicy::Spin => {
                let mut spins = 0;
                while self
                    .spin
                    .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_err()
                {
                    if spins < SPIN_LIMIT {
                        spins += 1;
                        hint::spin_loop();
                    } else {
                        thread::yield_now();
                    }
                }
                PolicyGuard::Spin(&self.spin)
            }
            // The mutex guards no data, so a poisoned lock is still usable
            LockPolicy::Mutex => PolicyGuard::Mutex(
                self.mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
            ),
        }
    }
}

impl Drop for PolicyGuard<'_> {
    fn drop(&mut self) {
        if let PolicyGuard::Spin(flag) = self {
            flag.store(false, Ordering::Release);
        }
    }
}
