//! Two-phase rendezvous barrier for the render loop
//!
//! `wait_pre` holds every worker until all `num_threads` have arrived;
//! `wait_post` holds them until all have left the frame. The two counting
//! turnstiles prevent a fast thread from lapping the barrier and stealing a
//! slot from the previous phase.

use std::sync::{Condvar, Mutex};

/// Counting semaphore (std has no portable one)
struct Turnstile {
    count: Mutex<isize>,
    cond: Condvar,
}

impl Turnstile {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn post(&self, n: isize) {
        let mut count = self.count.lock().unwrap();
        *count += n;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count <= 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }
}

/// Two-phase barrier for exactly `num_threads` render workers
pub struct RenderBarrier {
    num_threads: usize,
    wait_count: Mutex<usize>,
    turnstile1: Turnstile,
    turnstile2: Turnstile,
}

impl RenderBarrier {
    pub fn new(num_threads: usize) -> Self {
        Self {
            num_threads,
            wait_count: Mutex::new(0),
            turnstile1: Turnstile::new(),
            turnstile2: Turnstile::new(),
        }
    }

    /// Block until all threads have entered the frame
    pub fn wait_pre(&self) {
        {
            let mut count = self.wait_count.lock().unwrap();
            *count += 1;
            if *count == self.num_threads {
                self.turnstile1.post(self.num_threads as isize);
            }
        }
        self.turnstile1.wait();
    }

    /// Block until all threads have left the frame
    pub fn wait_post(&self) {
        {
            let mut count = self.wait_count.lock().unwrap();
            *count -= 1;
            if *count == 0 {
                self.turnstile2.post(self.num_threads as isize);
            }
        }
        self.turnstile2.wait();
    }

    /// Unblock both phases unconditionally (termination)
    pub fn release_all(&self) {
        self.turnstile1.post(self.num_threads as isize);
        self.turnstile2.post(self.num_threads as isize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_all_threads_arrive_before_release() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 8;

        let barrier = Arc::new(RenderBarrier::new(THREADS));
        let arrivals = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let arrivals = Arc::clone(&arrivals);
                std::thread::spawn(move || {
                    for round in 0..ROUNDS {
                        arrivals.fetch_add(1, Ordering::SeqCst);
                        barrier.wait_pre();
                        // After wait_pre every thread of this round has arrived
                        assert!(arrivals.load(Ordering::SeqCst) >= THREADS * (round + 1));
                        barrier.wait_post();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(arrivals.load(Ordering::SeqCst), THREADS * ROUNDS);
    }

    #[test]
    fn test_release_all_unblocks_waiters() {
        let barrier = Arc::new(RenderBarrier::new(2));

        let waiter = {
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || barrier.wait_pre())
        };

        // Only one thread ever arrives; release_all must free it
        std::thread::sleep(std::time::Duration::from_millis(20));
        barrier.release_all();
        waiter.join().unwrap();
    }
}
