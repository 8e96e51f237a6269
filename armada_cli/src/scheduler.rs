use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use threadpool::ThreadPool;

use super::Result;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    due: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Entry) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    // BinaryHeap is a max-heap; invert so the earliest deadline surfaces
    fn cmp(&self, other: &Entry) -> CmpOrdering {
        other.due.cmp(&self.due).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Delayed job execution over a shared worker pool.
///
/// Pollers reschedule themselves through this queue instead of recursing or
/// sleeping on a thread, so every wait is a plain heap entry and a restarted
/// process just re-registers its polls.
pub struct Scheduler {
    tx: Mutex<Sender<Entry>>,
    seq: AtomicU64,
}

impl Scheduler {
    pub fn new(workers: usize) -> Result<Scheduler> {
        let (tx, rx) = channel();
        let pool = ThreadPool::with_name("armada-poll".into(), workers);
        thread::Builder::new()
            .name("armada-timer".into())
            .spawn(move || run(rx, pool))?;
        Ok(Scheduler {
            tx: Mutex::new(tx),
            seq: AtomicU64::new(0),
        })
    }

    /// Run `job` on the pool once `delay` has passed.
    pub fn schedule<F>(&self, delay: Duration, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let entry = Entry {
            due: Instant::now() + delay,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            job: Box::new(job),
        };
        // the receiver lives until process teardown
        let _ = self
            .tx
            .lock()
            .expect("scheduler queue poisoned")
            .send(entry);
    }
}

fn run(rx: Receiver<Entry>, pool: ThreadPool) {
    let mut pending: BinaryHeap<Entry> = BinaryHeap::new();
    loop {
        let timeout = pending
            .peek()
            .map(|e| e.due.saturating_duration_since(Instant::now()))
            .unwrap_or_else(|| Duration::from_secs(60));
        match rx.recv_timeout(timeout) {
            Ok(entry) => pending.push(entry),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        loop {
            match pending.peek() {
                Some(e) if e.due <= Instant::now() => {}
                _ => break,
            }
            if let Some(e) = pending.pop() {
                pool.execute(e.job);
            }
        }
    }
    debug!("scheduler down");
}

#[cfg(test)]
mod tests {
    use super::Scheduler;
    use std::sync::mpsc::channel;
    use std::time::{Duration, Instant};

    #[test]
    fn jobs_fire_in_deadline_order() {
        let scheduler = Scheduler::new(1).unwrap();
        let (tx, rx) = channel();

        let late = tx.clone();
        scheduler.schedule(Duration::from_millis(80), move || {
            late.send("late").unwrap();
        });
        let early = tx.clone();
        scheduler.schedule(Duration::from_millis(10), move || {
            early.send("early").unwrap();
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "early");
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "late");
    }

    #[test]
    fn delays_are_respected() {
        let scheduler = Scheduler::new(1).unwrap();
        let (tx, rx) = channel();
        let begun = Instant::now();
        scheduler.schedule(Duration::from_millis(50), move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(begun.elapsed() >= Duration::from_millis(50));
    }
}
