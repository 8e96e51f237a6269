use std::cmp;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use threadpool::ThreadPool;

use armada_definitions::config::QueueConfig;

use super::kv::Kv;
use super::Result;

/// Handle over the consuming worker pool.
pub struct Workers {
    pool: ThreadPool,
    shutdown: Arc<AtomicBool>,
}

impl Workers {
    /// Block until the workers exit (they don't, short of `stop`).
    pub fn wait(&self) {
        self.pool.join();
    }

    /// Signal the workers and wait for in-flight messages to finish.
    pub fn stop(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.pool.join();
    }
}

/// Start a worker pool consuming the persistent work queue.
///
/// Each message is processed under a heartbeated lease of `lock_ms` so a
/// concurrent process cannot pick it up within the visibility window. The
/// queue is at-least-once: a crashed worker's message reappears once its
/// lease lapses.
pub fn consume<F>(kv: Arc<Kv>, opts: QueueConfig, handler: F) -> Workers
where
    F: Fn(&str) -> Result<()> + Send + Sync + 'static,
{
    let pool = ThreadPool::with_name("armada-worker".into(), opts.threads);
    let shutdown = Arc::new(AtomicBool::new(false));
    let handler = Arc::new(handler);
    for n in 0..opts.threads {
        let kv = Arc::clone(&kv);
        let shutdown = Arc::clone(&shutdown);
        let handler = Arc::clone(&handler);
        let opts = opts.clone();
        pool.execute(move || worker_loop(n, kv, opts, shutdown, handler));
    }
    Workers { pool, shutdown }
}

fn worker_loop<F>(
    n: usize,
    kv: Arc<Kv>,
    opts: QueueConfig,
    shutdown: Arc<AtomicBool>,
    handler: Arc<F>,
) where
    F: Fn(&str) -> Result<()> + Send + Sync + 'static,
{
    debug!("worker {} up", n);
    while !shutdown.load(Ordering::SeqCst) {
        match kv.queue_pop() {
            Ok(Some(payload)) => {
                process(&kv, &opts, handler.as_ref(), &payload);
                thread::sleep(Duration::from_millis(opts.throttle_ms));
            }
            Ok(None) => {
                if let Err(e) = kv.requeue_expired() {
                    warn!("worker {} could not reap expired leases: {}", n, e);
                }
                thread::sleep(Duration::from_millis(opts.backoff_ms));
            }
            Err(e) => {
                warn!("worker {} cannot reach the queue: {}", n, e);
                thread::sleep(Duration::from_millis(opts.backoff_ms));
            }
        }
    }
    debug!("worker {} down", n);
}

fn process<F>(kv: &Arc<Kv>, opts: &QueueConfig, handler: &F, payload: &str)
where
    F: Fn(&str) -> Result<()>,
{
    match kv.lease(payload, opts.lock_ms) {
        Ok(true) => {}
        Ok(false) => {
            // someone else holds it inside the visibility window; drop our copy
            debug!("{} already leased elsewhere", payload);
            if let Err(e) = kv.queue_ack(payload) {
                warn!("could not drop duplicate {}: {}", payload, e);
            }
            return;
        }
        Err(e) => {
            // leave the message on the processing list; the reaper requeues it
            warn!("could not lease {}: {}", payload, e);
            return;
        }
    }

    let done = Arc::new(AtomicBool::new(false));
    let heartbeat = spawn_heartbeat(kv, payload, opts.lock_ms, &done);

    let outcome = handler(payload);

    done.store(true, Ordering::SeqCst);
    let _ = heartbeat.join();

    if let Err(e) = outcome {
        // the deployment document records what went wrong; nothing to retry here
        error!("handler failed for {}: {}", payload, e);
    }
    if let Err(e) = kv.queue_ack(payload) {
        warn!("could not ack {}: {}", payload, e);
    }
    if let Err(e) = kv.release_lease(payload) {
        warn!("could not release lease on {}: {}", payload, e);
    }
}

/// Renew the message lease at a third of its lifetime until `done`.
fn spawn_heartbeat(
    kv: &Arc<Kv>,
    payload: &str,
    lock_ms: u64,
    done: &Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    let kv = Arc::clone(kv);
    let done = Arc::clone(done);
    let payload = payload.to_string();
    thread::spawn(move || {
        let tick = Duration::from_millis(cmp::min(lock_ms / 3, 50).max(1));
        let renew_every = Duration::from_millis(cmp::max(lock_ms / 3, 1));
        let mut since_renewal = Duration::from_millis(0);
        while !done.load(Ordering::SeqCst) {
            thread::sleep(tick);
            since_renewal += tick;
            if done.load(Ordering::SeqCst) {
                break;
            }
            if since_renewal >= renew_every {
                since_renewal = Duration::from_millis(0);
                if let Err(e) = kv.renew_lease(&payload, lock_ms) {
                    warn!("heartbeat for {} failed: {}", payload, e);
                }
            }
        }
    })
}
