use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// One queued unit of heavy device work.
pub struct Task {
    pub command_id: String,
    pub kind: String,
    pub job: Box<dyn FnOnce() + Send>,
}

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    cond: Condvar,
    running: Mutex<bool>,
}

/// Single worker thread draining a FIFO of device tasks.
///
/// Serial round-trips longer than the dispatch budget (payment reset,
/// device check) run here so the IPC client thread stays responsive. On
/// shutdown the queue drains to completion before the thread exits.
pub struct WorkerQueue {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Default for WorkerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerQueue {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            running: Mutex::new(true),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("command-worker".to_string())
            .spawn(move || worker_loop(thread_shared))
            .expect("failed to spawn worker thread");

        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queue a task; the worker is notified immediately.
    pub fn enqueue(&self, task: Task) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.push_back(task);
            log::debug!("worker: task queued, {} pending", queue.len());
        }
        self.shared.cond.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    /// Drain the queue to completion and stop the thread.
    pub fn shutdown(&self) {
        {
            let mut running = self.shared.running.lock().unwrap();
            if !*running {
                return;
            }
            *running = false;
        }
        self.shared.cond.notify_all();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(task) = queue.pop_front() {
                    break Some(task);
                }
                if !*shared.running.lock().unwrap() {
                    break None;
                }
                let (guard, _timeout) = shared
                    .cond
                    .wait_timeout(queue, Duration::from_millis(200))
                    .unwrap();
                queue = guard;
            }
        };

        let Some(task) = task else {
            // Stop requested and the queue is dry.
            break;
        };
        log::debug!("worker: running {} ({})", task.kind, task.command_id);
        (task.job)();
    }
    log::debug!("worker: thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;

    fn task(command_id: &str, job: impl FnOnce() + Send + 'static) -> Task {
        Task {
            command_id: command_id.to_string(),
            kind: "test".to_string(),
            job: Box::new(job),
        }
    }

    #[test]
    fn test_tasks_run_in_order() {
        let worker = WorkerQueue::new();
        let (tx, rx) = channel();

        for i in 0..5 {
            let tx = tx.clone();
            worker.enqueue(task(&format!("c-{i}"), move || {
                let _ = tx.send(i);
            }));
        }

        let order: Vec<i32> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let worker = WorkerQueue::new();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let done = Arc::clone(&done);
            worker.enqueue(task("c", move || {
                thread::sleep(Duration::from_millis(5));
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }

        worker.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_shutdown_twice_is_safe() {
        let worker = WorkerQueue::new();
        worker.shutdown();
        worker.shutdown();
    }
}
