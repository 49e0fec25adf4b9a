//! Background task execution for the cache manager.
//!
//! Free-memory and migrate work is queued onto a dedicated worker thread so
//! the requesting path returns immediately. Outstanding tasks are counted,
//! which lets shutdown drain the queue before tearing the pool down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use crate::manager::ManagerCore;

/// Work items the manager schedules.
#[derive(Debug, Clone)]
pub enum Task {
    /// Evict entries of one cache until its usage fits the target.
    FreeMemory { cache_id: u64, target_usage: u64 },
    /// Move one cache onto a table of the given log size.
    Migrate { cache_id: u64, log_size: u32 },
    /// Re-check whether a pending global resize is now satisfiable.
    ResizeCheck { new_limit: u64 },
}

pub struct TaskRunner {
    sender: Option<Sender<Task>>,
    handle: Option<JoinHandle<()>>,
    outstanding: Arc<AtomicU64>,
}

impl TaskRunner {
    pub fn start(core: Weak<ManagerCore>) -> Self {
        let (sender, receiver) = channel::<Task>();
        let outstanding = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&outstanding);

        let handle = std::thread::Builder::new()
            .name("heron-cache-tasks".into())
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    if let Some(core) = core.upgrade() {
                        core.execute_task(task);
                    }
                    counter.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .expect("failed to spawn cache task worker");

        Self {
            sender: Some(sender),
            handle: Some(handle),
            outstanding,
        }
    }

    /// Queue a task. Returns `false` once the runner is shut down.
    pub fn schedule(&self, task: Task) -> bool {
        match &self.sender {
            Some(sender) => {
                self.outstanding.fetch_add(1, Ordering::SeqCst);
                if sender.send(task).is_err() {
                    self.outstanding.fetch_sub(1, Ordering::SeqCst);
                    return false;
                }
                true
            }
            None => false,
        }
    }

    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Close the queue and wait for the worker to drain it.
    pub fn shutdown(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
