//! Job system contract (C7 ambient collaborator) and a reference
//! implementation.
//!
//! `JobSystem` is the seam the rendering phase schedules kernels through;
//! a host embedding this crate is free to substitute its own pool. The
//! `LocalJobSystem` here exists so this crate's own tests (and anyone
//! without a host job system) have something real to run against —
//! grounded on the named worker threads `dozer_core::executor::start_source`
//! spawns per source, generalized into a small fixed pool fed over a
//! `crossbeam::channel`.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::handle::{VersionedHandle, VersionedList};

pub struct JobMarker;
pub type JobHandle = VersionedHandle<JobMarker>;

/// `schedule`/`complete`: the minimal contract a job system must expose.
/// `deps` must already have been returned by a prior `schedule` or
/// `combine` call on the same system.
pub trait JobSystem: Send + Sync {
    fn schedule(&self, work: Box<dyn FnOnce() + Send>, deps: &[JobHandle]) -> JobHandle;

    /// Blocks the calling thread until `handle`'s work (and everything it
    /// depended on) has run.
    fn complete(&self, handle: JobHandle);

    /// A handle that completes once every handle in `deps` has, without
    /// running any work of its own. Mirrors `JobHandle.CombineDependencies`
    /// in Unity's C# Job System, the closest prior art for this contract.
    fn combine(&self, deps: &[JobHandle]) -> JobHandle {
        self.schedule(Box::new(|| {}), deps)
    }
}

struct JobSlot {
    done: bool,
}

struct Shared {
    slots: Mutex<VersionedList<JobSlot>>,
    cv: Condvar,
}

impl Shared {
    fn wait_for(&self, handle: JobHandle) {
        let mut slots = self.slots.lock();
        loop {
            match slots.get(handle.cast()) {
                Ok(slot) if slot.done => return,
                Ok(_) => self.cv.wait(&mut slots),
                // A handle from a different, already-torn-down job system,
                // or one already recycled: nothing to wait for.
                Err(_) => return,
            }
        }
    }
}

/// Fixed-size worker pool. `schedule` enqueues a closure that first waits
/// out its declared dependencies, then runs the work and marks itself
/// done; `complete` blocks the caller on that same condition variable.
pub struct LocalJobSystem {
    shared: Arc<Shared>,
    sender: Option<crossbeam::channel::Sender<Box<dyn FnOnce() + Send>>>,
    workers: Vec<JoinHandle<()>>,
}

impl LocalJobSystem {
    pub fn new(worker_count: usize) -> Self {
        let (sender, receiver) = crossbeam::channel::unbounded::<Box<dyn FnOnce() + Send>>();
        let workers = (0..worker_count.max(1))
            .map(|i| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("flowgraph-job-{i}"))
                    .spawn(move || {
                        while let Ok(task) = receiver.recv() {
                            task();
                        }
                    })
                    .expect("failed to spawn job worker thread")
            })
            .collect();

        Self {
            shared: Arc::new(Shared {
                slots: Mutex::new(VersionedList::new(2)),
                cv: Condvar::new(),
            }),
            sender: Some(sender),
            workers,
        }
    }
}

impl Default for LocalJobSystem {
    fn default() -> Self {
        Self::new(std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4))
    }
}

impl JobSystem for LocalJobSystem {
    fn schedule(&self, work: Box<dyn FnOnce() + Send>, deps: &[JobHandle]) -> JobHandle {
        let handle: JobHandle = self.shared.slots.lock().allocate(JobSlot { done: false }).cast();
        let shared = self.shared.clone();
        let deps = deps.to_vec();
        let queued: Box<dyn FnOnce() + Send> = Box::new(move || {
            for dep in &deps {
                shared.wait_for(*dep);
            }
            work();
            let mut slots = shared.slots.lock();
            if let Ok(slot) = slots.get_mut(handle.cast()) {
                slot.done = true;
            }
            drop(slots);
            shared.cv.notify_all();
        });
        self.sender
            .as_ref()
            .expect("not yet dropped")
            .send(queued)
            .expect("job worker threads outlive the channel");
        handle
    }

    fn complete(&self, handle: JobHandle) {
        self.shared.wait_for(handle);
    }
}

impl Drop for LocalJobSystem {
    fn drop(&mut self) {
        // Dropping the sender closes the channel; workers exit their recv
        // loop once the queue drains, so joining them here cannot hang.
        self.sender = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn dependent_job_runs_after_its_dependency() {
        let jobs = LocalJobSystem::new(2);
        let value = Arc::new(AtomicI32::new(0));
        let a = {
            let value = value.clone();
            jobs.schedule(Box::new(move || value.store(1, Ordering::SeqCst)), &[])
        };
        let b = {
            let value = value.clone();
            jobs.schedule(
                Box::new(move || {
                    let prior = value.load(Ordering::SeqCst);
                    value.store(prior + 1, Ordering::SeqCst);
                }),
                &[a],
            )
        };
        jobs.complete(b);
        assert_eq!(value.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn combine_waits_on_every_dependency() {
        let jobs = LocalJobSystem::new(4);
        let count = Arc::new(AtomicI32::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let count = count.clone();
                jobs.schedule(Box::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }), &[])
            })
            .collect();
        let fence = jobs.combine(&handles);
        jobs.complete(fence);
        assert_eq!(count.load(Ordering::SeqCst), 8);
    }
}
