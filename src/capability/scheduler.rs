use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::CapabilityContext;
use crate::error::CapabilityError;
use crate::lease::BoundedHandle;
use crate::policy::Grants;

/// A cooperative task: its handler is called once per step until it returns something other
/// than `true`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Microthread {
    pub id: u64,
    pub handler: String,
    pub steps: u64,
}

#[derive(Default)]
struct RunQueue {
    ready: VecDeque<Microthread>,
    cancelled: HashSet<u64>,
}

#[derive(Clone)]
pub struct SchedulerCapability {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    ctx: CapabilityContext,
    handle: BoundedHandle,
    queue: Mutex<RunQueue>,
    next_id: AtomicU64,
}

impl SchedulerCapability {
    pub(crate) fn new(ctx: CapabilityContext) -> Self {
        let handle = ctx.leases.issue("microthreads");
        Self {
            inner: Arc::new(SchedulerInner {
                ctx,
                handle,
                queue: Mutex::new(RunQueue::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn spawn(&self, handler: &str) -> Result<u64, CapabilityError> {
        self.inner.handle.ensure_live()?;
        self.inner.ctx.require(Grants::MICROTHREADS)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.queue.lock().ready.push_back(Microthread { id, handler: handler.to_string(), steps: 0 });
        Ok(id)
    }

    pub fn cancel(&self, id: u64) -> Result<bool, CapabilityError> {
        self.inner.handle.ensure_live()?;
        let mut queue = self.inner.queue.lock();
        let before = queue.ready.len();
        queue.ready.retain(|thread| thread.id != id);
        if queue.ready.len() != before {
            return Ok(true);
        }
        // May be mid-step; drop it when it comes back.
        Ok(queue.cancelled.insert(id))
    }

    pub fn count(&self) -> Result<usize, CapabilityError> {
        self.inner.handle.ensure_live()?;
        Ok(self.inner.queue.lock().ready.len())
    }

    pub(crate) fn is_live(&self) -> bool {
        self.inner.handle.is_live()
    }

    pub(crate) fn next_ready(&self) -> Option<Microthread> {
        self.inner.queue.lock().ready.pop_front()
    }

    pub(crate) fn resume(&self, mut thread: Microthread) {
        let mut queue = self.inner.queue.lock();
        if queue.cancelled.remove(&thread.id) {
            return;
        }
        thread.steps += 1;
        queue.ready.push_back(thread);
    }

    pub(crate) fn finish(&self, thread: &Microthread) {
        self.inner.queue.lock().cancelled.remove(&thread.id);
    }

    pub(crate) fn clear(&self) {
        let mut queue = self.inner.queue.lock();
        queue.ready.clear();
        queue.cancelled.clear();
    }
}
