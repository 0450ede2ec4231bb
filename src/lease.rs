use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::CapabilityError;

/// Renewal quantum granted to every live handle.
pub const LEASE_MINUTES: u64 = 1;

pub fn lease_quantum() -> Duration {
    Duration::from_secs(LEASE_MINUTES * 60)
}

/// A reference whose lifetime is bounded by a renewable lease.
///
/// Handles are cheap to clone; every clone observes the same liveness. Once a handle is dead it
/// stays dead: renewals return a zero grant and calls gated by [`BoundedHandle::ensure_live`]
/// fail with [`CapabilityError::BoundaryUnreachable`].
#[derive(Clone)]
pub struct BoundedHandle {
    inner: Arc<LeaseState>,
}

struct LeaseState {
    label: String,
    quantum: Duration,
    live: AtomicBool,
    timing: Mutex<LeaseTiming>,
    renewals: AtomicU64,
}

struct LeaseTiming {
    lease_until: Instant,
    kill_at: Option<Instant>,
}

impl BoundedHandle {
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_quantum(label, lease_quantum())
    }

    pub fn with_quantum(label: impl Into<String>, quantum: Duration) -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(LeaseState {
                label: label.into(),
                quantum,
                live: AtomicBool::new(true),
                timing: Mutex::new(LeaseTiming { lease_until: now + quantum, kill_at: None }),
                renewals: AtomicU64::new(0),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn quantum(&self) -> Duration {
        self.inner.quantum
    }

    pub fn renewals(&self) -> u64 {
        self.inner.renewals.load(Ordering::Relaxed)
    }

    /// Grants another quantum while live, zero once dead or past a scheduled kill.
    pub fn renew(&self) -> Duration {
        if !self.check(Instant::now()) {
            return Duration::ZERO;
        }
        let mut timing = self.inner.timing.lock();
        timing.lease_until = Instant::now() + self.inner.quantum;
        self.inner.renewals.fetch_add(1, Ordering::Relaxed);
        self.inner.quantum
    }

    pub fn kill(&self) {
        if self.inner.live.swap(false, Ordering::AcqRel) {
            tracing::trace!("[lease] {} killed", self.inner.label);
        }
    }

    /// Schedules death. An earlier deadline already on record is kept.
    pub fn kill_after(&self, delay: Duration) {
        if !self.inner.live.load(Ordering::Acquire) {
            return;
        }
        let deadline = Instant::now() + delay;
        let mut timing = self.inner.timing.lock();
        timing.kill_at = Some(match timing.kill_at {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
    }

    pub fn is_live(&self) -> bool {
        self.check(Instant::now())
    }

    /// Gate for every forwarded call. A successful check renews the lease.
    pub fn ensure_live(&self) -> Result<(), CapabilityError> {
        if self.renew().is_zero() {
            Err(CapabilityError::BoundaryUnreachable(self.inner.label.clone()))
        } else {
            Ok(())
        }
    }

    pub fn same_handle(&self, other: &BoundedHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn check(&self, now: Instant) -> bool {
        if !self.inner.live.load(Ordering::Acquire) {
            return false;
        }
        let timing = self.inner.timing.lock();
        let expired = now >= timing.lease_until || timing.kill_at.is_some_and(|deadline| now >= deadline);
        drop(timing);
        if expired {
            self.kill();
            return false;
        }
        true
    }
}

impl std::fmt::Debug for BoundedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedHandle").field("label", &self.inner.label).field("live", &self.is_live()).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    pub renewed: usize,
    pub reclaimed: usize,
}

/// Every handle issued for one boundary or local run.
#[derive(Clone)]
pub struct LeaseScope {
    name: Arc<str>,
    quantum: Duration,
    handles: Arc<Mutex<Vec<BoundedHandle>>>,
}

impl LeaseScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_quantum(name, lease_quantum())
    }

    pub fn with_quantum(name: impl Into<String>, quantum: Duration) -> Self {
        let name: String = name.into();
        Self { name: name.into(), quantum, handles: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn quantum(&self) -> Duration {
        self.quantum
    }

    pub fn issue(&self, label: &str) -> BoundedHandle {
        let handle = BoundedHandle::with_quantum(format!("{}/{label}", self.name), self.quantum);
        self.handles.lock().push(handle.clone());
        handle
    }

    pub fn kill_all(&self) {
        let handles: Vec<BoundedHandle> = self.handles.lock().drain(..).collect();
        for handle in &handles {
            handle.kill();
        }
        if !handles.is_empty() {
            tracing::debug!("[lease] {} released {} handle(s)", self.name, handles.len());
        }
    }

    pub fn kill_all_after(&self, grace: Duration) {
        for handle in self.handles.lock().iter() {
            handle.kill_after(grace);
        }
    }

    /// Renews every live handle and forgets the dead ones.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        self.handles.lock().retain(|handle| {
            if handle.renew().is_zero() {
                report.reclaimed += 1;
                false
            } else {
                report.renewed += 1;
                true
            }
        });
        report
    }

    pub fn live_count(&self) -> usize {
        self.handles.lock().iter().filter(|handle| handle.is_live()).count()
    }

    pub fn handles(&self) -> Vec<BoundedHandle> {
        self.handles.lock().clone()
    }
}
