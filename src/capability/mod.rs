//! Forwarding wrappers that expose a restricted view of the region to a running module.
//!
//! Every wrapper owns a [`BoundedHandle`](crate::lease::BoundedHandle) issued from the run's
//! [`LeaseScope`], checks it before each call, and enforces the trust-policy grants and the
//! script credential's edit rights before forwarding to the [`RegionWorld`].

pub mod dispatch;
pub mod graphics;
pub mod heightmap;
pub mod host;
pub mod object;
pub mod persistence;
pub mod scheduler;
pub mod subscription;
pub mod world;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CapabilityError;
use crate::lease::LeaseScope;
use crate::policy::{Grants, TrustPolicy};
use crate::region::{Credential, PrincipalId, RegionWorld};

pub use dispatch::{DispatchMode, EventDispatcher, HandlerCall};
pub use graphics::GraphicsCapability;
pub use heightmap::HeightmapCapability;
pub use host::HostCapability;
pub use object::{ObjectCapability, ObjectsCapability};
pub use persistence::PersistenceCapability;
pub use scheduler::SchedulerCapability;
pub use world::WorldCapability;

/// Live wrapper and listener counts, shared by every run of one engine.
#[derive(Debug, Default)]
pub struct CapabilityCounters {
    worlds_total: AtomicUsize,
    worlds_current: AtomicUsize,
    objects_total: AtomicUsize,
    objects_current: AtomicUsize,
    touch_listeners: AtomicUsize,
    chat_listeners: AtomicUsize,
    new_user_listeners: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub worlds_total: usize,
    pub worlds_current: usize,
    pub objects_total: usize,
    pub objects_current: usize,
    pub touch_listeners: usize,
    pub chat_listeners: usize,
    pub new_user_listeners: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Counter {
    World,
    Object,
    Touch,
    Chat,
    NewUser,
}

impl CapabilityCounters {
    pub(crate) fn created(&self, counter: Counter) {
        match counter {
            Counter::World => {
                self.worlds_total.fetch_add(1, Ordering::Relaxed);
                self.worlds_current.fetch_add(1, Ordering::Relaxed);
            }
            Counter::Object => {
                self.objects_total.fetch_add(1, Ordering::Relaxed);
                self.objects_current.fetch_add(1, Ordering::Relaxed);
            }
            Counter::Touch => {
                self.touch_listeners.fetch_add(1, Ordering::Relaxed);
            }
            Counter::Chat => {
                self.chat_listeners.fetch_add(1, Ordering::Relaxed);
            }
            Counter::NewUser => {
                self.new_user_listeners.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn released(&self, counter: Counter) {
        let slot = match counter {
            Counter::World => &self.worlds_current,
            Counter::Object => &self.objects_current,
            Counter::Touch => &self.touch_listeners,
            Counter::Chat => &self.chat_listeners,
            Counter::NewUser => &self.new_user_listeners,
        };
        let _ = slot.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| Some(value.saturating_sub(1)));
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            worlds_total: self.worlds_total.load(Ordering::Relaxed),
            worlds_current: self.worlds_current.load(Ordering::Relaxed),
            objects_total: self.objects_total.load(Ordering::Relaxed),
            objects_current: self.objects_current.load(Ordering::Relaxed),
            touch_listeners: self.touch_listeners.load(Ordering::Relaxed),
            chat_listeners: self.chat_listeners.load(Ordering::Relaxed),
            new_user_listeners: self.new_user_listeners.load(Ordering::Relaxed),
        }
    }
}

/// What every wrapper of one script run shares.
#[derive(Clone)]
pub struct CapabilityContext {
    pub(crate) region: Arc<dyn RegionWorld>,
    pub(crate) credential: Credential,
    pub(crate) policy: Arc<TrustPolicy>,
    pub(crate) leases: LeaseScope,
    pub(crate) dispatcher: Arc<EventDispatcher>,
    pub(crate) counters: Arc<CapabilityCounters>,
    pub(crate) script_id: Uuid,
    pub(crate) script_name: Arc<str>,
}

impl CapabilityContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        region: Arc<dyn RegionWorld>,
        credential: Credential,
        policy: Arc<TrustPolicy>,
        leases: LeaseScope,
        dispatcher: Arc<EventDispatcher>,
        counters: Arc<CapabilityCounters>,
        script_id: Uuid,
        script_name: &str,
    ) -> Self {
        Self { region, credential, policy, leases, dispatcher, counters, script_id, script_name: script_name.into() }
    }

    pub fn credential(&self) -> Credential {
        self.credential
    }

    pub fn leases(&self) -> &LeaseScope {
        &self.leases
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub(crate) fn require(&self, grant: Grants) -> Result<(), CapabilityError> {
        if self.policy.allows(grant) {
            Ok(())
        } else {
            Err(CapabilityError::NotGranted { policy: self.policy.name.clone(), grant: grant.label().to_string() })
        }
    }

    pub(crate) fn require_edit(&self, owner: PrincipalId, target: impl fmt::Display) -> Result<(), CapabilityError> {
        if self.credential.can_edit(owner) {
            Ok(())
        } else {
            Err(CapabilityError::PermissionDenied {
                principal: self.region.display_name(self.credential.principal),
                target: target.to_string(),
            })
        }
    }
}
