use parking_lot::Mutex;

use crate::region::ListenerId;

/// Script-side handlers for one event source.
///
/// The first added handler attaches exactly one real listener; removing the last one detaches it.
#[derive(Default)]
pub struct HandlerSet {
    state: Mutex<HandlerState>,
}

#[derive(Default)]
struct HandlerState {
    handlers: Vec<String>,
    listener: Option<ListenerId>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when this call attached the real listener.
    pub fn add(&self, handler: &str, attach: impl FnOnce() -> ListenerId) -> bool {
        let mut state = self.state.lock();
        state.handlers.push(handler.to_string());
        if state.listener.is_some() {
            return false;
        }
        state.listener = Some(attach());
        true
    }

    /// Returns true when this call detached the real listener.
    pub fn remove(&self, handler: &str, detach: impl FnOnce(ListenerId)) -> bool {
        let mut state = self.state.lock();
        let Some(index) = state.handlers.iter().position(|existing| existing == handler) else {
            return false;
        };
        state.handlers.remove(index);
        if !state.handlers.is_empty() {
            return false;
        }
        match state.listener.take() {
            Some(id) => {
                detach(id);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self, detach: impl FnOnce(ListenerId)) -> bool {
        let mut state = self.state.lock();
        state.handlers.clear();
        match state.listener.take() {
            Some(id) => {
                detach(id);
                true
            }
            None => false,
        }
    }

    pub fn handlers(&self) -> Vec<String> {
        self.state.lock().handlers.clone()
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().listener.is_some()
    }

    pub fn len(&self) -> usize {
        self.state.lock().handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn attaches_once_and_detaches_on_last_removal() {
        let set = HandlerSet::new();
        let attaches = Cell::new(0);
        let detaches = Cell::new(0);
        assert!(set.add("a", || {
            attaches.set(attaches.get() + 1);
            7
        }));
        assert!(!set.add("b", || {
            attaches.set(attaches.get() + 1);
            8
        }));
        assert_eq!(attaches.get(), 1);
        assert!(!set.remove("a", |_| detaches.set(detaches.get() + 1)));
        assert!(set.is_attached());
        assert!(set.remove("b", |id| {
            assert_eq!(id, 7);
            detaches.set(detaches.get() + 1);
        }));
        assert_eq!(detaches.get(), 1);
        assert!(!set.is_attached());
    }

    #[test]
    fn removing_unknown_handler_is_ignored() {
        let set = HandlerSet::new();
        set.add("a", || 1);
        assert!(!set.remove("missing", |_| panic!("must not detach")));
        assert_eq!(set.handlers(), vec!["a".to_string()]);
    }

    #[test]
    fn duplicate_handlers_are_kept_per_registration() {
        let set = HandlerSet::new();
        set.add("a", || 1);
        set.add("a", || 2);
        assert_eq!(set.len(), 2);
        assert!(!set.remove("a", |_| panic!("one registration remains")));
        assert!(set.clear(|id| assert_eq!(id, 1)));
        assert!(set.is_empty());
    }
}
