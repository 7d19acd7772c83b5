//! Single-shot close bookkeeping shared by every kind of session sink.

use crate::error::CloseReason;
use shared::PlayerIndex;
use std::collections::VecDeque;

/// Notified once when a session closes.
pub trait CloseListener: Send {
    fn on_close(&mut self, player: PlayerIndex, reason: &CloseReason);
}

impl<F> CloseListener for F
where
    F: FnMut(PlayerIndex, &CloseReason) + Send,
{
    fn on_close(&mut self, player: PlayerIndex, reason: &CloseReason) {
        self(player, reason)
    }
}

/// Guards the closing transition of one session.
///
/// The first call to [`CloseGuard::begin`] wins; every later call is a
/// no-op. Listeners are popped off the front as they run, so each one fires
/// at most once and a listener can never be re-entered. Registering a
/// listener on a guard that has already fired does nothing.
#[derive(Default)]
pub struct CloseGuard {
    reason: Option<CloseReason>,
    listeners: VecDeque<Box<dyn CloseListener>>,
}

impl CloseGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: Box<dyn CloseListener>) {
        if self.reason.is_none() {
            self.listeners.push_back(listener);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.reason.is_some()
    }

    pub fn reason(&self) -> Option<&CloseReason> {
        self.reason.as_ref()
    }

    /// Marks the guard closed. Returns false if it already was.
    pub fn begin(&mut self, reason: CloseReason) -> bool {
        if self.reason.is_some() {
            return false;
        }
        self.reason = Some(reason);
        true
    }

    /// Runs and discards every registered listener.
    pub fn notify(&mut self, player: PlayerIndex) {
        let Some(reason) = self.reason.clone() else {
            return;
        };
        while let Some(mut listener) = self.listeners.pop_front() {
            listener.on_close(player, &reason);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_listener(counter: &Arc<AtomicUsize>) -> Box<dyn CloseListener> {
        let counter = Arc::clone(counter);
        Box::new(move |_: PlayerIndex, _: &CloseReason| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_listeners_fire_once_across_repeated_closes() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut guard = CloseGuard::new();
        guard.register(counting_listener(&counter));
        guard.register(counting_listener(&counter));

        assert!(guard.begin(CloseReason::ReadError("boom".into())));
        guard.notify(3);
        assert!(!guard.begin(CloseReason::Kicked("again".into())));
        guard.notify(3);

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(guard.listener_count(), 0);
        assert_eq!(guard.reason(), Some(&CloseReason::ReadError("boom".into())));
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut guard = CloseGuard::new();
        for tag in 0..3 {
            let order = Arc::clone(&order);
            guard.register(Box::new(move |_: PlayerIndex, _: &CloseReason| {
                order.lock().unwrap().push(tag);
            }));
        }
        guard.begin(CloseReason::Exit);
        guard.notify(0);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_register_after_close_is_ignored() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut guard = CloseGuard::new();
        guard.begin(CloseReason::Exit);
        guard.register(counting_listener(&counter));
        guard.notify(1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_notify_before_begin_does_nothing() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut guard = CloseGuard::new();
        guard.register(counting_listener(&counter));
        guard.notify(1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(guard.listener_count(), 1);
    }
}
