//! Named timeouts for a single owner, built on selector alarms.
//!
//! A connection keeps one `Timeouter` and arms timeouts under small integer
//! ids; re-arming an id replaces its alarm, clearing erases it, and firing
//! removes the entry before invoking the owner's callback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::selector::{AlarmId, Selector};

/// Identifies one of the owner's timeouts.
pub type TimeoutId = i64;

pub struct Timeouter {
    selector: Arc<Selector>,
    callback: Arc<dyn Fn(TimeoutId) + Send + Sync>,
    timeouts: Arc<Mutex<HashMap<TimeoutId, AlarmId>>>,
}

impl Timeouter {
    pub fn new(
        selector: Arc<Selector>,
        callback: impl Fn(TimeoutId) + Send + Sync + 'static,
    ) -> Timeouter {
        Timeouter {
            selector,
            callback: Arc::new(callback),
            timeouts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Arms (or re-arms) the timeout `timeout_id` to fire after `timeout`.
    pub fn set_timeout(&self, timeout_id: TimeoutId, timeout: Duration) {
        let callback = self.callback.clone();
        let timeouts = self.timeouts.clone();
        // The map entry is installed under the lock before the alarm can
        // observe it, so a minimal timeout cannot race its own bookkeeping.
        let mut map = self.timeouts.lock().unwrap();
        let alarm_id = self.selector.register_alarm(
            move || {
                // The entry may have been cleared or re-armed since this
                // alarm was scheduled; fire only if it is still ours.
                let fired = timeouts.lock().unwrap().remove(&timeout_id).is_some();
                if fired {
                    callback(timeout_id);
                }
            },
            timeout,
        );
        if let Some(previous) = map.insert(timeout_id, alarm_id) {
            self.selector.unregister_alarm(previous);
        }
    }

    /// Clears a pending timeout. Returns true if one was armed.
    pub fn clear_timeout(&self, timeout_id: TimeoutId) -> bool {
        let Some(alarm_id) = self.timeouts.lock().unwrap().remove(&timeout_id) else {
            return false;
        };
        self.selector.unregister_alarm(alarm_id);
        true
    }

    /// Clears every pending timeout; called during owner teardown.
    pub fn clear_all_timeouts(&self) {
        let mut timeouts = self.timeouts.lock().unwrap();
        for (_, alarm_id) in timeouts.drain() {
            self.selector.unregister_alarm(alarm_id);
        }
    }
}

impl Drop for Timeouter {
    fn drop(&mut self) {
        self.clear_all_timeouts();
    }
}
