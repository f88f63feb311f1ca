// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::clock::Clock;
use crate::clock::TimerToken;

/// A one-shot timer armed against a shared [`Clock`].
///
/// The timer does not deliver its own expiration: the machine loop advances
/// the clock, receives the expired [`TimerToken`]s, and routes each back to
/// the owner of the matching timer. Re-arming and periodic scheduling are the
/// owner's business.
pub struct Timer {
    clock: Rc<RefCell<Clock>>,
    token: TimerToken,
    deadline_ns: Option<u64>,
}

impl Timer {
    /// Creates a new timer. The timer is initially disarmed and must be armed
    /// by calling `reset_oneshot`.
    pub fn new(clock: Rc<RefCell<Clock>>) -> Timer {
        let token = clock.borrow_mut().allocate_token();
        Timer {
            clock,
            token,
            deadline_ns: None,
        }
    }

    /// The token the clock reports when this timer expires.
    pub fn token(&self) -> TimerToken {
        self.token
    }

    /// Sets the timer to expire after `dur`. Cancels any existing deadline.
    pub fn reset_oneshot(&mut self, dur: Duration) {
        let mut clock = self.clock.borrow_mut();
        let deadline = clock.nanos() + dur.as_nanos() as u64;
        self.deadline_ns = Some(deadline);
        clock.add_event(deadline, self.token);
    }

    /// Disarms the timer.
    pub fn clear(&mut self) {
        self.deadline_ns = None;
        self.clock.borrow_mut().remove_event(self.token);
    }

    /// True if a deadline is armed and not yet reached.
    pub fn is_armed(&self) -> bool {
        match self.deadline_ns {
            Some(deadline) => deadline > self.clock.borrow().nanos(),
            None => false,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.clock.borrow_mut().remove_event(self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot() {
        let clock = Rc::new(RefCell::new(Clock::new()));
        let mut timer = Timer::new(clock.clone());

        timer.reset_oneshot(Duration::from_nanos(200));
        assert!(timer.is_armed());

        assert_eq!(clock.borrow_mut().add_ns(100), vec![]);
        assert_eq!(clock.borrow_mut().add_ns(100), vec![timer.token()]);
        assert!(!timer.is_armed());
    }

    #[test]
    fn cleared_timer_does_not_expire() {
        let clock = Rc::new(RefCell::new(Clock::new()));
        let mut timer = Timer::new(clock.clone());

        timer.reset_oneshot(Duration::from_nanos(100));
        timer.clear();
        assert_eq!(clock.borrow_mut().add_ns(1000), vec![]);
    }

    #[test]
    fn rearm_replaces_deadline() {
        let clock = Rc::new(RefCell::new(Clock::new()));
        let mut timer = Timer::new(clock.clone());

        timer.reset_oneshot(Duration::from_nanos(100));
        timer.reset_oneshot(Duration::from_nanos(500));

        assert_eq!(clock.borrow_mut().add_ns(100), vec![]);
        assert_eq!(clock.borrow_mut().add_ns(400), vec![timer.token()]);
    }

    #[test]
    fn dropped_timer_unregisters() {
        let clock = Rc::new(RefCell::new(Clock::new()));
        let mut timer = Timer::new(clock.clone());
        timer.reset_oneshot(Duration::from_nanos(100));
        drop(timer);
        assert_eq!(clock.borrow_mut().add_ns(1000), vec![]);
    }
}
