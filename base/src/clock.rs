// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

// The emulated machine keeps its own notion of time: a monotonic clock in
// guest nanoseconds that only moves when the surrounding emulator advances it.
// Timers register deadlines here and learn about expiration when the machine
// loop calls `add_ns`.

/// Token identifying a timer registered on a [`Clock`].
///
/// Tokens are minted by [`Clock::allocate_token`] and are unique for the
/// lifetime of the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerToken(u64);

/// A monotonic virtual clock with a deadline registry.
///
/// All mutation happens on the single emulation thread; the clock is shared
/// between the machine loop and the timers via `Rc<RefCell<Clock>>`.
#[derive(Debug, Default)]
pub struct Clock {
    ns_since_epoch: u64,
    next_token: u64,
    deadlines: Vec<(u64, TimerToken)>,
}

impl Clock {
    pub fn new() -> Self {
        Default::default()
    }

    /// Current time in guest nanoseconds.
    pub fn nanos(&self) -> u64 {
        self.ns_since_epoch
    }

    /// Mints a token for a new timer.
    pub fn allocate_token(&mut self) -> TimerToken {
        let token = TimerToken(self.next_token);
        self.next_token += 1;
        token
    }

    /// Registers a wake-up for `token` when the clock reaches `deadline_ns`.
    /// Drops any deadline previously registered for the same token.
    pub fn add_event(&mut self, deadline_ns: u64, token: TimerToken) {
        self.deadlines.retain(|&(_, t)| t != token);
        self.deadlines.push((deadline_ns, token));
    }

    /// Removes any pending deadline for `token`.
    pub fn remove_event(&mut self, token: TimerToken) {
        self.deadlines.retain(|&(_, t)| t != token);
    }

    /// Advances the clock by `ns` and returns the tokens whose deadlines were
    /// reached, in deadline order.
    pub fn add_ns(&mut self, ns: u64) -> Vec<TimerToken> {
        self.ns_since_epoch += ns;
        let now = self.ns_since_epoch;
        let mut expired: Vec<(u64, TimerToken)> = Vec::new();
        self.deadlines.retain(|&(deadline, token)| {
            if deadline <= now {
                expired.push((deadline, token));
                false
            } else {
                true
            }
        });
        expired.sort_by_key(|&(deadline, _)| deadline);
        expired.into_iter().map(|(_, token)| token).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_ns_fires_in_deadline_order() {
        let mut clock = Clock::new();
        let a = clock.allocate_token();
        let b = clock.allocate_token();
        clock.add_event(300, a);
        clock.add_event(100, b);

        assert_eq!(clock.add_ns(50), vec![]);
        assert_eq!(clock.add_ns(250), vec![b, a]);
        assert_eq!(clock.nanos(), 300);
    }

    #[test]
    fn reregistering_token_replaces_deadline() {
        let mut clock = Clock::new();
        let t = clock.allocate_token();
        clock.add_event(100, t);
        clock.add_event(500, t);

        assert_eq!(clock.add_ns(100), vec![]);
        assert_eq!(clock.add_ns(400), vec![t]);
    }

    #[test]
    fn removed_event_does_not_fire() {
        let mut clock = Clock::new();
        let t = clock.allocate_token();
        clock.add_event(100, t);
        clock.remove_event(t);
        assert_eq!(clock.add_ns(1000), vec![]);
    }
}
