use crate::details::icmp::SequenceNumber;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// How a sequence ended when its reply showed up.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Outcome {
    Replied(Duration),
    /// The reply came in after the deadline, before the sweep noticed.
    TimedOut,
}

/// Requests that were sent and still wait for a reply or their deadline.
///
/// Every entry is removed exactly once, whichever path gets to it first; the
/// other path then finds nothing and does nothing.
pub(crate) struct OutstandingRequests {
    timeout: Duration,
    send_times: BTreeMap<SequenceNumber, Instant>,
}

impl OutstandingRequests {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self { timeout, send_times: BTreeMap::new() }
    }

    pub(crate) fn insert(&mut self, sequence: SequenceNumber, send_time: Instant) {
        self.send_times.insert(sequence, send_time);
    }

    pub(crate) fn complete(&mut self, sequence: SequenceNumber, receive_time: Instant) -> Option<Outcome> {
        let send_time = self.send_times.remove(&sequence)?;
        let elapsed = receive_time.saturating_duration_since(send_time);
        if elapsed > self.timeout {
            Some(Outcome::TimedOut)
        } else {
            Some(Outcome::Replied(elapsed))
        }
    }

    /// Removes every entry whose deadline is not after `now`, in sequence order.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<SequenceNumber> {
        let expired: Vec<SequenceNumber> = self
            .send_times
            .iter()
            .filter(|(_, &send_time)| send_time + self.timeout <= now)
            .map(|(&sequence, _)| sequence)
            .collect();
        for sequence in &expired {
            self.send_times.remove(sequence);
        }
        expired
    }

    pub(crate) fn earliest_deadline(&self) -> Option<Instant> {
        self.send_times.values().map(|&send_time| send_time + self.timeout).min()
    }

    pub(crate) fn clear(&mut self) -> usize {
        let n = self.send_times.len();
        self.send_times.clear();
        n
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.send_times.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(500);

    #[test]
    fn reply_completes_once() {
        let mut outstanding = OutstandingRequests::new(TIMEOUT);
        let send_time = Instant::now();
        outstanding.insert(SequenceNumber::from(1), send_time);

        let first = outstanding.complete(SequenceNumber::from(1), send_time + Duration::from_millis(3));
        let second = outstanding.complete(SequenceNumber::from(1), send_time + Duration::from_millis(4));

        assert_eq!(Some(Outcome::Replied(Duration::from_millis(3))), first);
        assert_eq!(None, second);
        assert!(outstanding.is_empty());
    }

    #[test]
    fn late_reply_counts_as_timeout() {
        let mut outstanding = OutstandingRequests::new(TIMEOUT);
        let send_time = Instant::now();
        outstanding.insert(SequenceNumber::from(1), send_time);

        let outcome = outstanding.complete(SequenceNumber::from(1), send_time + TIMEOUT + Duration::from_millis(1));

        assert_eq!(Some(Outcome::TimedOut), outcome);
    }

    #[test]
    fn expire_removes_due_entries_in_order() {
        let mut outstanding = OutstandingRequests::new(TIMEOUT);
        let start = Instant::now();
        outstanding.insert(SequenceNumber::from(2), start + Duration::from_millis(100));
        outstanding.insert(SequenceNumber::from(1), start);
        outstanding.insert(SequenceNumber::from(3), start + Duration::from_millis(900));

        let expired = outstanding.expire(start + Duration::from_millis(600));

        assert_eq!(vec![SequenceNumber::from(1), SequenceNumber::from(2)], expired);
        assert_eq!(Some(start + Duration::from_millis(900) + TIMEOUT), outstanding.earliest_deadline());
        // expired entries cannot be completed any more
        assert_eq!(None, outstanding.complete(SequenceNumber::from(1), start));
    }

    #[test]
    fn clear_drops_everything() {
        let mut outstanding = OutstandingRequests::new(TIMEOUT);
        outstanding.insert(SequenceNumber::from(1), Instant::now());
        outstanding.insert(SequenceNumber::from(2), Instant::now());

        assert_eq!(2, outstanding.clear());
        assert!(outstanding.is_empty());
        assert_eq!(None, outstanding.earliest_deadline());
    }
}
