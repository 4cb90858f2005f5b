//! # Message EndPoint
//!
//! Correlates RPC responses with the calls that are waiting for them.
//!
//! ## Design
//!
//! ```text
//! acquire ──> serial ──> request frame ──> remote
//!    │                                        │
//!    └─ PendingCall <── set_result <── response frame (same serial)
//! ```
//!
//! - Serials are never 0 and never reused while a call is outstanding
//! - Each call resolves exactly once: response, timeout, disconnect or
//!   cancellation
//! - Deadlines are checked by [`EndPoint::expire`], which the peers run on
//!   every `update()`; a response arriving after that finds an unknown
//!   serial and is dropped
//!
//! The endpoint is owned by the poll thread. Callers hold only the
//! receiving half of a `tokio::sync::oneshot`, so they may wait on any
//! thread or await from any executor.

mod pending;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use skein_core::codec::Message;
use tracing::debug;

use crate::connection::ConnectionId;

use self::pending::{Delivery, Failure, FanOutSlot, SingleSlot, Slot};

pub use self::pending::{CallOutcome, FanOutCall, FanOutResults, PendingCall};

struct Entry {
    deadline: Instant,
    slot: Box<dyn Slot>,
}

/// Table of outstanding calls.
pub struct EndPoint {
    next_serial: u32,
    entries: HashMap<u32, Entry>,
}

impl EndPoint {
    /// Creates an empty endpoint.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_serial: 1,
            entries: HashMap::new(),
        }
    }

    fn allocate_serial(&mut self) -> u32 {
        loop {
            let serial = self.next_serial;
            self.next_serial = self.next_serial.wrapping_add(1);
            if serial != 0 && !self.entries.contains_key(&serial) {
                return serial;
            }
        }
    }

    /// Opens a call expecting a `T` response within `timeout`.
    ///
    /// `target` is the connection the request goes to, so the call fails
    /// with [`CallOutcome::Disconnected`] when that connection closes.
    pub fn acquire<T: Message>(
        &mut self,
        timeout: Duration,
        target: Option<ConnectionId>,
    ) -> (u32, PendingCall<T>) {
        let serial = self.allocate_serial();
        let (slot, rx) = SingleSlot::<T>::new(target);
        self.entries.insert(
            serial,
            Entry {
                deadline: Instant::now() + timeout,
                slot: Box::new(slot),
            },
        );
        (serial, PendingCall::new(serial, rx))
    }

    /// Opens one call answered by several connections, each identified by
    /// its cookie.
    ///
    /// An empty target list resolves immediately with no results.
    pub fn acquire_fan_out<T: Message>(
        &mut self,
        timeout: Duration,
        targets: &[(u32, ConnectionId)],
    ) -> (u32, FanOutCall<T>) {
        let serial = self.allocate_serial();
        let (mut slot, rx) = FanOutSlot::<T>::new(targets);
        let ids = targets.iter().map(|&(_, id)| id).collect();
        if targets.is_empty() {
            slot.fail(Failure::Cancelled);
        } else {
            self.entries.insert(
                serial,
                Entry {
                    deadline: Instant::now() + timeout,
                    slot: Box::new(slot),
                },
            );
        }
        (serial, FanOutCall::new(serial, ids, rx))
    }

    /// Completes a single call with a response frame (`[type id][payload]`).
    ///
    /// Returns false for unknown or already resolved serials.
    pub fn set_result(&mut self, serial: u32, frame: &[u8]) -> bool {
        self.deliver(serial, None, None, frame)
    }

    /// Completes the part of a call identified by `cookie`.
    ///
    /// Single calls ignore the cookie.
    pub fn set_result_with_cookie(&mut self, serial: u32, cookie: u32, frame: &[u8]) -> bool {
        self.deliver(serial, None, Some(cookie), frame)
    }

    /// Completes a call with a response received from `sender`.
    ///
    /// The response only counts if `sender` is the connection the call (or
    /// the part named by `cookie`) was addressed to, so one remote cannot
    /// answer for another. Calls opened without a target accept any sender.
    pub fn set_result_from(&mut self, serial: u32, sender: ConnectionId, cookie: u32, frame: &[u8]) -> bool {
        self.deliver(serial, Some(sender), Some(cookie), frame)
    }

    fn deliver(&mut self, serial: u32, sender: Option<ConnectionId>, cookie: Option<u32>, frame: &[u8]) -> bool {
        let Some(entry) = self.entries.get_mut(&serial) else {
            debug!(serial, "Response for unknown serial dropped");
            return false;
        };
        match entry.slot.deliver(sender, cookie, frame) {
            Delivery::Done => {
                self.entries.remove(&serial);
                true
            }
            Delivery::Partial => true,
            Delivery::Rejected => {
                debug!(serial, ?sender, ?cookie, "Response rejected");
                false
            }
        }
    }

    /// Returns true while `serial` is outstanding.
    #[must_use]
    pub fn checked(&self, serial: u32) -> bool {
        self.entries.contains_key(&serial)
    }

    /// Resolves every call whose deadline is at or before `now` with
    /// [`CallOutcome::Timeout`]. Returns how many expired.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(&serial, _)| serial)
            .collect();
        for serial in &expired {
            if let Some(mut entry) = self.entries.remove(serial) {
                entry.slot.fail(Failure::Timeout);
                debug!(serial, "Call timed out");
            }
        }
        expired.len()
    }

    /// Resolves every call part addressed to `id` with
    /// [`CallOutcome::Disconnected`]. Returns how many calls were touched.
    pub fn cancel_for(&mut self, id: ConnectionId) -> usize {
        let mut touched = 0;
        self.entries.retain(|_, entry| {
            if !entry.slot.targets(id) {
                return true;
            }
            touched += 1;
            entry.slot.fail_target(id, Failure::Disconnected) != Delivery::Done
        });
        if touched > 0 {
            debug!(%id, touched, "Calls cancelled by disconnect");
        }
        touched
    }

    /// Resolves the part of call `serial` addressed to `id` with
    /// [`CallOutcome::Disconnected`], e.g. when its request could not be sent.
    pub fn cancel_target(&mut self, serial: u32, id: ConnectionId) -> bool {
        let Some(entry) = self.entries.get_mut(&serial) else {
            return false;
        };
        match entry.slot.fail_target(id, Failure::Disconnected) {
            Delivery::Done => {
                self.entries.remove(&serial);
                true
            }
            Delivery::Partial => true,
            Delivery::Rejected => false,
        }
    }

    /// Resolves one call with [`CallOutcome::Cancelled`].
    pub fn cancel(&mut self, serial: u32) -> bool {
        match self.entries.remove(&serial) {
            Some(mut entry) => {
                entry.slot.fail(Failure::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Resolves every outstanding call with [`CallOutcome::Cancelled`].
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        for (_, mut entry) in self.entries.drain() {
            entry.slot.fail(Failure::Cancelled);
        }
        count
    }

    /// Number of outstanding calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for EndPoint {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::codec::encode_frame;
    use skein_shared::{EchoResponse, Ping, Pong};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn echo_frame(text: &str, served: u32) -> Vec<u8> {
        let mut frame = Vec::new();
        encode_frame(
            &EchoResponse {
                text: text.into(),
                served,
            },
            &mut frame,
        )
        .unwrap();
        frame
    }

    #[test]
    fn test_serials_distinct_and_nonzero() {
        let mut endpoint = EndPoint::new();
        endpoint.next_serial = u32::MAX;
        let (a, _call_a) = endpoint.acquire::<Pong>(TIMEOUT, None);
        let (b, _call_b) = endpoint.acquire::<Pong>(TIMEOUT, None);
        assert_eq!(a, u32::MAX);
        assert_eq!(b, 1);

        // Wrapping back onto an outstanding serial skips it.
        endpoint.next_serial = u32::MAX;
        let (c, _call_c) = endpoint.acquire::<Pong>(TIMEOUT, None);
        assert_eq!(c, 2);
    }

    #[test]
    fn test_results_are_isolated() {
        let mut endpoint = EndPoint::new();
        let (first, mut call_first) = endpoint.acquire::<EchoResponse>(TIMEOUT, None);
        let (second, mut call_second) = endpoint.acquire::<EchoResponse>(TIMEOUT, None);

        assert!(endpoint.set_result(second, &echo_frame("two", 2)));
        assert_eq!(call_first.try_outcome(), None);
        assert_eq!(
            call_second.try_outcome(),
            Some(CallOutcome::Completed(EchoResponse {
                text: "two".into(),
                served: 2
            }))
        );

        assert!(endpoint.checked(first));
        assert!(!endpoint.checked(second));
        assert!(!endpoint.set_result(second, &echo_frame("again", 3)));
        assert_eq!(endpoint.len(), 1);
    }

    #[test]
    fn test_type_mismatch_is_invalid() {
        let mut endpoint = EndPoint::new();
        let (serial, mut call) = endpoint.acquire::<Pong>(TIMEOUT, None);
        assert!(endpoint.set_result(serial, &echo_frame("x", 1)));
        assert_eq!(call.try_outcome(), Some(CallOutcome::Invalid));

        let (serial, mut call) = endpoint.acquire::<Pong>(TIMEOUT, None);
        assert!(endpoint.set_result(serial, &[2]));
        assert_eq!(call.try_outcome(), Some(CallOutcome::Invalid));
    }

    #[test]
    fn test_timeout_then_late_response_dropped() {
        let mut endpoint = EndPoint::new();
        let (serial, mut call) = endpoint.acquire::<EchoResponse>(Duration::from_millis(10), None);
        let (_, mut other) = endpoint.acquire::<EchoResponse>(TIMEOUT, None);

        assert_eq!(endpoint.expire(Instant::now() + Duration::from_millis(20)), 1);
        assert_eq!(call.try_outcome(), Some(CallOutcome::Timeout));
        assert_eq!(other.try_outcome(), None);
        assert!(!endpoint.set_result(serial, &echo_frame("late", 1)));
    }

    #[test]
    fn test_disconnect_cancels_only_its_calls() {
        let mut endpoint = EndPoint::new();
        let (_, mut to_one) = endpoint.acquire::<Pong>(TIMEOUT, Some(ConnectionId(1)));
        let (_, mut to_two) = endpoint.acquire::<Pong>(TIMEOUT, Some(ConnectionId(2)));

        assert_eq!(endpoint.cancel_for(ConnectionId(1)), 1);
        assert_eq!(to_one.try_outcome(), Some(CallOutcome::Disconnected));
        assert_eq!(to_two.try_outcome(), None);

        assert_eq!(endpoint.clear(), 1);
        assert_eq!(to_two.try_outcome(), Some(CallOutcome::Cancelled));
        assert!(endpoint.is_empty());
    }

    #[test]
    fn test_fan_out_collects_every_target() {
        let mut endpoint = EndPoint::new();
        let targets = [(1, ConnectionId(1)), (2, ConnectionId(2)), (3, ConnectionId(3))];
        let (serial, mut call) = endpoint.acquire_fan_out::<EchoResponse>(TIMEOUT, &targets);

        assert!(endpoint.set_result_with_cookie(serial, 2, &echo_frame("b", 1)));
        assert!(!endpoint.set_result_with_cookie(serial, 2, &echo_frame("b", 2)));
        assert!(!endpoint.set_result_with_cookie(serial, 9, &echo_frame("?", 0)));
        assert!(!endpoint.set_result(serial, &echo_frame("no cookie", 0)));
        assert_eq!(call.try_outcome(), None);

        assert_eq!(endpoint.cancel_for(ConnectionId(3)), 1);
        assert!(endpoint.set_result_with_cookie(serial, 1, &echo_frame("a", 1)));

        let results = call.try_outcome().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, ConnectionId(1));
        assert!(results[0].1.is_completed());
        assert_eq!(results[1].1.clone().completed().unwrap().text, "b");
        assert_eq!(results[2], (ConnectionId(3), CallOutcome::Disconnected));
        assert!(!endpoint.checked(serial));
    }

    #[test]
    fn test_response_from_wrong_sender_rejected() {
        let mut endpoint = EndPoint::new();
        let (serial, mut call) = endpoint.acquire::<EchoResponse>(TIMEOUT, Some(ConnectionId(1)));
        assert!(!endpoint.set_result_from(serial, ConnectionId(2), 0, &echo_frame("forged", 0)));
        assert_eq!(call.try_outcome(), None);
        assert!(endpoint.set_result_from(serial, ConnectionId(1), 0, &echo_frame("real", 1)));
        assert!(call.try_outcome().unwrap().is_completed());

        let targets = [(1, ConnectionId(1)), (2, ConnectionId(2))];
        let (serial, mut call) = endpoint.acquire_fan_out::<EchoResponse>(TIMEOUT, &targets);
        // Connection 2 claims connection 1's cookie.
        assert!(!endpoint.set_result_from(serial, ConnectionId(2), 1, &echo_frame("forged", 0)));
        assert!(endpoint.set_result_from(serial, ConnectionId(2), 2, &echo_frame("b", 2)));
        assert!(endpoint.set_result_from(serial, ConnectionId(1), 1, &echo_frame("a", 1)));
        let results = call.try_outcome().unwrap();
        assert_eq!(results[0].1.clone().completed().unwrap().text, "a");

        let (serial, mut call) = endpoint.acquire::<EchoResponse>(TIMEOUT, None);
        assert!(endpoint.set_result_from(serial, ConnectionId(7), 0, &echo_frame("any", 0)));
        assert!(call.try_outcome().unwrap().is_completed());
    }

    #[test]
    fn test_fan_out_timeout_keeps_answers() {
        let mut endpoint = EndPoint::new();
        let targets = [(1, ConnectionId(1)), (2, ConnectionId(2))];
        let (serial, mut call) = endpoint.acquire_fan_out::<EchoResponse>(Duration::ZERO, &targets);
        assert!(endpoint.set_result_with_cookie(serial, 1, &echo_frame("a", 1)));

        assert_eq!(endpoint.expire(Instant::now()), 1);
        let results = call.try_outcome().unwrap();
        assert!(results[0].1.is_completed());
        assert_eq!(results[1].1, CallOutcome::Timeout);
    }

    #[test]
    fn test_empty_fan_out_resolves_immediately() {
        let mut endpoint = EndPoint::new();
        let (_, mut call) = endpoint.acquire_fan_out::<Pong>(TIMEOUT, &[]);
        assert_eq!(call.try_outcome(), Some(Vec::new()));
        assert!(endpoint.is_empty());
    }

    #[test]
    fn test_dropped_endpoint_cancels() {
        let mut endpoint = EndPoint::new();
        let (_, call) = endpoint.acquire::<Pong>(TIMEOUT, None);
        drop(endpoint);
        assert_eq!(call.wait(), CallOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_pending_call_is_awaitable() {
        let mut endpoint = EndPoint::new();
        let (serial, call) = endpoint.acquire::<Pong>(TIMEOUT, Some(ConnectionId(4)));

        let mut frame = Vec::new();
        let ping = Ping {
            sent_at_micros: 9,
            sequence: 3,
            _pad: 0,
        };
        encode_frame(&Pong::answer(&ping), &mut frame).unwrap();
        assert!(endpoint.set_result(serial, &frame));

        let pong = call.await.completed().unwrap();
        assert_eq!(pong.sequence, 3);
        assert_eq!(pong.sent_at_micros, 9);
    }
}
