//! Caller-side handles for outstanding calls.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use skein_core::codec::{decode, split_frame, Message};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::debug;

use crate::connection::ConnectionId;

/// How a call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome<T> {
    /// The response arrived and decoded.
    Completed(T),
    /// No response before the deadline.
    Timeout,
    /// The target connection closed first.
    Disconnected,
    /// The endpoint was cleared or the call discarded.
    Cancelled,
    /// A response arrived but was not a valid `T`.
    Invalid,
}

impl<T> CallOutcome<T> {
    /// Returns true for [`CallOutcome::Completed`].
    #[inline]
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Returns the response, if any.
    #[must_use]
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            _ => None,
        }
    }
}

/// Why the endpoint resolved a call without a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Failure {
    Timeout,
    Disconnected,
    Cancelled,
}

impl Failure {
    fn outcome<T>(self) -> CallOutcome<T> {
        match self {
            Self::Timeout => CallOutcome::Timeout,
            Self::Disconnected => CallOutcome::Disconnected,
            Self::Cancelled => CallOutcome::Cancelled,
        }
    }
}

/// Result of handing a response to a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// The call is resolved and the slot can go.
    Done,
    /// Accepted, more responses outstanding.
    Partial,
    /// Not for this slot (unknown cookie, wrong sender, already answered).
    Rejected,
}

/// Type-erased completion side of a call.
pub(crate) trait Slot: Send {
    /// `frame` is `[type id][payload]` of the response. A `sender` that is
    /// not the addressed connection is rejected; `None` skips the check.
    fn deliver(&mut self, sender: Option<ConnectionId>, cookie: Option<u32>, frame: &[u8]) -> Delivery;

    /// Resolves everything still open.
    fn fail(&mut self, failure: Failure);

    /// Resolves the parts addressed to `target`.
    fn fail_target(&mut self, target: ConnectionId, failure: Failure) -> Delivery;

    /// Returns true if part of the call is addressed to `target`.
    fn targets(&self, target: ConnectionId) -> bool;
}

fn decode_response<T: Message>(frame: &[u8]) -> CallOutcome<T> {
    match split_frame(frame) {
        Ok((id, payload)) if id == T::ID => decode::<T>(payload).map_or(CallOutcome::Invalid, CallOutcome::Completed),
        Ok((id, _)) => {
            debug!(expected = %T::ID, got = %id, "Response type mismatch");
            CallOutcome::Invalid
        }
        Err(_) => CallOutcome::Invalid,
    }
}

pub(crate) struct SingleSlot<T> {
    target: Option<ConnectionId>,
    tx: Option<oneshot::Sender<CallOutcome<T>>>,
}

impl<T: Message> SingleSlot<T> {
    pub(crate) fn new(target: Option<ConnectionId>) -> (Self, oneshot::Receiver<CallOutcome<T>>) {
        let (tx, rx) = oneshot::channel();
        (Self { target, tx: Some(tx) }, rx)
    }

    fn resolve(&mut self, outcome: CallOutcome<T>) -> Delivery {
        match self.tx.take() {
            Some(tx) => {
                // The caller may have dropped its handle.
                let _ = tx.send(outcome);
                Delivery::Done
            }
            None => Delivery::Rejected,
        }
    }
}

impl<T: Message> Slot for SingleSlot<T> {
    fn deliver(&mut self, sender: Option<ConnectionId>, _cookie: Option<u32>, frame: &[u8]) -> Delivery {
        if let (Some(sender), Some(target)) = (sender, self.target) {
            if sender != target {
                return Delivery::Rejected;
            }
        }
        self.resolve(decode_response(frame))
    }

    fn fail(&mut self, failure: Failure) {
        self.resolve(failure.outcome());
    }

    fn fail_target(&mut self, target: ConnectionId, failure: Failure) -> Delivery {
        if self.targets(target) {
            self.resolve(failure.outcome())
        } else {
            Delivery::Rejected
        }
    }

    fn targets(&self, target: ConnectionId) -> bool {
        self.target == Some(target)
    }
}

/// Per-target outcomes of a fan-out call, in target order.
pub type FanOutResults<T> = Vec<(ConnectionId, CallOutcome<T>)>;

struct Part<T> {
    cookie: u32,
    target: ConnectionId,
    outcome: Option<CallOutcome<T>>,
}

pub(crate) struct FanOutSlot<T> {
    parts: Vec<Part<T>>,
    tx: Option<oneshot::Sender<FanOutResults<T>>>,
}

impl<T: Message> FanOutSlot<T> {
    pub(crate) fn new(targets: &[(u32, ConnectionId)]) -> (Self, oneshot::Receiver<FanOutResults<T>>) {
        let (tx, rx) = oneshot::channel();
        let parts = targets
            .iter()
            .map(|&(cookie, target)| Part {
                cookie,
                target,
                outcome: None,
            })
            .collect();
        (Self { parts, tx: Some(tx) }, rx)
    }

    /// Sends the results once every part is resolved.
    fn settle(&mut self) -> Delivery {
        if self.parts.iter().any(|part| part.outcome.is_none()) {
            return Delivery::Partial;
        }
        if let Some(tx) = self.tx.take() {
            let results = self
                .parts
                .drain(..)
                .filter_map(|part| Some((part.target, part.outcome?)))
                .collect();
            let _ = tx.send(results);
        }
        Delivery::Done
    }
}

impl<T: Message> Slot for FanOutSlot<T> {
    fn deliver(&mut self, sender: Option<ConnectionId>, cookie: Option<u32>, frame: &[u8]) -> Delivery {
        let Some(cookie) = cookie else {
            return Delivery::Rejected;
        };
        let Some(part) = self.parts.iter_mut().find(|part| {
            part.cookie == cookie && part.outcome.is_none() && sender.map_or(true, |sender| sender == part.target)
        })
        else {
            return Delivery::Rejected;
        };
        part.outcome = Some(decode_response(frame));
        self.settle()
    }

    fn fail(&mut self, failure: Failure) {
        for part in &mut self.parts {
            if part.outcome.is_none() {
                part.outcome = Some(failure.outcome());
            }
        }
        self.settle();
    }

    fn fail_target(&mut self, target: ConnectionId, failure: Failure) -> Delivery {
        let mut matched = false;
        for part in self.parts.iter_mut().filter(|part| part.target == target) {
            if part.outcome.is_none() {
                part.outcome = Some(failure.outcome());
                matched = true;
            }
        }
        if matched {
            self.settle()
        } else {
            Delivery::Rejected
        }
    }

    fn targets(&self, target: ConnectionId) -> bool {
        self.parts
            .iter()
            .any(|part| part.target == target && part.outcome.is_none())
    }
}

/// Handle for one outstanding call.
///
/// Await it from async code, poll it with [`try_outcome`](Self::try_outcome)
/// from a tick loop, or block on [`wait`](Self::wait) from a thread that is
/// not the one driving `update()`.
#[must_use = "dropping the handle discards the response"]
#[derive(Debug)]
pub struct PendingCall<T> {
    serial: u32,
    rx: oneshot::Receiver<CallOutcome<T>>,
}

impl<T> PendingCall<T> {
    pub(crate) fn new(serial: u32, rx: oneshot::Receiver<CallOutcome<T>>) -> Self {
        Self { serial, rx }
    }

    /// Serial correlating request and response.
    #[inline]
    #[must_use]
    pub const fn serial(&self) -> u32 {
        self.serial
    }

    /// Returns the outcome once it is available.
    ///
    /// After the outcome has been taken, later calls report
    /// [`CallOutcome::Cancelled`].
    pub fn try_outcome(&mut self) -> Option<CallOutcome<T>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(CallOutcome::Cancelled),
        }
    }

    /// Blocks until the call resolves.
    ///
    /// Must not be called on the thread running `update()`, and not from
    /// inside an async runtime.
    pub fn wait(self) -> CallOutcome<T> {
        self.rx.blocking_recv().unwrap_or(CallOutcome::Cancelled)
    }
}

impl<T> Future for PendingCall<T> {
    type Output = CallOutcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(CallOutcome::Cancelled))
    }
}

/// Handle for a call sent to several connections.
///
/// Resolves once every target answered or failed, with one entry per
/// target in the order they were given.
#[must_use = "dropping the handle discards the responses"]
#[derive(Debug)]
pub struct FanOutCall<T> {
    serial: u32,
    targets: Vec<ConnectionId>,
    rx: oneshot::Receiver<FanOutResults<T>>,
}

impl<T> FanOutCall<T> {
    pub(crate) fn new(
        serial: u32,
        targets: Vec<ConnectionId>,
        rx: oneshot::Receiver<FanOutResults<T>>,
    ) -> Self {
        Self { serial, targets, rx }
    }

    /// Serial shared by every request of the call.
    #[inline]
    #[must_use]
    pub const fn serial(&self) -> u32 {
        self.serial
    }

    /// Connections the call was sent to.
    #[must_use]
    pub fn targets(&self) -> &[ConnectionId] {
        &self.targets
    }

    fn cancelled(&self) -> FanOutResults<T> {
        self.targets
            .iter()
            .map(|&target| (target, CallOutcome::Cancelled))
            .collect()
    }

    /// Returns the results once every target resolved.
    pub fn try_outcome(&mut self) -> Option<FanOutResults<T>> {
        match self.rx.try_recv() {
            Ok(results) => Some(results),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(self.cancelled()),
        }
    }

    /// Blocks until every target resolved. Same restrictions as
    /// [`PendingCall::wait`].
    pub fn wait(self) -> FanOutResults<T> {
        let cancelled = self.cancelled();
        self.rx.blocking_recv().unwrap_or(cancelled)
    }
}

impl<T> Future for FanOutCall<T> {
    type Output = FanOutResults<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(results)) => Poll::Ready(results),
            Poll::Ready(Err(_)) => Poll::Ready(self.cancelled()),
            Poll::Pending => Poll::Pending,
        }
    }
}
