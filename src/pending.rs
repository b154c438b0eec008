//! Bookkeeping for calls awaiting a response.
//!
//! Under [`Correlation::Sequential`] only one call is written at a time; later calls queue up.
//! A call abandoned after it was written leaves a reply owed on the wire. Nothing else is
//! written until the next inbound message pays it off, so the stream never drifts out of step.
//! Under [`Correlation::Tagged`] calls are matched by id and an unknown id is a late response
//! to an abandoned call.
use std::{
    collections::{hash_map::Entry, HashMap, VecDeque},
    time::Instant,
};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::trace;

use crate::{
    config::Correlation,
    error::{Result, RpcError},
    message::{Inbound, Request},
};

/// A single invocation awaiting its response.
#[derive(Debug)]
pub(crate) struct PendingCall {
    pub key: u64,
    pub function: String,
    pub reply: oneshot::Sender<Result<Value>>,
    pub created: Instant,
}

impl PendingCall {
    pub fn new(key: u64, function: String, reply: oneshot::Sender<Result<Value>>) -> Self {
        Self {
            key,
            function,
            reply,
            created: Instant::now(),
        }
    }

    /// Delivers the outcome to the caller.
    pub fn resolve(self, outcome: Result<Value>) {
        trace!(
            "call {} ({}) settled after {:?}",
            self.key,
            self.function,
            self.created.elapsed()
        );
        // The caller may have stopped waiting; ignore send errors.
        drop(self.reply.send(outcome));
    }
}

/// Result of submitting a call.
#[derive(Debug)]
pub(crate) enum Submit {
    /// The request should be written to the transport now.
    Write(u64, Request),
    /// Another call is outstanding; this one waits its turn.
    Queued,
    /// The key is already in use. The call is handed back untouched.
    Duplicate(PendingCall),
}

/// Result of routing an inbound message.
#[derive(Debug, PartialEq)]
pub(crate) enum Dispatch {
    /// A pending call was settled.
    Resolved(u64),
    /// The message answered a call that was abandoned.
    Late,
    /// Nothing could claim the message.
    Unmatched(&'static str),
}

#[derive(Debug)]
pub(crate) struct PendingCalls {
    correlation: Correlation,
    /// Calls whose request has been written.
    in_flight: HashMap<u64, PendingCall>,
    /// Write order of in-flight keys. Sequential mode only.
    order: VecDeque<u64>,
    /// Calls not yet written. Sequential mode only.
    queue: VecDeque<(PendingCall, Request)>,
    /// An abandoned in-flight call still owes a reply. Sequential mode only.
    reply_owed: bool,
}

impl PendingCalls {
    pub fn new(correlation: Correlation) -> Self {
        Self {
            correlation,
            in_flight: HashMap::new(),
            order: VecDeque::new(),
            queue: VecDeque::new(),
            reply_owed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.in_flight.len() + self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True while an abandoned call's reply is still expected and queued calls are held.
    pub fn owes_reply(&self) -> bool {
        self.reply_owed
    }

    fn contains(&self, key: u64) -> bool {
        self.in_flight.contains_key(&key) || self.queue.iter().any(|(call, _)| call.key == key)
    }

    /// Registers a call. Returns what the caller should do with its request.
    pub fn submit(&mut self, call: PendingCall, request: Request) -> Submit {
        if self.contains(call.key) {
            return Submit::Duplicate(call);
        }
        let key = call.key;
        match self.correlation {
            Correlation::Tagged => {
                self.in_flight.insert(key, call);
                Submit::Write(key, request.with_id(key))
            }
            Correlation::Sequential => {
                if self.in_flight.is_empty() && self.queue.is_empty() && !self.reply_owed {
                    self.start(call);
                    Submit::Write(key, request)
                } else {
                    self.queue.push_back((call, request));
                    Submit::Queued
                }
            }
        }
    }

    fn start(&mut self, call: PendingCall) {
        let key = call.key;
        if let Entry::Vacant(entry) = self.in_flight.entry(key) {
            entry.insert(call);
            self.order.push_back(key);
        }
    }

    /// Promotes the next queued call when nothing is in flight or owed. Returns its request so
    /// it can be written.
    pub fn next_queued(&mut self) -> Option<(u64, Request)> {
        if !self.in_flight.is_empty() || self.reply_owed {
            return None;
        }
        let (call, request) = self.queue.pop_front()?;
        let key = call.key;
        self.start(call);
        Some((key, request))
    }

    /// Routes an inbound message to the call it answers.
    pub fn dispatch(&mut self, inbound: Inbound) -> Dispatch {
        match self.correlation {
            Correlation::Sequential => {
                if self.reply_owed {
                    self.reply_owed = false;
                    return Dispatch::Late;
                }
                let Some(key) = self.order.pop_front() else {
                    return Dispatch::Unmatched("no call is outstanding");
                };
                match self.in_flight.remove(&key) {
                    Some(call) => {
                        call.resolve(inbound.response.and_then(|r| r.into_result()));
                        Dispatch::Resolved(key)
                    }
                    None => Dispatch::Unmatched("no call is outstanding"),
                }
            }
            Correlation::Tagged => {
                let Some(id) = inbound.id else {
                    return Dispatch::Unmatched("response carries no id");
                };
                match self.in_flight.remove(&id) {
                    Some(call) => {
                        call.resolve(inbound.response.and_then(|r| r.into_result()));
                        Dispatch::Resolved(id)
                    }
                    None => Dispatch::Late,
                }
            }
        }
    }

    /// Forgets a call whose caller stopped waiting. Returns false if the key was unknown.
    pub fn abandon(&mut self, key: u64) -> bool {
        if self.in_flight.remove(&key).is_some() {
            if let Some(position) = self.order.iter().position(|k| *k == key) {
                self.order.remove(position);
                self.reply_owed = true;
            }
            return true;
        }
        if let Some(position) = self.queue.iter().position(|(call, _)| call.key == key) {
            self.queue.remove(position);
            return true;
        }
        false
    }

    /// Removes a call without resolving it, e.g. after its request failed to send.
    pub fn remove(&mut self, key: u64) -> Option<PendingCall> {
        let call = self.in_flight.remove(&key)?;
        self.order.retain(|k| *k != key);
        Some(call)
    }

    /// Rejects every pending call and resets the ordering state for a fresh connection.
    pub fn fail_all(&mut self, error: impl Fn() -> RpcError) {
        self.order.clear();
        self.reply_owed = false;
        let mut calls: Vec<PendingCall> = self.in_flight.drain().map(|(_, call)| call).collect();
        calls.extend(self.queue.drain(..).map(|(call, _)| call));
        calls.sort_by_key(|call| call.key);
        for call in calls {
            call.resolve(Err(error()));
        }
    }
}
