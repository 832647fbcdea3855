//! The ordered in-flight message queue and packet identifier allocation
//! (spec.md §3 Queue, §4.2).

use std::collections::VecDeque;

use mqtt_core::{PacketId, Type};

use crate::error::{Error, Result};
use crate::message::{Message, MessageState};

/// Ordered queue of in-flight messages. The source keeps a circular
/// doubly-linked list for O(1) removal-by-reference; a `VecDeque` gives the
/// same enqueue/dequeue-order guarantee and lookup-by-(type,id) is a linear
/// scan, acceptable since the number of in-flight messages is small in
/// practice (spec.md §9 design note).
pub struct Queue {
    messages: VecDeque<Message>,
    next_id: PacketId,
}

impl Default for Queue {
    fn default() -> Self {
        Queue::new()
    }
}

impl Queue {
    pub fn new() -> Self {
        Queue {
            messages: VecDeque::new(),
            next_id: 1,
        }
    }

    pub fn push_back(&mut self, message: Message) {
        self.messages.push_back(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Message> {
        self.messages.iter_mut()
    }

    /// Remove and return every message whose state is `Complete`.
    pub fn drain_complete(&mut self) {
        self.messages.retain(|m| m.state != MessageState::Complete);
    }

    /// Find the first in-flight message of `packet_type` with `packet_id`.
    pub fn find_mut(&mut self, packet_type: Type, packet_id: PacketId) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .find(|m| m.packet_type == packet_type && m.packet_id == packet_id)
    }

    /// Whether a QoS-2 PUBLISH is currently `AwaitingAck` (spec.md §4.5:
    /// "only one QoS-2 PUBLISH is allowed in flight outbound at any
    /// instant").
    pub fn qos2_publish_in_flight(&self) -> bool {
        self.messages.iter().any(|m| {
            m.packet_type == Type::Publish
                && m.qos == mqtt_core::QoS::ExactlyOnce
                && m.state == MessageState::AwaitingAck
        })
    }

    /// Clear all queued messages, resolving their waiters with
    /// `not-connected`. Used on the attached→unattached transition
    /// (spec.md §9 Open Question: the queue is authoritative only while
    /// connected).
    pub fn reset(&mut self) {
        for mut message in self.messages.drain(..) {
            message.resume(Err(Error::NotConnected));
        }
    }

    /// Allocate the next packet identifier: increment modulo 65536,
    /// skipping zero and any id currently occupying the queue. Fails with
    /// `cant-complete` after 65535 failed attempts (spec.md §4.2).
    pub fn next_packet_id(&mut self) -> Result<PacketId> {
        let start = self.next_id;
        let mut first = true;
        loop {
            let candidate = self.next_id;
            self.next_id = if self.next_id == u16::MAX {
                1
            } else {
                self.next_id + 1
            };
            if candidate != 0 && !self.messages.iter().any(|m| m.packet_id == candidate) {
                return Ok(candidate);
            }
            if !first && candidate == start {
                return Err(Error::CantComplete(
                    "no free packet identifier available".into(),
                ));
            }
            first = false;
        }
    }
}
