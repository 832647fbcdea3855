//! The non-blocking I/O loop: read-then-parse-then-dispatch, write-pending,
//! then the keep-alive/idle timer tick (spec.md §4.6, §4.7, §4.8).

use std::io;
use std::time::{Duration, Instant};

use mqtt_core::{unpack, Packet, PacketId, QoS, Type};

use crate::message::MessageState;
use crate::queue::Queue;
use crate::session::{Event, Session};
use crate::subscription::{MessageView, SubscriptionTable};
use crate::transport::{Clock, Spawner, Transport};

/// Largest chunk read from the transport per `poll()` iteration.
const READ_CHUNK: usize = 4096;

impl<T, C, S> Session<T, C, S>
where
    T: Transport,
    C: Clock,
    S: Spawner,
{
    /// Drive one iteration of the loop: drain readable bytes, dispatch any
    /// complete packets, write pending messages, then check timers. Never
    /// blocks; safe to call on a tight poll loop or from a single event-loop
    /// tick. Failures are recorded via [`Session::get_error`] and surfaced
    /// through waiters/events rather than returned, since nothing here is
    /// ever fatal to the *caller* of `poll` itself (spec.md §7).
    pub fn poll(&mut self) {
        self.drain_readable();
        self.drain_writable();
        self.check_timers();
    }

    fn drain_readable(&mut self) {
        if self.transport.is_none() {
            return;
        }

        loop {
            let mut chunk = [0u8; READ_CHUNK];
            let transport = self.transport.as_mut().unwrap();
            match transport.read(&mut chunk) {
                Ok(0) => {
                    self.handle_fatal_network("transport closed".to_string());
                    return;
                }
                Ok(n) => {
                    self.recv_buf.extend_from_slice(&chunk[..n]);
                    if n < READ_CHUNK {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.handle_fatal_network(e.to_string());
                    return;
                }
            }
        }

        loop {
            let outcome = match unpack(&self.recv_buf[self.recv_start..], self.max_message) {
                Ok(Some((packet, consumed))) => {
                    self.recv_start += consumed;
                    Some(dispatch_packet(
                        packet,
                        &mut self.queue,
                        &mut self.subscriptions,
                        &self.spawner,
                        self.clock.now(),
                    ))
                }
                Ok(None) => None,
                Err(err) => {
                    self.handle_fatal_protocol(err.to_string());
                    return;
                }
            };

            match outcome {
                Some(DispatchOutcome::Continue) => {}
                Some(DispatchOutcome::JustConnected) => {
                    let now = self.clock.now();
                    self.connected = true;
                    self.last_activity = Some(now);
                    self.next_deadline = Some(now + self.keep_alive.min(self.idle_timeout));
                    self.fire_event(Event::Connected);
                }
                Some(DispatchOutcome::PingAcked) => {
                    self.last_activity = Some(self.clock.now());
                }
                Some(DispatchOutcome::Fatal(msg)) => {
                    self.handle_fatal_protocol(msg);
                    return;
                }
                None => break,
            }
        }

        if self.recv_start > 0 {
            if self.recv_start >= self.recv_buf.len() {
                self.recv_buf.clear();
            } else {
                self.recv_buf.drain(..self.recv_start);
            }
            self.recv_start = 0;
        }
    }

    fn drain_writable(&mut self) {
        if self.transport.is_none() {
            return;
        }

        let now = self.clock.now();
        let msg_timeout = self.msg_timeout;
        let mut qos2_in_flight = self.queue.qos2_publish_in_flight();
        let mut fatal: Option<io::Error> = None;

        {
            let transport = self.transport.as_mut().unwrap();

            for message in self.queue.iter_mut() {
                if message.state == MessageState::AwaitingAck && message.is_fully_sent() {
                    if let Some(sent_at) = message.sent_at {
                        if now.saturating_duration_since(sent_at) >= msg_timeout {
                            log::warn!(
                                "retransmitting {:?} packet_id={} after {:?} without an ack",
                                message.packet_type,
                                message.packet_id,
                                msg_timeout
                            );
                            message.mark_for_retransmit();
                        }
                    }
                    continue;
                }

                if message.state != MessageState::Unsent && message.is_fully_sent() {
                    continue;
                }

                let is_qos2_publish = message.packet_type == Type::Publish && message.qos == QoS::ExactlyOnce;
                if is_qos2_publish && qos2_in_flight && message.cursor == 0 {
                    continue;
                }

                loop {
                    if message.is_fully_sent() {
                        break;
                    }
                    match transport.write(message.remaining()) {
                        Ok(0) => break,
                        Ok(n) => message.cursor += n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            fatal = Some(e);
                            break;
                        }
                    }
                }

                if fatal.is_some() {
                    break;
                }

                if message.is_fully_sent() {
                    message.sent_at = Some(now);
                    let next_state = crate::state_machine::on_sent(message.packet_type, message.qos);
                    message.state = next_state;
                    if is_qos2_publish {
                        qos2_in_flight = true;
                    }
                    if message.wait_mask == crate::message::WaitMask::Sent
                        || (message.wait_mask == crate::message::WaitMask::Ack
                            && next_state == MessageState::Complete)
                    {
                        message.resume(Ok(()));
                    }
                }
            }
        }

        self.queue.drain_complete();

        if let Some(e) = fatal {
            self.handle_fatal_network(e.to_string());
        }
    }

    fn check_timers(&mut self) {
        if !self.connected {
            return;
        }
        let now = self.clock.now();
        let deadline = match self.next_deadline {
            Some(d) => d,
            None => return,
        };
        if now < deadline {
            return;
        }

        let elapsed = now.saturating_duration_since(self.last_activity.unwrap_or(now));
        if elapsed >= self.idle_timeout {
            log::warn!("idle timeout after {:?} of inactivity", elapsed);
            self.fire_event(Event::Timeout);
        } else if elapsed >= self.keep_alive {
            log::trace!("keep-alive elapsed, sending PINGREQ");
            let _ = self.ping(crate::message::WaitMask::None);
        }

        let period = self.keep_alive.min(self.idle_timeout);
        let remaining = period.saturating_sub(elapsed).max(Duration::from_secs(1));
        self.next_deadline = Some(now + remaining);
    }

    /// Tear down the connection after a network or protocol failure neither
    /// side can recover from mid-stream: every queued message's waiter
    /// resolves not-connected and a `Disconnect` event fires (spec.md §4.9,
    /// §7). The caller finds out through `get_error`, a resolved waiter, or
    /// the event handler, never through `poll`'s own (non-existent) return.
    fn handle_fatal_network(&mut self, message: String) {
        log::error!("session failed, disconnecting: {}", message);
        self.record_error(message);
        self.connected = false;
        self.transport = None;
        self.queue.reset();
        self.fire_event(Event::Disconnect);
    }

    fn handle_fatal_protocol(&mut self, message: String) {
        self.handle_fatal_network(message);
    }
}

enum DispatchOutcome {
    Continue,
    JustConnected,
    /// A PINGRESP completed the outstanding PINGREQ: keep-alive resets
    /// (spec.md §4.4 `ping`: "resets keep-alive on ack").
    PingAcked,
    Fatal(String),
}

/// Receive-side state machine (spec.md §4.6). Takes disjoint field
/// references rather than `&mut Session` because the `Packet` it is handed
/// still borrows the session's receive buffer; see the module-level note in
/// [`crate::io_loop`] for why this lives as a free function.
fn dispatch_packet<S: Spawner>(
    packet: Packet,
    queue: &mut Queue,
    subscriptions: &mut SubscriptionTable,
    spawner: &S,
    now: Instant,
) -> DispatchOutcome {
    match packet {
        Packet::ConnectAck(ack) => {
            let message = match queue.find_mut(Type::Connect, 0) {
                Some(message) => message,
                None => return DispatchOutcome::Fatal("CONNACK with no CONNECT in flight".into()),
            };
            message.state = MessageState::Complete;
            if ack.return_code.is_accepted() {
                message.resume(Ok(()));
                DispatchOutcome::JustConnected
            } else {
                // spec.md §4.4: identifier-rejected is reported as
                // cant-complete; every other refusal as cant-connect.
                let err = if ack.return_code == mqtt_core::ConnectReturnCode::IdentifierRejected {
                    crate::error::Error::CantComplete(ack.return_code.to_string())
                } else {
                    crate::error::Error::CantConnect(ack.return_code.to_string())
                };
                message.resume(Err(err));
                DispatchOutcome::Continue
            }
        }

        Packet::Publish(publish) => {
            let view = MessageView {
                topic: publish.topic,
                payload: publish.payload,
                packet_id: publish.packet_id,
                qos: publish.qos,
                retain: publish.retain,
                dup: publish.dup,
            };

            match publish.qos {
                QoS::AtMostOnce => dispatch_to_subscriber(subscriptions, spawner, &view),
                QoS::AtLeastOnce => {
                    dispatch_to_subscriber(subscriptions, spawner, &view);
                    let packet_id = match publish.packet_id {
                        Some(id) => id,
                        None => return DispatchOutcome::Fatal("PUBLISH qos 1 without packet id".into()),
                    };
                    enqueue_ack(queue, Type::PublishAck, packet_id, None, now);
                }
                QoS::ExactlyOnce => {
                    let packet_id = match publish.packet_id {
                        Some(id) => id,
                        None => return DispatchOutcome::Fatal("PUBLISH qos 2 without packet id".into()),
                    };
                    // spec.md §4.6: a PUBREC already outstanding for this id
                    // means this PUBLISH is a duplicate (the broker's own
                    // retransmit of an unacked QoS-2 PUBLISH); drop it
                    // entirely rather than dispatching or re-enqueuing PUBREC.
                    if queue.find_mut(Type::PublishReceived, packet_id).is_none() {
                        dispatch_to_subscriber(subscriptions, spawner, &view);
                        enqueue_ack(queue, Type::PublishReceived, packet_id, None, now);
                    }
                }
            }
            DispatchOutcome::Continue
        }

        Packet::PublishAck(packet_id) => {
            match queue.find_mut(Type::Publish, packet_id) {
                Some(message) if message.qos == QoS::AtLeastOnce => {
                    message.state = MessageState::Complete;
                    message.resume(Ok(()));
                    DispatchOutcome::Continue
                }
                _ => DispatchOutcome::Fatal(format!("PUBACK for unknown packet id {}", packet_id)),
            }
        }

        Packet::PublishReceived(packet_id) => {
            // The original PUBLISH's waiter is *not* resolved here: spec.md
            // §8 scenario 2 resumes the caller only after PUBCOMP. Carry the
            // waiter forward onto the PUBREL this PUBREC triggers.
            match queue.find_mut(Type::Publish, packet_id) {
                Some(message) if message.qos == QoS::ExactlyOnce => {
                    message.state = MessageState::Complete;
                    let carried = message
                        .waiter
                        .take()
                        .map(|waiter| (message.wait_mask, waiter));
                    enqueue_ack(queue, Type::PublishRelease, packet_id, carried, now);
                    DispatchOutcome::Continue
                }
                _ => DispatchOutcome::Fatal(format!("PUBREC for unknown packet id {}", packet_id)),
            }
        }

        Packet::PublishRelease(packet_id) => {
            // Matches the PUBREC this client sent earlier for a broker-to-
            // client QoS-2 PUBLISH (spec.md §4.6: "Match pending PUBREC(id)").
            match queue.find_mut(Type::PublishReceived, packet_id) {
                Some(message) => {
                    message.state = MessageState::Complete;
                    enqueue_ack(queue, Type::PublishComplete, packet_id, None, now);
                    DispatchOutcome::Continue
                }
                None => DispatchOutcome::Fatal(format!("PUBREL for unknown packet id {}", packet_id)),
            }
        }

        Packet::PublishComplete(packet_id) => match queue.find_mut(Type::PublishRelease, packet_id) {
            Some(message) => {
                message.state = MessageState::Complete;
                message.resume(Ok(()));
                DispatchOutcome::Continue
            }
            None => DispatchOutcome::Fatal(format!("PUBCOMP for unknown packet id {}", packet_id)),
        },

        Packet::SubscribeAck(ack) => match queue.find_mut(Type::Subscribe, ack.packet_id) {
            Some(message) => {
                message.state = MessageState::Complete;
                let failed = ack.status.iter().any(|code| matches!(code, mqtt_core::SubscribeReturnCode::Failure));
                if failed {
                    message.resume(Err(crate::error::Error::CantComplete("subscribe refused".into())));
                } else {
                    message.resume(Ok(()));
                }
                DispatchOutcome::Continue
            }
            None => DispatchOutcome::Fatal(format!("SUBACK for unknown packet id {}", ack.packet_id)),
        },

        Packet::UnsubscribeAck(packet_id) => match queue.find_mut(Type::Unsubscribe, packet_id) {
            Some(message) => {
                message.state = MessageState::Complete;
                message.resume(Ok(()));
                DispatchOutcome::Continue
            }
            None => DispatchOutcome::Fatal(format!("UNSUBACK for unknown packet id {}", packet_id)),
        },

        Packet::PingResp => {
            // A stray PINGRESP with no outstanding PINGREQ is tolerated
            // rather than fatal: brokers occasionally send one unsolicited
            // and it carries no id to definitively mismatch against.
            if let Some(message) = queue.find_mut(Type::PingReq, 0) {
                message.state = MessageState::Complete;
                message.resume(Ok(()));
                DispatchOutcome::PingAcked
            } else {
                DispatchOutcome::Continue
            }
        }

        Packet::Connect(_) | Packet::Subscribe(_) | Packet::Unsubscribe(_) | Packet::Disconnect | Packet::PingReq => {
            DispatchOutcome::Fatal("unexpected server-to-client packet type".into())
        }
    }
}

/// Invokes the matching subscription's callback, if any (spec.md §4.6: "resolve
/// the first subscription whose filter matches"). A `fast` subscription is
/// called synchronously with `view`, which borrows straight from the receive
/// buffer and is only valid for the call. Otherwise the topic and payload are
/// copied out first and the callback itself runs *inside* the task handed to
/// the [`Spawner`], against the owned copies; the task frees them when it
/// returns (spec.md §4.6). With the default [`crate::transport::InlineSpawner`]
/// that happens before this function returns, but a `Spawner` backed by a
/// real executor can legally defer the whole invocation.
fn dispatch_to_subscriber<S: Spawner>(subscriptions: &mut SubscriptionTable, spawner: &S, view: &MessageView) {
    let index = match subscriptions.first_match(view.topic) {
        Some(index) => index,
        None => return,
    };

    if subscriptions.get_mut(index).fast {
        (subscriptions.get_mut(index).callback)(view);
        return;
    }

    let topic = view.topic.to_string();
    let payload = view.payload.to_vec();
    let packet_id = view.packet_id;
    let qos = view.qos;
    let retain = view.retain;
    let dup = view.dup;

    spawner.spawn(Box::new(move || {
        let owned_view = MessageView {
            topic: &topic,
            payload: &payload,
            packet_id,
            qos,
            retain,
            dup,
        };
        (subscriptions.get_mut(index).callback)(&owned_view);
    }));
}

/// Enqueue one of the four ack packet types. `carried_wait`, when present,
/// transfers a waiter from the message that triggered this ack onto the new
/// one — used to carry a QoS-2 PUBLISH's waiter forward onto the PUBREL it
/// triggers, so it resolves on PUBCOMP rather than on PUBREC (spec.md §8
/// scenario 2, §4.6).
fn enqueue_ack(
    queue: &mut Queue,
    packet_type: Type,
    packet_id: PacketId,
    carried_wait: Option<(crate::message::WaitMask, crate::message::Waiter)>,
    _now: Instant,
) {
    let packet = match packet_type {
        Type::PublishAck => Packet::PublishAck(packet_id),
        Type::PublishReceived => Packet::PublishReceived(packet_id),
        Type::PublishRelease => Packet::PublishRelease(packet_id),
        Type::PublishComplete => Packet::PublishComplete(packet_id),
        _ => unreachable!("enqueue_ack only used for the four ack types"),
    };
    let mut frame = Vec::new();
    if mqtt_core::pack(&packet, &mut frame, usize::MAX).is_ok() {
        let mut message = crate::message::Message::new(packet_type, packet_id, QoS::AtMostOnce, frame);
        if let Some((wait_mask, waiter)) = carried_wait {
            message = message.with_wait(wait_mask, waiter);
        }
        queue.push_back(message);
    }
}
