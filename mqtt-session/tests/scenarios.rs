//! End-to-end scenarios driven through a fake in-memory transport and clock,
//! exercising the full wire round trip without a real socket (spec.md §8).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mqtt_core::{
    pack, unpack, ConnectAck, ConnectReturnCode, Packet, Publish, QoS, SubscribeAck,
    SubscribeReturnCode,
};
use mqtt_session::{Clock, Event, InlineSpawner, Session, Transport, WaitMask};

#[derive(Default)]
struct Channel {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
}

/// A scripted response a [`FakeTransport`] synthesizes the instant a
/// matching packet is written, so a blocking `wait-mask: ack` call sees its
/// reply without a real broker on the other end.
type Script = fn(&Packet) -> Option<Packet<'static>>;

#[derive(Clone)]
struct FakeTransport {
    inner: Rc<RefCell<Channel>>,
    script: Option<Script>,
}

impl FakeTransport {
    fn new() -> Self {
        FakeTransport {
            inner: Rc::new(RefCell::new(Channel::default())),
            script: None,
        }
    }

    fn with_script(script: Script) -> Self {
        FakeTransport {
            inner: Rc::new(RefCell::new(Channel::default())),
            script: Some(script),
        }
    }

    fn push_inbound(&self, packet: &Packet) {
        let mut frame = Vec::new();
        pack(packet, &mut frame, usize::MAX).unwrap();
        self.inner.borrow_mut().inbound.extend(frame);
    }

    fn take_outbound(&self) -> Vec<u8> {
        std::mem::take(&mut self.inner.borrow_mut().outbound)
    }
}

impl Transport for FakeTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.borrow_mut();
        if inner.inbound.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "nothing queued"));
        }
        let n = inner.inbound.len().min(buf.len());
        for slot in buf.iter_mut().take(n) {
            *slot = inner.inbound.pop_front().unwrap();
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.borrow_mut().outbound.extend_from_slice(buf);
        if let Some(script) = self.script {
            if let Ok(Some((packet, _))) = unpack(buf, usize::MAX) {
                if let Some(response) = script(&packet) {
                    let mut frame = Vec::new();
                    pack(&response, &mut frame, usize::MAX).unwrap();
                    self.inner.borrow_mut().inbound.extend(frame);
                }
            }
        }
        Ok(buf.len())
    }

    fn is_closed(&self) -> bool {
        false
    }
}

#[derive(Clone)]
struct FakeClock {
    now: Rc<RefCell<Instant>>,
}

impl FakeClock {
    fn new() -> Self {
        FakeClock {
            now: Rc::new(RefCell::new(Instant::now())),
        }
    }

    fn advance(&self, d: Duration) {
        *self.now.borrow_mut() += d;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        *self.now.borrow()
    }
}

fn connack() -> Packet<'static> {
    Packet::ConnectAck(ConnectAck {
        session_present: false,
        return_code: ConnectReturnCode::Accepted,
    })
}

type TestSession = Session<FakeTransport, FakeClock, InlineSpawner>;

fn new_session(client_id: &str) -> (TestSession, FakeClock) {
    let clock = FakeClock::new();
    let session = Session::with_clock_and_spawner(client_id, clock.clone(), InlineSpawner);
    (session, clock)
}

/// Connect and drive the handshake to completion against `transport`,
/// returning once the session reports connected.
fn connect_and_ack(session: &mut TestSession, transport: FakeTransport) {
    session.connect(transport.clone(), WaitMask::None).unwrap();
    session.poll(); // writes CONNECT
    transport.take_outbound();
    transport.push_inbound(&connack());
    session.poll(); // dispatches CONNACK, fires Connected
    assert!(session.is_connected());
}

/// Scenario 1: subscribe "a/+/c" qos=1, receive a matching PUBLISH, and the
/// callback fires once while a PUBACK goes out.
#[test]
fn subscribe_then_dispatch_qos1_publish() {
    let (mut session, _clock) = new_session("c1");
    let transport = FakeTransport::new();
    connect_and_ack(&mut session, transport.clone());

    let received: Rc<RefCell<Vec<(String, Vec<u8>)>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = received.clone();
    session
        .subscribe(
            "a/+/c",
            QoS::AtLeastOnce,
            false,
            Box::new(move |view| {
                sink.borrow_mut()
                    .push((view.topic.to_string(), view.payload.to_vec()));
            }),
            WaitMask::None,
        )
        .unwrap();
    session.poll(); // writes SUBSCRIBE
    transport.take_outbound();

    transport.push_inbound(&Packet::SubscribeAck(SubscribeAck {
        packet_id: 1,
        status: vec![SubscribeReturnCode::Success(QoS::AtLeastOnce)],
    }));
    session.poll();

    transport.push_inbound(&Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtLeastOnce,
        retain: false,
        topic: "a/b/c",
        packet_id: Some(7),
        payload: b"hi",
    }));
    session.poll();

    assert_eq!(
        received.borrow().as_slice(),
        &[("a/b/c".to_string(), b"hi".to_vec())]
    );

    let mut expected = Vec::new();
    pack(&Packet::PublishAck(7), &mut expected, usize::MAX).unwrap();
    assert_eq!(transport.take_outbound(), expected);
}

/// Scenario 2: a QoS-2 publish goes PUBLISH -> PUBREC -> PUBREL -> PUBCOMP,
/// and the blocking caller only resumes once PUBCOMP lands.
#[test]
fn qos2_publish_round_trip_resumes_on_pubcomp() {
    fn script(packet: &Packet) -> Option<Packet<'static>> {
        match packet {
            Packet::Publish(p) if p.qos == QoS::ExactlyOnce => {
                Some(Packet::PublishReceived(p.packet_id.unwrap()))
            }
            Packet::PublishRelease(id) => Some(Packet::PublishComplete(*id)),
            _ => None,
        }
    }

    let (mut session, _clock) = new_session("c1");
    let transport = FakeTransport::with_script(script);
    connect_and_ack(&mut session, transport.clone());
    transport.take_outbound();

    session
        .publish("x/y", b"m", QoS::ExactlyOnce, WaitMask::Ack)
        .expect("publish resolves once PUBCOMP arrives");

    let wire = transport.take_outbound();
    let (first, consumed) = unpack(&wire, usize::MAX).unwrap().unwrap();
    match first {
        Packet::Publish(p) => {
            assert_eq!(p.qos, QoS::ExactlyOnce);
            assert_eq!(p.topic, "x/y");
            assert_eq!(p.payload, b"m");
        }
        other => panic!("expected PUBLISH, got {:?}", other),
    }
    let (second, _) = unpack(&wire[consumed..], usize::MAX).unwrap().unwrap();
    assert!(matches!(second, Packet::PublishRelease(_)));

    assert_eq!(session.msgs_to_send(), 0);
}

/// Scenario 3: an unacked QoS-1 PUBLISH is retransmitted with DUP set after
/// msg-timeout, carrying the same id and payload.
#[test]
fn unacked_qos1_publish_retransmits_with_dup() {
    let (mut session, clock) = new_session("c1");
    session.set_msg_timeout_ms(1000).unwrap();
    let transport = FakeTransport::new();
    connect_and_ack(&mut session, transport.clone());
    transport.take_outbound();

    session
        .publish("t", b"payload", QoS::AtLeastOnce, WaitMask::None)
        .unwrap();
    session.poll();
    let first = transport.take_outbound();
    let (packet, _) = unpack(&first, usize::MAX).unwrap().unwrap();
    let first_id = match packet {
        Packet::Publish(p) => {
            assert!(!p.dup);
            p.packet_id.unwrap()
        }
        other => panic!("expected PUBLISH, got {:?}", other),
    };

    clock.advance(Duration::from_millis(1500));
    session.poll(); // notices the timeout, marks for retransmit
    session.poll(); // actually rewrites the frame

    let second = transport.take_outbound();
    let (packet, _) = unpack(&second, usize::MAX).unwrap().unwrap();
    match packet {
        Packet::Publish(p) => {
            assert!(p.dup);
            assert_eq!(p.packet_id.unwrap(), first_id);
            assert_eq!(p.payload, b"payload");
        }
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}

/// Scenario 4: a QoS-0 publish whose encoded size exactly matches
/// `maxMessage` still sends exactly once and completes locally.
#[test]
fn publish_at_exact_max_message_size_completes() {
    let (mut session, _clock) = new_session("c1");
    session.set_client_id("c1").unwrap();
    // body = 2-byte length prefix + "t" (1 byte) + payload, so a 61-byte
    // payload makes the encoded body exactly 64 bytes.
    session.set_message_size(64).unwrap();
    let transport = FakeTransport::new();
    connect_and_ack(&mut session, transport.clone());
    transport.take_outbound();

    let payload = vec![0xAB; 61];
    session
        .publish("t", &payload, QoS::AtMostOnce, WaitMask::None)
        .unwrap();
    session.poll();

    let wire = transport.take_outbound();
    let (packet, consumed) = unpack(&wire, usize::MAX).unwrap().unwrap();
    assert_eq!(consumed, wire.len(), "exactly one PUBLISH on the wire");
    match packet {
        Packet::Publish(p) => assert_eq!(p.payload.len(), 61),
        other => panic!("expected PUBLISH, got {:?}", other),
    }
    assert_eq!(session.msgs_to_send(), 0, "message drained as complete");
}

/// Scenario 5: a master subscription multiplexes a later ordinary subscribe
/// under its prefix onto zero additional wire traffic.
#[test]
fn master_subscription_multiplexes_wire_traffic() {
    fn script(packet: &Packet) -> Option<Packet<'static>> {
        match packet {
            Packet::Subscribe(s) => Some(Packet::SubscribeAck(SubscribeAck {
                packet_id: s.packet_id,
                status: s
                    .subscriptions
                    .iter()
                    .map(|(_, qos)| SubscribeReturnCode::Success(*qos))
                    .collect(),
            })),
            _ => None,
        }
    }

    let (mut session, _clock) = new_session("c1");
    let transport = FakeTransport::with_script(script);
    connect_and_ack(&mut session, transport.clone());
    transport.take_outbound();

    // WaitMask::Ack so the master prefix is only recorded once the broker
    // has actually confirmed the SUBSCRIBE (spec.md §4.4: "on success").
    session
        .subscribe_master("sensor/#", QoS::AtMostOnce, WaitMask::Ack)
        .unwrap();

    let wire = transport.take_outbound();
    let mut expected = Vec::new();
    pack(
        &Packet::Subscribe(mqtt_core::Subscribe {
            packet_id: 1,
            subscriptions: vec![("sensor/#", QoS::AtMostOnce)],
        }),
        &mut expected,
        usize::MAX,
    )
    .unwrap();
    assert_eq!(wire, expected, "exactly one SUBSCRIBE for the master prefix");

    session
        .subscribe(
            "sensor/temp",
            QoS::AtMostOnce,
            false,
            Box::new(|_| {}),
            WaitMask::None,
        )
        .unwrap();
    session.poll();
    assert!(
        transport.take_outbound().is_empty(),
        "second subscribe installs locally only"
    );
}

/// Scenario 6: keep-alive pings the broker after an idle period; the
/// PINGRESP resets last-activity; a further idle period past idle-timeout
/// fires TIMEOUT.
#[test]
fn keep_alive_pings_then_times_out() {
    let (mut session, clock) = new_session("c1");
    session.set_keep_alive_ms(2000).unwrap();
    session.set_timeout_ms(5000).unwrap();
    let transport = FakeTransport::new();

    let events: Rc<RefCell<Vec<Event>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    session.set_event_handler(move |event| sink.borrow_mut().push(event));

    connect_and_ack(&mut session, transport.clone());
    transport.take_outbound();

    clock.advance(Duration::from_secs(2));
    session.poll(); // notices keep-alive elapsed, enqueues PINGREQ
    session.poll(); // writes it

    let wire = transport.take_outbound();
    let mut expected = Vec::new();
    pack(&Packet::PingReq, &mut expected, usize::MAX).unwrap();
    assert_eq!(wire, expected);

    let before = session.get_last_activity();
    transport.push_inbound(&Packet::PingResp);
    session.poll();
    assert!(session.get_last_activity() > before);
    assert!(!events.borrow().contains(&Event::Timeout));

    clock.advance(Duration::from_secs(5));
    session.poll();
    assert!(events.borrow().contains(&Event::Timeout));
}

/// A broker's DUP=1 retransmit of a QoS-2 PUBLISH it has already sent once,
/// while this client's PUBREC is still outstanding (no PUBREL yet), must be
/// dropped entirely: delivered to the subscriber once only, and acked with
/// exactly one PUBREC rather than a second one piling up in the queue.
#[test]
fn duplicate_qos2_publish_with_outstanding_pubrec_is_dropped() {
    let (mut session, _clock) = new_session("c1");
    let transport = FakeTransport::new();
    connect_and_ack(&mut session, transport.clone());

    let deliveries: Rc<RefCell<usize>> = Rc::new(RefCell::new(0));
    let sink = deliveries.clone();
    session
        .subscribe(
            "x/y",
            QoS::ExactlyOnce,
            false,
            Box::new(move |_| *sink.borrow_mut() += 1),
            WaitMask::None,
        )
        .unwrap();
    session.poll(); // writes SUBSCRIBE
    transport.take_outbound();
    transport.push_inbound(&Packet::SubscribeAck(SubscribeAck {
        packet_id: 1,
        status: vec![SubscribeReturnCode::Success(QoS::ExactlyOnce)],
    }));
    session.poll();

    let publish = Publish {
        dup: false,
        qos: QoS::ExactlyOnce,
        retain: false,
        topic: "x/y",
        packet_id: Some(99),
        payload: b"m",
    };
    transport.push_inbound(&Packet::Publish(publish.clone()));
    session.poll();
    assert_eq!(*deliveries.borrow(), 1);

    let first_pubrec = transport.take_outbound();
    let mut expected_pubrec = Vec::new();
    pack(&Packet::PublishReceived(99), &mut expected_pubrec, usize::MAX).unwrap();
    assert_eq!(first_pubrec, expected_pubrec);

    // the broker retransmits the same PUBLISH with DUP=1 before PUBREL
    // arrives: the engine's own PUBREC is still outstanding, so this must
    // be dropped, not delivered again or re-acked.
    let mut duplicate = publish;
    duplicate.dup = true;
    transport.push_inbound(&Packet::Publish(duplicate));
    session.poll();

    assert_eq!(*deliveries.borrow(), 1, "duplicate must not be redelivered");
    assert!(
        transport.take_outbound().is_empty(),
        "duplicate must not produce a second PUBREC"
    );

    // the broker's actual PUBREL still completes the original handshake.
    transport.push_inbound(&Packet::PublishRelease(99));
    session.poll();
    let pubcomp = transport.take_outbound();
    let mut expected_pubcomp = Vec::new();
    pack(&Packet::PublishComplete(99), &mut expected_pubcomp, usize::MAX).unwrap();
    assert_eq!(pubcomp, expected_pubcomp);
}

/// A clock whose `now()` advances a fixed tick on every read, standing in
/// for real wall-clock passage without an actual sleep — proves
/// `Session::wait_until`'s poll loop terminates once the injected `Clock`
/// reports the deadline has passed, rather than blocking the thread.
#[derive(Clone)]
struct TickingClock {
    now: Rc<RefCell<Instant>>,
    tick: Duration,
}

impl TickingClock {
    fn new(tick: Duration) -> Self {
        TickingClock {
            now: Rc::new(RefCell::new(Instant::now())),
            tick,
        }
    }
}

impl Clock for TickingClock {
    fn now(&self) -> Instant {
        let mut now = self.now.borrow_mut();
        *now += self.tick;
        *now
    }
}

/// `throttle()` delays the next `publish` by driving the I/O loop via
/// `Clock::now()`, never `std::thread::sleep` (spec.md §1, §5).
#[test]
fn throttle_delays_publish_without_blocking_the_thread() {
    let clock = TickingClock::new(Duration::from_millis(10));
    let mut session: Session<FakeTransport, TickingClock, InlineSpawner> =
        Session::with_clock_and_spawner("c1", clock, InlineSpawner);
    let transport = FakeTransport::new();

    session.connect(transport.clone(), WaitMask::None).unwrap();
    session.poll();
    transport.take_outbound();
    transport.push_inbound(&connack());
    session.poll();
    assert!(session.is_connected());
    transport.take_outbound();

    session.throttle();
    session
        .publish("t", b"m", QoS::AtMostOnce, WaitMask::None)
        .expect("publish still completes once the simulated delay elapses");
    session.poll();

    let wire = transport.take_outbound();
    let (packet, consumed) = unpack(&wire, usize::MAX).unwrap().unwrap();
    assert_eq!(consumed, wire.len());
    assert!(matches!(packet, Packet::Publish(_)));
}
