//! The `Session` engine: public API (spec.md §4.4) plus the configuration
//! state spec.md §3 describes. The I/O loop and receive-side state machine
//! live in [`crate::io_loop`], as additional `impl Session` blocks.

use std::time::Duration;

use mqtt_core::{pack, Connect, LastWill, Packet, QoS, Type};

use crate::error::{Error, Result};
use crate::message::{new_waiter, Message, WaitMask};
use crate::queue::Queue;
use crate::subscription::{Callback, MasterSubscription, Subscription, SubscriptionTable};
use crate::throttle::Throttle;
use crate::transport::{Clock, InlineSpawner, Spawner, SystemClock, Transport};

pub const CLIENT_ID_MAX_LEN: usize = 23;
pub const USERNAME_MAX_LEN: usize = 128;
pub const PASSWORD_MAX_LEN: usize = 128;
pub const WILL_TOPIC_MAX_LEN: usize = 128;

pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(20 * 60);
pub const DEFAULT_MSG_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_MESSAGE: usize = 256 * 1024 * 1024;

/// Events the engine notifies an installed handler about (spec.md §6
/// Event callback), aside from ATTACH which is handled by
/// [`Session::set_attach_handler`] since it must synchronously yield a
/// transport rather than just observe a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Connected,
    Disconnect,
    Timeout,
}

pub(crate) struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

pub(crate) struct Credentials {
    pub username: String,
    pub password: Vec<u8>,
}

/// The per-client MQTT engine object (spec.md §2).
pub struct Session<T, C = SystemClock, S = InlineSpawner> {
    pub(crate) transport: Option<T>,
    pub(crate) clock: C,
    pub(crate) spawner: S,
    pub(crate) on_attach: Option<Box<dyn FnMut() -> Option<T>>>,
    pub(crate) on_event: Option<Box<dyn FnMut(Event)>>,

    pub(crate) recv_buf: Vec<u8>,
    pub(crate) recv_start: usize,

    pub(crate) queue: Queue,
    pub(crate) subscriptions: SubscriptionTable,

    pub(crate) client_id: String,
    pub(crate) clean_session: bool,
    pub(crate) will: Option<Will>,
    pub(crate) credentials: Option<Credentials>,

    pub(crate) connected: bool,
    pub(crate) max_message: usize,
    pub(crate) msg_timeout: Duration,
    pub(crate) keep_alive: Duration,
    pub(crate) idle_timeout: Duration,
    pub(crate) throttle: Throttle,

    pub(crate) last_activity: Option<std::time::Instant>,
    pub(crate) next_deadline: Option<std::time::Instant>,
    pub(crate) last_error: Option<String>,
}

impl<T> Session<T, SystemClock, InlineSpawner> {
    pub fn new(client_id: impl Into<String>) -> Self {
        Session::with_clock_and_spawner(client_id, SystemClock, InlineSpawner)
    }
}

impl<T, C, S> Session<T, C, S>
where
    C: Clock,
    S: Spawner,
{
    pub fn with_clock_and_spawner(client_id: impl Into<String>, clock: C, spawner: S) -> Self {
        Session {
            transport: None,
            clock,
            spawner,
            on_attach: None,
            on_event: None,
            recv_buf: Vec::new(),
            recv_start: 0,
            queue: Queue::new(),
            subscriptions: SubscriptionTable::new(),
            client_id: client_id.into(),
            clean_session: true,
            will: None,
            credentials: None,
            connected: false,
            max_message: DEFAULT_MAX_MESSAGE,
            msg_timeout: DEFAULT_MSG_TIMEOUT,
            keep_alive: DEFAULT_KEEP_ALIVE,
            idle_timeout: Duration::MAX,
            throttle: Throttle::new(),
            last_activity: None,
            next_deadline: None,
            last_error: None,
        }
    }

    pub fn set_attach_handler(&mut self, handler: impl FnMut() -> Option<T> + 'static) {
        self.on_attach = Some(Box::new(handler));
    }

    pub fn set_event_handler(&mut self, handler: impl FnMut(Event) + 'static) {
        self.on_event = Some(Box::new(handler));
    }

    pub(crate) fn fire_event(&mut self, event: Event) {
        if let Some(handler) = self.on_event.as_mut() {
            handler(event);
        }
    }

    fn require_unattached(&self) -> Result<()> {
        if self.transport.is_some() {
            Err(Error::Core(mqtt_core::Error::BadState(
                "configuration can only change while unattached".into(),
            )))
        } else {
            Ok(())
        }
    }

    // ---- setters (spec.md §4.4, §6) -----------------------------------

    pub fn set_client_id(&mut self, client_id: impl Into<String>) -> Result<()> {
        self.require_unattached()?;
        let client_id = client_id.into();
        if client_id.len() > CLIENT_ID_MAX_LEN {
            return Err(mqtt_core::Error::BadArgs(format!(
                "client id of {} bytes exceeds the {}-byte limit",
                client_id.len(),
                CLIENT_ID_MAX_LEN
            ))
            .into());
        }
        if !client_id.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(mqtt_core::Error::BadArgs(format!(
                "client id {:?} is outside the portable [0-9A-Za-z] charset",
                client_id
            ))
            .into());
        }
        self.client_id = client_id;
        Ok(())
    }

    pub fn set_clean_session(&mut self, clean_session: bool) -> Result<()> {
        self.require_unattached()?;
        self.clean_session = clean_session;
        Ok(())
    }

    pub fn set_will(&mut self, topic: impl Into<String>, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<()> {
        self.require_unattached()?;
        let topic = topic.into();
        if topic.len() > WILL_TOPIC_MAX_LEN {
            return Err(mqtt_core::Error::BadArgs(format!(
                "will topic of {} bytes exceeds the {}-byte limit",
                topic.len(),
                WILL_TOPIC_MAX_LEN
            ))
            .into());
        }
        if payload.len() > self.max_message {
            return Err(mqtt_core::Error::WontFit("will payload exceeds max message size".into()).into());
        }
        self.will = Some(Will {
            topic,
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    pub fn set_credentials(&mut self, username: impl Into<String>, password: Vec<u8>) -> Result<()> {
        self.require_unattached()?;
        let username = username.into();
        if username.len() > USERNAME_MAX_LEN {
            return Err(mqtt_core::Error::BadArgs("username exceeds 128 bytes".into()).into());
        }
        if password.len() > PASSWORD_MAX_LEN {
            return Err(mqtt_core::Error::BadArgs("password exceeds 128 bytes".into()).into());
        }
        self.credentials = Some(Credentials { username, password });
        Ok(())
    }

    /// Zero or negative resets to the default (20 minutes).
    pub fn set_keep_alive_ms(&mut self, ms: i64) -> Result<()> {
        self.require_unattached()?;
        self.keep_alive = if ms <= 0 {
            DEFAULT_KEEP_ALIVE
        } else {
            Duration::from_millis(ms as u64)
        };
        Ok(())
    }

    /// Zero means "effectively unbounded" (spec.md §6 `idleTimeoutMs`).
    pub fn set_timeout_ms(&mut self, ms: i64) -> Result<()> {
        self.require_unattached()?;
        self.idle_timeout = if ms <= 0 {
            Duration::MAX
        } else {
            Duration::from_millis(ms as u64)
        };
        Ok(())
    }

    pub fn set_msg_timeout_ms(&mut self, ms: u64) -> Result<()> {
        self.require_unattached()?;
        self.msg_timeout = Duration::from_millis(ms);
        Ok(())
    }

    pub fn set_message_size(&mut self, bytes: usize) -> Result<()> {
        self.require_unattached()?;
        self.max_message = bytes;
        Ok(())
    }

    // ---- getters (spec.md §4.4) ---------------------------------------

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn get_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn get_last_activity(&self) -> Option<std::time::Instant> {
        self.last_activity
    }

    pub fn msgs_to_send(&self) -> usize {
        self.queue.len()
    }

    /// Signal broker-induced back-pressure (spec.md §4.4, §4.8): the next
    /// `publish` suspends for the resulting delay before writing. Callable
    /// by the application or by the transport layer (e.g. on a broker
    /// THROTTLE-equivalent signal or a write returning `WouldBlock`
    /// repeatedly); safe to call whether or not a throttle is already
    /// active, since `engage` only ever rises the delay.
    pub fn throttle(&mut self) {
        let now = self.clock.now();
        self.throttle.engage(now);
    }

    pub(crate) fn record_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
    }
}

impl<T, C, S> Session<T, C, S>
where
    T: Transport,
    C: Clock,
    S: Spawner,
{
    /// Attach `transport` and enqueue a CONNECT built from the current
    /// configuration. Fails with `bad-session` if the client id is empty
    /// and clean-session is not set (spec.md §4.4).
    pub fn connect(&mut self, transport: T, wait_mask: WaitMask) -> Result<()> {
        if self.client_id.is_empty() && !self.clean_session {
            return Err(mqtt_core::Error::BadSession(
                "empty client id requires clean_session".into(),
            )
            .into());
        }
        log::debug!("connecting client_id={:?} clean_session={}", self.client_id, self.clean_session);
        self.transport = Some(transport);

        let last_will = self.will.as_ref().map(|w| LastWill {
            qos: w.qos,
            retain: w.retain,
            topic: w.topic.as_str(),
            message: w.payload.as_slice(),
        });
        let (username, password) = match &self.credentials {
            Some(c) => (Some(c.username.as_str()), Some(c.password.as_slice())),
            None => (None, None),
        };

        let packet = Packet::Connect(Connect {
            clean_session: self.clean_session,
            keep_alive: (self.keep_alive.as_secs().min(u16::MAX as u64)) as u16,
            client_id: self.client_id.as_str(),
            last_will,
            username,
            password,
        });

        let mut frame = Vec::new();
        pack(&packet, &mut frame, self.max_message)?;

        let mut message = Message::new(Type::Connect, 0, QoS::AtMostOnce, frame);
        let waiter = new_waiter();
        if wait_mask != WaitMask::None {
            message = message.with_wait(wait_mask, waiter.clone());
        }
        self.queue.push_back(message);

        if wait_mask == WaitMask::Ack {
            self.wait_for(waiter)
        } else {
            Ok(())
        }
    }

    /// Enqueue a DISCONNECT; does not close the transport (the peer does).
    pub fn disconnect(&mut self) -> Result<()> {
        let mut frame = Vec::new();
        pack(&Packet::Disconnect, &mut frame, self.max_message)?;
        self.queue
            .push_back(Message::new(Type::Disconnect, 0, QoS::AtMostOnce, frame));
        Ok(())
    }

    fn ensure_attached(&mut self) -> Result<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        if let Some(handler) = self.on_attach.as_mut() {
            if let Some(transport) = handler() {
                log::debug!("attached transport on demand");
                self.transport = Some(transport);
                return Ok(());
            }
        }
        log::warn!("no transport available to attach");
        Err(Error::CantWrite("no transport attached".into()))
    }

    fn publish_inner(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool, wait_mask: WaitMask) -> Result<()> {
        if payload.len() > self.max_message {
            return Err(mqtt_core::Error::WontFit("publish payload exceeds max message size".into()).into());
        }

        self.ensure_attached()?;

        if self.throttle.is_active() {
            let now = self.clock.now();
            let delay = self.throttle.take_delay(now);
            if delay > Duration::ZERO {
                self.wait_until(now + delay);
            }
        }

        let packet_id = if qos >= QoS::AtLeastOnce {
            Some(self.queue.next_packet_id()?)
        } else {
            None
        };

        let publish = mqtt_core::Publish {
            dup: false,
            qos,
            retain,
            topic,
            packet_id,
            payload,
        };
        let mut frame = Vec::new();
        pack(&Packet::Publish(publish), &mut frame, self.max_message)?;

        let mut message = Message::new(Type::Publish, packet_id.unwrap_or(0), qos, frame);
        let waiter = new_waiter();
        if wait_mask != WaitMask::None {
            message = message.with_wait(wait_mask, waiter.clone());
        }
        self.queue.push_back(message);

        if wait_mask == WaitMask::Ack {
            self.wait_for(waiter)
        } else {
            Ok(())
        }
    }

    pub fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, wait_mask: WaitMask) -> Result<()> {
        self.publish_inner(topic, payload, qos, false, wait_mask)
    }

    pub fn publish_retained(&mut self, topic: &str, payload: &[u8], qos: QoS, wait_mask: WaitMask) -> Result<()> {
        self.publish_inner(topic, payload, qos, true, wait_mask)
    }

    /// If `filter` falls under a registered master prefix, install the
    /// subscription locally only and return without touching the wire
    /// (spec.md §4.4, §4.11).
    pub fn subscribe(
        &mut self,
        filter: impl Into<String>,
        max_qos: QoS,
        fast: bool,
        callback: Callback,
        wait_mask: WaitMask,
    ) -> Result<()> {
        let filter = filter.into();
        if !mqtt_core::topic::is_valid_filter(&filter) {
            return Err(mqtt_core::Error::BadArgs(format!(
                "invalid topic filter: {:?}",
                filter
            ))
            .into());
        }

        if self.subscriptions.master_prefix_for(&filter).is_some() {
            self.subscriptions.add(Subscription {
                filter,
                max_qos,
                fast,
                callback,
            });
            return Ok(());
        }

        self.ensure_attached()?;
        let packet_id = self.queue.next_packet_id()?;
        let mut frame = Vec::new();
        pack(
            &Packet::Subscribe(mqtt_core::Subscribe {
                packet_id,
                subscriptions: vec![(filter.as_str(), max_qos)],
            }),
            &mut frame,
            self.max_message,
        )?;

        self.subscriptions.add(Subscription {
            filter,
            max_qos,
            fast,
            callback,
        });

        let mut message = Message::new(Type::Subscribe, packet_id, QoS::AtMostOnce, frame);
        let waiter = new_waiter();
        if wait_mask != WaitMask::None {
            message = message.with_wait(wait_mask, waiter.clone());
        }
        self.queue.push_back(message);

        if wait_mask == WaitMask::Ack {
            self.wait_for(waiter)
        } else {
            Ok(())
        }
    }

    /// Subscribe normally; on success the prefix (minus a trailing `/+` or
    /// `/#`) is recorded as a master subscription (spec.md §4.4).
    pub fn subscribe_master(&mut self, prefix: impl Into<String>, max_qos: QoS, wait_mask: WaitMask) -> Result<()> {
        let prefix = prefix.into();
        if !mqtt_core::topic::is_valid_filter(&prefix) {
            return Err(mqtt_core::Error::BadArgs(format!(
                "invalid topic filter: {:?}",
                prefix
            ))
            .into());
        }
        let recorded_prefix = MasterSubscription::prefix_from_filter(&prefix);

        self.ensure_attached()?;
        let packet_id = self.queue.next_packet_id()?;
        let mut frame = Vec::new();
        pack(
            &Packet::Subscribe(mqtt_core::Subscribe {
                packet_id,
                subscriptions: vec![(prefix.as_str(), max_qos)],
            }),
            &mut frame,
            self.max_message,
        )?;

        let waiter = new_waiter();
        let mut message = Message::new(Type::Subscribe, packet_id, QoS::AtMostOnce, frame);
        if wait_mask != WaitMask::None {
            message = message.with_wait(wait_mask, waiter.clone());
        }
        self.queue.push_back(message);

        let result = if wait_mask == WaitMask::Ack {
            self.wait_for(waiter)
        } else {
            Ok(())
        };

        if result.is_ok() {
            self.subscriptions.add_master(recorded_prefix);
        }
        result
    }

    /// Removes the local subscription (immediately, the same as
    /// [`Session::subscribe`] installs one before the ack round-trip
    /// completes) and, unless `filter` is under a master prefix, sends
    /// UNSUBSCRIBE (spec.md §4.4).
    pub fn unsubscribe(&mut self, filter: &str, wait_mask: WaitMask) -> Result<()> {
        self.subscriptions.remove(filter);

        if self.subscriptions.master_prefix_for(filter).is_some() {
            return Ok(());
        }

        self.ensure_attached()?;
        let packet_id = self.queue.next_packet_id()?;
        let mut frame = Vec::new();
        pack(
            &Packet::Unsubscribe(mqtt_core::Unsubscribe {
                packet_id,
                topic_filters: vec![filter],
            }),
            &mut frame,
            self.max_message,
        )?;

        let mut message = Message::new(Type::Unsubscribe, packet_id, QoS::AtMostOnce, frame);
        let waiter = new_waiter();
        if wait_mask != WaitMask::None {
            message = message.with_wait(wait_mask, waiter.clone());
        }
        self.queue.push_back(message);

        if wait_mask == WaitMask::Ack {
            self.wait_for(waiter)
        } else {
            Ok(())
        }
    }

    /// Enqueue PINGREQ. Idempotent in effect; resets keep-alive on ack.
    pub fn ping(&mut self, wait_mask: WaitMask) -> Result<()> {
        self.ensure_attached()?;
        let mut frame = Vec::new();
        pack(&Packet::PingReq, &mut frame, self.max_message)?;

        let mut message = Message::new(Type::PingReq, 0, QoS::AtMostOnce, frame);
        let waiter = new_waiter();
        if wait_mask != WaitMask::None {
            message = message.with_wait(wait_mask, waiter.clone());
        }
        self.queue.push_back(message);

        if wait_mask == WaitMask::Ack {
            self.wait_for(waiter)
        } else {
            Ok(())
        }
    }

    pub(crate) fn wait_for(&mut self, waiter: crate::message::Waiter) -> Result<()> {
        loop {
            if let Some(result) = waiter.borrow_mut().take() {
                return result;
            }
            self.poll();
        }
    }

    /// Cooperatively suspend the caller until `deadline`, driving `poll()`
    /// on every iteration instead of blocking the thread (spec.md §1, §5:
    /// "suspend a caller... without blocking the I/O loop"), so reads,
    /// writes, retransmits and keep-alive ticks still happen while a
    /// throttled publish waits out its delay. Paced by the injected
    /// `Clock`, the same as `check_timers`, so a `FakeClock`-driven test
    /// never actually sleeps wall-clock time.
    pub(crate) fn wait_until(&mut self, deadline: std::time::Instant) {
        while self.clock.now() < deadline {
            self.poll();
        }
    }
}
