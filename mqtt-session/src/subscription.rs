//! Subscription table: ordinary subscriptions, master subscriptions, and
//! dispatch of incoming PUBLISH packets to the matching callback
//! (spec.md §3 Subscription / Master subscription, §4.3, §4.6).

use mqtt_core::{topic, PacketId, QoS};

/// A transient, read-only view of a just-dispatched PUBLISH (spec.md §3
/// MessageView). Valid only for the duration of the callback that receives
/// it; a callback that needs to retain the data must copy it out.
pub struct MessageView<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub packet_id: Option<PacketId>,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
}

/// Callback invoked once per dispatched PUBLISH matching a subscription's
/// filter.
pub type Callback = Box<dyn FnMut(&MessageView)>;

/// An ordinary (application) subscription.
pub struct Subscription {
    pub filter: String,
    pub max_qos: QoS,
    pub fast: bool,
    pub callback: Callback,
}

/// A locally registered filter prefix that multiplexes many ordinary
/// subscriptions onto a single broker-level SUBSCRIBE (spec.md §3 Master
/// subscription, §4.11).
pub struct MasterSubscription {
    pub prefix: String,
}

impl MasterSubscription {
    /// Strip a trailing `/+` or `/#` from `filter`, per spec.md §4.3's
    /// prefix-matching rule.
    pub fn prefix_from_filter(filter: &str) -> String {
        if let Some(stripped) = filter.strip_suffix("/+").or_else(|| filter.strip_suffix("/#")) {
            stripped.to_string()
        } else {
            filter.to_string()
        }
    }
}

#[derive(Default)]
pub struct SubscriptionTable {
    subscriptions: Vec<Subscription>,
    masters: Vec<MasterSubscription>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        SubscriptionTable::default()
    }

    /// Returns the master prefix `filter` falls under, if any.
    pub fn master_prefix_for(&self, filter: &str) -> Option<&str> {
        self.masters
            .iter()
            .map(|m| m.prefix.as_str())
            .find(|prefix| filter.starts_with(prefix))
    }

    pub fn add_master(&mut self, prefix: String) {
        self.masters.push(MasterSubscription { prefix });
    }

    pub fn add(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    /// Remove every ordinary subscription whose filter equals `filter`,
    /// returning how many were removed.
    pub fn remove(&mut self, filter: &str) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.filter != filter);
        before - self.subscriptions.len()
    }

    /// Index of the first subscription whose filter matches `topic_name`
    /// (spec.md §4.6: "resolve the first subscription whose filter
    /// matches").
    pub fn first_match(&self, topic_name: &str) -> Option<usize> {
        self.subscriptions
            .iter()
            .position(|s| topic::matches(topic_name, &s.filter))
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Subscription {
        &mut self.subscriptions[index]
    }
}
