use std::collections::BTreeMap;

use crate::protocol::OutboundMessage;

/// Set of topic keys the client wants live data for.
///
/// Keys survive reconnects; on every successful open the whole set is
/// replayed as a single subscribe message.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionRegistry {
    /// key -> epoch ms at which it was first subscribed
    keys: BTreeMap<String, u64>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Union `keys` into the set. Returns only the keys that were not
    /// already present, in first-seen order.
    pub fn subscribe<I, S>(&mut self, keys: I, now_ms: u64) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut added = Vec::new();
        for key in keys {
            let key = key.as_ref().trim();
            if key.is_empty() || self.keys.contains_key(key) {
                continue;
            }
            self.keys.insert(key.to_string(), now_ms);
            added.push(key.to_string());
        }
        added
    }

    /// Remove `keys`. Returns the ones that were actually present.
    pub fn unsubscribe<I, S>(&mut self, keys: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        keys.into_iter()
            .filter_map(|k| {
                let k = k.as_ref().trim();
                self.keys.remove_entry(k).map(|(k, _)| k)
            })
            .collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.keys.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.keys.iter().map(|(k, at)| (k.as_str(), *at))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Subscribe message carrying every key, or `None` when empty.
    pub fn replay_message(&self) -> Option<OutboundMessage> {
        (!self.is_empty()).then(|| OutboundMessage::Subscribe { assets: self.keys() })
    }
}
