//! QoS resolution between publishers and subscribers.

use crate::topic;
use crate::types::{QoS, Subscription};

/// QoS a message is delivered with to a subscriber.
///
/// MQTT 3.1.1: the minimum of the QoS of the published message and the
/// maximum QoS granted for the matching subscription.
pub fn effective_qos(published: QoS, granted: QoS) -> QoS {
    published.min(granted)
}

/// Granted QoS per subscription filter, in subscription order.
///
/// Filters are unique; re-granting an existing filter updates it in place
/// and keeps its position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantedQos {
    entries: Vec<(String, QoS)>,
}

impl GrantedQos {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, filter: impl Into<String>, qos: QoS) {
        let filter = filter.into();
        match self.entries.iter_mut().find(|(f, _)| *f == filter) {
            Some(entry) => entry.1 = qos,
            None => self.entries.push((filter, qos)),
        }
    }

    pub fn remove(&mut self, filter: &str) -> Option<QoS> {
        let idx = self.entries.iter().position(|(f, _)| f == filter)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn get(&self, filter: &str) -> Option<QoS> {
        self.entries
            .iter()
            .find(|(f, _)| f == filter)
            .map(|(_, qos)| *qos)
    }

    pub fn filters(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(f, _)| f.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Find the subscription matching `topic` and the QoS to deliver with.
    pub fn resolve(&self, topic: &str, published: QoS) -> Option<(&str, QoS)> {
        let filter = topic::select_filter(self.filters(), topic)?;
        let granted = self.get(filter)?;
        Some((filter, effective_qos(published, granted)))
    }

    /// Current subscriptions with their granted QoS.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.entries
            .iter()
            .map(|(f, qos)| Subscription::new(f.clone(), *qos))
            .collect()
    }
}

impl FromIterator<Subscription> for GrantedQos {
    fn from_iter<I: IntoIterator<Item = Subscription>>(iter: I) -> Self {
        let mut granted = GrantedQos::new();
        for sub in iter {
            granted.insert(sub.filter, sub.qos);
        }
        granted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEVELS: [QoS; 3] = [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce];

    #[test]
    fn test_effective_qos_is_minimum() {
        for published in LEVELS {
            for granted in LEVELS {
                let expected = if (published as u8) < (granted as u8) {
                    published
                } else {
                    granted
                };
                assert_eq!(effective_qos(published, granted), expected);
            }
        }
    }

    #[test]
    fn test_granted_insert_keeps_order_and_uniqueness() {
        let mut granted = GrantedQos::new();
        granted.insert("a/+", QoS::AtLeastOnce);
        granted.insert("a/#", QoS::ExactlyOnce);
        granted.insert("a/+", QoS::AtMostOnce);

        assert_eq!(granted.len(), 2);
        assert_eq!(granted.filters().collect::<Vec<_>>(), vec!["a/+", "a/#"]);
        assert_eq!(granted.get("a/+"), Some(QoS::AtMostOnce));
    }

    #[test]
    fn test_granted_remove() {
        let mut granted = GrantedQos::new();
        granted.insert("a/b", QoS::AtLeastOnce);

        assert_eq!(granted.remove("a/b"), Some(QoS::AtLeastOnce));
        assert_eq!(granted.remove("a/b"), None);
        assert!(granted.is_empty());
    }

    #[test]
    fn test_resolve() {
        let mut granted = GrantedQos::new();
        granted.insert("a/+", QoS::AtLeastOnce);
        granted.insert("#", QoS::ExactlyOnce);

        assert_eq!(
            granted.resolve("a/b", QoS::ExactlyOnce),
            Some(("a/+", QoS::AtLeastOnce))
        );
        assert_eq!(
            granted.resolve("b/c", QoS::ExactlyOnce),
            Some(("#", QoS::ExactlyOnce))
        );
        assert_eq!(
            granted.resolve("a/b", QoS::AtMostOnce),
            Some(("a/+", QoS::AtMostOnce))
        );
    }

    #[test]
    fn test_resolve_no_subscription() {
        let mut granted = GrantedQos::new();
        granted.insert("a/+", QoS::AtLeastOnce);
        assert_eq!(granted.resolve("b/c", QoS::AtLeastOnce), None);
    }

    #[test]
    fn test_from_subscriptions() {
        let granted: GrantedQos = vec![
            Subscription::new("x/#", QoS::ExactlyOnce),
            Subscription::new("y", QoS::AtMostOnce),
        ]
        .into_iter()
        .collect();

        assert_eq!(granted.len(), 2);
        assert_eq!(granted.subscriptions()[0], Subscription::new("x/#", QoS::ExactlyOnce));
    }
}
