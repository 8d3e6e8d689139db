//! Subscription matching engine
//!
//! [`SubscriptionIndex`] maps topic filters to the subscriptions that hold
//! them. A subscription is keyed by `(client, filter, share group)`;
//! subscribing again with the same key replaces the earlier options.
//!
//! Matching takes the trie read lock only, so concurrent publishes never
//! wait on each other; subscribe/unsubscribe take the write lock for the
//! duration of a single trie update.

mod trie;
pub mod validation;

pub use trie::TopicTrie;
pub use validation::{
    split_shared, topic_matches_filter, validate_topic_filter, validate_topic_name, TopicError,
};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::protocol::{QoS, SubscriptionOptions};

/// A subscription held by one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub client_id: Arc<str>,
    /// Filter without any `$share/{group}/` prefix
    pub filter: Arc<str>,
    pub share_group: Option<Arc<str>>,
    pub options: SubscriptionOptions,
    /// Subscription identifier (MQTT v5.0)
    pub subscription_id: Option<u32>,
}

impl Subscription {
    /// Build a subscription from a filter as the client sent it, splitting
    /// off the share group if present.
    pub fn parse(
        client_id: impl Into<Arc<str>>,
        filter: &str,
        options: SubscriptionOptions,
    ) -> Result<Self, TopicError> {
        validate_topic_filter(filter, 0)?;
        let (share_group, filter) = match split_shared(filter)? {
            Some((group, actual)) => (Some(Arc::from(group)), actual),
            None => (None, filter),
        };
        Ok(Self {
            client_id: client_id.into(),
            filter: filter.into(),
            share_group,
            options,
            subscription_id: None,
        })
    }

    pub fn with_id(mut self, id: u32) -> Self {
        self.subscription_id = Some(id);
        self
    }

    pub fn qos(&self) -> QoS {
        self.options.qos
    }

    /// Filter in the form the client subscribed with
    pub fn full_filter(&self) -> String {
        match &self.share_group {
            Some(group) => format!("$share/{}/{}", group, self.filter),
            None => self.filter.to_string(),
        }
    }

    fn same_key(&self, client_id: &str, share_group: Option<&str>) -> bool {
        self.client_id.as_ref() == client_id && self.share_group.as_deref() == share_group
    }
}

type ShareKey = (Arc<str>, Arc<str>);

/// Concurrent topic-filter index with shared-subscription selection
pub struct SubscriptionIndex {
    trie: RwLock<TopicTrie<Vec<Subscription>>>,
    /// Round-robin cursor per (share group, filter)
    share_cursors: DashMap<ShareKey, AtomicUsize>,
    count: AtomicUsize,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(TopicTrie::new()),
            share_cursors: DashMap::new(),
            count: AtomicUsize::new(0),
        }
    }

    /// Add or replace a subscription. Returns true if the key was new.
    pub fn subscribe(&self, subscription: Subscription) -> bool {
        let mut trie = self.trie.write();
        let subs = trie.get_or_insert_with(&subscription.filter, Vec::new);
        let existing = subs.iter_mut().find(|s| {
            s.same_key(&subscription.client_id, subscription.share_group.as_deref())
        });
        match existing {
            Some(slot) => {
                *slot = subscription;
                false
            }
            None => {
                subs.push(subscription);
                self.count.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// Remove one subscription. `filter` excludes the share prefix.
    pub fn unsubscribe(&self, client_id: &str, filter: &str, share_group: Option<&str>) -> bool {
        let mut trie = self.trie.write();
        let Some(subs) = trie.get_mut(filter) else {
            return false;
        };
        let Some(pos) = subs.iter().position(|s| s.same_key(client_id, share_group)) else {
            return false;
        };
        subs.remove(pos);
        let group_left = share_group.is_some_and(|g| {
            subs.iter().any(|s| s.share_group.as_deref() == Some(g))
        });
        if subs.is_empty() {
            trie.remove(filter);
        }
        drop(trie);

        if let Some(group) = share_group {
            if !group_left {
                self.share_cursors.remove(&(Arc::from(group), Arc::from(filter)));
            }
        }
        self.count.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Remove every subscription held by `client_id`
    pub fn unsubscribe_all(&self, client_id: &str) -> Vec<Subscription> {
        let mut removed = Vec::new();
        self.trie.write().retain(|subs| {
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(subs)
                .into_iter()
                .partition(|s| s.client_id.as_ref() == client_id);
            removed.extend(gone);
            *subs = kept;
            !subs.is_empty()
        });
        self.count.fetch_sub(removed.len(), Ordering::Relaxed);
        removed
    }

    /// Subscriptions matching `topic`.
    ///
    /// Every matching non-shared subscription is returned, so a client with
    /// several overlapping filters appears once per filter. Each matching
    /// (share group, filter) contributes exactly one member, chosen round
    /// robin. Non-shared entries come first, in trie order.
    pub fn matches(&self, topic: &str) -> SmallVec<[Subscription; 16]> {
        let mut result: SmallVec<[Subscription; 16]> = SmallVec::new();
        let mut groups: SmallVec<[(ShareKey, SmallVec<[Subscription; 4]>); 4]> = SmallVec::new();

        {
            let trie = self.trie.read();
            trie.matches(topic, |subs| {
                for sub in subs {
                    let Some(group) = &sub.share_group else {
                        result.push(sub.clone());
                        continue;
                    };
                    let slot = match groups
                        .iter()
                        .position(|((g, f), _)| g == group && *f == sub.filter)
                    {
                        Some(i) => i,
                        None => {
                            groups.push(((group.clone(), sub.filter.clone()), SmallVec::new()));
                            groups.len() - 1
                        }
                    };
                    groups[slot].1.push(sub.clone());
                }
            });
        }

        for (key, mut members) in groups {
            let cursor = self
                .share_cursors
                .entry(key)
                .or_insert_with(|| AtomicUsize::new(0));
            let idx = cursor.fetch_add(1, Ordering::Relaxed) % members.len();
            result.push(members.swap_remove(idx));
        }
        result
    }

    /// All subscriptions held by one client
    pub fn client_subscriptions(&self, client_id: &str) -> Vec<Subscription> {
        let mut out = Vec::new();
        self.trie.read().for_each(|subs| {
            out.extend(
                subs.iter()
                    .filter(|s| s.client_id.as_ref() == client_id)
                    .cloned(),
            );
        });
        out
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for SubscriptionIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sub(client: &str, filter: &str) -> Subscription {
        Subscription::parse(client, filter, SubscriptionOptions::with_qos(QoS::AtLeastOnce))
            .unwrap()
    }

    fn clients(subs: &[Subscription]) -> Vec<String> {
        let mut out: Vec<String> = subs.iter().map(|s| s.client_id.to_string()).collect();
        out.sort();
        out
    }

    #[test]
    fn test_parse_shared() {
        let s = sub("c1", "$share/grp/a/+");
        assert_eq!(s.share_group.as_deref(), Some("grp"));
        assert_eq!(&*s.filter, "a/+");
        assert_eq!(s.full_filter(), "$share/grp/a/+");
        assert!(Subscription::parse("c1", "a/#/b", SubscriptionOptions::default()).is_err());
    }

    #[test]
    fn test_resubscribe_replaces() {
        let index = SubscriptionIndex::new();
        assert!(index.subscribe(sub("c1", "a/b")));
        let mut again = sub("c1", "a/b");
        again.options.qos = QoS::ExactlyOnce;
        assert!(!index.subscribe(again));

        let matched = index.matches("a/b");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].qos(), QoS::ExactlyOnce);
        assert_eq!(index.count(), 1);
    }

    #[test]
    fn test_overlapping_filters_deliver_per_subscription() {
        let index = SubscriptionIndex::new();
        index.subscribe(sub("c1", "sensors/+/temp"));
        index.subscribe(sub("c1", "sensors/#"));
        index.subscribe(sub("c2", "other"));

        let matched = index.matches("sensors/42/temp");
        assert_eq!(clients(&matched), vec!["c1", "c1"]);
    }

    #[test]
    fn test_shared_round_robin() {
        let index = SubscriptionIndex::new();
        index.subscribe(sub("a", "$share/g/jobs/#"));
        index.subscribe(sub("b", "$share/g/jobs/#"));
        index.subscribe(sub("c", "$share/g/jobs/#"));
        index.subscribe(sub("watcher", "jobs/#"));

        let mut seen = Vec::new();
        for _ in 0..6 {
            let matched = index.matches("jobs/1");
            assert_eq!(matched.len(), 2);
            assert_eq!(&*matched[0].client_id, "watcher");
            seen.push(matched[1].client_id.to_string());
        }
        for member in ["a", "b", "c"] {
            assert_eq!(seen.iter().filter(|c| *c == member).count(), 2);
        }
    }

    #[test]
    fn test_shared_and_plain_keys_are_distinct() {
        let index = SubscriptionIndex::new();
        index.subscribe(sub("c1", "t"));
        index.subscribe(sub("c1", "$share/g/t"));
        assert_eq!(index.count(), 2);

        assert!(index.unsubscribe("c1", "t", Some("g")));
        assert!(!index.unsubscribe("c1", "t", Some("g")));
        assert_eq!(clients(&index.matches("t")), vec!["c1"]);
        assert!(index.matches("t")[0].share_group.is_none());
    }

    #[test]
    fn test_unsubscribe_all() {
        let index = SubscriptionIndex::new();
        index.subscribe(sub("c1", "a/+"));
        index.subscribe(sub("c1", "b/#"));
        index.subscribe(sub("c2", "a/+"));

        let removed = index.unsubscribe_all("c1");
        assert_eq!(removed.len(), 2);
        assert_eq!(index.count(), 1);
        assert!(index.client_subscriptions("c1").is_empty());
        assert_eq!(clients(&index.matches("a/x")), vec!["c2"]);
        assert!(index.matches("b/x").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_churn_keeps_index_consistent() {
        let index = Arc::new(SubscriptionIndex::new());
        let writers: Vec<_> = (0..8)
            .map(|n| {
                let index = index.clone();
                tokio::spawn(async move {
                    let client = format!("c{n}");
                    let own = format!("load/{n}");
                    index.subscribe(sub(&client, "load/+"));
                    for _ in 0..200 {
                        index.subscribe(sub(&client, &own));
                        index.subscribe(sub(&client, "$share/g/load/#"));
                        tokio::task::yield_now().await;
                        assert!(index.unsubscribe(&client, &own, None));
                        assert!(index.unsubscribe(&client, "load/#", Some("g")));
                    }
                })
            })
            .collect();
        let reader = {
            let index = index.clone();
            tokio::spawn(async move {
                for _ in 0..500 {
                    let matched = index.matches("load/3");
                    let mut keys: Vec<String> = matched.iter().map(|s| s.full_filter()).collect();
                    let shared = keys.iter().filter(|k| k.starts_with("$share/")).count();
                    assert!(shared <= 1);
                    keys.retain(|k| k == "load/+");
                    assert!(keys.len() <= 8);
                    tokio::task::yield_now().await;
                }
            })
        };

        for writer in writers {
            writer.await.unwrap();
        }
        reader.await.unwrap();

        assert_eq!(index.count(), 8);
        let matched = index.matches("load/3");
        assert_eq!(matched.len(), 8);
        assert!(matched.iter().all(|s| &*s.filter == "load/+"));
        assert_eq!(index.client_subscriptions("c3").len(), 1);
    }

    fn level() -> impl Strategy<Value = String> {
        prop_oneof![Just("a".to_string()), Just("b".to_string()), Just("".to_string())]
    }

    fn topic_strategy() -> impl Strategy<Value = String> {
        (
            prop_oneof![Just(""), Just("$")],
            prop::collection::vec(level(), 1..4),
        )
            .prop_map(|(prefix, levels)| format!("{prefix}{}", levels.join("/")))
    }

    fn filter_strategy() -> impl Strategy<Value = String> {
        let filter_level = prop_oneof![level(), Just("+".to_string())];
        (prop::collection::vec(filter_level, 1..4), any::<bool>()).prop_map(|(mut levels, hash)| {
            if hash {
                levels.push("#".to_string());
            }
            let filter = levels.join("/");
            if filter.is_empty() {
                "+".to_string()
            } else {
                filter
            }
        })
    }

    proptest! {
        #[test]
        fn prop_index_agrees_with_reference_matcher(
            filters in prop::collection::vec(filter_strategy(), 1..8),
            topic in topic_strategy(),
        ) {
            let index = SubscriptionIndex::new();
            for (i, filter) in filters.iter().enumerate() {
                index.subscribe(sub(&format!("c{i}"), filter));
            }

            let mut got: Vec<String> =
                index.matches(&topic).iter().map(|s| s.filter.to_string()).collect();
            let mut expected: Vec<String> = filters
                .iter()
                .filter(|f| topic_matches_filter(&topic, f))
                .cloned()
                .collect();
            got.sort();
            expected.sort();
            prop_assert_eq!(got, expected);
        }
    }
}
