//! Topic trie for subscription matching
//!
//! Each filter addresses one slot: the `value` of the node reached by its
//! levels, or the `multi` slot of the parent when the filter ends in `#`.
//! Removal prunes branches that no longer hold any value so the trie does
//! not grow without bound under subscribe/unsubscribe churn.

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

#[derive(Debug)]
struct Node<V> {
    value: Option<V>,
    /// Value for `<this level>/#`
    multi: Option<V>,
    /// Child for a `+` level
    single: Option<Box<Node<V>>>,
    children: AHashMap<CompactString, Node<V>>,
}

impl<V> Default for Node<V> {
    fn default() -> Self {
        Self {
            value: None,
            multi: None,
            single: None,
            children: AHashMap::new(),
        }
    }
}

impl<V> Node<V> {
    fn is_empty(&self) -> bool {
        self.value.is_none()
            && self.multi.is_none()
            && self.single.is_none()
            && self.children.is_empty()
    }
}

/// Prefix tree keyed by topic levels with `+`/`#` wildcard slots
#[derive(Debug)]
pub struct TopicTrie<V> {
    root: Node<V>,
}

impl<V> TopicTrie<V> {
    pub fn new() -> Self {
        Self {
            root: Node::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Slot for `filter`, created with `init` if vacant
    pub fn get_or_insert_with<F>(&mut self, filter: &str, init: F) -> &mut V
    where
        F: FnOnce() -> V,
    {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();
        while let Some(level) = levels.next() {
            if level == "#" && levels.peek().is_none() {
                return node.multi.get_or_insert_with(init);
            }
            node = if level == "+" {
                node.single.get_or_insert_with(Box::default).as_mut()
            } else {
                node.children.entry(CompactString::new(level)).or_default()
            };
        }
        node.value.get_or_insert_with(init)
    }

    pub fn get_mut(&mut self, filter: &str) -> Option<&mut V> {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();
        while let Some(level) = levels.next() {
            if level == "#" && levels.peek().is_none() {
                return node.multi.as_mut();
            }
            node = if level == "+" {
                node.single.as_deref_mut()?
            } else {
                node.children.get_mut(level)?
            };
        }
        node.value.as_mut()
    }

    /// Take the value stored for `filter`, pruning emptied branches
    pub fn remove(&mut self, filter: &str) -> Option<V> {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        Self::remove_at(&mut self.root, &levels)
    }

    fn remove_at(node: &mut Node<V>, levels: &[&str]) -> Option<V> {
        match levels {
            [] => node.value.take(),
            ["#"] => node.multi.take(),
            ["+", rest @ ..] => {
                let child = node.single.as_deref_mut()?;
                let removed = Self::remove_at(child, rest);
                if child.is_empty() {
                    node.single = None;
                }
                removed
            }
            [level, rest @ ..] => {
                let child = node.children.get_mut(*level)?;
                let removed = Self::remove_at(child, rest);
                if child.is_empty() {
                    node.children.remove(*level);
                }
                removed
            }
        }
    }

    /// Keep only values for which `keep` returns true. `keep` may mutate the
    /// value in place (e.g. drop one client's entries from a list).
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&mut V) -> bool,
    {
        Self::retain_at(&mut self.root, &mut keep);
    }

    fn retain_at<F>(node: &mut Node<V>, keep: &mut F)
    where
        F: FnMut(&mut V) -> bool,
    {
        if node.value.as_mut().is_some_and(|v| !keep(v)) {
            node.value = None;
        }
        if node.multi.as_mut().is_some_and(|v| !keep(v)) {
            node.multi = None;
        }
        if let Some(child) = node.single.as_deref_mut() {
            Self::retain_at(child, keep);
            if child.is_empty() {
                node.single = None;
            }
        }
        node.children.retain(|_, child| {
            Self::retain_at(child, keep);
            !child.is_empty()
        });
    }

    /// Visit every stored value
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&V),
    {
        Self::for_each_at(&self.root, &mut f);
    }

    fn for_each_at<F>(node: &Node<V>, f: &mut F)
    where
        F: FnMut(&V),
    {
        if let Some(v) = &node.value {
            f(v);
        }
        if let Some(v) = &node.multi {
            f(v);
        }
        if let Some(child) = node.single.as_deref() {
            Self::for_each_at(child, f);
        }
        for child in node.children.values() {
            Self::for_each_at(child, f);
        }
    }

    /// Invoke `callback` for every value whose filter matches `topic`.
    /// Topics starting with `$` skip wildcard slots at the first level.
    pub fn matches<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&V),
    {
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        let dollar = topic.starts_with('$');
        Self::matches_at(&self.root, &levels, dollar, &mut callback);
    }

    fn matches_at<F>(node: &Node<V>, levels: &[&str], skip_wildcards: bool, callback: &mut F)
    where
        F: FnMut(&V),
    {
        if !skip_wildcards {
            if let Some(v) = &node.multi {
                callback(v);
            }
        }

        let Some((level, rest)) = levels.split_first() else {
            if let Some(v) = &node.value {
                callback(v);
            }
            return;
        };

        if !skip_wildcards {
            if let Some(child) = node.single.as_deref() {
                Self::matches_at(child, rest, false, callback);
            }
        }
        if let Some(child) = node.children.get(*level) {
            Self::matches_at(child, rest, false, callback);
        }
    }
}

impl<V> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}
