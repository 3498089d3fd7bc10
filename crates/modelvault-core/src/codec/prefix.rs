//! Trie over `/`-separated tree paths.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
struct Node {
    terminal: bool,
    children: BTreeMap<String, Node>,
}

/// A set of path prefixes answering "is this path inside any listed prefix".
///
/// Matching is per path segment: `a/b` contains `a/b` and `a/b/c`, not `a/bc`.
#[derive(Debug, Clone, Default)]
pub struct PrefixSet {
    root: Node,
}

impl PrefixSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, prefix: &str) {
        let mut node = &mut self.root;
        for segment in segments(prefix) {
            node = node.children.entry(segment.to_string()).or_default();
        }
        node.terminal = true;
    }

    /// Whether `path` equals or lies below any inserted prefix.
    pub fn contains(&self, path: &str) -> bool {
        let mut node = &self.root;
        if node.terminal {
            return true;
        }
        for segment in segments(path) {
            match node.children.get(segment) {
                Some(child) if child.terminal => return true,
                Some(child) => node = child,
                None => return false,
            }
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        !self.root.terminal && self.root.children.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<S> for PrefixSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = PrefixSet::new();
        for prefix in iter {
            set.insert(prefix.as_ref());
        }
        set
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}
