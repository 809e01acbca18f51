//! Name pattern → replication policy matcher.
//!
//! Patterns are prefixes of an object's file name. A trailing `*` may be
//! written to make that explicit (`"tmp*"` and `"tmp"` are the same rule).
//! The tree is a trie over pattern bytes; each node keeps its children's
//! key bytes sorted so a lookup binary-searches one level at a time.
//!
//! Search returns the policy of the deepest node on the walked path that
//! carries one, i.e. the most specific matching prefix wins:
//!
//! ```
//! use replifs_kernel::{RaidType, Rule, RuleTree};
//!
//! let tree = RuleTree::construct(
//!     &[Rule::new("a*", RaidType::Raid1), Rule::new("ab", RaidType::Raid0)],
//!     RaidType::Raid1,
//! )
//! .unwrap();
//! assert_eq!(tree.search("abc"), RaidType::Raid0);
//! assert_eq!(tree.search("ax"), RaidType::Raid1);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{ReplicaError, ReplicaResult};
use crate::flag::RaidType;

/// One configured rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub pattern: String,
    pub raid: RaidType,
}

impl Rule {
    pub fn new(pattern: impl Into<String>, raid: RaidType) -> Self {
        Self {
            pattern: pattern.into(),
            raid,
        }
    }

    /// The literal prefix this rule matches.
    fn prefix(&self) -> ReplicaResult<&[u8]> {
        let pattern = self.pattern.as_str();
        let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
        if prefix.is_empty() {
            return Err(ReplicaError::configuration(format!(
                "rule pattern {:?} is empty",
                self.pattern
            )));
        }
        if prefix.contains('*') {
            return Err(ReplicaError::configuration(format!(
                "rule pattern {:?}: '*' is only allowed as the last character",
                self.pattern
            )));
        }
        if self.raid == RaidType::None {
            return Err(ReplicaError::configuration(format!(
                "rule pattern {:?} has no policy",
                self.pattern
            )));
        }
        Ok(prefix.as_bytes())
    }
}

#[derive(Debug, Default)]
struct Node {
    /// Number of pattern bytes matched to reach this node.
    depth: usize,
    /// Sorted; `children[i]` is reached by `keys[i]`.
    keys: Vec<u8>,
    children: Vec<Node>,
    policy: Option<RaidType>,
}

impl Node {
    fn child(&self, key: u8) -> Option<&Node> {
        self.keys
            .binary_search(&key)
            .ok()
            .map(|pos| &self.children[pos])
    }

    fn child_or_insert(&mut self, key: u8) -> &mut Node {
        let pos = match self.keys.binary_search(&key) {
            Ok(pos) => pos,
            Err(pos) => {
                self.keys.insert(pos, key);
                self.children.insert(
                    pos,
                    Node {
                        depth: self.depth + 1,
                        ..Node::default()
                    },
                );
                pos
            }
        };
        &mut self.children[pos]
    }

    fn collect(&self, prefix: &mut Vec<u8>, out: &mut Vec<Rule>) {
        if let Some(raid) = self.policy {
            out.push(Rule::new(
                format!("{}*", String::from_utf8_lossy(prefix)),
                raid,
            ));
        }
        for (key, child) in self.keys.iter().zip(&self.children) {
            prefix.push(*key);
            child.collect(prefix, out);
            prefix.pop();
        }
    }
}

/// Immutable pattern trie with a default policy.
#[derive(Debug)]
pub struct RuleTree {
    root: Node,
    default: RaidType,
    rules: usize,
}

impl RuleTree {
    /// Build a tree from `rules`. Later duplicates replace earlier ones.
    pub fn construct(rules: &[Rule], default: RaidType) -> ReplicaResult<Self> {
        if rules.is_empty() {
            return Err(ReplicaError::configuration("rule list is empty"));
        }
        if default == RaidType::None {
            return Err(ReplicaError::configuration("default policy cannot be none"));
        }

        let mut root = Node::default();
        for rule in rules {
            let mut node = &mut root;
            for key in rule.prefix()? {
                node = node.child_or_insert(*key);
            }
            if let Some(previous) = node.policy.replace(rule.raid) {
                tracing::warn!(pattern = %rule.pattern, %previous, raid = %rule.raid, "duplicate rule replaces earlier one");
            }
        }

        Ok(Self {
            root,
            default,
            rules: rules.len(),
        })
    }

    /// Policy for an object named `name`.
    pub fn search(&self, name: &str) -> RaidType {
        let mut node = &self.root;
        let mut policy = self.default;
        for key in name.bytes() {
            match node.child(key) {
                Some(child) => node = child,
                None => break,
            }
            if let Some(raid) = node.policy {
                policy = raid;
            }
        }
        tracing::trace!(name, depth = node.depth, %policy, "rule search");
        policy
    }

    pub fn default_policy(&self) -> RaidType {
        self.default
    }

    /// Number of rules the tree was built from.
    pub fn len(&self) -> usize {
        self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules == 0
    }

    /// Effective rules in lexical order, duplicates collapsed.
    pub fn dump(&self) -> Vec<Rule> {
        let mut out = Vec::new();
        self.root.collect(&mut Vec::new(), &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(rules: &[(&str, RaidType)]) -> RuleTree {
        let rules: Vec<Rule> = rules.iter().map(|(p, r)| Rule::new(*p, *r)).collect();
        RuleTree::construct(&rules, RaidType::Raid1).unwrap()
    }

    #[test]
    fn test_most_specific_prefix_wins() {
        let tree = RuleTree::construct(
            &[Rule::new("a*", RaidType::Raid1), Rule::new("ab", RaidType::Raid0)],
            RaidType::Raid0,
        )
        .unwrap();
        assert_eq!(tree.search("abc"), RaidType::Raid0);
        assert_eq!(tree.search("ab"), RaidType::Raid0);
        assert_eq!(tree.search("ax"), RaidType::Raid1);
        assert_eq!(tree.search("a"), RaidType::Raid1);
        assert_eq!(tree.search("b"), RaidType::Raid0);
        assert_eq!(tree.search(""), RaidType::Raid0);
    }

    #[test]
    fn test_partial_walk_falls_back_to_ancestor() {
        let tree = tree(&[("tmp", RaidType::Raid0), ("tmpfile.keep", RaidType::Raid1)]);
        assert_eq!(tree.search("tmpfile.log"), RaidType::Raid0);
        assert_eq!(tree.search("tmpfile.keep.1"), RaidType::Raid1);
        assert_eq!(tree.search("tm"), RaidType::Raid1);
    }

    #[test]
    fn test_duplicate_pattern_last_wins() {
        let tree = tree(&[("log", RaidType::Raid0), ("log*", RaidType::Raid1)]);
        assert_eq!(tree.search("logfile"), RaidType::Raid1);
        assert_eq!(tree.dump(), vec![Rule::new("log*", RaidType::Raid1)]);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_construct_errors() {
        let err = |rules: &[Rule]| RuleTree::construct(rules, RaidType::Raid1).unwrap_err();

        assert!(matches!(err(&[]), ReplicaError::Configuration(_)));
        assert!(matches!(
            err(&[Rule::new("*", RaidType::Raid0)]),
            ReplicaError::Configuration(_)
        ));
        assert!(matches!(
            err(&[Rule::new("a*b", RaidType::Raid0)]),
            ReplicaError::Configuration(_)
        ));
        assert!(matches!(
            err(&[Rule::new("a", RaidType::None)]),
            ReplicaError::Configuration(_)
        ));
        assert!(
            RuleTree::construct(&[Rule::new("a", RaidType::Raid0)], RaidType::None).is_err()
        );
    }

    #[test]
    fn test_keys_stay_sorted() {
        let tree = tree(&[
            ("z", RaidType::Raid0),
            ("b", RaidType::Raid0),
            ("m", RaidType::Raid1),
            ("a", RaidType::Raid1),
        ]);
        assert_eq!(tree.root.keys, b"abmz".to_vec());
        let patterns: Vec<_> = tree.dump().into_iter().map(|r| r.pattern).collect();
        assert_eq!(patterns, vec!["a*", "b*", "m*", "z*"]);
    }

    #[test]
    fn test_drop_deep_tree() {
        let long = "x".repeat(512);
        let tree = tree(&[(long.as_str(), RaidType::Raid0)]);
        assert_eq!(tree.search(&long), RaidType::Raid0);
        drop(tree);
    }
}
