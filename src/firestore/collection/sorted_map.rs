//! Persistent left-leaning red-black tree.
//!
//! Every update returns a new map that shares all untouched subtrees with the
//! original, so snapshots are O(1) to take and stay valid after later writes.

use std::cmp::Ordering;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

type Link<K, V> = Option<Arc<Node<K, V>>>;

struct Node<K, V> {
    key: K,
    value: V,
    red: bool,
    size: usize,
    left: Link<K, V>,
    right: Link<K, V>,
}

impl<K: Clone, V: Clone> Node<K, V> {
    fn new(key: K, value: V, red: bool, left: Link<K, V>, right: Link<K, V>) -> Arc<Self> {
        let size = 1 + size(&left) + size(&right);
        Arc::new(Self {
            key,
            value,
            red,
            size,
            left,
            right,
        })
    }

    fn copy(&self, red: bool, left: Link<K, V>, right: Link<K, V>) -> Arc<Self> {
        Self::new(self.key.clone(), self.value.clone(), red, left, right)
    }
}

fn size<K, V>(link: &Link<K, V>) -> usize {
    link.as_ref().map_or(0, |node| node.size)
}

fn is_red<K, V>(link: &Link<K, V>) -> bool {
    link.as_ref().map_or(false, |node| node.red)
}

fn is_left_left_red<K, V>(link: &Link<K, V>) -> bool {
    link.as_ref().map_or(false, |node| is_red(&node.left))
}

fn rotate_left<K: Clone, V: Clone>(node: &Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    let Some(right) = &node.right else {
        return Arc::clone(node);
    };
    let new_left = node.copy(true, node.left.clone(), right.left.clone());
    right.copy(node.red, Some(new_left), right.right.clone())
}

fn rotate_right<K: Clone, V: Clone>(node: &Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    let Some(left) = &node.left else {
        return Arc::clone(node);
    };
    let new_right = node.copy(true, left.right.clone(), node.right.clone());
    left.copy(node.red, left.left.clone(), Some(new_right))
}

fn color_flip<K: Clone, V: Clone>(node: &Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    let flip = |link: &Link<K, V>| {
        link.as_ref()
            .map(|child| child.copy(!child.red, child.left.clone(), child.right.clone()))
    };
    node.copy(!node.red, flip(&node.left), flip(&node.right))
}

fn move_red_left<K: Clone, V: Clone>(node: &Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    let mut node = color_flip(node);
    if is_left_left_red(&node.right) {
        let new_right = node.right.as_ref().map(rotate_right);
        node = node.copy(node.red, node.left.clone(), new_right);
        node = rotate_left(&node);
        node = color_flip(&node);
    }
    node
}

fn move_red_right<K: Clone, V: Clone>(node: &Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    let mut node = color_flip(node);
    if is_left_left_red(&node.left) {
        node = rotate_right(&node);
        node = color_flip(&node);
    }
    node
}

fn fix_up<K: Clone, V: Clone>(node: Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    let mut node = node;
    if is_red(&node.right) && !is_red(&node.left) {
        node = rotate_left(&node);
    }
    if is_red(&node.left) && is_left_left_red(&node.left) {
        node = rotate_right(&node);
    }
    if is_red(&node.left) && is_red(&node.right) {
        node = color_flip(&node);
    }
    node
}

fn insert_node<K: Ord + Clone, V: Clone>(link: &Link<K, V>, key: K, value: V) -> Arc<Node<K, V>> {
    let Some(node) = link else {
        return Node::new(key, value, true, None, None);
    };
    let updated = match key.cmp(&node.key) {
        Ordering::Less => node.copy(
            node.red,
            Some(insert_node(&node.left, key, value)),
            node.right.clone(),
        ),
        Ordering::Equal => Node::new(key, value, node.red, node.left.clone(), node.right.clone()),
        Ordering::Greater => node.copy(
            node.red,
            node.left.clone(),
            Some(insert_node(&node.right, key, value)),
        ),
    };
    fix_up(updated)
}

fn min_node<K, V>(node: &Arc<Node<K, V>>) -> &Arc<Node<K, V>> {
    let mut current = node;
    while let Some(left) = &current.left {
        current = left;
    }
    current
}

fn remove_min<K: Clone, V: Clone>(node: &Arc<Node<K, V>>) -> Link<K, V> {
    node.left.as_ref()?;
    let mut node = Arc::clone(node);
    if !is_red(&node.left) && !is_left_left_red(&node.left) {
        node = move_red_left(&node);
    }
    let new_left = node.left.as_ref().and_then(remove_min);
    Some(fix_up(node.copy(node.red, new_left, node.right.clone())))
}

/// Removes `key`, which must be present in the subtree.
fn remove_node<K: Ord + Clone, V: Clone>(node: &Arc<Node<K, V>>, key: &K) -> Link<K, V> {
    let mut node = Arc::clone(node);
    if *key < node.key {
        if !is_red(&node.left) && !is_left_left_red(&node.left) {
            node = move_red_left(&node);
        }
        let new_left = node.left.as_ref().and_then(|left| remove_node(left, key));
        node = node.copy(node.red, new_left, node.right.clone());
    } else {
        if is_red(&node.left) {
            node = rotate_right(&node);
        }
        if *key == node.key && node.right.is_none() {
            return None;
        }
        if !is_red(&node.right) && !is_left_left_red(&node.right) {
            node = move_red_right(&node);
        }
        if *key == node.key {
            let Some(right) = &node.right else {
                return None;
            };
            let successor = min_node(right);
            node = Node::new(
                successor.key.clone(),
                successor.value.clone(),
                node.red,
                node.left.clone(),
                remove_min(right),
            );
        } else {
            let new_right = node.right.as_ref().and_then(|right| remove_node(right, key));
            node = node.copy(node.red, node.left.clone(), new_right);
        }
    }
    Some(fix_up(node))
}

fn blacken<K: Clone, V: Clone>(node: Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    if node.red {
        node.copy(false, node.left.clone(), node.right.clone())
    } else {
        node
    }
}

/// Immutable ordered map with structural sharing.
pub struct SortedMap<K, V> {
    root: Link<K, V>,
}

impl<K, V> SortedMap<K, V> {
    pub fn new() -> Self {
        Self { root: None }
    }

    pub fn len(&self) -> usize {
        size(&self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// In-order iteration from the smallest key.
    pub fn iter(&self) -> Iter<'_, K, V> {
        let mut iter = Iter {
            stack: Vec::new(),
            ascending: true,
        };
        iter.push_spine(self.root.as_ref());
        iter
    }

    /// Reverse in-order iteration from the largest key.
    pub fn iter_rev(&self) -> Iter<'_, K, V> {
        let mut iter = Iter {
            stack: Vec::new(),
            ascending: false,
        };
        iter.push_spine(self.root.as_ref());
        iter
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, value)| value)
    }

    pub fn min_key(&self) -> Option<&K> {
        self.root.as_ref().map(|root| &min_node(root).key)
    }

    pub fn max_key(&self) -> Option<&K> {
        let mut current = self.root.as_ref()?;
        while let Some(right) = &current.right {
            current = right;
        }
        Some(&current.key)
    }
}

impl<K: Ord, V> SortedMap<K, V> {
    pub fn get(&self, key: &K) -> Option<&V> {
        let mut current = &self.root;
        while let Some(node) = current {
            match key.cmp(&node.key) {
                Ordering::Less => current = &node.left,
                Ordering::Equal => return Some(&node.value),
                Ordering::Greater => current = &node.right,
            }
        }
        None
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Position of `key` in iteration order.
    pub fn index_of(&self, key: &K) -> Option<usize> {
        let mut index = 0;
        let mut current = &self.root;
        while let Some(node) = current {
            match key.cmp(&node.key) {
                Ordering::Less => current = &node.left,
                Ordering::Equal => return Some(index + size(&node.left)),
                Ordering::Greater => {
                    index += size(&node.left) + 1;
                    current = &node.right;
                }
            }
        }
        None
    }

    /// Ascending iteration starting at the first key `>= key`.
    pub fn iter_from(&self, key: &K) -> Iter<'_, K, V> {
        let mut stack = Vec::new();
        let mut current = &self.root;
        while let Some(node) = current {
            match key.cmp(&node.key) {
                Ordering::Less => {
                    stack.push(node.as_ref());
                    current = &node.left;
                }
                Ordering::Equal => {
                    stack.push(node.as_ref());
                    break;
                }
                Ordering::Greater => current = &node.right,
            }
        }
        Iter {
            stack,
            ascending: true,
        }
    }

    /// Descending iteration starting at the last key `<= key`.
    pub fn iter_rev_from(&self, key: &K) -> Iter<'_, K, V> {
        let mut stack = Vec::new();
        let mut current = &self.root;
        while let Some(node) = current {
            match key.cmp(&node.key) {
                Ordering::Less => current = &node.left,
                Ordering::Equal => {
                    stack.push(node.as_ref());
                    break;
                }
                Ordering::Greater => {
                    stack.push(node.as_ref());
                    current = &node.right;
                }
            }
        }
        Iter {
            stack,
            ascending: false,
        }
    }
}

impl<K: Ord + Clone, V: Clone> SortedMap<K, V> {
    #[must_use]
    pub fn insert(&self, key: K, value: V) -> Self {
        Self {
            root: Some(blacken(insert_node(&self.root, key, value))),
        }
    }

    #[must_use]
    pub fn remove(&self, key: &K) -> Self {
        let Some(root) = &self.root else {
            return self.clone();
        };
        if !self.contains_key(key) {
            return self.clone();
        }
        let root = if !is_red(&root.left) && !is_red(&root.right) {
            root.copy(true, root.left.clone(), root.right.clone())
        } else {
            Arc::clone(root)
        };
        Self {
            root: remove_node(&root, key).map(blacken),
        }
    }

    /// Verifies ordering, red-black shape and size annotations.
    ///
    /// Returns the black height on success.
    pub fn check_invariants(&self) -> Result<usize, String> {
        if is_red(&self.root) {
            return Err("root is red".to_string());
        }
        check_node(&self.root, None, None)
    }
}

fn check_node<K: Ord, V>(link: &Link<K, V>, lower: Option<&K>, upper: Option<&K>) -> Result<usize, String> {
    let Some(node) = link else {
        return Ok(1);
    };
    if lower.map_or(false, |lower| node.key <= *lower) || upper.map_or(false, |upper| node.key >= *upper) {
        return Err("keys out of order".to_string());
    }
    if node.red && (is_red(&node.left) || is_red(&node.right)) {
        return Err("red node has a red child".to_string());
    }
    if is_red(&node.right) {
        return Err("right-leaning red link".to_string());
    }
    if node.size != 1 + size(&node.left) + size(&node.right) {
        return Err("size annotation mismatch".to_string());
    }
    let left_height = check_node(&node.left, lower, Some(&node.key))?;
    let right_height = check_node(&node.right, Some(&node.key), upper)?;
    if left_height != right_height {
        return Err("black height differs between subtrees".to_string());
    }
    Ok(left_height + usize::from(!node.red))
}

/// Stack-based in-order iterator over a [`SortedMap`].
pub struct Iter<'a, K, V> {
    stack: Vec<&'a Node<K, V>>,
    ascending: bool,
}

impl<'a, K, V> Iter<'a, K, V> {
    fn push_spine(&mut self, mut link: Option<&'a Arc<Node<K, V>>>) {
        while let Some(node) = link {
            self.stack.push(node.as_ref());
            link = if self.ascending {
                node.left.as_ref()
            } else {
                node.right.as_ref()
            };
        }
    }

    pub fn peek(&self) -> Option<(&'a K, &'a V)> {
        self.stack.last().map(|node| (&node.key, &node.value))
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        let next = if self.ascending {
            node.right.as_ref()
        } else {
            node.left.as_ref()
        };
        self.push_spine(next);
        Some((&node.key, &node.value))
    }
}

impl<K, V> Clone for SortedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
        }
    }
}

impl<K, V> Default for SortedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Debug, V: Debug> Debug for SortedMap<K, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K: PartialEq, V: PartialEq> PartialEq for SortedMap<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().eq(other.iter())
    }
}

impl<K: Eq, V: Eq> Eq for SortedMap<K, V> {}

impl<K: Ord + Clone, V: Clone> FromIterator<(K, V)> for SortedMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(SortedMap::new(), |map, (key, value)| map.insert(key, value))
    }
}

impl<'a, K, V> IntoIterator for &'a SortedMap<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
