//! Radix trie backing the menu's tab completion.

use std::collections::HashMap;

#[derive(Default)]
struct Node {
    prefix: Vec<u8>,
    children: HashMap<u8, Node>,
    is_word: bool,
}

#[derive(Default)]
pub struct Trie {
    root: Node,
    len: usize,
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

impl Trie {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn add(&mut self, word: &str) {
        if Self::insert(&mut self.root, word.as_bytes()) {
            self.len += 1;
        }
    }

    fn insert(node: &mut Node, rest: &[u8]) -> bool {
        if rest.is_empty() {
            let added = !node.is_word;
            node.is_word = true;
            return added;
        }
        match node.children.get_mut(&rest[0]) {
            None => {
                node.children.insert(
                    rest[0],
                    Node {
                        prefix: rest.to_vec(),
                        children: HashMap::new(),
                        is_word: true,
                    },
                );
                true
            }
            Some(child) => {
                let common = common_prefix_len(&child.prefix, rest);
                if common == child.prefix.len() {
                    return Self::insert(child, &rest[common..]);
                }
                // Diverges inside the child's prefix: split the node.
                let lower_prefix = child.prefix.split_off(common);
                let lower = Node {
                    prefix: lower_prefix,
                    children: std::mem::take(&mut child.children),
                    is_word: child.is_word,
                };
                child.is_word = false;
                child.children.insert(lower.prefix[0], lower);
                Self::insert(child, &rest[common..])
            }
        }
    }

    pub fn contains(&self, word: &str) -> bool {
        let mut node = &self.root;
        let mut rest = word.as_bytes();
        while !rest.is_empty() {
            let Some(child) = node.children.get(&rest[0]) else {
                return false;
            };
            let plen = child.prefix.len();
            if rest.len() < plen || child.prefix[..] != rest[..plen] {
                return false;
            }
            node = child;
            rest = &rest[plen..];
        }
        node.is_word
    }

    /// The continuation every word starting with `input` shares, and whether
    /// appending it completes a word with no longer alternatives.
    pub fn search(&self, input: &str) -> (String, bool) {
        let mut node = &self.root;
        let mut rest = input.as_bytes();
        loop {
            if rest.is_empty() {
                if node.children.len() == 1 {
                    let child = node.children.values().next().unwrap();
                    return (
                        String::from_utf8_lossy(&child.prefix).into_owned(),
                        child.children.is_empty(),
                    );
                }
                return (String::new(), node.children.is_empty());
            }
            let Some(child) = node.children.get(&rest[0]) else {
                return (String::new(), false);
            };
            let common = common_prefix_len(&child.prefix, rest);
            if common == rest.len() {
                // Input ends inside this child's prefix.
                if common < child.prefix.len() {
                    return (
                        String::from_utf8_lossy(&child.prefix[common..]).into_owned(),
                        child.children.is_empty(),
                    );
                }
                node = child;
                rest = &[];
                continue;
            }
            if common < child.prefix.len() {
                // Mismatch inside the prefix: nothing to offer.
                return (String::new(), false);
            }
            node = child;
            rest = &rest[common..];
        }
    }

    pub fn remove(&mut self, word: &str) -> bool {
        if Self::remove_from(&mut self.root, word.as_bytes()) {
            self.len -= 1;
            return true;
        }
        false
    }

    fn remove_from(node: &mut Node, rest: &[u8]) -> bool {
        if rest.is_empty() {
            if node.is_word {
                node.is_word = false;
                return true;
            }
            return false;
        }
        let Some(child) = node.children.get_mut(&rest[0]) else {
            return false;
        };
        let plen = child.prefix.len();
        if rest.len() < plen || child.prefix[..] != rest[..plen] {
            return false;
        }
        if !Self::remove_from(child, &rest[plen..]) {
            return false;
        }
        if !child.is_word {
            if child.children.is_empty() {
                node.children.remove(&rest[0]);
            } else if child.children.len() == 1 {
                // Merge the pass-through node with its only child.
                let mut children = std::mem::take(&mut child.children);
                let (_, mut only) = children.drain().next().unwrap();
                let mut prefix = std::mem::take(&mut child.prefix);
                prefix.extend_from_slice(&only.prefix);
                only.prefix = prefix;
                *child = only;
            }
        }
        true
    }

    pub fn words(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.len);
        Self::collect(&self.root, String::new(), &mut out);
        out
    }

    fn collect(node: &Node, acc: String, out: &mut Vec<String>) {
        if node.is_word {
            out.push(acc.clone());
        }
        for child in node.children.values() {
            let mut next = acc.clone();
            next.push_str(&String::from_utf8_lossy(&child.prefix));
            Self::collect(child, next, out);
        }
    }
}
