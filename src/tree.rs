//! Balanced name tree over one storage's children.
//!
//! The on-disk format threads each storage's children through
//! `left_sid`/`right_sid`/`child_sid` as a red-black tree, but any
//! balanced BST is a valid substitute provided the rebuild step
//! serialises a valid binary search tree under [`compare_names`]; the
//! on-disk `color` byte is informational only. This module rebuilds a
//! height-balanced tree from a sorted child list on every structural
//! change rather than performing incremental red-black rotations.

use std::cmp::Ordering;

use crate::directory::{compare_names, DirectoryEntry};
use crate::error::{Error, Result};

/// Walk the tree rooted at `root` in ascending name order, returning the
/// directory SIDs in that order. Used both for enumeration and to recover
/// a storage's children before a rebuild.
pub fn in_order(entries: &[DirectoryEntry], root: Option<u32>) -> Vec<u32> {
    let mut out = Vec::new();
    let mut stack = Vec::new();
    let mut current = root;
    loop {
        while let Some(sid) = current {
            stack.push(sid);
            current = entries[sid as usize].left_sid;
        }
        match stack.pop() {
            Some(sid) => {
                out.push(sid);
                current = entries[sid as usize].right_sid;
            }
            None => break,
        }
    }
    out
}

pub fn find(entries: &[DirectoryEntry], root: Option<u32>, name: &str) -> Option<u32> {
    let mut current = root;
    while let Some(sid) = current {
        let node = &entries[sid as usize];
        match compare_names(name, &node.name) {
            Ordering::Equal => return Some(sid),
            Ordering::Less => current = node.left_sid,
            Ordering::Greater => current = node.right_sid,
        }
    }
    None
}

/// Rebuild a height-balanced tree over `children` (directory SIDs, any
/// order) and write the resulting `left_sid`/`right_sid` links directly
/// into `entries`. Returns the new subtree root, or `None` if `children`
/// is empty.
pub fn rebuild(entries: &mut [DirectoryEntry], mut children: Vec<u32>) -> Result<Option<u32>> {
    children.sort_by(|&a, &b| compare_names(&entries[a as usize].name, &entries[b as usize].name));
    for w in children.windows(2) {
        if compare_names(&entries[w[0] as usize].name, &entries[w[1] as usize].name)
            == Ordering::Equal
        {
            return Err(Error::DuplicatedItem(entries[w[0] as usize].name.clone()));
        }
    }
    Ok(build_balanced(entries, &children))
}

fn build_balanced(entries: &mut [DirectoryEntry], sorted: &[u32]) -> Option<u32> {
    if sorted.is_empty() {
        return None;
    }
    let mid = sorted.len() / 2;
    let root = sorted[mid];
    let left = build_balanced(entries, &sorted[..mid]);
    let right = build_balanced(entries, &sorted[mid + 1..]);
    entries[root as usize].left_sid = left;
    entries[root as usize].right_sid = right;
    root
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::DirectoryEntry;

    fn entry_vec(names: &[&str]) -> Vec<DirectoryEntry> {
        names.iter().map(|n| DirectoryEntry::new_stream(n)).collect()
    }

    #[test]
    fn rebuild_then_in_order_matches_sorted_order() {
        let mut entries = entry_vec(&["zzz", "a", "bb", "c"]);
        let children: Vec<u32> = (0..entries.len() as u32).collect();
        let root = rebuild(&mut entries, children).unwrap();
        let order = in_order(&entries, root);
        let names: Vec<&str> = order.iter().map(|&i| entries[i as usize].name.as_str()).collect();
        // length-first: "a" < "c" < "bb" < "zzz"
        assert_eq!(names, vec!["a", "c", "bb", "zzz"]);
    }

    #[test]
    fn rejects_duplicate_names() {
        let mut entries = entry_vec(&["dup", "dup"]);
        let children: Vec<u32> = vec![0, 1];
        assert!(rebuild(&mut entries, children).is_err());
    }

    #[test]
    fn find_locates_existing_child() {
        let mut entries = entry_vec(&["alpha", "beta", "gamma"]);
        let children: Vec<u32> = (0..entries.len() as u32).collect();
        let root = rebuild(&mut entries, children).unwrap();
        assert_eq!(find(&entries, root, "beta"), Some(1));
        assert_eq!(find(&entries, root, "missing"), None);
    }
}
