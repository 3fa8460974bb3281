//! DAG helpers shared by join and delta computation.

use std::collections::{HashMap, HashSet, VecDeque};

use reef_types::Hash;

use crate::entry::Entry;

/// Order entries parents-before-children (Kahn's algorithm).
///
/// Only edges between members of `entries` count; parents outside the set
/// are treated as already satisfied. Ties are broken by clock so the output
/// is deterministic.
pub fn topological_order(mut entries: HashMap<Hash, Entry>) -> Vec<Entry> {
    let members: HashSet<Hash> = entries.keys().copied().collect();
    let mut in_degree: HashMap<Hash, usize> = HashMap::with_capacity(entries.len());
    let mut children: HashMap<Hash, Vec<Hash>> = HashMap::new();

    for (hash, entry) in &entries {
        let mut parents: Vec<Hash> = entry
            .next()
            .iter()
            .copied()
            .filter(|p| members.contains(p))
            .collect();
        parents.sort();
        parents.dedup();
        in_degree.insert(*hash, parents.len());
        for parent in parents {
            children.entry(parent).or_default().push(*hash);
        }
    }

    let mut roots: Vec<&Entry> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .filter_map(|(h, _)| entries.get(h))
        .collect();
    roots.sort_by(|a, b| a.clock().cmp(b.clock()).then_with(|| a.hash().cmp(&b.hash())));
    let mut ready: VecDeque<Hash> = roots.into_iter().map(|e| e.hash()).collect();

    let mut result = Vec::with_capacity(entries.len());

    while let Some(hash) = ready.pop_front() {
        if let Some(entry) = entries.remove(&hash) {
            result.push(entry);
        }

        if let Some(kids) = children.get(&hash) {
            for kid in kids {
                if let Some(deg) = in_degree.get_mut(kid) {
                    *deg -= 1;

                    if *deg == 0 {
                        ready.push_back(*kid);
                    }
                }
            }
        }
    }

    result
}
