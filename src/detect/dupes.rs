// CLASSIFICATION: COMMUNITY
// Filename: dupes.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Aliasing classes of a kernel's memory arguments.

use std::collections::BTreeMap;

use crate::registry::KernelArgument;

/// For each argument index, the lowest index bound to the same buffer or
/// image (or the index itself).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DuplicateMap(Vec<u32>);

impl DuplicateMap {
    /// Resolve aliasing for arguments `0..num_args`. Quadratic in the
    /// argument count; unset and non-memory arguments are unique.
    pub fn resolve(num_args: u32, args: &BTreeMap<u32, KernelArgument>) -> Self {
        let mut dupe = Vec::with_capacity(num_args as usize);
        for i in 0..num_args {
            let handle = args.get(&i).and_then(|a| a.mem_handle());
            let earlier = handle.and_then(|h| {
                (0..i).find(|j| args.get(j).and_then(|a| a.mem_handle()) == Some(h))
            });
            dupe.push(earlier.unwrap_or(i));
        }
        DuplicateMap(dupe)
    }

    pub fn from_indices(dupe: Vec<u32>) -> Self {
        DuplicateMap(dupe)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn canonical(&self, index: u32) -> u32 {
        self.0.get(index as usize).copied().unwrap_or(index)
    }

    pub fn is_canonical(&self, index: u32) -> bool {
        self.canonical(index) == index
    }

    /// `(alias, canonical)` pairs in index order.
    pub fn aliases(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.0
            .iter()
            .enumerate()
            .map(|(i, &j)| (i as u32, j))
            .filter(|(i, j)| i != j)
    }

    pub fn has_aliases(&self) -> bool {
        self.aliases().next().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ArgBinding;
    use crate::runtime::MemHandle;

    fn args(bindings: &[Option<usize>]) -> BTreeMap<u32, KernelArgument> {
        bindings
            .iter()
            .enumerate()
            .map(|(i, b)| {
                let binding = match b {
                    Some(h) => ArgBinding::Untracked(MemHandle(*h)),
                    None => ArgBinding::Value(vec![0; 4]),
                };
                (i as u32, KernelArgument::new(i as u32, binding))
            })
            .collect()
    }

    #[test]
    fn earliest_match_wins() {
        let a = args(&[Some(0x10), Some(0x20), Some(0x10), Some(0x10), None, Some(0x20)]);
        let map = DuplicateMap::resolve(6, &a);
        assert_eq!(map, DuplicateMap::from_indices(vec![0, 1, 0, 0, 4, 1]));
        assert_eq!(map.aliases().collect::<Vec<_>>(), vec![(2, 0), (3, 0), (5, 1)]);
    }

    #[test]
    fn values_and_gaps_are_unique() {
        let mut a = args(&[None, None, Some(0x10)]);
        a.remove(&1);
        let map = DuplicateMap::resolve(4, &a);
        assert_eq!(map, DuplicateMap::from_indices(vec![0, 1, 2, 3]));
        assert!(!map.has_aliases());
        assert_eq!(map.canonical(9), 9);
    }

    #[test]
    fn resolved_maps_are_minimal_aliases() {
        let handles = [Some(3usize), None, Some(1), Some(3), Some(1), Some(2), Some(3), None];
        let bindings: Vec<Option<usize>> = handles.iter().map(|h| h.map(|v| v * 0x10)).collect();
        let a = args(&bindings);
        let map = DuplicateMap::resolve(bindings.len() as u32, &a);
        for i in 0..bindings.len() as u32 {
            let j = map.canonical(i);
            assert!(j <= i);
            let h = bindings[i as usize];
            if j == i {
                assert!(h.is_none() || (0..i).all(|k| bindings[k as usize] != h));
            } else {
                assert_eq!(bindings[j as usize], h);
                assert!((0..j).all(|k| bindings[k as usize] != h));
            }
        }
    }
}
