use std::collections::BTreeMap;

use crate::cache_type::HaloGame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Namespace {
    pub id: i32,
    /// Ids below this value in the namespace index the table directly.
    pub min: i32,
    pub start: i32,
}

/// Maps bit-packed string ids to indices in a cache's string table.
///
/// A string id is `length | namespace | index` from most to least significant
/// bits. Each namespace owns a contiguous run of the table beginning at its
/// `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringIdTranslator {
    index_bits: u32,
    namespace_bits: u32,
    length_bits: u32,
    namespaces: BTreeMap<i32, Namespace>,
}

fn mask(bits: u32) -> i32 {
    ((1u64 << bits) - 1) as i32
}

impl StringIdTranslator {
    pub fn new(index_bits: u32, namespace_bits: u32, length_bits: u32) -> Self {
        Self {
            index_bits,
            namespace_bits,
            length_bits,
            namespaces: BTreeMap::new(),
        }
    }

    /// Bit widths used by each game's string ids.
    pub fn for_game(game: HaloGame) -> Self {
        match game {
            HaloGame::HaloReach | HaloGame::Halo4 | HaloGame::Halo2X => Self::new(17, 8, 7),
            _ => Self::new(16, 8, 8),
        }
    }

    pub fn with_namespace(mut self, id: i32, min: i32, start: i32) -> Self {
        self.namespaces.insert(id, Namespace { id, min, start });
        self
    }

    /// Namespaces from a header table of per-namespace string counts.
    ///
    /// Namespaces `1..n` are laid out consecutively after the first
    /// `counts[0]` strings and namespace 0 continues after the last of them.
    pub fn from_namespace_table(mut self, counts: &[i32]) -> Self {
        self.namespaces.clear();
        if counts.len() <= 1 {
            return self;
        }
        let mask = mask(self.index_bits);
        let mut start = counts[0] & mask;
        for (id, count) in counts.iter().enumerate().skip(1) {
            let id = id as i32;
            self.namespaces.insert(id, Namespace { id, min: 0, start });
            start += count & mask;
        }
        self.namespaces.insert(
            0,
            Namespace {
                id: 0,
                min: counts[0] & mask,
                start,
            },
        );
        self
    }

    pub fn index_bits(&self) -> u32 {
        self.index_bits
    }
    pub fn namespace_bits(&self) -> u32 {
        self.namespace_bits
    }
    pub fn length_bits(&self) -> u32 {
        self.length_bits
    }
    pub fn namespaces(&self) -> impl Iterator<Item = &Namespace> {
        self.namespaces.values()
    }

    pub fn get_string_index(&self, string_id: i32) -> i32 {
        let index = string_id & mask(self.index_bits);
        let id = (string_id >> self.index_bits) & mask(self.namespace_bits);

        // unknown namespaces fall back to the nearest lower one
        match self.namespaces.range(..=id).next_back() {
            Some((_, ns)) if index >= ns.min => index - ns.min + ns.start,
            _ => index,
        }
    }

    pub fn get_string_id(&self, index: i32) -> i32 {
        let ns = self
            .namespaces
            .values()
            .filter(|ns| ns.start <= index)
            .max_by_key(|ns| ns.start);
        match ns {
            Some(ns) => index - ns.start + ((ns.id << self.index_bits) | ns.min),
            None => index,
        }
    }
}
