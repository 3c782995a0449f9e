use std::collections::HashMap;

use crate::record::RecordKind;

/// Collects the record kinds every module registers during boot.
///
/// Registration is idempotent and append-only; call `finalize` once, after
/// the last `register` and before the first envelope is built.
#[derive(Debug, Default)]
pub struct StreamTypeRegistryBuilder {
    kinds: Vec<RecordKind>,
}

impl StreamTypeRegistryBuilder {
    pub fn register(&mut self, kind: RecordKind) {
        if !self.kinds.contains(&kind) {
            self.kinds.push(kind);
        }
    }

    /// Assigns sequential ids starting at 1, ordered by stable stream name.
    ///
    /// The assignment depends only on the set of registered kinds, never on
    /// registration order, so every cluster node running the same modules
    /// computes an identical mapping with no coordination round-trip.
    pub fn finalize(mut self) -> StreamTypeRegistry {
        self.kinds.sort_by_key(|k| k.stream_name());

        let by_kind = self
            .kinds
            .iter()
            .enumerate()
            .map(|(i, kind)| (*kind, i as u32 + 1))
            .collect();

        StreamTypeRegistry {
            by_kind,
            by_id: self.kinds,
        }
    }
}

/// Finalized kind ↔ id mapping; lookups are O(1).
#[derive(Debug)]
pub struct StreamTypeRegistry {
    by_kind: HashMap<RecordKind, u32>,
    by_id: Vec<RecordKind>,
}

impl StreamTypeRegistry {
    pub fn id_for(&self, kind: RecordKind) -> Option<u32> {
        self.by_kind.get(&kind).copied()
    }

    pub fn kind_for(&self, id: u32) -> Option<RecordKind> {
        if id == 0 {
            return None;
        }
        self.by_id.get(id as usize - 1).copied()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
