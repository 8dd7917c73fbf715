use std::collections::HashMap;
use std::fmt;

/// Identity of a message for at-least-once deduplication.
///
/// `origin` names the producing controller instance; `sequence` is monotone
/// per origin within a job. Canonical string form is `"<origin>-<sequence>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyId {
    pub origin: String,
    pub sequence: u32,
}

impl IdempotencyId {
    pub fn new(origin: impl Into<String>, sequence: u32) -> Self {
        IdempotencyId {
            origin: origin.into(),
            sequence,
        }
    }
}

impl fmt::Display for IdempotencyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.origin, self.sequence)
    }
}

/// Last-seen sequence per origin.
///
/// A message is accepted only if its sequence strictly exceeds the last
/// accepted one for its origin; everything else is a duplicate of an
/// at-least-once redelivery and must be dropped.
#[derive(Debug, Default, Clone)]
pub struct IdempotencyStore {
    last: HashMap<String, u32>,
}

impl IdempotencyStore {
    pub fn new() -> Self {
        IdempotencyStore::default()
    }

    /// Greatest sequence observed for `origin`, if any.
    pub fn last_for_origin(&self, origin: &str) -> Option<IdempotencyId> {
        self.last
            .get(origin)
            .map(|&seq| IdempotencyId::new(origin, seq))
    }

    pub fn is_duplicate(&self, id: &IdempotencyId) -> bool {
        match self.last.get(&id.origin) {
            Some(&seen) => id.sequence <= seen,
            None => false,
        }
    }

    /// Records `id`, keeping the maximum sequence per origin.
    pub fn update(&mut self, id: &IdempotencyId) {
        let entry = self.last.entry(id.origin.clone()).or_insert(id.sequence);
        if id.sequence > *entry {
            *entry = id.sequence;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}
