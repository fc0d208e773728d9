use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{LabelError, Result};
use crate::id_service::IdService;
use crate::label::{ensure_regular, is_regular};

// ============================================================================
// LOOKUP TABLE – persisted fragment → segment pairs
// ============================================================================

/// Non-identity fragment → segment entries. Stored on disk as a 2×N block,
/// row 0 keys, row 1 values.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupTable {
    pub keys: Vec<u64>,
    pub values: Vec<u64>,
}

impl LookupTable {
    pub fn new(keys: Vec<u64>, values: Vec<u64>) -> Self {
        Self { keys, values }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn to_block(&self) -> [Vec<u64>; 2] {
        [self.keys.clone(), self.values.clone()]
    }

    pub fn from_block(block: [Vec<u64>; 2]) -> Self {
        let [keys, values] = block;
        Self { keys, values }
    }
}

// ============================================================================
// CHANGE RECORDS
// ============================================================================

/// What a merge or detach rewrote. Returned to callers so the display can
/// invalidate tiles showing any of `fragments`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssignmentChange {
    /// Fragments whose segment changed.
    pub fragments: Vec<u64>,
    /// Segment ids that no longer exist after this change.
    pub retired: Vec<u64>,
    /// Segment the changed fragments now belong to.
    pub segment: u64,
}

// ============================================================================
// ASSIGNMENT GRAPH
// ============================================================================

/// Fragment → segment mapping with an owned reverse index.
///
/// `forward` only holds non-identity entries. `members[s]` exists for every
/// segment with more than one fragment and lists all of them, including `s`
/// itself. Each lookup is a single hash access; there is no path compression.
#[derive(Debug)]
pub struct AssignmentGraph {
    forward: HashMap<u64, u64>,
    members: HashMap<u64, HashSet<u64>>,
    ids: Arc<IdService>,
}

impl AssignmentGraph {
    pub fn new(ids: Arc<IdService>) -> Self {
        Self {
            forward: HashMap::new(),
            members: HashMap::new(),
            ids,
        }
    }

    /// Segment of `fragment`; unmapped fragments are their own segment.
    #[inline]
    pub fn segment(&self, fragment: u64) -> u64 {
        self.forward.get(&fragment).copied().unwrap_or(fragment)
    }

    /// All fragments of the segment `fragment` belongs to.
    pub fn fragments_of(&self, fragment: u64) -> HashSet<u64> {
        let seg = self.segment(fragment);
        self.members
            .get(&seg)
            .cloned()
            .unwrap_or_else(|| HashSet::from([seg]))
    }

    /// Number of non-identity entries.
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Segments with more than one fragment.
    pub fn merged_segment_count(&self) -> usize {
        self.members.len()
    }

    /// Merge the segments of `a` and `b`.
    ///
    /// The representative is `merge_into`'s segment when that is one of the
    /// two, otherwise the larger segment id. The losing segment's fragments
    /// are relabelled. Returns `None` when both already share a segment.
    pub fn merge(
        &mut self,
        a: u64,
        b: u64,
        merge_into: Option<u64>,
    ) -> Result<Option<AssignmentChange>> {
        ensure_regular(a)?;
        ensure_regular(b)?;
        let sa = self.segment(a);
        let sb = self.segment(b);
        if sa == sb {
            return Ok(None);
        }

        let larger = sa.max(sb);
        let rep = match merge_into.map(|hint| self.segment(hint)) {
            Some(s) if s == sa || s == sb => s,
            Some(s) => {
                warn!(hint = s, sa, sb, "merge target is neither segment, using larger id");
                larger
            }
            None => larger,
        };
        let loser = if rep == sa { sb } else { sa };

        let moved = self
            .members
            .remove(&loser)
            .unwrap_or_else(|| HashSet::from([loser]));
        for &f in &moved {
            self.forward.insert(f, rep);
        }
        let group = self
            .members
            .entry(rep)
            .or_insert_with(|| HashSet::from([rep]));
        group.extend(moved.iter().copied());

        debug!(a, b, segment = rep, moved = moved.len(), "merged segments");
        let mut fragments: Vec<u64> = moved.into_iter().collect();
        fragments.sort_unstable();
        Ok(Some(AssignmentChange {
            fragments,
            retired: vec![loser],
            segment: rep,
        }))
    }

    /// Peel `fragment` out of its segment into a fresh one-fragment segment.
    /// No-op when the fragment is its own segment.
    pub fn detach(&mut self, fragment: u64) -> Result<Option<AssignmentChange>> {
        ensure_regular(fragment)?;
        let old = self.segment(fragment);
        if old == fragment {
            return Ok(None);
        }

        let fresh = self.ids.next()?;

        if let Some(group) = self.members.get_mut(&old) {
            group.remove(&fragment);
            if group.len() <= 1 {
                self.members.remove(&old);
            }
        }
        self.forward.insert(fragment, fresh);
        self.members.insert(fresh, HashSet::from([fresh, fragment]));

        debug!(fragment, from = old, to = fresh, "detached fragment");
        Ok(Some(AssignmentChange {
            fragments: vec![fragment],
            retired: Vec::new(),
            segment: fresh,
        }))
    }

    /// Replace the whole mapping with a persisted table.
    ///
    /// Identity pairs are skipped; a key listed twice must carry the same
    /// value. A value that is itself assigned elsewhere is rejected because
    /// the result would not be a function onto segments. On error the graph
    /// is left untouched.
    pub fn init_from_lookup_table(&mut self, keys: &[u64], values: &[u64]) -> Result<()> {
        if keys.len() != values.len() {
            return Err(LabelError::MalformedTable(format!(
                "{} keys but {} values",
                keys.len(),
                values.len()
            )));
        }

        let mut forward: HashMap<u64, u64> = HashMap::with_capacity(keys.len());
        let mut max_id = 0u64;
        for (&k, &v) in keys.iter().zip(values) {
            if !is_regular(k) || !is_regular(v) {
                return Err(LabelError::MalformedTable(format!(
                    "entry {} -> {} uses a sentinel id",
                    k, v
                )));
            }
            max_id = max_id.max(k).max(v);
            if k == v {
                continue;
            }
            match forward.insert(k, v) {
                Some(prev) if prev != v => {
                    return Err(LabelError::MalformedTable(format!(
                        "fragment {} assigned to both {} and {}",
                        k, prev, v
                    )));
                }
                _ => {}
            }
        }

        let mut members: HashMap<u64, HashSet<u64>> = HashMap::new();
        for (&k, &v) in &forward {
            if let Some(&w) = forward.get(&v) {
                return Err(LabelError::MalformedTable(format!(
                    "segment {} of fragment {} is itself assigned to {}",
                    v, k, w
                )));
            }
            let group = members.entry(v).or_insert_with(|| HashSet::from([v]));
            group.insert(k);
        }

        self.ids.invalidate(max_id);
        self.forward = forward;
        self.members = members;
        Ok(())
    }

    /// Non-identity entries sorted by fragment id.
    pub fn export_lookup_table(&self) -> LookupTable {
        let mut pairs: Vec<(u64, u64)> = self.forward.iter().map(|(&k, &v)| (k, v)).collect();
        pairs.sort_unstable();
        let (keys, values) = pairs.into_iter().unzip();
        LookupTable { keys, values }
    }
}
