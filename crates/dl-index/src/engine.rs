use tracing::trace;

use crate::sorting::{compare, precedes, Sorting};

/// Membership test of one filter layer. It may close over external state
/// (a search term, the current time), so calling it twice on the same
/// element is not guaranteed to agree; see `reload_filter`.
pub type Predicate<T> = Box<dyn FnMut(&T) -> bool + Send>;

struct FilterLayer<T> {
    id: String,
    predicate: Predicate<T>,
    /// Ascending backing indices; always a subset of the previous layer.
    selection: Vec<usize>,
}

/// Effect of `update` on the projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Still visible at the same position.
    InPlace(usize),
    /// Still visible, now at `to` (position after removal at `from`).
    Moved { from: usize, to: usize },
    /// Became visible.
    Inserted(usize),
    /// Stopped being visible.
    Deleted(usize),
}

/// Filtered, sorted view over an append-mostly collection.
///
/// Each filter layer narrows the one before it. The projection holds the
/// last layer's backing indices in sort order and is what consumers read.
/// Single inserts and updates cost a binary search per layer; only layer
/// (re)builds touch every element.
///
/// Not synchronized: callers serialize all mutation on one context.
/// Keys are expected to be unique; merging duplicates is the caller's job.
pub struct SortedProjectionEngine<T> {
    backing: Vec<T>,
    layers: Vec<FilterLayer<T>>,
    projection: Vec<usize>,
    sorting: Option<Sorting<T>>,
}

impl<T> Default for SortedProjectionEngine<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SortedProjectionEngine<T> {
    pub fn new() -> Self {
        Self {
            backing: Vec::new(),
            layers: Vec::new(),
            projection: Vec::new(),
            sorting: None,
        }
    }

    pub fn with_records(records: Vec<T>, sorting: Option<Sorting<T>>) -> Self {
        let mut engine = Self {
            backing: Vec::new(),
            layers: Vec::new(),
            projection: Vec::new(),
            sorting,
        };
        engine.reset(records);
        engine
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn len(&self) -> usize {
        self.backing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backing.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.backing.get(index)
    }

    pub fn backing(&self) -> &[T] {
        &self.backing
    }

    pub fn display_count(&self) -> usize {
        self.projection.len()
    }

    pub fn display_record(&self, at: usize) -> Option<&T> {
        self.projection.get(at).map(|&i| &self.backing[i])
    }

    pub fn backing_index(&self, at: usize) -> Option<usize> {
        self.projection.get(at).copied()
    }

    /// Position of backing element `index` in the projection, if visible.
    pub fn display_position(&self, index: usize) -> Option<usize> {
        if index >= self.backing.len() {
            return None;
        }
        let pos = self.insert_position(index);
        (self.projection.get(pos) == Some(&index)).then_some(pos)
    }

    pub fn display_iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.projection.iter().map(|&i| &self.backing[i])
    }

    pub fn projection(&self) -> &[usize] {
        &self.projection
    }

    pub fn sorting(&self) -> Option<&Sorting<T>> {
        self.sorting.as_ref()
    }

    pub fn layer_ids(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.id.as_str()).collect()
    }

    pub fn layer_selection(&self, id: &str) -> Option<&[usize]> {
        self.layers
            .iter()
            .find(|l| l.id == id)
            .map(|l| l.selection.as_slice())
    }

    fn layer_position(&self, id: &str) -> Option<usize> {
        self.layers.iter().position(|l| l.id == id)
    }

    // ── Filter layers ────────────────────────────────────────────────

    /// Add a layer in front of `before` (or last when `before` is absent or
    /// unknown). An existing layer with the same id gets the new predicate
    /// and is rebuilt in place.
    pub fn add_filter(&mut self, id: impl Into<String>, predicate: Predicate<T>, before: Option<&str>) {
        let id = id.into();
        if let Some(pos) = self.layer_position(&id) {
            self.layers[pos].predicate = predicate;
            self.rebuild_layers_from(pos);
            self.rebuild_projection();
            self.check_invariants();
            return;
        }

        let pos = before
            .and_then(|b| self.layer_position(b))
            .unwrap_or(self.layers.len());
        trace!("add filter '{}' at layer {}", id, pos);
        self.layers.insert(
            pos,
            FilterLayer {
                id,
                predicate,
                selection: Vec::new(),
            },
        );
        self.rebuild_layers_from(pos);

        if pos + 1 == self.layers.len() {
            // Only the new predicate ran, over the old last selection, so the
            // result is a subset and the current order can be kept.
            let last = &self.layers[pos].selection;
            self.projection.retain(|i| last.binary_search(i).is_ok());
        } else {
            self.rebuild_projection();
        }
        self.check_invariants();
    }

    /// Drop a layer. Returns false for an unknown id.
    ///
    /// Removing the last layer merges back exactly the elements it had
    /// excluded, without touching any predicate. Removing an inner layer
    /// re-evaluates every layer after it, as their predicates may not give
    /// the same answers again.
    pub fn remove_filter(&mut self, id: &str) -> bool {
        let Some(pos) = self.layer_position(id) else {
            return false;
        };

        let removed = self.layers.remove(pos);
        if pos == self.layers.len() {
            let exposed = self.last_selection();
            let mut restored = sorted_difference(&exposed, &removed.selection);
            trace!("remove last filter '{}', restoring {}", id, restored.len());
            let sorting = self.sorting.as_ref();
            let backing = &self.backing;
            restored.sort_unstable_by(|&a, &b| compare(sorting, backing, a, b));
            self.merge_into_projection(restored);
        } else {
            trace!("remove inner filter '{}', rebuilding from layer {}", id, pos);
            self.rebuild_layers_from(pos);
            self.rebuild_projection();
        }
        self.check_invariants();
        true
    }

    /// Re-run one layer and everything after it, for when the state its
    /// predicate reads has changed. Returns false for an unknown id.
    pub fn reload_filter(&mut self, id: &str) -> bool {
        let Some(pos) = self.layer_position(id) else {
            return false;
        };
        self.rebuild_layers_from(pos);
        self.rebuild_projection();
        self.check_invariants();
        true
    }

    // ── Element mutation ─────────────────────────────────────────────

    /// Append `record`. Returns its projection position when it passes every
    /// layer.
    pub fn insert(&mut self, record: T) -> Option<usize> {
        let index = self.backing.len();
        self.backing.push(record);

        let record = &self.backing[index];
        let mut passing = true;
        for layer in &mut self.layers {
            passing = (layer.predicate)(record);
            if !passing {
                break;
            }
            layer.selection.push(index);
        }
        if !passing {
            self.check_invariants();
            return None;
        }

        let pos = self.insert_position(index);
        self.projection.insert(pos, index);
        self.check_invariants();
        Some(pos)
    }

    /// Replace the element at `index` and re-evaluate its layer membership.
    /// `None` means it was hidden before and still is.
    pub fn update(&mut self, index: usize, record: T) -> Option<UpdateOutcome> {
        debug_assert!(index < self.backing.len(), "update out of bounds");
        // Located with the old value, which the projection is ordered by.
        let old_pos = self.display_position(index);
        self.backing[index] = record;

        let record = &self.backing[index];
        let mut passing = true;
        for layer in &mut self.layers {
            let found = layer.selection.binary_search(&index);
            if passing {
                passing = (layer.predicate)(record);
            }
            match (found, passing) {
                (Ok(at), false) => {
                    layer.selection.remove(at);
                }
                (Err(at), true) => layer.selection.insert(at, index),
                _ => {}
            }
        }

        let outcome = match (old_pos, passing) {
            (None, false) => None,
            (None, true) => {
                let pos = self.insert_position(index);
                self.projection.insert(pos, index);
                Some(UpdateOutcome::Inserted(pos))
            }
            (Some(pos), false) => {
                self.projection.remove(pos);
                Some(UpdateOutcome::Deleted(pos))
            }
            (Some(pos), true) => {
                let sorting = self.sorting.as_ref();
                let backing = &self.backing;
                let proj = &self.projection;
                let after_prev = pos == 0 || precedes(sorting, backing, proj[pos - 1], index);
                let before_next =
                    pos + 1 == proj.len() || precedes(sorting, backing, index, proj[pos + 1]);

                if after_prev && before_next {
                    Some(UpdateOutcome::InPlace(pos))
                } else {
                    self.projection.remove(pos);
                    let to = self.insert_position(index);
                    self.projection.insert(to, index);
                    Some(UpdateOutcome::Moved { from: pos, to })
                }
            }
        };
        self.check_invariants();
        outcome
    }

    /// Erase the elements at `indices` (ascending, unique) and shift every
    /// remaining index down accordingly. Returns the projection positions
    /// that disappeared, ascending.
    pub fn remove(&mut self, indices: &[usize]) -> Vec<usize> {
        debug_assert!(indices.windows(2).all(|w| w[0] < w[1]), "indices must be sorted");
        debug_assert!(indices.last().is_none_or(|&i| i < self.backing.len()));
        if indices.is_empty() {
            return Vec::new();
        }

        let removed_positions: Vec<usize> = self
            .projection
            .iter()
            .enumerate()
            .filter(|(_, i)| indices.binary_search(i).is_ok())
            .map(|(pos, _)| pos)
            .collect();

        let mut current = 0;
        let mut pending = indices.iter().peekable();
        self.backing.retain(|_| {
            let drop = pending.peek() == Some(&&current);
            if drop {
                pending.next();
            }
            current += 1;
            !drop
        });

        for layer in &mut self.layers {
            shift_remove_sorted(&mut layer.selection, indices);
        }
        shift_remove_unsorted(&mut self.projection, indices);

        self.check_invariants();
        removed_positions
    }

    /// Replace the whole collection and rebuild every layer and the order.
    pub fn reset(&mut self, records: Vec<T>) {
        self.backing = records;
        self.rebuild_layers_from(0);
        self.rebuild_projection();
        self.check_invariants();
    }

    /// Change the order. Flipping the direction of the current key reverses
    /// the projection instead of sorting again.
    pub fn set_sorting(&mut self, sorting: Option<Sorting<T>>) {
        let flip = matches!(
            (&self.sorting, &sorting),
            (Some(current), Some(next)) if next.is_reverse_of(current)
        );
        self.sorting = sorting;
        if flip {
            self.projection.reverse();
        } else {
            self.rebuild_projection();
        }
        self.check_invariants();
    }

    // ── Internals ────────────────────────────────────────────────────

    fn insert_position(&self, index: usize) -> usize {
        let sorting = self.sorting.as_ref();
        self.projection
            .partition_point(|&p| precedes(sorting, &self.backing, p, index))
    }

    fn last_selection(&self) -> Vec<usize> {
        match self.layers.last() {
            Some(layer) => layer.selection.clone(),
            None => (0..self.backing.len()).collect(),
        }
    }

    fn rebuild_layers_from(&mut self, start: usize) {
        let backing = &self.backing;
        for i in start..self.layers.len() {
            let (before, rest) = self.layers.split_at_mut(i);
            let layer = &mut rest[0];
            let predicate = &mut layer.predicate;
            let selection: Vec<usize> = match before.last() {
                Some(prev) => prev
                    .selection
                    .iter()
                    .copied()
                    .filter(|&j| predicate(&backing[j]))
                    .collect(),
                None => (0..backing.len()).filter(|&j| predicate(&backing[j])).collect(),
            };
            layer.selection = selection;
        }
    }

    fn rebuild_projection(&mut self) {
        let mut projection = self.last_selection();
        let sorting = self.sorting.as_ref();
        let backing = &self.backing;
        if sorting.is_some() {
            projection.sort_unstable_by(|&a, &b| compare(sorting, backing, a, b));
        }
        self.projection = projection;
    }

    /// Merge already-ordered indices into the projection. Few elements are
    /// binary-inserted; many are merged in one linear pass.
    fn merge_into_projection(&mut self, restored: Vec<usize>) {
        if restored.is_empty() {
            return;
        }
        let sorting = self.sorting.as_ref();
        let backing = &self.backing;

        if restored.len() * 8 < self.projection.len() {
            for index in restored {
                let pos = self
                    .projection
                    .partition_point(|&p| precedes(sorting, backing, p, index));
                self.projection.insert(pos, index);
            }
            return;
        }

        let current = std::mem::take(&mut self.projection);
        let mut merged = Vec::with_capacity(current.len() + restored.len());
        let (mut a, mut b) = (current.into_iter().peekable(), restored.into_iter().peekable());
        loop {
            let take_restored = match (a.peek(), b.peek()) {
                (Some(&x), Some(&y)) => precedes(sorting, backing, y, x),
                (None, Some(_)) => true,
                (Some(_), None) => false,
                (None, None) => break,
            };
            let next = if take_restored { b.next() } else { a.next() };
            merged.extend(next);
        }
        self.projection = merged;
    }

    #[cfg(debug_assertions)]
    fn check_invariants(&self) {
        let mut previous: Option<&[usize]> = None;
        for layer in &self.layers {
            debug_assert!(
                layer.selection.windows(2).all(|w| w[0] < w[1]),
                "layer '{}' not sorted",
                layer.id
            );
            debug_assert!(layer.selection.last().is_none_or(|&i| i < self.backing.len()));
            if let Some(prev) = previous {
                debug_assert!(
                    sorted_difference(&layer.selection, prev).is_empty(),
                    "layer '{}' is not a subset of its predecessor",
                    layer.id
                );
            }
            previous = Some(&layer.selection);
        }

        let expected = previous.map_or(self.backing.len(), <[usize]>::len);
        debug_assert_eq!(self.projection.len(), expected, "projection size drifted");
        let sorting = self.sorting.as_ref();
        debug_assert!(
            self.projection
                .windows(2)
                .all(|w| precedes(sorting, &self.backing, w[0], w[1])),
            "projection not sorted"
        );
    }

    #[cfg(not(debug_assertions))]
    fn check_invariants(&self) {}
}

/// Elements of ascending `a` that are not in ascending `b`.
fn sorted_difference(a: &[usize], b: &[usize]) -> Vec<usize> {
    let mut out = Vec::new();
    let mut j = 0;
    for &x in a {
        while j < b.len() && b[j] < x {
            j += 1;
        }
        if j >= b.len() || b[j] != x {
            out.push(x);
        }
    }
    out
}

/// Drop removed indices from an ascending index array and move the rest down
/// by the number of removed indices below them. One pass, both inputs sorted.
fn shift_remove_sorted(selection: &mut Vec<usize>, removed: &[usize]) {
    let mut below = 0;
    selection.retain_mut(|index| {
        while below < removed.len() && removed[below] < *index {
            below += 1;
        }
        if below < removed.len() && removed[below] == *index {
            return false;
        }
        *index -= below;
        true
    });
}

/// Same as `shift_remove_sorted` for an array in arbitrary (sort) order.
fn shift_remove_unsorted(indices: &mut Vec<usize>, removed: &[usize]) {
    indices.retain_mut(|index| {
        let below = removed.partition_point(|&r| r < *index);
        if removed.get(below) == Some(index) {
            return false;
        }
        *index -= below;
        true
    });
}
