//! # Grouping Sequence
//!
//! Ordered list of acquisition units plus a run-length partition of that list into
//! contiguous parallel groups. Group `i` owns the next `run_lengths[i]` units.
//!
//! All structural edits go through [`GroupingSequence`], which keeps the following true
//! after every call:
//!
//! - there is always at least one unit
//! - every run-length is at least 1
//! - the run-lengths sum to the number of units
//!
//! The run-length vector is never handed out mutably.

mod unit;

pub use unit::{Unit, UnitId};

use serde::Serialize;
use std::ops::Range;

use crate::error::{Result, SchedulerError};
use crate::logging::log_error;

/// Location of one group inside the unit list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSpan {
    pub group: usize,
    pub first: usize,
    pub len: usize,
}

impl GroupSpan {
    pub fn range(&self) -> Range<usize> {
        self.first..self.first + self.len
    }

    pub fn last(&self) -> usize {
        self.first + self.len - 1
    }
}

/// One row of the acquisition table as presented to a view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceRow {
    /// 1-based group number, shared by all units of a parallel group
    pub order: usize,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct GroupingSequence {
    units: Vec<Unit>,
    run_lengths: Vec<usize>,
}

impl GroupingSequence {
    /// Create a sequence holding a single ungrouped unit
    pub fn new(first: Unit) -> Self {
        Self {
            units: vec![first],
            run_lengths: vec![1],
        }
    }

    /// Build a sequence from explicit groups, in order
    pub fn from_groups(groups: Vec<Vec<Unit>>) -> Result<Self> {
        if groups.is_empty() || groups.iter().any(Vec::is_empty) {
            return Err(SchedulerError::invariant(
                "a sequence needs at least one group and every group needs at least one unit",
            ));
        }
        let run_lengths = groups.iter().map(Vec::len).collect();
        let units = groups.into_iter().flatten().collect();
        Ok(Self { units, run_lengths })
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Always false; the last unit can never be removed
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn group_count(&self) -> usize {
        self.run_lengths.len()
    }

    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    pub fn unit(&self, index: usize) -> Option<&Unit> {
        self.units.get(index)
    }

    /// Mutable access to a unit's name and settings; its position is not editable here
    pub fn unit_mut(&mut self, index: usize) -> Option<&mut Unit> {
        self.units.get_mut(index)
    }

    pub fn position_of(&self, id: UnitId) -> Option<usize> {
        self.units.iter().position(|unit| unit.id() == id)
    }

    pub fn unit_ids(&self) -> Vec<UnitId> {
        self.units.iter().map(Unit::id).collect()
    }

    /// Read-only view of the group sizes
    pub fn run_lengths(&self) -> &[usize] {
        &self.run_lengths
    }

    /// Whether the run-length partition currently covers the unit list exactly
    pub fn is_consistent(&self) -> bool {
        !self.units.is_empty()
            && self.run_lengths.iter().all(|&len| len >= 1)
            && self.run_lengths.iter().sum::<usize>() == self.units.len()
    }

    /// Append a new unit as its own group at the tail
    pub fn add_new(&mut self, unit: Unit) {
        self.units.push(unit);
        self.run_lengths.push(1);
    }

    /// Remove the unit at `index`
    ///
    /// Refuses (returns `None`) when this is the last unit or `index` is out of range.
    pub fn remove(&mut self, index: usize) -> Option<Unit> {
        if self.units.len() <= 1 || index >= self.units.len() {
            return None;
        }
        let span = self.span_of(index).ok()?;
        let removed = self.units.remove(index);
        if span.len == 1 {
            self.run_lengths.remove(span.group);
        } else {
            self.run_lengths[span.group] -= 1;
        }
        Some(removed)
    }

    /// Move a unit one slot towards the head, returning the displacement applied
    ///
    /// Inside a group this swaps with the previous member (-1). The first member of a
    /// group takes its whole group above the previous group; the result is then the
    /// (negative) shift of the unit itself.
    pub fn move_up(&mut self, index: usize) -> Result<isize> {
        self.check_index(index)?;
        if index == 0 {
            return Ok(0);
        }
        let span = self.span_of(index)?;
        if index != span.first {
            self.units.swap(index - 1, index);
            return Ok(-1);
        }

        let above = self.group_span(span.group - 1).ok_or_else(|| {
            SchedulerError::invariant(format!("group {} has no predecessor", span.group))
        })?;
        self.units[above.first..span.first + span.len].rotate_left(above.len);
        self.run_lengths.swap(above.group, span.group);
        Ok(above.first as isize - index as isize)
    }

    /// Move a unit one slot towards the tail, returning the displacement applied
    ///
    /// Mirror image of [`move_up`](Self::move_up): the last member of a group takes its
    /// whole group below the next group.
    pub fn move_down(&mut self, index: usize) -> Result<isize> {
        self.check_index(index)?;
        if index == self.units.len() - 1 {
            return Ok(0);
        }
        let span = self.span_of(index)?;
        if index != span.last() {
            self.units.swap(index, index + 1);
            return Ok(1);
        }

        let below = self.group_span(span.group + 1).ok_or_else(|| {
            SchedulerError::invariant(format!("group {} has no successor", span.group))
        })?;
        self.units[span.first..below.first + below.len].rotate_left(span.len);
        self.run_lengths.swap(span.group, below.group);
        Ok(below.len as isize)
    }

    /// Merge the group owning `index` with the group that follows it
    ///
    /// No-op when that group is already the last one.
    pub fn add_to_parallel_grouping(&mut self, index: usize) -> Result<()> {
        self.check_index(index)?;
        let span = self.span_of(index)?;
        if span.group + 1 >= self.run_lengths.len() {
            return Ok(());
        }
        let next = self.run_lengths.remove(span.group + 1);
        self.run_lengths[span.group] += next;
        Ok(())
    }

    /// Split the unit at `index` out of its group into a new singleton group
    ///
    /// Units in the second half of the group (in-group position greater than half the
    /// group size) land right after the remaining members, the others right before them.
    /// Returns the unit's new index; a unit already alone keeps its place.
    pub fn remove_from_parallel_grouping(&mut self, index: usize) -> Result<usize> {
        self.check_index(index)?;
        let span = self.span_of(index)?;
        if span.len == 1 {
            return Ok(index);
        }

        let position = index - span.first;
        let unit = self.units.remove(index);
        self.run_lengths[span.group] -= 1;

        let target = if 2 * position > span.len {
            self.run_lengths.insert(span.group + 1, 1);
            span.last()
        } else {
            self.run_lengths.insert(span.group, 1);
            span.first
        };
        self.units.insert(target, unit);
        Ok(target)
    }

    /// Index of the group that owns the unit at `index`
    pub fn group_index_of(&self, index: usize) -> Result<usize> {
        self.check_index(index)?;
        Ok(self.span_of(index)?.group)
    }

    pub fn index_within_group(&self, index: usize) -> Result<usize> {
        self.check_index(index)?;
        Ok(index - self.span_of(index)?.first)
    }

    pub fn first_index_of_group(&self, group: usize) -> Result<usize> {
        self.group_span(group)
            .map(|span| span.first)
            .ok_or(SchedulerError::IndexOutOfRange {
                index: group,
                len: self.run_lengths.len(),
            })
    }

    /// Size of the group that owns the unit at `index`
    pub fn group_size_of(&self, index: usize) -> Result<usize> {
        self.check_index(index)?;
        Ok(self.span_of(index)?.len)
    }

    /// Span of the group with index `group`
    pub fn group_span(&self, group: usize) -> Option<GroupSpan> {
        let len = *self.run_lengths.get(group)?;
        let first = self.run_lengths[..group].iter().sum();
        Some(GroupSpan { group, first, len })
    }

    pub fn group_units(&self, group: usize) -> Option<&[Unit]> {
        self.group_span(group).map(|span| &self.units[span.range()])
    }

    /// Span of the group that owns the unit at `index`
    ///
    /// Cumulative scan over the run-lengths; failing to find an owner means the
    /// partition no longer covers the unit list.
    pub fn span_of(&self, index: usize) -> Result<GroupSpan> {
        let mut first = 0;
        for (group, &len) in self.run_lengths.iter().enumerate() {
            if index < first + len {
                return Ok(GroupSpan { group, first, len });
            }
            first += len;
        }

        let error = SchedulerError::invariant(format!(
            "no group owns unit index {index} (units: {}, run lengths: {:?})",
            self.units.len(),
            self.run_lengths
        ));
        log_error("grouping_sequence", "span_of", &error.to_string(), None);
        Err(error)
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.units.len() {
            return Err(SchedulerError::IndexOutOfRange {
                index,
                len: self.units.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::sequence_of;

    fn names(sequence: &GroupingSequence) -> Vec<&str> {
        sequence.units().iter().map(|u| u.name.as_str()).collect()
    }

    #[test]
    fn test_add_new_appends_singleton_group() {
        let mut sequence = GroupingSequence::new(Unit::new("A"));
        sequence.add_new(Unit::new("B"));
        assert_eq!(names(&sequence), ["A", "B"]);
        assert_eq!(sequence.run_lengths(), [1, 1]);
    }

    #[test]
    fn test_remove_refuses_last_unit() {
        let mut sequence = GroupingSequence::new(Unit::new("A"));
        assert!(sequence.remove(0).is_none());
        assert!(sequence.remove(7).is_none());
        assert_eq!(sequence.len(), 1);
    }

    #[test]
    fn test_remove_shrinks_or_drops_group() {
        let mut sequence = sequence_of(&[&["A", "B"], &["C"]]);
        assert_eq!(sequence.remove(1).unwrap().name, "B");
        assert_eq!(sequence.run_lengths(), [1, 1]);
        assert_eq!(sequence.remove(0).unwrap().name, "A");
        assert_eq!(sequence.run_lengths(), [1]);
        assert_eq!(names(&sequence), ["C"]);
    }

    #[test]
    fn test_remove_out_of_range_is_noop() {
        let mut sequence = sequence_of(&[&["A"], &["B"]]);
        assert!(sequence.remove(2).is_none());
        assert_eq!(sequence.len(), 2);
    }

    #[test]
    fn test_moves_at_boundaries_are_noops() {
        let mut sequence = sequence_of(&[&["A", "B"], &["C"]]);
        assert_eq!(sequence.move_up(0).unwrap(), 0);
        assert_eq!(sequence.move_down(2).unwrap(), 0);
        assert_eq!(names(&sequence), ["A", "B", "C"]);
        assert_eq!(sequence.run_lengths(), [2, 1]);
    }

    #[test]
    fn test_move_within_group_swaps_neighbours() {
        let mut sequence = sequence_of(&[&["A", "B", "C"]]);
        assert_eq!(sequence.move_down(0).unwrap(), 1);
        assert_eq!(names(&sequence), ["B", "A", "C"]);
        assert_eq!(sequence.move_up(2).unwrap(), -1);
        assert_eq!(names(&sequence), ["B", "C", "A"]);
        assert_eq!(sequence.run_lengths(), [3]);
    }

    #[test]
    fn test_move_up_at_group_edge_moves_whole_group() {
        let mut sequence = sequence_of(&[&["A", "B"], &["C", "D", "E"]]);
        assert_eq!(sequence.move_up(2).unwrap(), -2);
        assert_eq!(names(&sequence), ["C", "D", "E", "A", "B"]);
        assert_eq!(sequence.run_lengths(), [3, 2]);
    }

    #[test]
    fn test_move_down_at_group_edge_moves_next_group_above() {
        let mut sequence = sequence_of(&[&["A", "B"], &["C", "D", "E"], &["F"]]);
        assert_eq!(sequence.move_down(1).unwrap(), 3);
        assert_eq!(names(&sequence), ["C", "D", "E", "A", "B", "F"]);
        assert_eq!(sequence.run_lengths(), [3, 2, 1]);
        // The unit that moved is now at 1 + 3
        assert_eq!(sequence.unit(4).unwrap().name, "B");
    }

    #[test]
    fn test_group_round_trip() {
        let mut sequence = sequence_of(&[&["A"], &["B"], &["C"]]);
        sequence.add_to_parallel_grouping(0).unwrap();
        assert_eq!(sequence.run_lengths(), [2, 1]);
        assert_eq!(sequence.remove_from_parallel_grouping(0).unwrap(), 0);
        assert_eq!(sequence.run_lengths(), [1, 1, 1]);
        assert_eq!(names(&sequence), ["A", "B", "C"]);
    }

    #[test]
    fn test_add_to_grouping_walks_to_group_boundary() {
        let mut sequence = sequence_of(&[&["A", "B"], &["C"], &["D"]]);
        sequence.add_to_parallel_grouping(0).unwrap();
        assert_eq!(sequence.run_lengths(), [3, 1]);
        sequence.add_to_parallel_grouping(3).unwrap();
        assert_eq!(sequence.run_lengths(), [3, 1]);
    }

    #[test]
    fn test_remove_from_grouping_upper_half_moves_after_group() {
        let mut sequence = sequence_of(&[&["A", "B", "C"], &["D"]]);
        assert_eq!(sequence.remove_from_parallel_grouping(2).unwrap(), 2);
        assert_eq!(names(&sequence), ["A", "B", "C", "D"]);
        assert_eq!(sequence.run_lengths(), [2, 1, 1]);

        let mut sequence = sequence_of(&[&["A", "B", "C", "D"]]);
        assert_eq!(sequence.remove_from_parallel_grouping(1).unwrap(), 0);
        assert_eq!(names(&sequence), ["B", "A", "C", "D"]);
        assert_eq!(sequence.run_lengths(), [1, 3]);
    }

    #[test]
    fn test_remove_from_singleton_group_is_noop() {
        let mut sequence = sequence_of(&[&["A"], &["B"]]);
        assert_eq!(sequence.remove_from_parallel_grouping(1).unwrap(), 1);
        assert_eq!(sequence.run_lengths(), [1, 1]);
    }

    #[test]
    fn test_lookups() {
        let sequence = sequence_of(&[&["A", "B"], &["C"], &["D", "E", "F"]]);
        assert_eq!(sequence.group_index_of(4).unwrap(), 2);
        assert_eq!(sequence.index_within_group(4).unwrap(), 1);
        assert_eq!(sequence.first_index_of_group(2).unwrap(), 3);
        assert_eq!(sequence.group_size_of(0).unwrap(), 2);
        assert!(matches!(
            sequence.group_index_of(6),
            Err(SchedulerError::IndexOutOfRange { index: 6, len: 6 })
        ));
        assert!(sequence.first_index_of_group(3).is_err());
    }

    #[test]
    fn test_from_groups_rejects_empty_groups() {
        assert!(GroupingSequence::from_groups(vec![]).is_err());
        assert!(GroupingSequence::from_groups(vec![vec![Unit::new("A")], vec![]]).is_err());
    }
}
