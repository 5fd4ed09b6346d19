//! Live intervals, their uses, and the arena holding split children

use std::{
  collections::BTreeSet,
  fmt::{Display, Error, Formatter},
};

use crate::ir::{ConstNumber, MoveType, ValueId};

/// A read or write of a value by an instruction. `limit` is the last
/// position at which the value must still be in its register for this use;
/// for an ordinary operand it equals `position`.
///
/// Liveness only records ordinary operands. Uses with a later limit come
/// from front ends that build their own `IntervalSet` and drive
/// `LinearScanAllocator` directly, for operands that must sit in a register
/// range across several instructions.
///
/// Ordered by position, then by limit.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct LiveIntervalsUse {
  position: u32,
  limit: u32,
}

impl LiveIntervalsUse {
  pub fn new(position: u32, limit: u32) -> Self {
    debug_assert!(position <= limit);
    LiveIntervalsUse { position, limit }
  }

  pub fn at(position: u32) -> Self {
    LiveIntervalsUse::new(position, position)
  }

  #[inline]
  pub fn position(&self) -> u32 {
    self.position
  }

  #[inline]
  pub fn limit(&self) -> u32 {
    self.limit
  }
}

/// Half-open range `[start, end)` of program positions.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LiveRange {
  pub start: u32,
  pub end: u32,
}

impl LiveRange {
  #[inline]
  pub fn contains(&self, position: u32) -> bool {
    self.start <= position && position < self.end
  }
}

/// Handle into an `IntervalSet`.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct IntervalId(pub u32);

impl IntervalId {
  #[inline]
  pub fn index(self) -> usize {
    self.0 as usize
  }
}

/// Where an interval keeps its value.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Location {
  /// A register operands can address.
  Register(u32),
  /// A register of the spill area, only reachable by moves.
  Spill(u32),
  /// Nowhere; the constant is re-created when needed again.
  Rematerialize,
}

impl Location {
  pub fn register(&self) -> Option<u32> {
    match self {
      Location::Register(r) | Location::Spill(r) => Some(*r),
      Location::Rematerialize => None,
    }
  }
}

impl Display for Location {
  fn fmt(&self, fmt: &mut Formatter) -> Result<(), Error> {
    match self {
      Location::Register(r) => write!(fmt, "r{}", r),
      Location::Spill(r) => write!(fmt, "spill r{}", r),
      Location::Rematerialize => write!(fmt, "remat"),
    }
  }
}

#[derive(Debug, Clone)]
pub struct LiveIntervals {
  value: ValueId,
  move_type: MoveType,
  /// Set when the value can be rematerialized instead of spilled.
  constant: Option<ConstNumber>,
  ranges: Vec<LiveRange>,
  uses: BTreeSet<LiveIntervalsUse>,
  location: Option<Location>,
  fixed_register: Option<u32>,
  parent: Option<IntervalId>,
}

impl LiveIntervals {
  pub fn new(value: ValueId, move_type: MoveType) -> Self {
    LiveIntervals {
      value,
      move_type,
      constant: None,
      ranges: vec![],
      uses: BTreeSet::new(),
      location: None,
      fixed_register: None,
      parent: None,
    }
  }

  #[inline]
  pub fn value(&self) -> ValueId {
    self.value
  }

  #[inline]
  pub fn move_type(&self) -> MoveType {
    self.move_type
  }

  #[inline]
  pub fn is_wide(&self) -> bool {
    self.move_type.is_wide()
  }

  #[inline]
  pub fn required_registers(&self) -> u32 {
    self.move_type.required_registers()
  }

  pub fn constant(&self) -> Option<ConstNumber> {
    self.constant
  }

  pub fn set_constant(&mut self, constant: ConstNumber) {
    self.constant = Some(constant);
  }

  pub fn is_rematerializable(&self) -> bool {
    self.constant.is_some()
  }

  pub fn fixed_register(&self) -> Option<u32> {
    self.fixed_register
  }

  pub fn set_fixed_register(&mut self, register: u32) {
    self.fixed_register = Some(register);
  }

  /// The interval this one was split off from (the value's first interval).
  pub fn split_parent(&self) -> Option<IntervalId> {
    self.parent
  }

  pub fn ranges(&self) -> &[LiveRange] {
    &self.ranges
  }

  pub fn uses(&self) -> &BTreeSet<LiveIntervalsUse> {
    &self.uses
  }

  pub fn add_use(&mut self, use_: LiveIntervalsUse) {
    self.uses.insert(use_);
  }

  /// Add `[start, end)`, merging with overlapping or adjacent ranges.
  pub fn add_range(&mut self, start: u32, end: u32) {
    debug_assert!(start < end);
    let mut new = LiveRange { start, end };
    let mut merged = Vec::with_capacity(self.ranges.len() + 1);
    let mut inserted = false;
    for range in self.ranges.drain(..) {
      if range.end < new.start {
        merged.push(range);
      } else if new.end < range.start {
        if !inserted {
          merged.push(new);
          inserted = true;
        }
        merged.push(range);
      } else {
        new = LiveRange {
          start: new.start.min(range.start),
          end: new.end.max(range.end),
        };
      }
    }
    if !inserted {
      merged.push(new);
    }
    self.ranges = merged;
  }

  /// Shorten the first range so the interval starts at its definition. A
  /// definition outside every range yields a one-point range.
  pub fn set_definition(&mut self, position: u32) {
    match self.ranges.first_mut() {
      Some(first) if first.contains(position) => first.start = position,
      _ => self.add_range(position, position + 1),
    }
  }

  pub fn start(&self) -> u32 {
    self.ranges.first().map_or(0, |range| range.start)
  }

  pub fn end(&self) -> u32 {
    self.ranges.last().map_or(0, |range| range.end)
  }

  pub fn covers(&self, position: u32) -> bool {
    let index = self.ranges.partition_point(|range| range.end <= position);
    self
      .ranges
      .get(index)
      .map_or(false, |range| range.contains(position))
  }

  /// First position covered by both intervals.
  pub fn first_intersection(&self, other: &LiveIntervals) -> Option<u32> {
    let (mut i, mut j) = (0, 0);
    while i < self.ranges.len() && j < other.ranges.len() {
      let (a, b) = (self.ranges[i], other.ranges[j]);
      let start = a.start.max(b.start);
      if start < a.end.min(b.end) {
        return Some(start);
      }
      if a.end <= b.end {
        i += 1;
      } else {
        j += 1;
      }
    }
    None
  }

  /// First covered position at or after `position`.
  pub fn next_covered(&self, position: u32) -> Option<u32> {
    let index = self.ranges.partition_point(|range| range.end <= position);
    self
      .ranges
      .get(index)
      .map(|range| range.start.max(position))
  }

  pub fn overlaps(&self, other: &LiveIntervals) -> bool {
    self.first_intersection(other).is_some()
  }

  /// Position of the first use still needing the register at or after
  /// `position`. A use whose limit reaches `position` counts even if it
  /// started earlier.
  pub fn next_use_after(&self, position: u32) -> Option<u32> {
    self
      .uses
      .iter()
      .find(|use_| use_.limit >= position)
      .map(|use_| use_.position)
  }

  pub fn first_use(&self) -> Option<u32> {
    self.uses.iter().next().map(|use_| use_.position)
  }

  /// Latest use or definition strictly before `position`.
  pub fn last_use_before(&self, position: u32) -> Option<u32> {
    self
      .uses
      .range(..LiveIntervalsUse::at(position))
      .next_back()
      .map(|use_| use_.position)
  }

  /// True when splitting at `position` would cut a use that must keep its
  /// register across it.
  pub fn is_pinned_at(&self, position: u32) -> bool {
    self
      .uses
      .iter()
      .any(|use_| use_.position < position && position <= use_.limit)
  }

  pub fn location(&self) -> Option<Location> {
    self.location
  }

  pub fn set_location(&mut self, location: Location) {
    self.location = Some(location);
  }

  /// The register, if the interval lives in an operand register.
  pub fn register(&self) -> Option<u32> {
    match self.location {
      Some(Location::Register(r)) => Some(r),
      _ => None,
    }
  }

  /// All registers (operand or spill) the interval occupies.
  pub fn occupied_registers(&self) -> Vec<u32> {
    match self.location.and_then(|location| location.register()) {
      Some(r) => (r..r + self.required_registers()).collect(),
      None => vec![],
    }
  }

  /// Move everything from `position` on into a new child interval.
  fn split_off(&mut self, position: u32, parent: IntervalId) -> LiveIntervals {
    debug_assert!(self.start() < position && position < self.end());
    debug_assert!(!self.is_pinned_at(position));
    let index = self.ranges.partition_point(|range| range.end <= position);
    let mut tail = self.ranges.split_off(index);
    if let Some(first) = tail.first_mut() {
      if first.start < position {
        self.ranges.push(LiveRange {
          start: first.start,
          end: position,
        });
        first.start = position;
      }
    }
    // Sorts before every use at `position`, whatever its limit.
    let key = LiveIntervalsUse { position, limit: 0 };
    let uses = self.uses.split_off(&key);
    LiveIntervals {
      value: self.value,
      move_type: self.move_type,
      constant: self.constant,
      ranges: tail,
      uses,
      location: None,
      fixed_register: None,
      parent: Some(parent),
    }
  }
}

impl Display for LiveIntervals {
  fn fmt(&self, fmt: &mut Formatter) -> Result<(), Error> {
    write!(fmt, "{}", self.value)?;
    if self.is_wide() {
      write!(fmt, " (wide)")?;
    }
    for range in self.ranges.iter() {
      write!(fmt, " [{}, {})", range.start, range.end)?;
    }
    let uses = self
      .uses
      .iter()
      .map(|use_| {
        if use_.limit == use_.position {
          use_.position.to_string()
        } else {
          format!("{}..{}", use_.position, use_.limit)
        }
      })
      .collect::<Vec<_>>();
    write!(fmt, " uses {{{}}}", uses.join(", "))?;
    match self.location {
      Some(location) => write!(fmt, " @ {}", location),
      None => write!(fmt, " @ ?"),
    }
  }
}

/// Arena of all intervals of a method. The first interval of a value has the
/// value's index as its handle; split children are appended.
#[derive(Debug, Clone, Default)]
pub struct IntervalSet {
  intervals: Vec<LiveIntervals>,
  /// Per value, its intervals ordered by start.
  chains: Vec<Vec<IntervalId>>,
}

impl IntervalSet {
  /// One parent interval per value, in value order.
  pub fn from_parents(parents: Vec<LiveIntervals>) -> Self {
    let chains = (0..parents.len())
      .map(|index| vec![IntervalId(index as u32)])
      .collect();
    debug_assert!(parents
      .iter()
      .enumerate()
      .all(|(index, interval)| interval.value().index() == index));
    IntervalSet {
      intervals: parents,
      chains,
    }
  }

  pub fn len(&self) -> usize {
    self.intervals.len()
  }

  pub fn is_empty(&self) -> bool {
    self.intervals.is_empty()
  }

  pub fn get(&self, id: IntervalId) -> &LiveIntervals {
    &self.intervals[id.index()]
  }

  pub fn get_mut(&mut self, id: IntervalId) -> &mut LiveIntervals {
    &mut self.intervals[id.index()]
  }

  pub fn ids(&self) -> impl Iterator<Item = IntervalId> {
    (0..self.intervals.len() as u32).map(IntervalId)
  }

  pub fn iter(&self) -> impl Iterator<Item = (IntervalId, &LiveIntervals)> {
    self
      .intervals
      .iter()
      .enumerate()
      .map(|(index, interval)| (IntervalId(index as u32), interval))
  }

  /// The intervals of a value ordered by start.
  pub fn chain(&self, value: ValueId) -> &[IntervalId] {
    self
      .chains
      .get(value.index())
      .map_or(&[], |chain| chain.as_slice())
  }

  /// Split `id` at `position` and return the new child holding the rest.
  pub fn split(&mut self, id: IntervalId, position: u32) -> IntervalId {
    let parent = self.intervals[id.index()]
      .split_parent()
      .unwrap_or(id);
    let child = self.intervals[id.index()].split_off(position, parent);
    let value = child.value();
    let start = child.start();
    let child_id = IntervalId(self.intervals.len() as u32);
    self.intervals.push(child);

    let chain = &mut self.chains[value.index()];
    let index = chain.partition_point(|other| self.intervals[other.index()].start() <= start);
    chain.insert(index, child_id);
    child_id
  }

  /// The interval of `value` responsible for `position`: the last one
  /// starting at or before it.
  pub fn interval_at(&self, value: ValueId, position: u32) -> Option<IntervalId> {
    self
      .chain(value)
      .iter()
      .take_while(|id| self.get(**id).start() <= position)
      .last()
      .copied()
  }

  pub fn location_at(&self, value: ValueId, position: u32) -> Option<Location> {
    self
      .interval_at(value, position)
      .and_then(|id| self.get(id).location())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn interval(ranges: &[(u32, u32)], uses: &[u32]) -> LiveIntervals {
    let mut interval = LiveIntervals::new(ValueId(0), MoveType::Single);
    for (start, end) in ranges.iter().rev() {
      interval.add_range(*start, *end);
    }
    for position in uses {
      interval.add_use(LiveIntervalsUse::at(*position));
    }
    interval
  }

  #[test]
  fn test_use_ordering() {
    let mut uses = vec![
      LiveIntervalsUse::new(4, 8),
      LiveIntervalsUse::new(2, 2),
      LiveIntervalsUse::new(4, 4),
    ];
    uses.sort();
    assert_eq!(
      uses,
      vec![
        LiveIntervalsUse::new(2, 2),
        LiveIntervalsUse::new(4, 4),
        LiveIntervalsUse::new(4, 8)
      ]
    );
    assert_ne!(LiveIntervalsUse::new(4, 4), LiveIntervalsUse::new(4, 8));
  }

  #[test]
  fn test_add_range_merges() {
    let mut interval = LiveIntervals::new(ValueId(0), MoveType::Single);
    interval.add_range(11, 15);
    interval.add_range(3, 7);
    interval.add_range(7, 9);
    assert_eq!(
      interval.ranges(),
      &[LiveRange { start: 3, end: 9 }, LiveRange { start: 11, end: 15 }]
    );
    interval.add_range(8, 12);
    assert_eq!(interval.ranges(), &[LiveRange { start: 3, end: 15 }]);
  }

  #[test]
  fn test_set_definition() {
    let mut interval = LiveIntervals::new(ValueId(0), MoveType::Single);
    interval.add_range(1, 9);
    interval.set_definition(4);
    assert_eq!(interval.start(), 4);

    let mut dead = LiveIntervals::new(ValueId(1), MoveType::Single);
    dead.set_definition(6);
    assert_eq!(dead.ranges(), &[LiveRange { start: 6, end: 7 }]);
  }

  #[test]
  fn test_covers_and_intersection() {
    let a = interval(&[(2, 6), (10, 14)], &[2]);
    let b = interval(&[(6, 10), (12, 20)], &[6]);
    assert!(a.covers(5));
    assert!(!a.covers(6));
    assert!(!a.covers(8));
    assert!(a.covers(13));
    assert_eq!(a.first_intersection(&b), Some(12));
    let c = interval(&[(6, 10)], &[]);
    assert_eq!(a.first_intersection(&c), None);
    assert_eq!(a.next_covered(7), Some(10));
    assert_eq!(a.next_covered(11), Some(11));
    assert_eq!(a.next_covered(14), None);
  }

  #[test]
  fn test_next_use_respects_limit() {
    let mut a = interval(&[(2, 20)], &[4, 12]);
    assert_eq!(a.next_use_after(5), Some(12));
    a.add_use(LiveIntervalsUse::new(6, 9));
    assert_eq!(a.next_use_after(8), Some(6));
    assert!(a.is_pinned_at(7));
    assert!(!a.is_pinned_at(11));
    assert_eq!(a.last_use_before(12), Some(6));
    assert_eq!(a.next_use_after(13), None);
  }

  #[test]
  fn test_split_partitions_ranges_and_uses() {
    let parent = interval(&[(2, 9), (13, 21)], &[2, 8, 14, 20]);
    let mut set = IntervalSet::from_parents(vec![parent]);
    let child = set.split(IntervalId(0), 7);
    assert_eq!(set.get(IntervalId(0)).ranges(), &[LiveRange { start: 2, end: 7 }]);
    assert_eq!(
      set.get(child).ranges(),
      &[LiveRange { start: 7, end: 9 }, LiveRange { start: 13, end: 21 }]
    );
    assert_eq!(set.get(IntervalId(0)).uses().len(), 1);
    assert_eq!(set.get(child).first_use(), Some(8));

    let grandchild = set.split(child, 11);
    assert_eq!(set.get(grandchild).start(), 13);
    assert_eq!(set.get(grandchild).split_parent(), Some(IntervalId(0)));
    assert_eq!(set.chain(ValueId(0)), &[IntervalId(0), child, grandchild]);
    assert_eq!(set.interval_at(ValueId(0), 12), Some(child));
    assert_eq!(set.interval_at(ValueId(0), 13), Some(grandchild));
    assert_eq!(set.interval_at(ValueId(0), 1), None);
  }

  #[test]
  fn test_split_at_use_moves_it_to_child() {
    let mut parent = interval(&[(2, 21)], &[2, 8]);
    parent.add_use(LiveIntervalsUse::new(14, 16));
    let mut set = IntervalSet::from_parents(vec![parent]);
    let child = set.split(IntervalId(0), 8);
    assert_eq!(set.get(IntervalId(0)).uses().len(), 1);
    assert_eq!(set.get(child).first_use(), Some(8));
    assert_eq!(set.get(child).next_use_after(9), Some(14));
    let grandchild = set.split(child, 14);
    assert_eq!(set.get(grandchild).first_use(), Some(14));
    assert_eq!(set.get(grandchild).uses().iter().next().map(|u| u.limit()), Some(16));
  }
}
