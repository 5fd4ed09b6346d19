//! Blocked allocation: evicting intervals from registers or spilling the
//! current one, and the spill area the evicted values go to.

use std::collections::BTreeMap;

use crate::{
  error::AllocError,
  ir::{MoveType, ValueId},
};

use super::{
  allocation::{gap_at_or_before, pair_position, LinearScanAllocator},
  intervals::{IntervalId, Location},
  positions::{RegisterPositions, UNUSED},
};

/// Registers of the spill area, `first..limit`. A value keeps its slot for
/// its whole lifetime so stores and edge moves anywhere in it stay valid.
#[derive(Debug, Clone)]
pub struct SpillSlots {
  first: u32,
  limit: u32,
  even_pairs: bool,
  /// Per register of the spill area, the end of the last value reserved in
  /// it.
  busy_until: Vec<u32>,
  assigned: BTreeMap<ValueId, u32>,
}

impl SpillSlots {
  pub fn new(first: u32, limit: u32, even_pairs: bool) -> Self {
    SpillSlots {
      first,
      limit,
      even_pairs,
      busy_until: vec![0; limit.saturating_sub(first) as usize],
      assigned: BTreeMap::new(),
    }
  }

  /// The slot of `value`, reserving the lowest one free from `start` to
  /// `end` on first use.
  pub fn slot_for(&mut self, value: ValueId, ty: MoveType, start: u32, end: u32) -> Option<u32> {
    if let Some(slot) = self.assigned.get(&value) {
      return Some(*slot);
    }
    let width = ty.required_registers();
    let even = ty.is_wide() && self.even_pairs;
    let slot = (self.first..self.limit)
      .filter(|r| r + width <= self.limit && (!even || r % 2 == 0))
      .find(|r| (*r..r + width).all(|r| self.busy_until[(r - self.first) as usize] <= start))?;
    for r in slot..slot + width {
      self.busy_until[(r - self.first) as usize] = end;
    }
    self.assigned.insert(value, slot);
    Some(slot)
  }
}

/// Lower the position recorded for `register`; it holds a constant only if
/// every occupant does.
fn merge(positions: &mut RegisterPositions, register: u32, position: u32, holds_constant: bool) {
  let previous = positions.get(register);
  let holds = if previous == UNUSED {
    holds_constant
  } else {
    holds_constant && positions.holds_constant(register)
  };
  positions.set(register, previous.min(position), holds);
}

impl LinearScanAllocator<'_> {
  /// No register is free long enough: take the one whose occupants are
  /// needed farthest away, or spill `id` itself if everybody is needed
  /// before it.
  pub(super) fn allocate_blocked(&mut self, id: IntervalId) -> Result<(), AllocError> {
    let current = self.interval(id);
    let start = current.start();
    let gap = gap_at_or_before(start);
    let width = current.required_registers();

    let mut use_positions = RegisterPositions::new(self.operand_registers);
    let mut blocked = RegisterPositions::new(self.operand_registers);
    for other in self.active.iter() {
      let other = self.interval(*other);
      for r in other.occupied_registers() {
        if other.fixed_register().is_some() {
          use_positions.set(r, 0, false);
          blocked.set(r, 0, false);
        } else {
          let next = other.next_use_after(gap).unwrap_or(UNUSED);
          merge(&mut use_positions, r, next, other.is_rematerializable());
        }
      }
    }
    for other in self.inactive.iter() {
      let other = self.interval(*other);
      let intersection = match other.first_intersection(current) {
        Some(position) => position,
        None => continue,
      };
      for r in other.occupied_registers() {
        if other.fixed_register().is_some() {
          merge(&mut use_positions, r, intersection, false);
          merge(&mut blocked, r, intersection, false);
        } else {
          let next = other.next_use_after(gap).unwrap_or(UNUSED);
          merge(&mut use_positions, r, next, other.is_rematerializable());
        }
      }
    }

    // Farthest next use, then registers holding constants, then the lowest.
    let mut best: Option<(u32, bool, u32)> = None;
    for register in self.candidates(width) {
      let position = pair_position(&use_positions, register, width);
      let holds_constant = (register..register + width)
        .all(|r| use_positions.get(r) == UNUSED || use_positions.holds_constant(r));
      if best.map_or(true, |(p, c, _)| (position, holds_constant) > (p, c)) {
        best = Some((position, holds_constant, register));
      }
    }

    let first_use = current.first_use();
    let (position, register) = match best {
      Some((position, _, register)) => (position, register),
      None => return Err(self.capacity_error(start)),
    };
    match first_use {
      Some(first_use) if position > first_use => {
        log::debug!(
          "{}: {} evicts r{} (next use {})",
          start,
          current.value(),
          register,
          position
        );
        self.assign(id, register);
        self.evict(id, register..register + width, gap)?;
        let blocked_at = pair_position(&blocked, register, width);
        if blocked_at < self.interval(id).end() {
          self.split_to_unhandled(id, gap_at_or_before(blocked_at));
        }
      }
      Some(first_use) => {
        // Every register is needed again before `id` needs one.
        let reload_at = first_use.saturating_sub(1);
        if first_use <= start || reload_at <= start {
          return Err(self.capacity_error(start));
        }
        self.split_to_unhandled(id, reload_at);
        self.spill(id)?;
      }
      None => self.spill(id)?,
    }
    Ok(())
  }

  /// Take `registers` away from every interval holding them that conflicts
  /// with `id`. Active holders are spilled from `gap` on; inactive ones are
  /// requeued from their next live position.
  fn evict(
    &mut self,
    id: IntervalId,
    registers: std::ops::Range<u32>,
    gap: u32,
  ) -> Result<(), AllocError> {
    let start = self.interval(id).start();
    let holds = |allocator: &Self, other: IntervalId| {
      let other = allocator.interval(other);
      other.fixed_register().is_none()
        && other
          .occupied_registers()
          .iter()
          .any(|r| registers.contains(r))
    };

    let (evicted, kept): (Vec<_>, Vec<_>) = self
      .active
      .iter()
      .copied()
      .partition(|other| holds(self, *other));
    self.active = kept;
    for holder in evicted {
      let spilled = if self.interval(holder).start() >= gap {
        holder
      } else {
        self.intervals.split(holder, gap)
      };
      self.spill(spilled)?;
      let next_use = self.interval(spilled).next_use_after(gap);
      if let Some(next_use) = next_use {
        let reload_at = next_use - 1;
        if reload_at <= self.interval(spilled).start() {
          return Err(self.capacity_error(start));
        }
        self.split_to_unhandled(spilled, reload_at);
      }
    }

    let current = self.interval(id);
    let (evicted, kept): (Vec<_>, Vec<_>) = self
      .inactive
      .iter()
      .copied()
      .partition(|other| holds(self, *other) && self.interval(*other).overlaps(current));
    self.inactive = kept;
    for holder in evicted {
      if let Some(resume) = self.interval(holder).next_covered(start) {
        self.split_to_unhandled(holder, resume);
      }
    }
    Ok(())
  }

  /// Give `id` a slot in the spill area, or mark it for rematerialization.
  fn spill(&mut self, id: IntervalId) -> Result<(), AllocError> {
    let interval = self.interval(id);
    let (value, ty, start) = (interval.value(), interval.move_type(), interval.start());
    let location = if interval.is_rematerializable() {
      Location::Rematerialize
    } else {
      let chain = self.intervals.chain(value);
      let first = chain.first().map_or(0, |first| self.interval(*first).start());
      let last = chain
        .iter()
        .map(|other| self.interval(*other).end())
        .max()
        .unwrap_or(0);
      match self.spill_slots.slot_for(value, ty, first, last) {
        Some(slot) => Location::Spill(slot),
        None => return Err(self.capacity_error(start)),
      }
    };
    self.intervals.get_mut(id).set_location(location);
    log::debug!("spilled {}", self.interval(id));
    Ok(())
  }

  pub(super) fn capacity_error(&self, position: u32) -> AllocError {
    AllocError::capacity(
      &self.method.name,
      position,
      self.active.len() + self.inactive.len() + 1,
      self.method.register_budget,
    )
  }
}
