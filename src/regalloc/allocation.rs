use std::collections::BTreeSet;

use crate::{
  config::AllocatorConfig,
  error::AllocError,
  ir::{BlockId, Instruction, Method, Phi, ValueId},
  utils::MinHeap,
};

use super::{
  intervals::{IntervalId, IntervalSet, LiveIntervals, Location},
  liveness::Liveness,
  positions::{RegisterPositions, UNUSED},
  spill::SpillSlots,
  verify::verify_allocation,
};

/// A move the allocator inserted, with the gap it was inserted at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertedMove {
  pub position: u32,
  pub block: BlockId,
  pub instr: Instruction,
}

/// The result of allocating one method. The method itself carries the
/// rewritten operands and the inserted moves; its phis move here.
#[derive(Debug)]
pub struct Allocation {
  pub(super) intervals: IntervalSet,
  pub(super) liveness: Liveness,
  pub(super) operand_registers: u32,
  pub(super) even_pairs: bool,
  pub(super) registers_used: u32,
  pub(super) moves: Vec<InsertedMove>,
  /// Phis of each block, by block index. The moves inserted for them make
  /// them redundant in the rewritten method.
  pub(super) phis: Vec<Vec<Phi>>,
}

impl Allocation {
  /// Registers the method needs in its frame, spill area and temporaries
  /// included.
  pub fn registers_used(&self) -> u32 {
    self.registers_used
  }

  pub fn operand_registers(&self) -> u32 {
    self.operand_registers
  }

  pub fn location_at(&self, value: ValueId, position: u32) -> Option<Location> {
    self.intervals.location_at(value, position)
  }

  /// The operand register of `value` at `position`, if it is in one.
  pub fn register_at(&self, value: ValueId, position: u32) -> Option<u32> {
    match self.location_at(value, position) {
      Some(Location::Register(r)) => Some(r),
      _ => None,
    }
  }

  pub fn inserted_moves(&self) -> &[InsertedMove] {
    &self.moves
  }

  pub fn intervals(&self) -> &IntervalSet {
    &self.intervals
  }

  pub fn live_in(&self, block: BlockId) -> &BTreeSet<ValueId> {
    self.liveness.live_in(block)
  }

  pub fn phis(&self, block: BlockId) -> &[Phi] {
    self.phis.get(block.index()).map(Vec::as_slice).unwrap_or_default()
  }

  /// Number of values with at least one spilled or rematerialized part.
  pub fn spilled_values(&self) -> usize {
    self
      .intervals
      .iter()
      .filter(|(_, interval)| {
        matches!(
          interval.location(),
          Some(Location::Spill(_) | Location::Rematerialize)
        )
      })
      .map(|(_, interval)| interval.value())
      .collect::<BTreeSet<_>>()
      .len()
  }
}

/// Allocate registers for `method` in place: operands are rewritten to
/// registers and moves are inserted for spills, reloads and phis.
pub fn allocate_registers(
  method: &mut Method,
  config: &AllocatorConfig,
) -> Result<Allocation, AllocError> {
  method.compute_predecessors();
  method.number_instructions();
  method.validate()?;

  let liveness = Liveness::from_method(method);
  let intervals = liveness.build_intervals(method, config);

  let mut allocator = LinearScanAllocator::new(method, config, liveness, intervals)?;
  allocator.run()?;
  let (moves, registers_used) = allocator.resolve()?;
  let operand_registers = allocator.operand_registers;
  let (liveness, intervals) = (allocator.liveness, allocator.intervals);

  rewrite_operands(method, &intervals)?;
  insert_moves(method, &moves);

  let allocation = Allocation {
    intervals,
    liveness,
    operand_registers,
    even_pairs: config.even_pairs(),
    registers_used,
    moves,
    phis: method
      .blocks
      .iter_mut()
      .map(|block| std::mem::take(&mut block.phis))
      .collect(),
  };
  if config.verify {
    verify_allocation(method, &allocation)?;
  }

  log::debug!(
    "{}: {} registers, {} spilled values, {} moves",
    method.name,
    allocation.registers_used,
    allocation.spilled_values(),
    allocation.moves.len()
  );
  Ok(allocation)
}

/// Linear scan over the intervals of one method, in order of their start.
pub struct LinearScanAllocator<'a> {
  pub(super) method: &'a Method,
  pub(super) config: &'a AllocatorConfig,
  pub(super) liveness: Liveness,
  pub(super) intervals: IntervalSet,
  pub(super) unhandled: MinHeap<(u32, IntervalId)>,
  /// Intervals holding their register at the current position.
  pub(super) active: Vec<IntervalId>,
  /// Intervals with a register but in a lifetime hole at the current
  /// position.
  pub(super) inactive: Vec<IntervalId>,
  pub(super) spill_slots: SpillSlots,
  /// Registers `0..operand_registers` can appear in instructions; the rest
  /// of the budget is the spill area.
  pub(super) operand_registers: u32,
}

/// The gap at or before `position`.
pub(super) fn gap_at_or_before(position: u32) -> u32 {
  if position % 2 == 1 {
    position
  } else {
    position.saturating_sub(1)
  }
}

/// Smallest position over the registers of a candidate.
pub(super) fn pair_position(positions: &RegisterPositions, register: u32, width: u32) -> u32 {
  (register..register + width)
    .map(|r| positions.get(r))
    .min()
    .unwrap_or(UNUSED)
}

impl<'a> LinearScanAllocator<'a> {
  pub fn new(
    method: &'a Method,
    config: &'a AllocatorConfig,
    liveness: Liveness,
    intervals: IntervalSet,
  ) -> Result<Self, AllocError> {
    let budget = method.register_budget;
    let operand_registers = config.operand_registers.min(budget);
    let mut allocator = LinearScanAllocator {
      method,
      config,
      liveness,
      intervals,
      unhandled: MinHeap::new(),
      active: vec![],
      inactive: vec![],
      spill_slots: SpillSlots::new(operand_registers, budget, config.even_pairs()),
      operand_registers,
    };

    let mut fixed = BTreeSet::new();
    for id in allocator.intervals.ids().collect::<Vec<_>>() {
      let interval = allocator.intervals.get_mut(id);
      if let Some(register) = interval.fixed_register() {
        let registers = register..register + interval.required_registers();
        if registers.end > operand_registers {
          return Err(AllocError::invariant(
            &method.name,
            format!(
              "argument {} is fixed to r{} outside the {} operand registers",
              interval.value(),
              register,
              operand_registers
            ),
          ));
        }
        for r in registers {
          if !fixed.insert(r) {
            return Err(AllocError::invariant(
              &method.name,
              format!("two arguments are fixed to r{}", r),
            ));
          }
        }
        interval.set_location(Location::Register(register));
      }
      allocator.unhandled.push((interval.start(), id));
    }
    Ok(allocator)
  }

  pub fn run(&mut self) -> Result<(), AllocError> {
    while let Some((position, id)) = self.unhandled.pop() {
      self.advance_to(position);
      log::trace!("{}: allocating {}", position, self.intervals.get(id));

      if self.intervals.get(id).fixed_register().is_some() {
        self.active.push(id);
        continue;
      }
      if !self.try_allocate_free(id) {
        self.allocate_blocked(id)?;
      }
      if self.intervals.get(id).register().is_some() {
        self.active.push(id);
      }
    }
    Ok(())
  }

  /// Retire intervals that ended and move the others between the active and
  /// inactive lists according to whether they cover `position`.
  fn advance_to(&mut self, position: u32) {
    let intervals = &self.intervals;
    let mut active = vec![];
    let mut inactive = vec![];
    for id in self.active.drain(..).chain(self.inactive.drain(..)) {
      let interval = intervals.get(id);
      if interval.end() <= position {
        continue;
      }
      if interval.covers(position) {
        active.push(id);
      } else {
        inactive.push(id);
      }
    }
    self.active = active;
    self.inactive = inactive;
  }

  /// Low registers a value of `width` registers may start in.
  pub(super) fn candidates(&self, width: u32) -> impl Iterator<Item = u32> {
    let limit = self.operand_registers;
    let even = width > 1 && self.config.even_pairs();
    (0..limit).filter(move |r| r + width <= limit && (!even || r % 2 == 0))
  }

  /// Take a register that is free for the whole interval, or for a prefix
  /// of it, splitting off the rest. Returns false if none is free long
  /// enough to be worth it.
  fn try_allocate_free(&mut self, id: IntervalId) -> bool {
    let current = self.intervals.get(id);
    let mut free_until = RegisterPositions::new(self.operand_registers);
    for other in self.active.iter() {
      for r in self.intervals.get(*other).occupied_registers() {
        free_until.set(r, 0, false);
      }
    }
    for other in self.inactive.iter() {
      let other = self.intervals.get(*other);
      if let Some(position) = other.first_intersection(current) {
        for r in other.occupied_registers() {
          if position < free_until.get(r) {
            free_until.set(r, position, false);
          }
        }
      }
    }

    let (start, end) = (current.start(), current.end());
    let width = current.required_registers();
    let mut best: Option<(u32, u32)> = None;
    for register in self.candidates(width) {
      let position = pair_position(&free_until, register, width);
      if position >= end {
        best = Some((register, position));
        break;
      }
      if best.map_or(true, |(_, free)| position > free) {
        best = Some((register, position));
      }
    }

    let (register, free) = match best {
      Some(best) => best,
      None => return false,
    };
    if free >= end {
      self.assign(id, register);
      return true;
    }
    let split_at = gap_at_or_before(free);
    if free == 0 || split_at <= start {
      return false;
    }
    self.assign(id, register);
    self.split_to_unhandled(id, split_at);
    true
  }

  pub(super) fn assign(&mut self, id: IntervalId, register: u32) {
    log::trace!("{} -> r{}", self.intervals.get(id).value(), register);
    self.intervals.get_mut(id).set_location(Location::Register(register));
  }

  /// Split `id` at `position` and queue the rest for allocation.
  pub(super) fn split_to_unhandled(&mut self, id: IntervalId, position: u32) -> IntervalId {
    let child = self.intervals.split(id, position);
    self.unhandled.push((self.intervals.get(child).start(), child));
    child
  }

  /// Registers in use, spill area included.
  pub(super) fn highest_register(&self) -> Option<u32> {
    self
      .intervals
      .iter()
      .filter_map(|(_, interval)| interval.occupied_registers().last().copied())
      .max()
  }

  /// First register above everything the intervals occupy, where move
  /// cycles get their temporaries.
  pub(super) fn temp_register_base(&self) -> u32 {
    let base = self.highest_register().map_or(0, |r| r + 1);
    if self.config.even_pairs() {
      (base + 1) & !1
    } else {
      base
    }
  }

  pub(super) fn interval(&self, id: IntervalId) -> &LiveIntervals {
    self.intervals.get(id)
  }
}

/// Replace the values of every original instruction by their registers.
fn rewrite_operands(method: &mut Method, intervals: &IntervalSet) -> Result<(), AllocError> {
  let name = method.name.clone();
  let register_for = |value: ValueId, position: u32| match intervals.location_at(value, position) {
    Some(Location::Register(r)) => Ok(r),
    location => Err(AllocError::invariant(
      &name,
      format!(
        "{} is not in a register at {} ({})",
        value,
        position,
        location.map_or("unallocated".to_string(), |l| l.to_string())
      ),
    )),
  };
  for block in method.blocks.iter_mut() {
    for instr in block.instructions.iter_mut() {
      let number = instr.number;
      instr.out_register = instr.out.map(|out| register_for(out, number)).transpose()?;
      instr.in_registers = instr
        .ins
        .iter()
        .map(|value| register_for(*value, number))
        .collect::<Result<Vec<_>, _>>()?;
    }
  }
  Ok(())
}

/// Place the moves of each gap before the instruction following it. `moves`
/// is ordered by gap.
fn insert_moves(method: &mut Method, moves: &[InsertedMove]) {
  for block in method.blocks.iter_mut() {
    let mut pending = moves
      .iter()
      .filter(|m| m.block == block.id)
      .peekable();
    if pending.peek().is_none() {
      continue;
    }
    let instrs = std::mem::take(&mut block.instructions);
    for instr in instrs {
      while let Some(m) = pending.next_if(|m| m.position < instr.number) {
        block.instructions.push(m.instr.clone());
      }
      block.instructions.push(instr);
    }
  }
}
