//! Turning location changes into moves
//!
//! Moves come from two places: a value whose interval was split changes
//! location in the middle of a block, and a value flowing along a control
//! flow edge may be expected somewhere else at the successor (phis always
//! are). All moves of one gap and phase form a parallel batch that the
//! `RegisterMoveScheduler` sequentializes.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
  error::AllocError,
  ir::ValueId,
};

use super::{
  allocation::{InsertedMove, LinearScanAllocator},
  intervals::{LiveIntervals, Location},
  moves::RegisterMove,
  scheduler::RegisterMoveScheduler,
};

/// Batches sharing a gap run in this order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum MovePhase {
  /// Edge moves placed at the entry of a block with a single predecessor.
  IncomingEdge,
  /// Stores, reloads and register changes of split intervals.
  Split,
  /// Edge moves placed before the `goto` of a block with a single successor.
  OutgoingEdge,
}

type MoveBatches = BTreeMap<(u32, MovePhase), Vec<RegisterMove>>;

impl LinearScanAllocator<'_> {
  /// Compute, schedule and number all moves. Returns them ordered by gap,
  /// with the number of registers the method uses.
  pub(super) fn resolve(&self) -> Result<(Vec<InsertedMove>, u32), AllocError> {
    let mut batches = MoveBatches::new();
    self.resolve_splits(&mut batches)?;
    self.resolve_edges(&mut batches)?;
    self.schedule(batches)
  }

  fn resolve_splits(&self, batches: &mut MoveBatches) -> Result<(), AllocError> {
    // Edge resolution covers locations changing at a block boundary.
    let entries = self
      .method
      .blocks
      .iter()
      .map(|block| block.entry())
      .collect::<BTreeSet<_>>();

    for value in self.method.values.iter() {
      for pair in self.intervals.chain(value.id).windows(2) {
        let (prev, next) = (self.interval(pair[0]), self.interval(pair[1]));
        let position = next.start();
        if entries.contains(&position) {
          continue;
        }
        let (from, to) = (self.allocated(prev)?, self.allocated(next)?);
        let gap = match (from, to) {
          (Location::Register(_), Location::Spill(_)) => self.store_position(prev, position),
          _ => position,
        };
        self.add_move(batches, (gap, MovePhase::Split), value.id, from, to)?;
      }
    }
    Ok(())
  }

  /// Stores go right after the last use or definition before `position`
  /// when that is in the same block.
  fn store_position(&self, interval: &LiveIntervals, position: u32) -> u32 {
    let block = self.method.block_at(position).map(|block| block.id);
    match interval.last_use_before(position) {
      Some(last) if self.method.block_at(last).map(|block| block.id) == block => last + 1,
      _ => position,
    }
  }

  fn resolve_edges(&self, batches: &mut MoveBatches) -> Result<(), AllocError> {
    for block in self.method.blocks.iter() {
      let entry = block.entry();
      let phis = block.phis.iter().map(|phi| phi.out).collect::<BTreeSet<_>>();
      for pred in block.predecessors.iter() {
        let pred = self.method.block(*pred);
        let exit = match pred.terminator() {
          Some(terminator) => terminator.number,
          None => continue,
        };
        let key = if pred.successors().len() == 1 {
          (exit - 1, MovePhase::OutgoingEdge)
        } else {
          (entry, MovePhase::IncomingEdge)
        };

        for phi in block.phis.iter() {
          let operand = phi.operand_for(pred.id).ok_or_else(|| {
            AllocError::invariant(
              &self.method.name,
              format!("phi {} has no operand for {}", phi.out, pred.id),
            )
          })?;
          let from = self.location(operand, exit)?;
          let to = self.location(phi.out, entry)?;
          self.add_move(batches, key, operand, from, to)?;
        }
        for value in self.liveness.live_in(block.id).difference(&phis) {
          let from = self.location(*value, exit)?;
          let to = self.location(*value, entry)?;
          self.add_move(batches, key, *value, from, to)?;
        }
      }
    }
    Ok(())
  }

  fn add_move(
    &self,
    batches: &mut MoveBatches,
    key: (u32, MovePhase),
    value: ValueId,
    from: Location,
    to: Location,
  ) -> Result<(), AllocError> {
    let dst = match to.register() {
      Some(dst) => dst,
      // Rematerialized values need no copy.
      None => return Ok(()),
    };
    let move_ = match from {
      Location::Rematerialize => {
        let number = self.method.value(value).constant().ok_or_else(|| {
          AllocError::invariant(
            &self.method.name,
            format!("{} is rematerialized but not a constant", value),
          )
        })?;
        RegisterMove::constant(dst, value, number)
      }
      Location::Register(src) | Location::Spill(src) => {
        if src == dst {
          return Ok(());
        }
        RegisterMove::new(dst, src, self.method.value(value).move_type())
      }
    };
    log::trace!("{}: {} for {}", key.0, move_, value);
    batches.entry(key).or_default().push(move_);
    Ok(())
  }

  fn schedule(&self, batches: MoveBatches) -> Result<(Vec<InsertedMove>, u32), AllocError> {
    let temp = self.temp_register_base();
    let budget = self.method.register_budget;
    let mut temps_used = 0;
    let mut inserted = vec![];
    for ((gap, phase), moves) in batches {
      let block = self
        .method
        .block_at(gap + 1)
        .map(|block| block.id)
        .ok_or_else(|| {
          AllocError::invariant(&self.method.name, format!("no block after gap {}", gap))
        })?;
      let mut scheduler = RegisterMoveScheduler::new(temp)
        .with_register_limit(budget)
        .with_even_wide_temps(self.config.even_pairs());
      for move_ in moves.iter() {
        scheduler.add_move(*move_);
      }
      let mut instrs = vec![];
      scheduler
        .schedule(&mut instrs)
        .map_err(|e| e.in_method(&self.method.name, gap))?;
      log::debug!(
        "{}: {:?} batch of {} moves in {} instructions",
        gap,
        phase,
        moves.len(),
        instrs.len()
      );
      temps_used = temps_used.max(scheduler.used_temp_registers());
      for mut instr in instrs {
        instr.number = gap;
        inserted.push(InsertedMove {
          position: gap,
          block,
          instr,
        });
      }
    }

    let registers_used = if temps_used > 0 {
      temp + temps_used
    } else {
      self.highest_register().map_or(0, |r| r + 1)
    };
    Ok((inserted, registers_used))
  }

  fn allocated(&self, interval: &LiveIntervals) -> Result<Location, AllocError> {
    interval.location().ok_or_else(|| {
      AllocError::invariant(
        &self.method.name,
        format!("{} was never allocated", interval),
      )
    })
  }

  fn location(&self, value: ValueId, position: u32) -> Result<Location, AllocError> {
    self.intervals.location_at(value, position).ok_or_else(|| {
      AllocError::invariant(
        &self.method.name,
        format!("{} has no location at {}", value, position),
      )
    })
  }
}
