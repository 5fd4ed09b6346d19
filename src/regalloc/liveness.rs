// Method -> live-in sets per block -> live intervals per value

use std::collections::BTreeSet;

use crate::{
  config::AllocatorConfig,
  ir::{BlockId, Method, Opcode, ValueId},
};

use super::intervals::{IntervalSet, LiveIntervals, LiveIntervalsUse};

/// The liveness analysis result of a method
#[derive(Debug)]
pub struct Liveness {
  /// Values live at the entry of each block, phi results included.
  live_in: Vec<BTreeSet<ValueId>>,
  /// Values live at the end of each block, phi operands for the
  /// successors included.
  live_out: Vec<BTreeSet<ValueId>>,
}

impl Liveness {
  /// Iterate the live-in sets to a fixed point. Blocks are visited in
  /// reverse linear order, which settles loop-free code in one round.
  pub fn from_method(method: &Method) -> Self {
    let count = method.blocks.len();
    // Values read before any definition in the block, and values defined.
    let mut used = vec![BTreeSet::new(); count];
    let mut defined = vec![BTreeSet::new(); count];
    for block in method.blocks.iter() {
      let (used, defined) = (&mut used[block.id.index()], &mut defined[block.id.index()]);
      defined.extend(block.phis.iter().map(|phi| phi.out));
      for instr in block.instructions.iter() {
        for value in instr.ins.iter() {
          if !defined.contains(value) {
            used.insert(*value);
          }
        }
        if let Some(out) = instr.out {
          defined.insert(out);
        }
      }
    }

    let mut liveness = Liveness {
      live_in: vec![BTreeSet::new(); count],
      live_out: vec![BTreeSet::new(); count],
    };
    let mut changed = true;
    while changed {
      changed = false;
      for block in method.blocks.iter().rev() {
        let index = block.id.index();
        let live_out = liveness.compute_live_out(method, block.id);
        let mut live_in = used[index].clone();
        live_in.extend(live_out.difference(&defined[index]).copied());
        live_in.extend(block.phis.iter().map(|phi| phi.out));
        if live_in != liveness.live_in[index] {
          liveness.live_in[index] = live_in;
          changed = true;
        }
        liveness.live_out[index] = live_out;
      }
    }
    liveness
  }

  /// Live-ins of the successors minus their phi results, plus the phi
  /// operands flowing out of `block`.
  fn compute_live_out(&self, method: &Method, block: BlockId) -> BTreeSet<ValueId> {
    let mut live_out = BTreeSet::new();
    for succ in method.block(block).successors() {
      let succ = method.block(succ);
      let phis = succ.phis.iter().map(|phi| phi.out).collect::<BTreeSet<_>>();
      live_out.extend(self.live_in[succ.id.index()].difference(&phis).copied());
      live_out.extend(succ.phis.iter().filter_map(|phi| phi.operand_for(block)));
    }
    live_out
  }

  pub fn live_in(&self, block: BlockId) -> &BTreeSet<ValueId> {
    &self.live_in[block.index()]
  }

  pub fn live_out(&self, block: BlockId) -> &BTreeSet<ValueId> {
    &self.live_out[block.index()]
  }

  /// Build one interval per value, walking every block backwards.
  pub fn build_intervals(&self, method: &Method, config: &AllocatorConfig) -> IntervalSet {
    let mut intervals = method
      .values
      .iter()
      .map(|value| LiveIntervals::new(value.id, value.move_type()))
      .collect::<Vec<_>>();

    for block in method.blocks.iter().rev() {
      let (entry, end) = (block.entry(), block.end());
      for value in self.live_out(block.id) {
        intervals[value.index()].add_range(entry, end);
      }
      for instr in block.instructions.iter().rev() {
        let number = instr.number;
        if let Some(out) = instr.out {
          let interval = &mut intervals[out.index()];
          interval.set_definition(number);
          interval.add_use(LiveIntervalsUse::at(number));
          if let Opcode::Argument { register } = instr.op {
            interval.set_fixed_register(register);
          }
        }
        for value in instr.ins.iter() {
          let interval = &mut intervals[value.index()];
          interval.add_range(entry, number + 1);
          interval.add_use(LiveIntervalsUse::at(number));
        }
      }
      for phi in block.phis.iter() {
        // Unused phis still occupy their location at the block entry.
        intervals[phi.out.index()].set_definition(entry);
      }
    }

    let method_end = method.blocks.last().map_or(0, |block| block.end());
    for (value, interval) in method.values.iter().zip(intervals.iter_mut()) {
      if config.debug && value.local.is_some() && interval.end() < method_end {
        interval.add_range(interval.start(), method_end);
      }
      if config.rematerialize_constants && value.is_rematerializable() {
        if let Some(number) = value.constant() {
          interval.set_constant(number);
        }
      }
    }

    for interval in intervals.iter() {
      log::trace!("{}", interval);
    }
    IntervalSet::from_parents(intervals)
  }
}
