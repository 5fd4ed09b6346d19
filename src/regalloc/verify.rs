//! Checks of a finished allocation
//!
//! First the intervals on their own: every part of every value has a legal
//! location and no two values share a register at the same time. Then every
//! block of the rewritten method is run symbolically, tracking which value
//! each register holds, so a missing or misordered move shows up as an
//! operand register holding the wrong value.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
  error::AllocError,
  ir::{BasicBlock, ConstNumber, Method, Opcode, ValueId},
};

use super::{
  allocation::Allocation,
  intervals::{LiveIntervals, Location},
};

/// What a register holds: the low (`half` 0) or high half of a value known
/// under one or more names, or of a constant.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Content {
  values: BTreeSet<ValueId>,
  constant: Option<ConstNumber>,
  half: u32,
}

impl Content {
  fn value(value: ValueId, half: u32) -> Self {
    Content {
      values: std::iter::once(value).collect(),
      constant: None,
      half,
    }
  }

  fn constant(number: ConstNumber, half: u32) -> Self {
    Content {
      values: BTreeSet::new(),
      constant: Some(number),
      half,
    }
  }
}

/// Symbolic register file of one block.
struct BlockState<'a> {
  method: &'a Method,
  block: &'a BasicBlock,
  registers: BTreeMap<u32, Content>,
  /// Phis resolved at this block's entry, mapped to the operand the
  /// registers still name them by.
  aliases: BTreeMap<ValueId, ValueId>,
}

/// Verify an allocation of `method`, which must already be rewritten. Phis
/// are read from the allocation, the method no longer has them.
pub fn verify_allocation(method: &Method, allocation: &Allocation) -> Result<(), AllocError> {
  let fail =
    |message: String| AllocError::invariant(&method.name, format!("bad allocation: {}", message));
  check_intervals(method, allocation).map_err(fail)?;
  for block in method.blocks.iter() {
    let mut state = BlockState::at_entry(method, allocation, block).map_err(fail)?;
    state.execute(allocation).map_err(fail)?;
    state.check_exit(allocation).map_err(fail)?;
  }
  Ok(())
}

fn check_intervals(method: &Method, allocation: &Allocation) -> Result<(), String> {
  let budget = method.register_budget;
  let operand_registers = allocation.operand_registers;
  if allocation.registers_used > budget {
    return Err(format!(
      "{} registers used with a budget of {}",
      allocation.registers_used, budget
    ));
  }

  let mut holders: BTreeMap<u32, Vec<&LiveIntervals>> = BTreeMap::new();
  for (_, interval) in allocation.intervals.iter() {
    let location = interval
      .location()
      .ok_or_else(|| format!("{} has no location", interval))?;
    let width = interval.required_registers();
    match location {
      Location::Register(r) if r + width > operand_registers => {
        return Err(format!("{} is outside the operand registers", interval));
      }
      Location::Spill(r) if r < operand_registers || r + width > budget => {
        return Err(format!("{} is outside the spill area", interval));
      }
      Location::Rematerialize if !interval.is_rematerializable() => {
        return Err(format!("{} is not a constant", interval));
      }
      _ => {}
    }
    if let Some(r) = location.register() {
      if interval.is_wide() && allocation.even_pairs && r % 2 != 0 {
        return Err(format!("{} is not in an even pair", interval));
      }
    }
    for r in interval.occupied_registers() {
      holders.entry(r).or_default().push(interval);
    }
  }

  for (register, holders) in holders.iter() {
    for (index, a) in holders.iter().enumerate() {
      for b in holders[index + 1..].iter() {
        if a.value() != b.value() && a.overlaps(b) {
          return Err(format!("{} and {} share r{}", a, b, register));
        }
      }
    }
  }
  Ok(())
}

impl<'a> BlockState<'a> {
  /// The registers at the entry of `block` as the edge moves leave them.
  /// Moves into a block with a single predecessor that branches run at the
  /// block entry, so the block starts with the predecessor's locations;
  /// otherwise the moves ran before the predecessor's goto.
  fn at_entry(
    method: &'a Method,
    allocation: &Allocation,
    block: &'a BasicBlock,
  ) -> Result<Self, String> {
    let mut state = BlockState {
      method,
      block,
      registers: BTreeMap::new(),
      aliases: BTreeMap::new(),
    };
    let phis = allocation
      .phis(block.id)
      .iter()
      .map(|phi| phi.out)
      .collect::<BTreeSet<_>>();
    let moves_at_entry = match block.predecessors.as_slice() {
      [pred] => method.block(*pred).successors().len() > 1,
      _ => false,
    };

    if moves_at_entry {
      let pred = method.block(block.predecessors[0]);
      let exit = exit_of(pred)?;
      for value in allocation.live_in(block.id).difference(&phis) {
        state.place(*value, location(allocation, *value, exit)?);
      }
      for phi in allocation.phis(block.id).iter() {
        let operand = phi
          .operand_for(pred.id)
          .ok_or_else(|| format!("phi {} has no operand for {}", phi.out, pred.id))?;
        state.place(operand, location(allocation, operand, exit)?);
        state.aliases.insert(phi.out, operand);
      }
    } else {
      for value in allocation.live_in(block.id).iter() {
        state.place(*value, location(allocation, *value, block.entry())?);
      }
    }
    Ok(state)
  }

  fn place(&mut self, value: ValueId, location: Location) {
    let r = match location.register() {
      Some(r) => r,
      None => return,
    };
    for half in 0..self.method.value(value).move_type().required_registers() {
      let content = self
        .registers
        .entry(r + half)
        .or_insert_with(|| Content::value(value, half));
      if content.half == half {
        content.values.insert(value);
      }
    }
  }

  /// Whether `register` holds the given half of `value`, under its own name,
  /// the operand it aliases, or as the same constant.
  fn holds(&self, register: u32, value: ValueId, half: u32) -> bool {
    let content = match self.registers.get(&register) {
      Some(content) if content.half == half => content,
      _ => return false,
    };
    std::iter::once(value)
      .chain(self.aliases.get(&value).copied())
      .any(|name| {
        content.values.contains(&name)
          || (content.constant.is_some() && content.constant == self.method.value(name).constant())
      })
  }

  fn expect(&self, register: u32, value: ValueId, position: u32) -> Result<(), String> {
    for half in 0..self.method.value(value).move_type().required_registers() {
      if !self.holds(register + half, value, half) {
        return Err(format!(
          "{} at {}: r{} does not hold {}",
          self.block.id,
          position,
          register + half,
          value
        ));
      }
    }
    Ok(())
  }

  fn execute(&mut self, allocation: &Allocation) -> Result<(), String> {
    let operand_registers = allocation.operand_registers;
    let block = self.block;
    for instr in block.instructions.iter() {
      let number = instr.number;
      if instr.is_allocator_move() {
        let dst = instr
          .out_register
          .ok_or_else(|| format!("move at {} has no destination", number))?;
        match &instr.op {
          Opcode::FixedMove(ty) => {
            let src = instr
              .in_registers
              .first()
              .copied()
              .ok_or_else(|| format!("move at {} has no source", number))?;
            let width = ty.required_registers();
            let copied = (0..width)
              .map(|half| self.registers.get(&(src + half)).cloned())
              .collect::<Vec<_>>();
            for (half, content) in copied.into_iter().enumerate() {
              let r = dst + half as u32;
              match content {
                Some(content) => self.registers.insert(r, content),
                None => self.registers.remove(&r),
              };
            }
          }
          Opcode::Const(number) => {
            for half in 0..number.ty.required_registers() {
              self.registers.insert(dst + half, Content::constant(*number, half));
            }
          }
          _ => return Err(format!("unexpected move at {}", number)),
        }
        continue;
      }

      if instr.in_registers.len() != instr.ins.len() {
        return Err(format!("{} at {} was not rewritten", self.block.id, number));
      }
      for (value, register) in instr.ins.iter().zip(instr.in_registers.iter()) {
        let width = self.method.value(*value).move_type().required_registers();
        if register + width > operand_registers {
          return Err(format!(
            "{} at {}: r{} is not an operand register",
            self.block.id, number, register
          ));
        }
        self.expect(*register, *value, number)?;
      }
      if let Some(out) = instr.out {
        let register = instr
          .out_register
          .ok_or_else(|| format!("{} at {}: {} has no register", self.block.id, number, out))?;
        let width = self.method.value(out).move_type().required_registers();
        if register + width > operand_registers {
          return Err(format!(
            "{} at {}: r{} is not an operand register",
            self.block.id, number, register
          ));
        }
        for half in 0..width {
          self.registers.insert(register + half, Content::value(out, half));
        }
      }
    }
    Ok(())
  }

  /// Every successor must find its live-ins and phi operands where its
  /// entry state expects them.
  fn check_exit(&self, allocation: &Allocation) -> Result<(), String> {
    let successors = self.block.successors();
    if successors.is_empty() {
      return Ok(());
    }
    let exit = exit_of(self.block)?;
    for succ in successors.iter() {
      let succ = self.method.block(*succ);
      // A branch leaves the moves to its successors.
      let position = if successors.len() > 1 { exit } else { succ.entry() };
      for value in allocation.live_in(succ.id).iter() {
        let phi = allocation.phis(succ.id).iter().find(|phi| phi.out == *value);
        let (expected, location) = match phi {
          Some(phi) => {
            let operand = phi
              .operand_for(self.block.id)
              .ok_or_else(|| format!("phi {} has no operand for {}", phi.out, self.block.id))?;
            if successors.len() > 1 {
              (operand, location(allocation, operand, exit)?)
            } else {
              (operand, location(allocation, phi.out, position)?)
            }
          }
          None => (*value, location(allocation, *value, position)?),
        };
        if let Some(register) = location.register() {
          self.expect(register, expected, exit)?;
        }
      }
    }
    Ok(())
  }
}

fn exit_of(block: &BasicBlock) -> Result<u32, String> {
  block
    .terminator()
    .map(|instr| instr.number)
    .ok_or_else(|| format!("{} has no terminator", block.id))
}

fn location(allocation: &Allocation, value: ValueId, position: u32) -> Result<Location, String> {
  allocation
    .location_at(value, position)
    .ok_or_else(|| format!("{} has no location at {}", value, position))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    config::AllocatorConfig,
    ir::{ConstNumber, IfCond, MethodBuilder, ValueKind},
    regalloc::allocate_registers,
  };

  const INT: ValueKind = ValueKind::Narrow { object: false };

  fn config(operand_registers: u32) -> AllocatorConfig {
    AllocatorConfig {
      operand_registers,
      verify: false,
      ..AllocatorConfig::default()
    }
  }

  fn spilling_method() -> Method {
    let mut builder = MethodBuilder::new("spill", 2);
    let a = builder.invoke("make", vec![], Some(INT)).unwrap(); // 2
    let b = builder.invoke("make", vec![], Some(INT)).unwrap(); // 4
    builder.invoke("use", vec![b], None); // 6
    builder.invoke("use", vec![a], None); // 8
    builder.ret(None); // 10
    builder.build()
  }

  #[test]
  fn test_accepts_allocated_method() {
    let mut method = spilling_method();
    let allocation = allocate_registers(&mut method, &config(1)).unwrap();
    assert!(verify_allocation(&method, &allocation).is_ok());
  }

  #[test]
  fn test_detects_dropped_reload() {
    let mut method = spilling_method();
    let allocation = allocate_registers(&mut method, &config(1)).unwrap();
    // Drop the reload in front of the last use.
    let instrs = &mut method.blocks[0].instructions;
    let reload = instrs
      .iter()
      .rposition(|instr| instr.is_allocator_move())
      .unwrap();
    instrs.remove(reload);
    let err = verify_allocation(&method, &allocation).unwrap_err();
    assert!(err.to_string().contains("does not hold v0"), "{}", err);
  }

  #[test]
  fn test_detects_swapped_operands() {
    let mut builder = MethodBuilder::new("swapped", 4);
    let a = builder.invoke("make", vec![], Some(INT)).unwrap();
    let b = builder.invoke("make", vec![], Some(INT)).unwrap();
    builder.invoke("use", vec![a, b], None);
    builder.ret(None);
    let mut method = builder.build();
    let allocation = allocate_registers(&mut method, &config(4)).unwrap();
    method.blocks[0].instructions[2].in_registers.reverse();
    assert!(verify_allocation(&method, &allocation).is_err());
  }

  #[test]
  fn test_rematerialized_constant_matches_by_number() {
    let mut builder = MethodBuilder::new("remat", 1);
    let c = builder.constant(ConstNumber::int(42)); // 2
    let v = builder.invoke("make", vec![], Some(INT)).unwrap(); // 4
    builder.invoke("use", vec![v], None); // 6
    builder.invoke("use", vec![c], None); // 8
    builder.ret(None); // 10
    let mut method = builder.build();
    let allocation = allocate_registers(&mut method, &config(1)).unwrap();
    assert!(verify_allocation(&method, &allocation).is_ok());

    // A different constant in its place is caught.
    for instr in method.blocks[0].instructions.iter_mut() {
      if instr.is_allocator_move() {
        instr.op = Opcode::Const(ConstNumber::int(43));
      }
    }
    assert!(verify_allocation(&method, &allocation).is_err());
  }

  #[test]
  fn test_phis_across_branches() {
    let mut builder = MethodBuilder::new("diamond", 8);
    let left = builder.new_block();
    let right = builder.new_block();
    let join = builder.new_block();
    let p = builder.invoke("make", vec![], Some(INT)).unwrap();
    let q = builder.invoke("make", vec![], Some(INT)).unwrap();
    builder.branch(IfCond::Eq, vec![p, q], left, right);
    builder.switch_to(left);
    let r = builder.invoke("make", vec![], Some(INT)).unwrap();
    builder.goto(join);
    builder.switch_to(right);
    builder.goto(join);
    builder.switch_to(join);
    let x = builder.phi(join, INT);
    builder.invoke("use", vec![x, p], None);
    builder.ret(None);
    builder.add_phi_operand(x, left, r);
    builder.add_phi_operand(x, right, q);
    let mut method = builder.build();

    // Verified after the fact: the method has lost its phis by now.
    let allocation = allocate_registers(&mut method, &config(2)).unwrap();
    assert!(method.block(join).phis.is_empty());
    assert_eq!(allocation.phis(join).len(), 1);
    assert!(verify_allocation(&method, &allocation).is_ok());
  }

  #[test]
  fn test_detects_wrong_phi_operand() {
    let mut builder = MethodBuilder::new("diamond", 8);
    let left = builder.new_block();
    let right = builder.new_block();
    let join = builder.new_block();
    let p = builder.invoke("make", vec![], Some(INT)).unwrap();
    let q = builder.invoke("make", vec![], Some(INT)).unwrap();
    builder.branch(IfCond::Eq, vec![p, q], left, right);
    builder.switch_to(left);
    let r = builder.invoke("make", vec![], Some(INT)).unwrap();
    builder.goto(join);
    builder.switch_to(right);
    builder.goto(join);
    builder.switch_to(join);
    let x = builder.phi(join, INT);
    builder.invoke("use", vec![x, p], None);
    builder.ret(None);
    builder.add_phi_operand(x, left, r);
    builder.add_phi_operand(x, right, q);
    let mut method = builder.build();

    let mut allocation = allocate_registers(&mut method, &config(2)).unwrap();
    // Claim the left edge brings `p` instead of `r`.
    allocation.phis[join.index()][0].operands = vec![(left, p), (right, q)];
    assert!(verify_allocation(&method, &allocation).is_err());
  }
}
