//! Blocks, phis and methods

use std::{
  collections::BTreeSet,
  fmt::{Display, Error, Formatter},
};

use serde::{Deserialize, Serialize};

use super::{BlockId, Instruction, Opcode, Value, ValueId, ValueKind};
use crate::error::AllocError;

/// Distance between the numbers of two consecutive instructions. The odd
/// number in between is the gap where the allocator inserts moves.
pub const INSTRUCTION_NUMBER_DELTA: u32 = 2;

/// A merge of values at the head of a block, one operand per predecessor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phi {
  pub out: ValueId,
  pub operands: Vec<(BlockId, ValueId)>,
}

impl Phi {
  pub fn operand_for(&self, pred: BlockId) -> Option<ValueId> {
    self
      .operands
      .iter()
      .find(|(block, _)| *block == pred)
      .map(|(_, value)| *value)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicBlock {
  pub id: BlockId,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub phis: Vec<Phi>,
  pub instructions: Vec<Instruction>,
  #[serde(skip)]
  pub predecessors: Vec<BlockId>,
}

impl BasicBlock {
  pub fn new(id: BlockId) -> Self {
    BasicBlock {
      id,
      phis: vec![],
      instructions: vec![],
      predecessors: vec![],
    }
  }

  pub fn terminator(&self) -> Option<&Instruction> {
    self.instructions.last().filter(|instr| instr.is_terminator())
  }

  pub fn successors(&self) -> Vec<BlockId> {
    self.terminator().map(Instruction::successors).unwrap_or_default()
  }

  /// The gap before the first instruction, where the block's live-in values
  /// and phis start.
  pub fn entry(&self) -> u32 {
    self.instructions.first().map_or(0, |instr| instr.number.saturating_sub(1))
  }

  /// One past the terminator.
  pub fn end(&self) -> u32 {
    self.instructions.last().map_or(0, |instr| instr.number + 1)
  }

  pub fn contains_position(&self, position: u32) -> bool {
    self.entry() <= position && position < self.end()
  }
}

/// A method in SSA form with its blocks in linear (emission) order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Method {
  pub name: String,
  /// Total number of registers the method may use.
  pub register_budget: u32,
  pub values: Vec<Value>,
  pub blocks: Vec<BasicBlock>,
}

impl Method {
  pub fn value(&self, id: ValueId) -> &Value {
    &self.values[id.index()]
  }

  pub fn block(&self, id: BlockId) -> &BasicBlock {
    &self.blocks[id.index()]
  }

  /// Recompute predecessor lists from the terminators, in block order.
  pub fn compute_predecessors(&mut self) {
    let mut preds = vec![vec![]; self.blocks.len()];
    for block in self.blocks.iter() {
      for succ in block.successors() {
        if let Some(list) = preds.get_mut(succ.index()) {
          if !list.contains(&block.id) {
            list.push(block.id);
          }
        }
      }
    }
    for (block, preds) in self.blocks.iter_mut().zip(preds) {
      block.predecessors = preds;
    }
  }

  /// Number every instruction in linear order, starting at
  /// `INSTRUCTION_NUMBER_DELTA`. Returns the number after the last one.
  pub fn number_instructions(&mut self) -> u32 {
    let mut number = INSTRUCTION_NUMBER_DELTA;
    for block in self.blocks.iter_mut() {
      for instr in block.instructions.iter_mut() {
        instr.number = number;
        number += INSTRUCTION_NUMBER_DELTA;
      }
    }
    number
  }

  /// The block containing a numbered position.
  pub fn block_at(&self, position: u32) -> Option<&BasicBlock> {
    let index = self
      .blocks
      .partition_point(|block| block.entry() <= position);
    index
      .checked_sub(1)
      .map(|i| &self.blocks[i])
      .filter(|block| block.contains_position(position))
  }

  /// Check the structural requirements of the allocator. Predecessors must
  /// be computed first.
  pub fn validate(&self) -> Result<(), AllocError> {
    let fail = |message: String| Err(AllocError::invariant(&self.name, message));

    if self.blocks.is_empty() {
      return fail("method has no blocks".to_string());
    }
    if self.register_budget == 0 {
      return fail("register budget is zero".to_string());
    }
    for (index, value) in self.values.iter().enumerate() {
      if value.id.index() != index {
        return fail(format!("value {} stored at index {}", value.id, index));
      }
    }

    let mut defined = vec![false; self.values.len()];
    let mut define = |value: ValueId| -> Result<(), AllocError> {
      match defined.get_mut(value.index()) {
        None => fail(format!("{} is not a value of the method", value)),
        Some(true) => fail(format!("{} is defined more than once", value)),
        Some(slot) => {
          *slot = true;
          Ok(())
        }
      }
    };

    let mut arguments_done = false;
    for (index, block) in self.blocks.iter().enumerate() {
      if block.id.index() != index {
        return fail(format!("{} stored at index {}", block.id, index));
      }
      if block.instructions.is_empty() {
        return fail(format!("{} is empty", block.id));
      }
      if block.terminator().is_none() {
        return fail(format!("{} does not end in a terminator", block.id));
      }
      if let Some(Opcode::If {
        target, fallthrough, ..
      }) = block.terminator().map(|instr| &instr.op)
      {
        if target == fallthrough {
          return fail(format!("{} branches twice to {}", block.id, target));
        }
      }
      for succ in block.successors() {
        if succ.index() >= self.blocks.len() {
          return fail(format!("{} jumps to unknown {}", block.id, succ));
        }
        if block.successors().len() > 1 && self.block(succ).predecessors.len() > 1 {
          return fail(format!("critical edge {} -> {}", block.id, succ));
        }
      }
      if index == 0 && !block.predecessors.is_empty() {
        return fail("entry block has predecessors".to_string());
      }

      let pred_set = block.predecessors.iter().copied().collect::<BTreeSet<_>>();
      for phi in block.phis.iter() {
        define(phi.out)?;
        if self.value(phi.out).kind.is_constant() {
          return fail(format!("phi {} defines a constant", phi.out));
        }
        let operand_preds = phi.operands.iter().map(|(b, _)| *b).collect::<BTreeSet<_>>();
        if operand_preds != pred_set || phi.operands.len() != pred_set.len() {
          return fail(format!("phi {} does not match the predecessors of {}", phi.out, block.id));
        }
        let wide = self.value(phi.out).is_wide();
        for (_, operand) in phi.operands.iter() {
          if operand.index() >= self.values.len() {
            return fail(format!("{} is not a value of the method", operand));
          }
          if self.value(*operand).is_wide() != wide {
            return fail(format!("phi {} mixes wide and narrow operands", phi.out));
          }
        }
      }

      for (position, instr) in block.instructions.iter().enumerate() {
        if instr.is_terminator() && position + 1 != block.instructions.len() {
          return fail(format!("terminator in the middle of {}", block.id));
        }
        for value in instr.ins.iter() {
          if value.index() >= self.values.len() {
            return fail(format!("{} is not a value of the method", value));
          }
        }
        match &instr.op {
          Opcode::Argument { .. } => {
            if index != 0 || arguments_done {
              return fail("arguments must lead the entry block".to_string());
            }
            if instr.out.is_none() {
              return fail("argument without a value".to_string());
            }
          }
          Opcode::Const(number) => match instr
            .out
            .and_then(|out| self.values.get(out.index()))
            .map(|value| value.kind)
          {
            Some(ValueKind::Constant(kind)) if kind == *number => {}
            _ => return fail(format!("const {} does not define a matching constant", number)),
          },
          Opcode::FixedMove(_) => {
            return fail("register moves are not allowed before allocation".to_string());
          }
          Opcode::Move => {
            if instr.ins.len() != 1 || instr.out.is_none() {
              return fail("move needs one input and one output".to_string());
            }
          }
          _ => {
            if let Some(out) = instr.out {
              if self.values.get(out.index()).map_or(false, |v| v.kind.is_constant()) {
                return fail(format!("{} is a constant not defined by a const", out));
              }
            }
          }
        }
        if !matches!(instr.op, Opcode::Argument { .. }) {
          arguments_done = true;
        }
        if let Some(out) = instr.out {
          define(out)?;
        }
      }
    }

    for (index, value) in self.values.iter().enumerate() {
      if !defined[index] {
        return fail(format!("{} is never defined", value.id));
      }
    }
    Ok(())
  }
}

impl Display for Method {
  fn fmt(&self, fmt: &mut Formatter) -> Result<(), Error> {
    writeln!(fmt, "method {} (budget {})", self.name, self.register_budget)?;
    for block in self.blocks.iter() {
      write!(fmt, "{}:", block.id)?;
      if !block.predecessors.is_empty() {
        let preds = block
          .predecessors
          .iter()
          .map(|b| b.to_string())
          .collect::<Vec<_>>();
        write!(fmt, " preds {}", preds.join(", "))?;
      }
      writeln!(fmt)?;
      for phi in block.phis.iter() {
        let operands = phi
          .operands
          .iter()
          .map(|(b, v)| format!("{}: {}", b, v))
          .collect::<Vec<_>>();
        writeln!(fmt, "  phi {} = [{}]", phi.out, operands.join(", "))?;
      }
      for instr in block.instructions.iter() {
        writeln!(fmt, "  {:>4}: {}", instr.number, instr)?;
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use crate::ir::{BinOp, ConstNumber, IfCond, MethodBuilder, ValueKind};

  use super::*;

  #[test]
  fn test_numbering_and_positions() {
    let mut builder = MethodBuilder::new("numbers", 4);
    let a = builder.constant(ConstNumber::int(1));
    let b = builder.constant(ConstNumber::int(2));
    let c = builder.binop(BinOp::Add, a, b);
    builder.ret(Some(c));
    let method = builder.build();

    let numbers = method.blocks[0]
      .instructions
      .iter()
      .map(|instr| instr.number)
      .collect::<Vec<_>>();
    assert_eq!(numbers, vec![2, 4, 6, 8]);
    assert_eq!(method.blocks[0].entry(), 1);
    assert_eq!(method.blocks[0].end(), 9);
    assert_eq!(method.block_at(5).map(|b| b.id), Some(BlockId(0)));
    assert!(method.block_at(9).is_none());
  }

  #[test]
  fn test_critical_edge_rejected() {
    let mut builder = MethodBuilder::new("critical", 4);
    let left = builder.new_block();
    let join = builder.new_block();
    let v = builder.invoke("make", vec![], Some(ValueKind::Narrow { object: false }));
    let v = v.unwrap();
    builder.branch(IfCond::Eq, vec![v], join, left);
    builder.switch_to(left);
    builder.goto(join);
    builder.switch_to(join);
    builder.ret(None);
    let method = builder.build();
    let err = method.validate().unwrap_err();
    assert!(err.to_string().contains("critical edge"), "{}", err);
  }

  #[test]
  fn test_double_definition_rejected() {
    let mut builder = MethodBuilder::new("twice", 4);
    let v = builder.constant(ConstNumber::int(1));
    builder.ret(Some(v));
    let mut method = builder.build();
    let copy = method.blocks[0].instructions[0].clone();
    method.blocks[0].instructions.insert(0, copy);
    method.number_instructions();
    let err = method.validate().unwrap_err();
    assert!(err.to_string().contains("defined more than once"), "{}", err);
  }

  #[test]
  fn test_arguments_lead_entry_block() {
    let mut builder = MethodBuilder::new("args", 4);
    let c = builder.constant(ConstNumber::int(0));
    let a = builder.argument(ValueKind::Narrow { object: false }, 0);
    let s = builder.binop(BinOp::Add, a, c);
    builder.ret(Some(s));
    let err = builder.build().validate().unwrap_err();
    assert!(err.to_string().contains("arguments must lead"), "{}", err);
  }
}
