//! Convenience builder for methods, used by tests and front ends alike

use super::{
  BasicBlock, BinOp, BlockId, ConstNumber, IfCond, Instruction, Method, MoveType, Opcode, Phi,
  Value, ValueId, ValueKind,
};

/// Appends instructions to a current block; blocks are laid out in the
/// order they are created.
pub struct MethodBuilder {
  method: Method,
  current: BlockId,
}

/// The non-constant kind holding values of the given register category.
fn register_kind(ty: MoveType) -> ValueKind {
  match ty {
    MoveType::Wide => ValueKind::Wide,
    MoveType::Object => ValueKind::Narrow { object: true },
    MoveType::Single => ValueKind::Narrow { object: false },
  }
}

impl MethodBuilder {
  pub fn new(name: &str, register_budget: u32) -> Self {
    MethodBuilder {
      method: Method {
        name: name.to_string(),
        register_budget,
        values: vec![],
        blocks: vec![BasicBlock::new(BlockId(0))],
      },
      current: BlockId(0),
    }
  }

  pub fn new_block(&mut self) -> BlockId {
    let id = BlockId(self.method.blocks.len() as u32);
    self.method.blocks.push(BasicBlock::new(id));
    id
  }

  pub fn switch_to(&mut self, block: BlockId) {
    self.current = block;
  }

  pub fn new_value(&mut self, kind: ValueKind) -> ValueId {
    let id = ValueId(self.method.values.len() as u32);
    self.method.values.push(Value::new(id, kind));
    id
  }

  /// Attach debug local info to a value.
  pub fn set_local(&mut self, value: ValueId, name: &str) {
    self.method.values[value.index()].local = Some(name.to_string());
  }

  fn push(&mut self, instr: Instruction) {
    self.method.blocks[self.current.index()]
      .instructions
      .push(instr);
  }

  fn kind_of(&self, value: ValueId) -> ValueKind {
    self.method.values[value.index()].kind
  }

  pub fn argument(&mut self, kind: ValueKind, register: u32) -> ValueId {
    let out = self.new_value(kind);
    self.push(Instruction::new(Opcode::Argument { register }, Some(out), vec![]));
    out
  }

  pub fn constant(&mut self, number: ConstNumber) -> ValueId {
    let out = self.new_value(ValueKind::Constant(number));
    self.push(Instruction::new(Opcode::Const(number), Some(out), vec![]));
    out
  }

  pub fn mov(&mut self, src: ValueId) -> ValueId {
    let out = self.new_value(register_kind(self.kind_of(src).move_type()));
    self.push(Instruction::new(Opcode::Move, Some(out), vec![src]));
    out
  }

  /// Binary operation; the result is wide when the left operand is.
  pub fn binop(&mut self, op: BinOp, left: ValueId, right: ValueId) -> ValueId {
    let kind = if self.kind_of(left).needs_pair() {
      ValueKind::Wide
    } else {
      ValueKind::Narrow { object: false }
    };
    let out = self.new_value(kind);
    self.push(Instruction::new(Opcode::Binop(op), Some(out), vec![left, right]));
    out
  }

  pub fn invoke(
    &mut self,
    name: &str,
    args: Vec<ValueId>,
    result: Option<ValueKind>,
  ) -> Option<ValueId> {
    let out = result.map(|kind| self.new_value(kind));
    self.push(Instruction::new(Opcode::Invoke(name.to_string()), out, args));
    out
  }

  /// Add a phi without operands to `block`; operands are added once the
  /// predecessors exist.
  pub fn phi(&mut self, block: BlockId, kind: ValueKind) -> ValueId {
    let out = self.new_value(kind);
    self.method.blocks[block.index()].phis.push(Phi {
      out,
      operands: vec![],
    });
    out
  }

  pub fn add_phi_operand(&mut self, phi: ValueId, pred: BlockId, value: ValueId) {
    for block in self.method.blocks.iter_mut() {
      if let Some(phi) = block.phis.iter_mut().find(|p| p.out == phi) {
        phi.operands.push((pred, value));
        return;
      }
    }
  }

  pub fn goto(&mut self, target: BlockId) {
    self.push(Instruction::new(Opcode::Goto(target), None, vec![]));
  }

  pub fn branch(&mut self, cond: IfCond, ins: Vec<ValueId>, target: BlockId, fallthrough: BlockId) {
    self.push(Instruction::new(
      Opcode::If {
        cond,
        target,
        fallthrough,
      },
      None,
      ins,
    ));
  }

  pub fn ret(&mut self, value: Option<ValueId>) {
    self.push(Instruction::new(Opcode::Return, None, value.into_iter().collect()));
  }

  /// Finish the method: compute predecessors and number the instructions.
  pub fn build(mut self) -> Method {
    self.method.compute_predecessors();
    self.method.number_instructions();
    self.method
  }
}
