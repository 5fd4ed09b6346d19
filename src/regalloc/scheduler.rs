//! Sequentialization of parallel register moves
//!
//! All moves added to one scheduler happen "at once": every source is read
//! before any destination is written. The scheduler emits them one by one,
//! ordering them so no pending read is clobbered, and breaks cycles by
//! parking values in temporary registers numbered from `temp_register` up.

use std::collections::{BTreeMap, VecDeque};

use crate::{
  error::AllocError,
  ir::{Instruction, MoveType},
};

use super::moves::RegisterMove;

pub struct RegisterMoveScheduler {
  /// Pending moves in insertion order, without duplicates.
  move_set: Vec<RegisterMove>,
  /// Where the value originally in a register can be read now.
  value_map: BTreeMap<u32, u32>,
  temp_register: u32,
  used_temp_registers: u32,
  register_limit: u32,
  even_wide_temps: bool,
}

impl RegisterMoveScheduler {
  pub fn new(temp_register: u32) -> Self {
    RegisterMoveScheduler {
      move_set: vec![],
      value_map: BTreeMap::new(),
      temp_register,
      used_temp_registers: 0,
      register_limit: u32::MAX,
      even_wide_temps: false,
    }
  }

  /// Temporaries must stay below `limit`.
  pub fn with_register_limit(mut self, limit: u32) -> Self {
    self.register_limit = limit;
    self
  }

  /// Start wide temporaries on even registers.
  pub fn with_even_wide_temps(mut self, even: bool) -> Self {
    self.even_wide_temps = even;
    self
  }

  pub fn add_move(&mut self, move_: RegisterMove) {
    if self.move_set.contains(&move_) {
      return;
    }
    if let Some(src) = move_.src {
      self.value_map.insert(src, src);
    }
    self.value_map.insert(move_.dst, move_.dst);
    self.move_set.push(move_);
  }

  /// Number of temporary registers the emitted moves use.
  pub fn used_temp_registers(&self) -> u32 {
    self.used_temp_registers
  }

  /// Emit all pending moves into `out` in an order with parallel semantics.
  pub fn schedule(&mut self, out: &mut Vec<Instruction>) -> Result<(), AllocError> {
    let mut worklist = VecDeque::new();
    self.collect_unblocked(&mut worklist);

    while !worklist.is_empty() || !self.move_set.is_empty() {
      while let Some(move_) = worklist.pop_front() {
        debug_assert!(!move_.is_blocked(&self.move_set, &self.value_map));
        let dst = self.create_move(&move_, out);
        if let Some(src) = move_.src {
          self.value_map.insert(src, dst);
        }
        self.collect_unblocked(&mut worklist);
      }
      if !self.move_set.is_empty() {
        // Everything left is part of a cycle.
        let move_ = self.pick_move_to_unblock();
        self.create_move_dest_to_temp(&move_, out)?;
        worklist.push_back(move_);
      }
    }
    Ok(())
  }

  fn collect_unblocked(&mut self, worklist: &mut VecDeque<RegisterMove>) {
    let mut index = 0;
    while index < self.move_set.len() {
      if self.move_set[index].is_blocked(&self.move_set, &self.value_map) {
        index += 1;
      } else {
        worklist.push_back(self.move_set.remove(index));
      }
    }
  }

  fn create_move(&self, move_: &RegisterMove, out: &mut Vec<Instruction>) -> u32 {
    let instr = match (move_.src, move_.definition) {
      (Some(src), _) => {
        let from = self.value_map.get(&src).copied().unwrap_or(src);
        Instruction::fixed_move(move_.ty, move_.dst, from)
      }
      (None, Some(definition)) => Instruction::fixed_const(move_.dst, definition.number),
      (None, None) => unreachable!("register move without source or definition"),
    };
    out.push(instr);
    move_.dst
  }

  /// The first narrow move, or the last move when all are wide.
  fn pick_move_to_unblock(&mut self) -> RegisterMove {
    let index = self
      .move_set
      .iter()
      .position(|m| !m.ty.is_wide())
      .unwrap_or(self.move_set.len() - 1);
    self.move_set.remove(index)
  }

  /// Park every value `move_` would overwrite in a fresh temporary.
  fn create_move_dest_to_temp(
    &mut self,
    move_: &RegisterMove,
    out: &mut Vec<Instruction>,
  ) -> Result<(), AllocError> {
    let blocking = self.find_moves_with_src(move_.dst, move_.ty);
    debug_assert!(!blocking.is_empty());
    for other in blocking {
      let src = match other.src {
        Some(src) => src,
        None => continue,
      };
      let temp = self.next_temp(other.ty)?;
      let from = self.value_map.get(&src).copied().unwrap_or(src);
      out.push(Instruction::fixed_move(other.ty, temp, from));
      self.value_map.insert(src, temp);
    }
    Ok(())
  }

  fn next_temp(&mut self, ty: MoveType) -> Result<u32, AllocError> {
    let mut temp = self.temp_register + self.used_temp_registers;
    if ty.is_wide() && self.even_wide_temps && temp % 2 == 1 {
      temp += 1;
    }
    let end = temp + ty.required_registers();
    if end > self.register_limit {
      // The caller knows the method and the gap.
      return Err(AllocError::capacity(
        "",
        0,
        self.move_set.len() + 1,
        self.register_limit,
      ));
    }
    self.used_temp_registers = end - self.temp_register;
    Ok(temp)
  }

  /// Pending moves whose current source overlaps `register` (or the pair
  /// starting there when `ty` is wide).
  fn find_moves_with_src(&self, register: u32, ty: MoveType) -> Vec<RegisterMove> {
    self
      .move_set
      .iter()
      .filter(|m| match m.src {
        Some(src) => {
          let current = self.value_map.get(&src).copied().unwrap_or(src);
          current == register
            || (m.ty.is_wide() && current + 1 == register)
            || (ty.is_wide() && current == register + 1)
        }
        None => false,
      })
      .copied()
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use super::*;
  use crate::ir::{ConstNumber, Opcode, ValueId};

  const TEMP: u32 = 42;

  fn schedule(moves: &[(u32, u32, MoveType)]) -> Vec<Instruction> {
    let mut scheduler = RegisterMoveScheduler::new(TEMP);
    for (dst, src, ty) in moves {
      scheduler.add_move(RegisterMove::new(*dst, *src, *ty));
    }
    let mut out = vec![];
    scheduler.schedule(&mut out).unwrap();
    out
  }

  fn dst(instr: &Instruction) -> u32 {
    instr.out_register.unwrap()
  }

  fn src(instr: &Instruction) -> u32 {
    instr.in_registers[0]
  }

  fn ty(instr: &Instruction) -> MoveType {
    *instr.op.as_fixed_move().unwrap()
  }

  /// Run the moves on a register file where every register holds its own
  /// number, one register at a time.
  fn replay(instrs: &[Instruction]) -> BTreeMap<u32, u32> {
    let mut regs = BTreeMap::new();
    let read = |regs: &BTreeMap<u32, u32>, r: u32| regs.get(&r).copied().unwrap_or(r);
    for instr in instrs {
      let width = ty(instr).required_registers();
      let values = (0..width)
        .map(|i| read(&regs, src(instr) + i))
        .collect::<Vec<_>>();
      for (i, value) in values.into_iter().enumerate() {
        regs.insert(dst(instr) + i as u32, value);
      }
    }
    regs
  }

  fn assert_parallel(moves: &[(u32, u32, MoveType)], instrs: &[Instruction]) {
    let regs = replay(instrs);
    for (d, s, t) in moves {
      for i in 0..t.required_registers() {
        assert_eq!(regs.get(&(d + i)).copied().unwrap_or(d + i), s + i, "r{}", d + i);
      }
    }
  }

  #[test]
  fn test_single_parallel_move() {
    let moves = [(0, 1, MoveType::Single), (1, 0, MoveType::Single)];
    let out = schedule(&moves);
    assert_eq!(out.len(), 3);
    assert!(out.iter().all(|m| ty(m) == MoveType::Single));
    assert_eq!(dst(&out[0]), TEMP);
    assert_eq!(src(&out[0]), dst(&out[1]));
    assert_eq!(src(&out[2]), TEMP);
    assert_eq!(src(&out[1]), dst(&out[2]));
    assert_parallel(&moves, &out);
  }

  #[test]
  fn test_wide_parallel_move() {
    let moves = [(0, 2, MoveType::Wide), (2, 0, MoveType::Wide)];
    let out = schedule(&moves);
    assert_eq!(out.len(), 3);
    assert!(out.iter().all(|m| ty(m) == MoveType::Wide));
    assert_eq!(dst(&out[0]), TEMP);
    assert_eq!(src(&out[0]), dst(&out[1]));
    assert_eq!(src(&out[2]), TEMP);
    assert_eq!(src(&out[1]), dst(&out[2]));
    assert_parallel(&moves, &out);
  }

  #[test]
  fn test_mixed_parallel_move() {
    let moves = [(1, 0, MoveType::Wide), (0, 1, MoveType::Single)];
    let out = schedule(&moves);
    assert_eq!(out.len(), 3);
    assert_eq!(
      out.iter().map(ty).collect::<Vec<_>>(),
      vec![MoveType::Wide, MoveType::Single, MoveType::Wide]
    );
    assert_eq!(dst(&out[0]), TEMP);
    assert_eq!(src(&out[0]), dst(&out[1]));
    assert_eq!(src(&out[2]), TEMP);
    assert_eq!(src(&out[1]), dst(&out[2]));
  }

  #[test]
  fn test_mixed_parallel_move_other_order() {
    let moves = [(0, 1, MoveType::Single), (1, 0, MoveType::Wide)];
    let out = schedule(&moves);
    assert_eq!(out.len(), 3);
    assert_eq!(
      out.iter().map(ty).collect::<Vec<_>>(),
      vec![MoveType::Wide, MoveType::Single, MoveType::Wide]
    );
    assert_eq!(dst(&out[0]), TEMP);
    assert_eq!(src(&out[0]), dst(&out[1]));
    assert_eq!(src(&out[2]), TEMP);
    assert_eq!(src(&out[1]), dst(&out[2]));
  }

  #[test]
  fn test_slide_wide_moves() {
    let moves = [(0, 1, MoveType::Wide), (2, 3, MoveType::Wide)];
    let out = schedule(&moves);
    assert_eq!(out.len(), 2);
    assert_eq!((dst(&out[0]), src(&out[0])), (0, 1));
    assert_eq!((dst(&out[1]), src(&out[1])), (2, 3));
    assert_parallel(&moves, &out);
  }

  #[test]
  fn test_slide_wide_moves_needing_temp() {
    let moves = [(2, 1, MoveType::Wide), (0, 3, MoveType::Wide)];
    let out = schedule(&moves);
    assert_eq!(out.len(), 3);
    assert!(out.iter().all(|m| ty(m) == MoveType::Wide));
    assert_eq!((dst(&out[0]), src(&out[0])), (TEMP, 1));
    assert_eq!((dst(&out[1]), src(&out[1])), (0, 3));
    assert_eq!((dst(&out[2]), src(&out[2])), (2, TEMP));
    assert_parallel(&moves, &out);
  }

  #[test]
  fn test_wide_blocked_by_two_singles() {
    let moves = [
      (2, 0, MoveType::Wide),
      (0, 2, MoveType::Single),
      (1, 3, MoveType::Single),
    ];
    let out = schedule(&moves);
    assert_eq!(out.len(), 4);
    assert_eq!(
      out.iter().map(ty).collect::<Vec<_>>(),
      vec![MoveType::Wide, MoveType::Single, MoveType::Single, MoveType::Wide]
    );
    assert_eq!(
      out.iter().map(dst).collect::<Vec<_>>(),
      vec![TEMP, 0, 1, 2]
    );
    assert_parallel(&moves, &out);
  }

  #[test]
  fn test_single_blocked_by_second_half_of_wide() {
    let moves = [(0, 2, MoveType::Wide), (3, 0, MoveType::Single)];
    let out = schedule(&moves);
    assert_eq!(out.len(), 3);
    assert_eq!((dst(&out[0]), src(&out[0]), ty(&out[0])), (TEMP, 2, MoveType::Wide));
    assert_eq!((dst(&out[1]), src(&out[1]), ty(&out[1])), (3, 0, MoveType::Single));
    assert_eq!((dst(&out[2]), src(&out[2]), ty(&out[2])), (0, TEMP, MoveType::Wide));
    assert_parallel(&moves, &out);
  }

  #[test]
  fn test_multiple_wide_moves() {
    let moves = [
      (14, 11, MoveType::Wide),
      (16, 13, MoveType::Wide),
      (10, 17, MoveType::Wide),
      (12, 19, MoveType::Wide),
    ];
    let mut scheduler = RegisterMoveScheduler::new(TEMP);
    for (d, s, t) in moves.iter() {
      scheduler.add_move(RegisterMove::new(*d, *s, *t));
    }
    let mut out = vec![];
    scheduler.schedule(&mut out).unwrap();
    // Two temporary pairs are live at once.
    assert_eq!(out.len(), 6);
    assert_eq!((dst(&out[0]), src(&out[0])), (42, 11));
    assert_eq!((dst(&out[1]), src(&out[1])), (44, 13));
    assert_eq!(dst(&out[2]), 12);
    assert_eq!(scheduler.used_temp_registers(), 4);
    assert_parallel(&moves, &out);
  }

  #[test]
  fn test_multiple_live_temp_registers() {
    let moves = [
      (26, 22, MoveType::Single),
      (29, 24, MoveType::Wide),
      (28, 26, MoveType::Object),
      (23, 28, MoveType::Wide),
    ];
    let out = schedule(&moves);
    assert_eq!(
      out.iter().map(|m| (dst(m), src(m))).collect::<Vec<_>>(),
      vec![(42, 26), (26, 22), (43, 28), (28, 42), (29, 24), (23, 43)]
    );
    assert_parallel(&moves, &out);
  }

  #[test]
  fn test_constant_move_waits_for_reader() {
    let mut scheduler = RegisterMoveScheduler::new(TEMP);
    scheduler.add_move(RegisterMove::constant(0, ValueId(5), ConstNumber::int(9)));
    scheduler.add_move(RegisterMove::new(1, 0, MoveType::Single));
    let mut out = vec![];
    scheduler.schedule(&mut out).unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!((dst(&out[0]), src(&out[0])), (1, 0));
    assert_eq!(out[1].op, Opcode::Const(ConstNumber::int(9)));
    assert_eq!(dst(&out[1]), 0);
  }

  #[test]
  fn test_duplicate_moves_are_emitted_once() {
    let out = schedule(&[(3, 1, MoveType::Single), (3, 1, MoveType::Single)]);
    assert_eq!(out.len(), 1);
  }

  #[test]
  fn test_temp_beyond_limit_fails() {
    let mut scheduler = RegisterMoveScheduler::new(2).with_register_limit(3);
    scheduler.add_move(RegisterMove::new(0, 1, MoveType::Wide));
    scheduler.add_move(RegisterMove::new(1, 0, MoveType::Wide));
    let mut out = vec![];
    assert!(scheduler.schedule(&mut out).unwrap_err().is_capacity());
  }

  #[test]
  fn test_even_wide_temps() {
    let mut scheduler = RegisterMoveScheduler::new(5).with_even_wide_temps(true);
    scheduler.add_move(RegisterMove::new(0, 2, MoveType::Wide));
    scheduler.add_move(RegisterMove::new(2, 0, MoveType::Wide));
    let mut out = vec![];
    scheduler.schedule(&mut out).unwrap();
    assert_eq!(dst(&out[0]), 6);
    assert_eq!(scheduler.used_temp_registers(), 3);
  }

  /// Deterministic pseudo-random numbers, same seed same batches.
  fn next(state: &mut u64, bound: u32) -> u32 {
    *state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    ((*state >> 33) % bound as u64) as u32
  }

  fn shuffled(state: &mut u64, n: u32) -> Vec<u32> {
    let mut perm = (0..n).collect::<Vec<_>>();
    for i in (1..n as usize).rev() {
      let j = next(state, i as u32 + 1) as usize;
      perm.swap(i, j);
    }
    perm
  }

  #[test]
  fn test_random_narrow_batches() {
    let mut state = 7;
    for _ in 0..300 {
      let n = 2 + next(&mut state, 7);
      let perm = shuffled(&mut state, n);
      let mut moves = perm
        .iter()
        .enumerate()
        .filter(|(src, dst)| **dst != *src as u32 && next(&mut state, 4) != 0)
        .map(|(src, dst)| (*dst, src as u32, MoveType::Single))
        .collect::<Vec<_>>();
      // Copies of live registers into registers nothing else writes.
      for extra in 0..next(&mut state, 3) {
        moves.push((n + extra, next(&mut state, n), MoveType::Single));
      }
      let out = schedule(&moves);
      assert_parallel(&moves, &out);
    }
  }

  #[test]
  fn test_random_wide_batches() {
    let mut state = 11;
    for _ in 0..200 {
      let n = 2 + next(&mut state, 5);
      let perm = shuffled(&mut state, n);
      let moves = perm
        .iter()
        .enumerate()
        .filter(|(src, dst)| **dst != *src as u32)
        .map(|(src, dst)| (2 * dst, 2 * src as u32, MoveType::Wide))
        .collect::<Vec<_>>();
      let out = schedule(&moves);
      assert_parallel(&moves, &out);
    }
  }
}
