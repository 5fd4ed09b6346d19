//! Register to position table used when picking registers
//!
//! Maps a register to the next position its occupant needs it (or is free
//! until). Registers without an entry are free forever, which is encoded as
//! `u32::MAX` so the "largest position wins" comparisons need no special case.

/// Value of a register that was never set.
pub const UNUSED: u32 = u32::MAX;

const INITIAL_SIZE: usize = 16;

#[derive(Debug, Clone)]
pub struct RegisterPositions {
  limit: u32,
  backing: Vec<u32>,
  holds_constant: Vec<bool>,
}

impl RegisterPositions {
  pub fn new(limit: u32) -> Self {
    let size = INITIAL_SIZE.min(limit as usize);
    RegisterPositions {
      limit,
      backing: vec![UNUSED; size],
      holds_constant: vec![false; size],
    }
  }

  /// Record `position` for `register`, and whether its occupant is a
  /// constant that can be rematerialized instead of spilled.
  pub fn set(&mut self, register: u32, position: u32, holds_constant: bool) {
    assert!(
      register < self.limit,
      "register {} beyond limit {}",
      register,
      self.limit
    );
    let index = register as usize;
    if index >= self.backing.len() {
      self.grow(index + 1);
    }
    self.backing[index] = position;
    self.holds_constant[index] = holds_constant;
  }

  pub fn get(&self, register: u32) -> u32 {
    debug_assert!(register < self.limit);
    self
      .backing
      .get(register as usize)
      .copied()
      .unwrap_or(UNUSED)
  }

  pub fn holds_constant(&self, register: u32) -> bool {
    self
      .holds_constant
      .get(register as usize)
      .copied()
      .unwrap_or(false)
  }

  /// Double the backing until it holds `min_size` entries, never past the
  /// limit.
  fn grow(&mut self, min_size: usize) {
    let mut size = self.backing.len().max(1);
    while size < min_size {
      size *= 2;
    }
    let size = size.min(self.limit as usize);
    self.backing.resize(size, UNUSED);
    self.holds_constant.resize(size, false);
  }

  #[cfg(test)]
  fn capacity(&self) -> usize {
    self.backing.len()
  }
}
