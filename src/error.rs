//! Errors reported by the register allocator
//!
//! Both kinds abort allocation of a single method; the driver reports them as
//! internal compiler errors and keeps going with the other methods.

use std::{error::Error, fmt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
  /// The method cannot be allocated within its register budget.
  Capacity {
    method: String,
    /// Program position where the allocator ran out of registers.
    position: u32,
    /// Number of intervals competing for registers at that point.
    live_intervals: usize,
    budget: u32,
  },
  /// Malformed input or a broken allocation.
  Invariant { method: String, message: String },
}

impl AllocError {
  pub fn capacity(method: &str, position: u32, live_intervals: usize, budget: u32) -> Self {
    AllocError::Capacity {
      method: method.to_string(),
      position,
      live_intervals,
      budget,
    }
  }

  pub fn invariant(method: &str, message: impl Into<String>) -> Self {
    AllocError::Invariant {
      method: method.to_string(),
      message: message.into(),
    }
  }

  /// Attach the method, and for capacity errors the position, to an error
  /// raised by a helper that knows neither.
  pub fn in_method(self, name: &str, position: u32) -> Self {
    match self {
      AllocError::Capacity {
        live_intervals,
        budget,
        ..
      } => AllocError::Capacity {
        method: name.to_string(),
        position,
        live_intervals,
        budget,
      },
      AllocError::Invariant { message, .. } => AllocError::Invariant {
        method: name.to_string(),
        message,
      },
    }
  }

  pub fn method(&self) -> &str {
    match self {
      AllocError::Capacity { method, .. } | AllocError::Invariant { method, .. } => method,
    }
  }

  pub fn is_capacity(&self) -> bool {
    matches!(self, AllocError::Capacity { .. })
  }
}

impl fmt::Display for AllocError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      AllocError::Capacity {
        method,
        position,
        live_intervals,
        budget,
      } => write!(
        f,
        "method `{}`: {} live intervals do not fit in {} registers at position {}",
        method, live_intervals, budget, position
      ),
      AllocError::Invariant { method, message } => {
        write!(f, "method `{}`: invariant violated: {}", method, message)
      }
    }
  }
}

impl Error for AllocError {}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_in_method() {
    let err = AllocError::capacity("", 0, 3, 2).in_method("foo", 7);
    assert_eq!(err.method(), "foo");
    assert!(err.is_capacity());
    assert_eq!(
      err.to_string(),
      "method `foo`: 3 live intervals do not fit in 2 registers at position 7"
    );

    let err = AllocError::invariant("", "bad move").in_method("bar", 9);
    assert_eq!(err.to_string(), "method `bar`: invariant violated: bad move");
  }
}
