//! Allocating many methods on a pool of worker threads
//!
//! Methods are independent: each worker takes the next method off a shared
//! queue and allocates it on its own. A method that fails, or panics, only
//! fails itself.

use std::{
  collections::VecDeque,
  panic::{self, AssertUnwindSafe},
  sync::{Mutex, PoisonError},
  thread,
};

use serde::Deserialize;

use crate::{
  config::AllocatorConfig,
  error::AllocError,
  ir::Method,
  regalloc::{allocate_registers, Allocation},
};

/// A method after allocation, rewritten if allocation succeeded.
pub struct MethodOutcome {
  pub method: Method,
  pub result: Result<Allocation, AllocError>,
}

impl MethodOutcome {
  pub fn is_ok(&self) -> bool {
    self.result.is_ok()
  }
}

/// Input files hold either one method or a list of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum MethodInput {
  Many(Vec<Method>),
  One(Box<Method>),
}

pub fn parse_methods(source: &str) -> serde_json::Result<Vec<Method>> {
  Ok(match serde_json::from_str(source)? {
    MethodInput::Many(methods) => methods,
    MethodInput::One(method) => vec![*method],
  })
}

/// Allocate every method with `jobs` workers. Outcomes come back in input
/// order whatever order the workers finish in.
pub fn allocate_all(
  methods: Vec<Method>,
  config: &AllocatorConfig,
  jobs: usize,
) -> Vec<MethodOutcome> {
  let count = methods.len();
  let jobs = jobs.clamp(1, count.max(1));
  let queue = Mutex::new(methods.into_iter().enumerate().collect::<VecDeque<_>>());
  let results = Mutex::new(Vec::with_capacity(count));

  thread::scope(|scope| {
    for worker in 0..jobs {
      let (queue, results) = (&queue, &results);
      scope.spawn(move || loop {
        let next = queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        let (index, mut method) = match next {
          Some(next) => next,
          None => break,
        };
        let result = allocate_isolated(&mut method, config);
        match &result {
          Ok(allocation) => log::info!(
            "worker {}: {} in {} registers",
            worker,
            method.name,
            allocation.registers_used()
          ),
          Err(e) => log::info!("worker {}: {}", worker, e),
        }
        results
          .lock()
          .unwrap_or_else(PoisonError::into_inner)
          .push((index, MethodOutcome { method, result }));
      });
    }
  });

  let mut results = results.into_inner().unwrap_or_else(PoisonError::into_inner);
  results.sort_by_key(|(index, _)| *index);
  results.into_iter().map(|(_, outcome)| outcome).collect()
}

/// Allocate one method, turning a panic into an internal error of that
/// method.
fn allocate_isolated(
  method: &mut Method,
  config: &AllocatorConfig,
) -> Result<Allocation, AllocError> {
  let name = method.name.clone();
  match panic::catch_unwind(AssertUnwindSafe(|| allocate_registers(method, config))) {
    Ok(result) => result,
    Err(payload) => {
      let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
      Err(AllocError::invariant(&name, format!("panic: {}", message)))
    }
  }
}
