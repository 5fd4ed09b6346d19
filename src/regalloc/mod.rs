// Linear scan register allocation: SSA values -> live intervals -> registers,
// spill slots and the moves between them
mod allocation;
mod intervals;
mod liveness;
mod moves;
mod positions;
mod resolve;
mod scheduler;
mod spill;
mod verify;

pub use allocation::{allocate_registers, Allocation, InsertedMove, LinearScanAllocator};
pub use intervals::{IntervalId, IntervalSet, LiveIntervals, LiveIntervalsUse, LiveRange, Location};
pub use liveness::Liveness;
pub use moves::{ConstDefinition, RegisterMove};
pub use positions::{RegisterPositions, UNUSED};
pub use scheduler::RegisterMoveScheduler;
pub use spill::SpillSlots;
pub use verify::verify_allocation;
