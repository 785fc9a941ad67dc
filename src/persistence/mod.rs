//! Persistence layer for gate records.
//!
//! Only the per-change-set gate state is durable. Orchestration runs are
//! in-process: a run that dies with the process can never publish, and the
//! record it leaves behind in `Running` is loaded as `Invalidated`.

mod atomic;
mod gate_store;

pub use atomic::write_atomic;
pub use gate_store::{FileGateStore, GateStore, MemoryGateStore, Result, StoreError};
