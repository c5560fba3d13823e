//! Nested call stack for procedures that run queries
//!
//! A procedure connects a frame, runs statements through it and finishes
//! it. Statements may call further procedures, which connect frames of
//! their own on top.
//!
//! # Invariants
//!
//! - Only the procedure that owns the innermost frame may connect a new one
//! - Temporary plans and results die with their frame
//! - Saved plans survive until freed
//! - The processed count of a row-returning statement equals the rows in its
//!   result table
//! - Transaction and subtransaction ends pop every frame they own
//!
//! The call stack is generic over [`QueryEngine`]. [`MemoryEngine`] is the
//! in-memory engine used by the CLI and the tests.

mod codes;
mod config;
mod context;
mod cursor;
mod engine;
mod errors;
mod execute;
mod frame;
mod memory;
mod memory_engine;
mod plan;
mod tuple;
mod tuptable;

pub use codes::{result_code_string, SpiResultCode};
pub use config::{SpiConfig, DEFAULT_STACK_SIZE};
pub use context::{Procedure, SpiContext};
pub use cursor::{FetchDirection, Portal, FETCH_ALL};
pub use engine::{
    DiscardSink, ExecOutcome, ExecRequest, Operand, ParamTypes, PlannedStatement, QueryEngine,
    RawStatement, Snapshot, StatementKind, SubTransactionId, TupleSink, VecSink,
    TOP_SUBTRANSACTION,
};
pub use errors::{SpiError, SpiResult};
pub use frame::{Destination, ExecutionFrame, SpiCallback};
pub use memory::{MemoryScope, EXEC_SCOPE, PROC_SCOPE, TUPTABLE_SCOPE};
pub use memory_engine::{MemoryEngine, MemoryStatement};
pub use plan::{CursorOptions, PlanKind, ScrollOption, SpiPlan, PLAN_MAGIC};
pub use tuple::{
    copytuple, fname, fnumber, getbinval, gettype, gettypeid, getvalue, modifytuple, Column,
    Datum, Tuple, TupleDesc, TypeId,
};
pub use tuptable::{TupleTable, DEFAULT_TUPTABLE_SIZE};
