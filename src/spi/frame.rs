//! One activation on the call stack

use std::fmt;

use super::engine::SubTransactionId;
use super::memory::{MemoryScope, EXEC_SCOPE, PROC_SCOPE};
use super::tuptable::TupleTable;

/// Where rows produced inside a frame go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
    /// Accumulate into the frame's tuple table.
    #[default]
    Spi,
    /// Hand full tuple tables to the frame's callback and reuse them.
    Batched,
    /// Discard.
    None,
}

/// Invoked with each full batch when the destination is `Batched`.
pub type SpiCallback = Box<dyn FnMut(&TupleTable)>;

pub struct ExecutionFrame {
    pub(super) processed: u64,
    pub(super) last_oid: u64,
    pub(super) tuptable: Option<TupleTable>,
    pub(super) proc_scope: MemoryScope,
    pub(super) exec_scope: MemoryScope,
    pub(super) connect_subid: SubTransactionId,
    pub(super) dest: Destination,
    pub(super) callback: Option<SpiCallback>,
}

impl ExecutionFrame {
    pub(super) fn new(
        connect_subid: SubTransactionId,
        dest: Destination,
        callback: Option<SpiCallback>,
        work_mem_limit: u64,
    ) -> Self {
        Self {
            processed: 0,
            last_oid: 0,
            tuptable: None,
            proc_scope: MemoryScope::new(PROC_SCOPE, work_mem_limit),
            exec_scope: MemoryScope::new(EXEC_SCOPE, work_mem_limit),
            connect_subid,
            dest,
            callback,
        }
    }

    pub(super) fn reset_results(&mut self) {
        self.processed = 0;
        self.last_oid = 0;
        self.tuptable = None;
    }

    pub fn connect_subid(&self) -> SubTransactionId {
        self.connect_subid
    }

    pub fn destination(&self) -> Destination {
        self.dest
    }

    pub fn proc_scope(&self) -> &MemoryScope {
        &self.proc_scope
    }

    pub fn exec_scope(&self) -> &MemoryScope {
        &self.exec_scope
    }
}

impl fmt::Debug for ExecutionFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionFrame")
            .field("processed", &self.processed)
            .field("last_oid", &self.last_oid)
            .field("has_tuptable", &self.tuptable.is_some())
            .field("connect_subid", &self.connect_subid)
            .field("dest", &self.dest)
            .field("proc_used", &self.proc_scope.used())
            .field("exec_generation", &self.exec_scope.generation())
            .finish()
    }
}
