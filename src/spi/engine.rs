//! Query engine seam
//!
//! The call stack never parses or runs SQL itself. It asks an engine to
//! split source text into raw statements, analyze them into planned
//! statements, and execute one planned statement into a tuple sink.

use std::fmt;
use std::rc::Rc;

use super::errors::SpiResult;
use super::tuple::{Datum, Tuple, TupleDesc, TypeId};

pub type SubTransactionId = u32;

/// Outermost subtransaction id, used before any savepoint exists.
pub const TOP_SUBTRANSACTION: SubTransactionId = 1;

/// Visibility point for a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub id: u64,
    /// Rows written by commands before this id are visible.
    pub command_id: u32,
}

/// How `$n` parameter types are known.
#[derive(Clone, Default)]
pub enum ParamTypes {
    #[default]
    None,
    Fixed(Vec<TypeId>),
    /// Resolved during analysis by a caller-provided hook.
    Hook(Rc<dyn Fn(usize) -> Option<TypeId>>),
}

impl ParamTypes {
    /// Number of declared parameters. A hook declares none up front.
    pub fn nargs(&self) -> usize {
        match self {
            ParamTypes::Fixed(types) => types.len(),
            _ => 0,
        }
    }

    /// Type of parameter `$index` (1-based).
    pub fn resolve(&self, index: usize) -> Option<TypeId> {
        match self {
            ParamTypes::None => None,
            ParamTypes::Fixed(types) => index.checked_sub(1).and_then(|i| types.get(i).copied()),
            ParamTypes::Hook(hook) => hook(index),
        }
    }
}

impl fmt::Debug for ParamTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamTypes::None => f.write_str("None"),
            ParamTypes::Fixed(types) => f.debug_tuple("Fixed").field(types).finish(),
            ParamTypes::Hook(_) => f.write_str("Hook"),
        }
    }
}

/// Argument of a procedure call.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Option<Datum>),
    Param(usize),
}

impl Operand {
    pub fn resolve(&self, params: &[Option<Datum>]) -> Option<Datum> {
        match self {
            Operand::Literal(v) => v.clone(),
            Operand::Param(n) => n
                .checked_sub(1)
                .and_then(|i| params.get(i))
                .cloned()
                .flatten(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Merge,
    Utility,
    /// COPY; `to_client` when the data would flow over the client channel.
    Copy { to_client: bool },
    Transaction,
    /// CREATE TABLE AS, or SELECT INTO when `select_into`.
    CreateTableAs { select_into: bool },
    Call { procedure: String, args: Vec<Operand> },
}

impl StatementKind {
    pub fn is_utility(&self) -> bool {
        !matches!(
            self,
            StatementKind::Select
                | StatementKind::Insert
                | StatementKind::Update
                | StatementKind::Delete
                | StatementKind::Merge
        )
    }
}

/// Statement as split out of the source text, before analysis.
#[derive(Debug, Clone)]
pub struct RawStatement<S> {
    pub text: String,
    pub tag: String,
    pub tree: S,
}

/// Statement ready to execute.
#[derive(Debug, Clone)]
pub struct PlannedStatement<S> {
    pub kind: StatementKind,
    pub tag: String,
    /// Whether this statement's result is reported to the caller.
    pub can_set_tag: bool,
    pub has_returning: bool,
    /// FOR UPDATE / FOR SHARE present.
    pub has_row_marks: bool,
    pub supports_backward_scan: bool,
    pub read_only: bool,
    pub result_desc: Option<TupleDesc>,
    pub tree: S,
}

impl<S> PlannedStatement<S> {
    /// Whether this statement hands rows back.
    pub fn returns_tuples(&self) -> bool {
        match self.kind {
            StatementKind::Select => true,
            StatementKind::Insert | StatementKind::Update | StatementKind::Delete => {
                self.has_returning
            }
            StatementKind::Utility => self.result_desc.is_some(),
            _ => false,
        }
    }
}

/// Receives rows produced by one statement.
pub trait TupleSink {
    fn startup(&mut self, desc: &TupleDesc) -> SpiResult<()>;
    fn receive(&mut self, tuple: Tuple) -> SpiResult<()>;
    fn shutdown(&mut self) -> SpiResult<()> {
        Ok(())
    }
}

/// Sink that discards everything.
pub struct DiscardSink;

impl TupleSink for DiscardSink {
    fn startup(&mut self, _desc: &TupleDesc) -> SpiResult<()> {
        Ok(())
    }

    fn receive(&mut self, _tuple: Tuple) -> SpiResult<()> {
        Ok(())
    }
}

/// Sink that keeps rows in memory, used to materialize cursors.
#[derive(Default)]
pub struct VecSink {
    pub desc: Option<TupleDesc>,
    pub rows: Vec<Tuple>,
}

impl TupleSink for VecSink {
    fn startup(&mut self, desc: &TupleDesc) -> SpiResult<()> {
        self.desc = Some(desc.clone());
        Ok(())
    }

    fn receive(&mut self, tuple: Tuple) -> SpiResult<()> {
        self.rows.push(tuple);
        Ok(())
    }
}

pub struct ExecRequest<'a> {
    pub params: &'a [Option<Datum>],
    pub snapshot: Option<&'a Snapshot>,
    pub crosscheck: Option<&'a Snapshot>,
    pub fire_triggers: bool,
    /// Row cap, 0 for none.
    pub tcount: u64,
    pub sink: &'a mut dyn TupleSink,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub processed: u64,
    pub last_oid: u64,
}

pub trait QueryEngine {
    /// Engine-specific parse tree.
    type Tree: Clone + fmt::Debug;

    fn parse(&mut self, src: &str) -> SpiResult<Vec<RawStatement<Self::Tree>>>;

    fn analyze(
        &mut self,
        raw: &RawStatement<Self::Tree>,
        params: &ParamTypes,
    ) -> SpiResult<Vec<PlannedStatement<Self::Tree>>>;

    fn execute(
        &mut self,
        stmt: &PlannedStatement<Self::Tree>,
        request: ExecRequest<'_>,
    ) -> SpiResult<ExecOutcome>;

    /// Fresh snapshot for a new top-level statement.
    fn transaction_snapshot(&mut self) -> Snapshot;

    /// Snapshot of the enclosing statement, if one is running.
    fn active_snapshot(&self) -> Option<Snapshot>;

    /// Make earlier writes visible to later commands. Returns the new id.
    fn command_counter_increment(&mut self) -> u32;

    fn current_subtransaction(&self) -> SubTransactionId;
}
