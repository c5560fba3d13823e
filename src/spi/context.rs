//! Frame stack and transaction-boundary cleanup
//!
//! Two indices track the stack. `connected` is the innermost connected
//! frame. `current` is one below it while the connected procedure runs its
//! own code and equal to it while a call-stack operation is in progress:
//!
//! ```text
//! connect   requires current == connected, then connected += 1
//! begin     requires current + 1 == connected, then current += 1
//! end       current -= 1
//! finish    begin, pop the frame, connected -= 1, current -= 1
//! ```
//!
//! A procedure invoked from inside an operation can therefore connect its
//! own frame, and nothing else can.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use super::codes::SpiResultCode;
use super::config::SpiConfig;
use super::cursor::Portal;
use super::engine::{QueryEngine, SubTransactionId};
use super::errors::{SpiError, SpiResult};
use super::frame::{Destination, ExecutionFrame, SpiCallback};
use super::memory::MemoryScope;
use super::plan::{PlanEntry, PlanKind, PreparedPlan, SpiPlan};
use super::tuple::{Datum, TypeId};
use super::tuptable::TupleTable;
use crate::observability::{log_event_with_fields, Event};

const SAVED_SCOPE: &str = "SPI Saved Plans";

/// Body of a procedure reachable through `CALL`.
pub type Procedure<E> = Rc<dyn Fn(&mut SpiContext<E>, &[Option<Datum>]) -> SpiResult<()>>;

pub struct SpiContext<E: QueryEngine> {
    pub(super) engine: E,
    pub(super) config: SpiConfig,
    pub(super) stack: Vec<ExecutionFrame>,
    stack_depth: usize,
    pub(super) connected: i32,
    pub(super) current: i32,
    pub(super) plans: HashMap<u64, PlanEntry<E::Tree>>,
    next_plan_id: u64,
    saved_scope: MemoryScope,
    pub(super) portals: BTreeMap<String, Portal>,
    pub(super) next_portal: u64,
    pub(super) procedures: HashMap<String, Procedure<E>>,
    pub(super) processed: u64,
    pub(super) last_oid: u64,
    pub(super) tuptable: Option<TupleTable>,
}

impl<E: QueryEngine> SpiContext<E> {
    pub fn new(engine: E, config: SpiConfig) -> Self {
        let depth = config.stack_size.max(1);
        Self {
            engine,
            config,
            stack: Vec::with_capacity(depth),
            stack_depth: depth,
            connected: -1,
            current: -1,
            plans: HashMap::new(),
            next_plan_id: 1,
            saved_scope: MemoryScope::new(SAVED_SCOPE, 0),
            portals: BTreeMap::new(),
            next_portal: 0,
            procedures: HashMap::new(),
            processed: 0,
            last_oid: 0,
            tuptable: None,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn config(&self) -> &SpiConfig {
        &self.config
    }

    /// Index of the innermost connected frame, -1 when none.
    pub fn connected(&self) -> i32 {
        self.connected
    }

    pub fn current(&self) -> i32 {
        self.current
    }

    /// Frames currently entered.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Frames the stack can hold before it doubles.
    pub fn stack_capacity(&self) -> usize {
        self.stack_depth
    }

    pub fn current_frame(&self) -> Option<&ExecutionFrame> {
        usize::try_from(self.connected)
            .ok()
            .and_then(|i| self.stack.get(i))
    }

    /// Rows processed by the last operation.
    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn last_oid(&self) -> u64 {
        self.last_oid
    }

    pub fn tuptable(&self) -> Option<&TupleTable> {
        self.tuptable.as_ref()
    }

    /// Take ownership of the last result table.
    pub fn take_tuptable(&mut self) -> Option<TupleTable> {
        self.tuptable.take()
    }

    pub fn free_tuptable(&mut self) {
        self.tuptable = None;
    }

    pub fn register_procedure<F>(&mut self, name: impl Into<String>, body: F)
    where
        F: Fn(&mut SpiContext<E>, &[Option<Datum>]) -> SpiResult<()> + 'static,
    {
        self.procedures.insert(name.into(), Rc::new(body));
    }

    // =====================================================================
    // Enter / leave
    // =====================================================================

    pub fn connect(
        &mut self,
        dest: Destination,
        callback: Option<SpiCallback>,
    ) -> SpiResult<SpiResultCode> {
        if self.current != self.connected {
            return Err(SpiResultCode::ErrorConnect.into());
        }
        if self.stack.len() as i64 != i64::from(self.connected) + 1 {
            return Err(self.stack_corrupted("SPI stack corrupted when connect SPI"));
        }
        if self.stack.len() == self.stack_depth {
            self.stack_depth *= 2;
            self.stack
                .reserve_exact(self.stack_depth - self.stack.len());
        }
        let subid = self.engine.current_subtransaction();
        self.stack.push(ExecutionFrame::new(
            subid,
            dest,
            callback,
            self.config.work_mem_limit,
        ));
        self.connected += 1;
        Ok(SpiResultCode::OkConnect)
    }

    pub fn finish(&mut self) -> SpiResult<SpiResultCode> {
        self.begin_call()?;
        self.pop_frame();
        self.reset_results();
        self.connected -= 1;
        self.current -= 1;
        Ok(SpiResultCode::OkFinish)
    }

    /// Allow a nested connect from the connected procedure's own code.
    pub fn push(&mut self) {
        self.current += 1;
    }

    pub fn pop(&mut self) {
        self.current -= 1;
    }

    /// Push unless an operation is already in progress. Returns whether it
    /// pushed.
    pub fn push_conditional(&mut self) -> bool {
        let pushed = self.current != self.connected;
        if pushed {
            self.current += 1;
        }
        pushed
    }

    pub fn pop_conditional(&mut self, pushed: bool) {
        if pushed {
            self.current -= 1;
        }
    }

    /// Return to the connected procedure after an error unwound an operation.
    pub fn restore_connection(&mut self) {
        self.current = self.connected - 1;
    }

    // =====================================================================
    // Transaction boundaries
    // =====================================================================

    /// Clean up at the end of the top-level transaction.
    pub fn at_eoxact(&mut self, commit: bool) {
        if commit && self.connected != -1 {
            self.log_leak("transaction left non-empty SPI stack");
        }
        self.stack.clear();
        self.stack_depth = self.config.stack_size.max(1);
        self.connected = -1;
        self.current = -1;
        self.reset_results();
        self.plans.retain(|_, entry| entry.frame.is_none());
        self.portals.clear();
    }

    /// Clean up at the end of subtransaction `subid`.
    ///
    /// Frames connected inside it are popped, innermost first, stopping at
    /// the first frame that belongs to an outer subtransaction.
    pub fn at_eosubxact(&mut self, commit: bool, subid: SubTransactionId) {
        let mut found = false;
        while self.connected >= 0 {
            match self.stack.get(self.connected as usize) {
                Some(frame) if frame.connect_subid == subid => {}
                _ => break,
            }
            found = true;
            self.pop_frame();
            self.connected -= 1;
            self.current = self.connected;
            self.reset_results();
        }

        if found && commit {
            self.log_leak("subtransaction left non-empty SPI stack");
        }

        if !commit {
            if let Ok(level) = usize::try_from(self.connected) {
                if let Some(frame) = self.stack.get_mut(level) {
                    frame.exec_scope.recreate();
                    frame.tuptable = None;
                }
            }
            self.portals.retain(|_, p| p.subid != subid);
        }
    }

    // =====================================================================
    // Internals shared by the operation modules
    // =====================================================================

    pub(super) fn begin_call(&mut self) -> SpiResult<()> {
        if self.current + 1 != self.connected {
            return Err(SpiResultCode::ErrorUnconnected.into());
        }
        self.current += 1;
        Ok(())
    }

    /// Leave an operation. `procmem` also recreates the statement scope.
    pub(super) fn end_call(&mut self, procmem: bool) {
        self.current -= 1;
        if procmem {
            if let Some(frame) = usize::try_from(self.connected)
                .ok()
                .and_then(|i| self.stack.get_mut(i))
            {
                frame.exec_scope.recreate();
            }
        }
    }

    pub(super) fn level(&self) -> SpiResult<usize> {
        usize::try_from(self.connected)
            .ok()
            .filter(|&i| i < self.stack.len())
            .ok_or_else(|| self.stack_corrupted("SPI stack corrupted when begin SPI operation"))
    }

    pub(super) fn frame_mut(&mut self) -> SpiResult<&mut ExecutionFrame> {
        let level = self.level()?;
        Ok(&mut self.stack[level])
    }

    pub(super) fn stack_corrupted(&self, message: &str) -> SpiError {
        let connected = self.connected.to_string();
        let current = self.current.to_string();
        let frames = self.stack.len().to_string();
        SpiError::corrupted(
            message,
            &[
                ("connected", &connected),
                ("current", &current),
                ("frames", &frames),
            ],
        )
    }

    pub(super) fn reset_results(&mut self) {
        self.processed = 0;
        self.last_oid = 0;
        self.tuptable = None;
    }

    fn pop_frame(&mut self) {
        let level = self.stack.len().saturating_sub(1);
        self.stack.pop();
        self.plans.retain(|_, entry| entry.frame != Some(level));
    }

    fn log_leak(&self, message: &str) {
        let frames = self.stack.len().to_string();
        log_event_with_fields(
            Event::SpiStackLeak,
            &[
                ("message", message),
                ("frames", &frames),
                ("hint", "Check for missing \"SPI_finish\" calls."),
            ],
        );
    }

    // =====================================================================
    // Plan registry
    // =====================================================================

    /// Register a plan owned by the current frame.
    pub(super) fn register_temporary(
        &mut self,
        plan: PreparedPlan<E::Tree>,
    ) -> SpiResult<SpiPlan> {
        let level = self.level()?;
        self.stack[level].proc_scope.charge(plan.footprint())?;
        let id = self.next_plan_id;
        self.next_plan_id += 1;
        self.plans.insert(
            id,
            PlanEntry {
                plan: Rc::new(plan),
                frame: Some(level),
            },
        );
        Ok(SpiPlan::new(id))
    }

    pub(super) fn lookup_plan(&self, handle: SpiPlan) -> SpiResult<Rc<PreparedPlan<E::Tree>>> {
        if !handle.is_valid_magic() {
            return Err(SpiResultCode::ErrorArgument.into());
        }
        self.plans
            .get(&handle.id)
            .map(|entry| Rc::clone(&entry.plan))
            .ok_or(SpiError::Routine(SpiResultCode::ErrorArgument))
    }

    /// Promote a temporary plan into the saved registry.
    ///
    /// Either the plan is saved and released from its frame, or nothing
    /// changes.
    pub fn keepplan(&mut self, handle: SpiPlan) -> SpiResult<()> {
        let plan = self.lookup_plan(handle)?;
        if plan.kind != PlanKind::Temporary {
            return Err(SpiResultCode::ErrorArgument.into());
        }
        let footprint = plan.footprint();
        drop(plan);
        self.saved_scope.charge(footprint)?;

        let Some(entry) = self.plans.get_mut(&handle.id) else {
            self.saved_scope.release(footprint);
            return Err(SpiResultCode::ErrorArgument.into());
        };
        let owner = entry.frame.take();
        Rc::make_mut(&mut entry.plan).kind = PlanKind::Saved;
        if let Some(frame) = owner.and_then(|level| self.stack.get_mut(level)) {
            frame.proc_scope.release(footprint);
        }
        Ok(())
    }

    /// Copy a plan into the saved registry, leaving the original alone.
    pub fn saveplan(&mut self, handle: SpiPlan) -> SpiResult<SpiPlan> {
        let plan = self.lookup_plan(handle)?;
        if plan.kind == PlanKind::OneShot {
            return Err(SpiResultCode::ErrorArgument.into());
        }
        self.begin_call()?;
        let mut copy = (*plan).clone();
        copy.kind = PlanKind::Saved;
        let charged = self.saved_scope.charge(copy.footprint());
        self.end_call(false);
        charged?;

        let id = self.next_plan_id;
        self.next_plan_id += 1;
        self.plans.insert(
            id,
            PlanEntry {
                plan: Rc::new(copy),
                frame: None,
            },
        );
        Ok(SpiPlan::new(id))
    }

    pub fn freeplan(&mut self, handle: SpiPlan) -> SpiResult<()> {
        if !handle.is_valid_magic() {
            return Err(SpiResultCode::ErrorArgument.into());
        }
        let entry = self
            .plans
            .remove(&handle.id)
            .ok_or(SpiError::Routine(SpiResultCode::ErrorArgument))?;
        let footprint = entry.plan.footprint();
        match entry.frame {
            Some(level) => {
                if let Some(frame) = self.stack.get_mut(level) {
                    frame.proc_scope.release(footprint);
                }
            }
            None => self.saved_scope.release(footprint),
        }
        Ok(())
    }

    pub fn is_cursor_plan(&self, handle: SpiPlan) -> SpiResult<bool> {
        Ok(self.lookup_plan(handle)?.is_cursor_plan())
    }

    pub fn plan_source_text(&self, handle: SpiPlan) -> SpiResult<String> {
        Ok(self.lookup_plan(handle)?.source_text.clone())
    }

    pub fn plan_kind(&self, handle: SpiPlan) -> SpiResult<PlanKind> {
        Ok(self.lookup_plan(handle)?.kind)
    }

    pub fn getargcount(&self, handle: SpiPlan) -> SpiResult<usize> {
        Ok(self.lookup_plan(handle)?.nargs())
    }

    /// Type of argument `index` (0-based) of a plan with fixed types.
    pub fn getargtypeid(&self, handle: SpiPlan, index: usize) -> SpiResult<TypeId> {
        let plan = self.lookup_plan(handle)?;
        if index >= plan.nargs() {
            return Err(SpiResultCode::ErrorArgument.into());
        }
        plan.param_types
            .resolve(index + 1)
            .ok_or(SpiError::Routine(SpiResultCode::ErrorArgument))
    }

    /// Saved plans currently registered.
    pub fn saved_plan_count(&self) -> usize {
        self.plans.values().filter(|e| e.frame.is_none()).count()
    }
}
