//! Prepare and execute
//!
//! Snapshot policy for a plan run:
//!
//! | snapshot | read_only | behavior                                        |
//! |----------|-----------|-------------------------------------------------|
//! | given    | true      | use it as is                                    |
//! | given    | false     | copy it and advance its command id per statement|
//! | none     | true      | use the engine's active snapshot                |
//! | none     | false     | new snapshot per source statement               |

use std::rc::Rc;

use super::codes::SpiResultCode;
use super::context::SpiContext;
use super::engine::{
    ExecRequest, ParamTypes, PlannedStatement, QueryEngine, Snapshot, StatementKind, TupleSink,
};
use super::errors::{SpiError, SpiResult};
use super::frame::{Destination, ExecutionFrame};
use super::plan::{CursorOptions, PlanKind, PlanSource, PreparedPlan, SpiPlan};
use super::tuple::{Datum, Tuple, TupleDesc, TypeId};
use super::tuptable::TupleTable;

/// Routes engine output into the connected frame.
pub(super) struct SpiReceiver<'a> {
    pub frame: &'a mut ExecutionFrame,
    pub dest: Destination,
    pub initial: usize,
    pub limit: u64,
}

impl TupleSink for SpiReceiver<'_> {
    fn startup(&mut self, desc: &TupleDesc) -> SpiResult<()> {
        if self.dest == Destination::None {
            return Ok(());
        }
        if self.frame.tuptable.is_some() {
            return Err(SpiError::corrupted(
                "SPI tupletable is not cleaned when initializing SPI",
                &[],
            ));
        }
        self.frame.tuptable = Some(TupleTable::new(desc.clone(), self.initial, self.limit));
        Ok(())
    }

    fn receive(&mut self, tuple: Tuple) -> SpiResult<()> {
        let frame = &mut *self.frame;
        let table = match self.dest {
            Destination::None => return Ok(()),
            _ => frame.tuptable.as_mut().ok_or_else(|| {
                SpiError::corrupted("SPI tupletable is NULL when store tuple to it", &[])
            })?,
        };
        if self.dest == Destination::Batched && table.is_full() {
            if let Some(callback) = frame.callback.as_mut() {
                callback(table);
            }
            table.clear();
        }
        table.push(tuple)
    }

    fn shutdown(&mut self) -> SpiResult<()> {
        if self.dest != Destination::Batched {
            return Ok(());
        }
        let frame = &mut *self.frame;
        if let (Some(table), Some(callback)) = (frame.tuptable.as_ref(), frame.callback.as_mut()) {
            if table.filled() > 0 {
                callback(table);
            }
        }
        Ok(())
    }
}

/// Arguments of one plan run.
struct PlanRun {
    params: Vec<Option<Datum>>,
    snapshot: Option<Snapshot>,
    crosscheck: Option<Snapshot>,
    read_only: bool,
    fire_triggers: bool,
    tcount: u64,
}

fn check_tcount(tcount: i64) -> SpiResult<u64> {
    u64::try_from(tcount).map_err(|_| SpiError::Routine(SpiResultCode::ErrorArgument))
}

impl<E: QueryEngine> SpiContext<E> {
    // =====================================================================
    // Execute
    // =====================================================================

    /// Parse, analyze and run `src` once.
    pub fn execute(&mut self, src: &str, read_only: bool, tcount: i64) -> SpiResult<SpiResultCode> {
        if src.is_empty() {
            return Err(SpiResultCode::ErrorArgument.into());
        }
        let tcount = check_tcount(tcount)?;
        self.begin_call()?;
        let result = self
            .build_plan(src, ParamTypes::None, CursorOptions::default(), PlanKind::OneShot)
            .and_then(|plan| {
                self.run_plan(
                    &plan,
                    PlanRun {
                        params: Vec::new(),
                        snapshot: None,
                        crosscheck: None,
                        read_only,
                        fire_triggers: true,
                        tcount,
                    },
                )
            });
        self.end_call(true);
        result
    }

    /// Read-write [`execute`](Self::execute).
    pub fn exec(&mut self, src: &str, tcount: i64) -> SpiResult<SpiResultCode> {
        self.execute(src, false, tcount)
    }

    pub fn execute_plan(
        &mut self,
        plan: SpiPlan,
        values: Option<&[Option<Datum>]>,
        read_only: bool,
        tcount: i64,
    ) -> SpiResult<SpiResultCode> {
        self.execute_snapshot(plan, values, None, None, read_only, true, tcount)
    }

    /// Read-write [`execute_plan`](Self::execute_plan).
    pub fn execp(
        &mut self,
        plan: SpiPlan,
        values: Option<&[Option<Datum>]>,
        tcount: i64,
    ) -> SpiResult<SpiResultCode> {
        self.execute_plan(plan, values, false, tcount)
    }

    /// Run a prepared plan under an explicit snapshot policy.
    #[allow(clippy::too_many_arguments)]
    pub fn execute_snapshot(
        &mut self,
        plan: SpiPlan,
        values: Option<&[Option<Datum>]>,
        snapshot: Option<Snapshot>,
        crosscheck: Option<Snapshot>,
        read_only: bool,
        fire_triggers: bool,
        tcount: i64,
    ) -> SpiResult<SpiResultCode> {
        let plan = self.lookup_plan(plan)?;
        let tcount = check_tcount(tcount)?;
        let params = bind_params(plan.nargs(), values)?;
        self.begin_call()?;
        let result = self.run_plan(
            &plan,
            PlanRun {
                params,
                snapshot,
                crosscheck,
                read_only,
                fire_triggers,
                tcount,
            },
        );
        self.end_call(true);
        result
    }

    /// One-shot run of `src` with typed parameters.
    pub fn execute_with_args(
        &mut self,
        src: &str,
        argtypes: &[TypeId],
        values: Option<&[Option<Datum>]>,
        read_only: bool,
        tcount: i64,
    ) -> SpiResult<SpiResultCode> {
        if src.is_empty() {
            return Err(SpiResultCode::ErrorArgument.into());
        }
        let tcount = check_tcount(tcount)?;
        let params = bind_params(argtypes.len(), values)?;
        self.begin_call()?;
        let result = self
            .build_plan(
                src,
                ParamTypes::Fixed(argtypes.to_vec()),
                CursorOptions::default(),
                PlanKind::OneShot,
            )
            .and_then(|plan| {
                self.run_plan(
                    &plan,
                    PlanRun {
                        params,
                        snapshot: None,
                        crosscheck: None,
                        read_only,
                        fire_triggers: true,
                        tcount,
                    },
                )
            });
        self.end_call(true);
        result
    }

    // =====================================================================
    // Prepare
    // =====================================================================

    pub fn prepare(&mut self, src: &str, argtypes: &[TypeId]) -> SpiResult<SpiPlan> {
        self.prepare_cursor(src, argtypes, CursorOptions::default())
    }

    pub fn prepare_cursor(
        &mut self,
        src: &str,
        argtypes: &[TypeId],
        options: CursorOptions,
    ) -> SpiResult<SpiPlan> {
        self.prepare_with(
            src,
            ParamTypes::Fixed(argtypes.to_vec()),
            options,
            PlanKind::Temporary,
        )
    }

    /// Prepare with parameter types resolved by `hook` during analysis.
    pub fn prepare_params(
        &mut self,
        src: &str,
        hook: Rc<dyn Fn(usize) -> Option<TypeId>>,
        options: CursorOptions,
    ) -> SpiResult<SpiPlan> {
        self.prepare_with(src, ParamTypes::Hook(hook), options, PlanKind::Temporary)
    }

    /// Prepare without analysis. The plan is analyzed each time it runs and
    /// can never be kept or saved.
    pub fn prepare_oneshot(&mut self, src: &str, argtypes: &[TypeId]) -> SpiResult<SpiPlan> {
        self.prepare_with(
            src,
            ParamTypes::Fixed(argtypes.to_vec()),
            CursorOptions::default(),
            PlanKind::OneShot,
        )
    }

    fn prepare_with(
        &mut self,
        src: &str,
        params: ParamTypes,
        options: CursorOptions,
        kind: PlanKind,
    ) -> SpiResult<SpiPlan> {
        if src.is_empty() {
            return Err(SpiResultCode::ErrorArgument.into());
        }
        self.begin_call()?;
        let plan = self.build_plan(src, params, options, kind);
        self.end_call(true);
        self.register_temporary(plan?)
    }

    pub(super) fn build_plan(
        &mut self,
        src: &str,
        param_types: ParamTypes,
        cursor_options: CursorOptions,
        kind: PlanKind,
    ) -> SpiResult<PreparedPlan<E::Tree>> {
        let raws = self.engine.parse(src)?;
        let mut sources = Vec::with_capacity(raws.len());
        for raw in raws {
            let planned = match kind {
                PlanKind::OneShot => None,
                _ => Some(self.engine.analyze(&raw, &param_types)?),
            };
            sources.push(PlanSource { raw, planned });
        }
        Ok(PreparedPlan {
            kind,
            source_text: src.to_string(),
            sources,
            param_types,
            cursor_options,
        })
    }

    // =====================================================================
    // Statement loop
    // =====================================================================

    fn run_plan(&mut self, plan: &PreparedPlan<E::Tree>, run: PlanRun) -> SpiResult<SpiResultCode> {
        let sizes: Vec<u64> = run
            .params
            .iter()
            .map(|p| p.as_ref().map_or(1, Datum::size))
            .collect();
        self.frame_mut()?.exec_scope.charge_all(&sizes)?;

        let mut my_res: Option<SpiResultCode> = None;
        let mut my_processed = 0;
        let mut my_lastoid = 0;
        let mut my_tuptable: Option<TupleTable> = None;

        let mut active = match run.snapshot {
            Some(s) => Some(s),
            None if run.read_only => self.engine.active_snapshot(),
            None => None,
        };

        'sources: for source in &plan.sources {
            let stmts = match &source.planned {
                Some(stmts) => stmts.clone(),
                None => self.engine.analyze(&source.raw, &plan.param_types)?,
            };
            if run.snapshot.is_none() && !run.read_only {
                active = Some(self.engine.transaction_snapshot());
            }

            for stmt in &stmts {
                self.frame_mut()?.reset_results();

                match stmt.kind {
                    StatementKind::Copy { to_client: true } => {
                        my_res = Some(SpiResultCode::ErrorCopy);
                        break 'sources;
                    }
                    StatementKind::Transaction => {
                        my_res = Some(SpiResultCode::ErrorTransaction);
                        break 'sources;
                    }
                    _ => {}
                }

                if run.read_only && !stmt.read_only {
                    return Err(SpiError::FeatureNotSupported(format!(
                        "{} is not allowed in a non-volatile function",
                        stmt.tag
                    )));
                }

                if !run.read_only {
                    let cid = self.engine.command_counter_increment();
                    if let Some(s) = active.as_mut() {
                        s.command_id = cid;
                    }
                }

                let dest = if stmt.can_set_tag {
                    self.frame_mut()?.dest
                } else {
                    Destination::None
                };
                let tcount = if stmt.can_set_tag { run.tcount } else { 0 };
                let res = self.run_statement(stmt, &run, active.as_ref(), dest, tcount)?;

                let frame = self.frame_mut()?;
                if stmt.can_set_tag {
                    my_processed = frame.processed;
                    my_lastoid = frame.last_oid;
                    my_tuptable = frame.tuptable.take();
                    my_res = Some(res);
                } else {
                    frame.tuptable = None;
                }
                frame.exec_scope.recreate();

                if res.is_error() {
                    my_res = Some(res);
                    break 'sources;
                }
            }

            if !run.read_only {
                self.engine.command_counter_increment();
            }
        }

        self.processed = my_processed;
        self.last_oid = my_lastoid;
        self.tuptable = my_tuptable;

        match my_res {
            Some(code) if code.is_error() => Err(code.into()),
            Some(code) => Ok(code),
            None => Ok(SpiResultCode::OkRewritten),
        }
    }

    fn run_statement(
        &mut self,
        stmt: &PlannedStatement<E::Tree>,
        run: &PlanRun,
        snapshot: Option<&Snapshot>,
        dest: Destination,
        tcount: u64,
    ) -> SpiResult<SpiResultCode> {
        if let StatementKind::Call { procedure, args } = &stmt.kind {
            let args: Vec<Option<Datum>> = args.iter().map(|a| a.resolve(&run.params)).collect();
            let body = self.procedures.get(procedure).cloned().ok_or_else(|| {
                SpiError::Engine(format!("procedure {}() does not exist", procedure))
            })?;
            body(self, &args)?;
            let frame = self.frame_mut()?;
            if let Some(t) = &frame.tuptable {
                frame.processed = t.filled() as u64;
            }
            return Ok(SpiResultCode::OkUtility);
        }

        let level = self.level()?;
        let outcome = {
            let mut receiver = SpiReceiver {
                frame: &mut self.stack[level],
                dest,
                initial: self.config.tuptable_size,
                limit: self.config.work_mem_limit,
            };
            self.engine.execute(
                stmt,
                ExecRequest {
                    params: &run.params,
                    snapshot,
                    crosscheck: run.crosscheck.as_ref(),
                    fire_triggers: run.fire_triggers,
                    tcount,
                    sink: &mut receiver,
                },
            )?
        };

        let frame = &mut self.stack[level];
        if stmt.kind.is_utility() {
            if let Some(t) = &frame.tuptable {
                frame.processed = t.filled() as u64;
            }
            return Ok(match stmt.kind {
                StatementKind::CreateTableAs { select_into } => {
                    frame.processed = outcome.processed;
                    if select_into {
                        SpiResultCode::OkSelInto
                    } else {
                        SpiResultCode::OkUtility
                    }
                }
                _ => SpiResultCode::OkUtility,
            });
        }

        let res = match (&stmt.kind, stmt.has_returning) {
            (StatementKind::Select, _) if dest == Destination::Spi => SpiResultCode::OkSelect,
            (StatementKind::Select, _) => SpiResultCode::OkUtility,
            (StatementKind::Insert, true) => SpiResultCode::OkInsertReturning,
            (StatementKind::Insert, false) => SpiResultCode::OkInsert,
            (StatementKind::Delete, true) => SpiResultCode::OkDeleteReturning,
            (StatementKind::Delete, false) => SpiResultCode::OkDelete,
            (StatementKind::Update, true) => SpiResultCode::OkUpdateReturning,
            (StatementKind::Update, false) => SpiResultCode::OkUpdate,
            (StatementKind::Merge, _) => SpiResultCode::OkMerge,
            _ => return Ok(SpiResultCode::ErrorOpUnknown),
        };
        frame.processed = outcome.processed;
        frame.last_oid = outcome.last_oid;

        let returns_rows = stmt.kind == StatementKind::Select || stmt.has_returning;
        if returns_rows && dest == Destination::Spi {
            self.check_tuples("consistency check on SPI tuple count failed when execute plan")?;
        }
        Ok(res)
    }

    /// The processed count must equal the rows held by the tuple table.
    pub(super) fn check_tuples(&self, message: &str) -> SpiResult<()> {
        let frame = self
            .current_frame()
            .ok_or_else(|| self.stack_corrupted("SPI stack corrupted when check tuples"))?;
        let problem = match &frame.tuptable {
            None => "tupletable is NULL.",
            Some(t) if t.filled() as u64 != frame.processed => "processed tuples is not matched.",
            Some(_) => return Ok(()),
        };
        let processed = frame.processed.to_string();
        let filled = frame
            .tuptable
            .as_ref()
            .map_or(0, TupleTable::filled)
            .to_string();
        Err(SpiError::corrupted(
            format!("{}, {}", message, problem),
            &[("processed", &processed), ("filled", &filled)],
        ))
    }
}

/// Check supplied values against the declared parameter count.
pub(super) fn bind_params(
    nargs: usize,
    values: Option<&[Option<Datum>]>,
) -> SpiResult<Vec<Option<Datum>>> {
    match values {
        None if nargs > 0 => Err(SpiResultCode::ErrorParam.into()),
        None => Ok(Vec::new()),
        Some(v) if nargs > 0 && v.len() != nargs => Err(SpiResultCode::ErrorParam.into()),
        Some(v) => Ok(v.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spi::config::SpiConfig;
    use crate::spi::memory_engine::MemoryEngine;

    fn connected() -> SpiContext<MemoryEngine> {
        let mut c = SpiContext::new(MemoryEngine::new(), SpiConfig::default());
        c.connect(Destination::Spi, None).unwrap();
        c.exec("create table t (id int8, name text)", 0).unwrap();
        c.exec("insert into t values (1, 'a'), (2, 'b'), (3, 'c')", 0)
            .unwrap();
        c
    }

    fn code(r: SpiResult<SpiResultCode>) -> Option<SpiResultCode> {
        r.err().and_then(|e| e.code())
    }

    #[test]
    fn test_select_fills_tuptable() {
        let mut c = connected();
        assert_eq!(c.exec("select * from t", 0).unwrap(), SpiResultCode::OkSelect);
        assert_eq!(c.processed(), 3);
        assert_eq!(c.tuptable().unwrap().filled(), 3);
        assert_eq!((c.current(), c.connected()), (-1, 0));
    }

    #[test]
    fn test_argument_errors() {
        let mut c = connected();
        assert_eq!(code(c.exec("", 0)), Some(SpiResultCode::ErrorArgument));
        assert_eq!(code(c.exec("select 1", -1)), Some(SpiResultCode::ErrorArgument));
        assert_eq!(
            code(c.execute_plan(SpiPlan::invalid(), None, false, 0)),
            Some(SpiResultCode::ErrorArgument)
        );
        assert_eq!(
            code(c.execute_with_args("select $1", &[TypeId::Int8], None, false, 0)),
            Some(SpiResultCode::ErrorParam)
        );
        assert_eq!((c.current(), c.connected()), (-1, 0));
    }

    #[test]
    fn test_unconnected_execute() {
        let mut c = SpiContext::new(MemoryEngine::new(), SpiConfig::default());
        assert_eq!(code(c.exec("select 1", 0)), Some(SpiResultCode::ErrorUnconnected));
    }

    #[test]
    fn test_result_codes_by_statement() {
        let mut c = connected();
        assert_eq!(c.exec("insert into t values (4, 'd')", 0).unwrap(), SpiResultCode::OkInsert);
        assert!(c.last_oid() > 0);
        assert_eq!(
            c.exec("update t set name = 'z' where id = 4 returning id", 0).unwrap(),
            SpiResultCode::OkUpdateReturning
        );
        assert_eq!(c.tuptable().unwrap().filled(), 1);
        assert_eq!(c.exec("delete from t where id = 4", 0).unwrap(), SpiResultCode::OkDelete);
        assert_eq!(c.processed(), 1);
        assert_eq!(c.exec("show tables", 0).unwrap(), SpiResultCode::OkUtility);
        assert_eq!(c.processed(), 1);
        assert_eq!(c.exec("select * into t2 from t", 0).unwrap(), SpiResultCode::OkSelInto);
        assert_eq!(c.processed(), 3);
    }

    #[test]
    fn test_copy_and_transaction_rejected() {
        let mut c = connected();
        assert_eq!(code(c.exec("copy t to stdout", 0)), Some(SpiResultCode::ErrorCopy));
        assert_eq!(code(c.exec("begin", 0)), Some(SpiResultCode::ErrorTransaction));
        assert_eq!(code(c.exec("insert into t values (9, 'x'); commit", 0)), Some(SpiResultCode::ErrorTransaction));
        assert_eq!(c.engine().row_count("t"), Some(4));
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let mut c = connected();
        let err = c.execute("insert into t values (5, 'e')", true, 0).unwrap_err();
        assert_eq!(
            err,
            SpiError::FeatureNotSupported("INSERT is not allowed in a non-volatile function".into())
        );
        let err = c.execute("select * from t for update", true, 0).unwrap_err();
        assert!(matches!(err, SpiError::FeatureNotSupported(_)));
        assert_eq!(c.execute("select * from t", true, 0).unwrap(), SpiResultCode::OkSelect);
    }

    #[test]
    fn test_last_statement_sets_result() {
        let mut c = connected();
        let res = c.exec("select * from t; insert into t values (7, 'g')", 0).unwrap();
        assert_eq!(res, SpiResultCode::OkInsert);
        assert!(c.tuptable().is_none());
        assert_eq!(c.processed(), 1);
    }

    #[test]
    fn test_row_cap() {
        let mut c = connected();
        c.exec("select * from t", 2).unwrap();
        assert_eq!(c.processed(), 2);
    }

    #[test]
    fn test_each_statement_sees_earlier_writes() {
        let mut c = connected();
        c.exec("insert into t values (10, 'j'); delete from t where id = 10", 0)
            .unwrap();
        assert_eq!(c.processed(), 1);
    }

    #[test]
    fn test_fixed_read_only_snapshot_is_used_as_given() {
        let mut c = connected();
        let plan = c.prepare("select * from t", &[]).unwrap();
        let old = Snapshot {
            id: 0,
            command_id: 1,
        };
        c.execute_snapshot(plan, None, Some(old), None, true, true, 0)
            .unwrap();
        assert_eq!(c.processed(), 0);
        c.execute_snapshot(plan, None, Some(old), None, false, true, 0)
            .unwrap();
        assert_eq!(c.processed(), 3);
    }

    #[test]
    fn test_tuple_count_mismatch_is_corruption() {
        let mut c = connected();
        c.engine_mut().inflate_processed_count(true);
        let err = c.exec("select * from t", 0).unwrap_err();
        assert_eq!(
            err,
            SpiError::DataCorrupted(
                "consistency check on SPI tuple count failed when execute plan, processed tuples is not matched."
                    .into()
            )
        );
        // writes without RETURNING are not checked
        c.exec("delete from t where id = 1", 0).unwrap();
    }

    #[test]
    fn test_work_mem_limit() {
        let mut c = SpiContext::new(
            MemoryEngine::new(),
            SpiConfig::default().with_work_mem_limit(64),
        );
        c.connect(Destination::Spi, None).unwrap();
        let big = Some(Datum::Text("x".repeat(100)));
        let err = c
            .execute_with_args("select $1", &[TypeId::Text], Some(&[big]), false, 0)
            .unwrap_err();
        assert!(matches!(err, SpiError::OutOfMemory { .. }));
        assert_eq!(c.current_frame().unwrap().exec_scope().used(), 0);
        assert_eq!((c.current(), c.connected()), (-1, 0));
    }

    #[test]
    fn test_batched_destination_hands_off_full_tables() {
        use std::cell::RefCell;

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let mut c = SpiContext::new(
            MemoryEngine::new(),
            SpiConfig {
                tuptable_size: 2,
                ..SpiConfig::default()
            },
        );
        c.connect(
            Destination::Batched,
            Some(Box::new(move |t: &TupleTable| sink.borrow_mut().push(t.filled()))),
        )
        .unwrap();
        c.exec("create table n (v int8)", 0).unwrap();
        c.exec("insert into n values (1), (2), (3), (4), (5)", 0).unwrap();
        assert_eq!(c.exec("select * from n", 0).unwrap(), SpiResultCode::OkUtility);
        assert_eq!(*seen.borrow(), vec![2, 2, 1]);
    }
}
