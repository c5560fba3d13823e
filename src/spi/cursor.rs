//! Cursors over prepared plans
//!
//! Opening a cursor runs its statement once and keeps the rows in a portal.
//! Position 0 is before the first row and `len + 1` after the last, so
//! fetching forward from 0 starts at row 1.

use super::codes::SpiResultCode;
use super::context::SpiContext;
use super::engine::{ExecRequest, ParamTypes, QueryEngine, SubTransactionId, TupleSink, VecSink};
use super::errors::{SpiError, SpiResult};
use super::execute::{bind_params, SpiReceiver};
use super::frame::Destination;
use super::plan::{CursorOptions, PlanKind, PreparedPlan, ScrollOption, SpiPlan};
use super::tuple::{Datum, Tuple, TupleDesc, TypeId};

/// Count meaning "every remaining row".
pub const FETCH_ALL: i64 = i64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDirection {
    Forward,
    Backward,
    /// Count is the target row; negative counts from the end.
    Absolute,
    /// Count is an offset from the current row.
    Relative,
}

#[derive(Debug, Clone)]
pub struct Portal {
    name: String,
    source_text: String,
    tag: String,
    desc: TupleDesc,
    rows: Vec<Tuple>,
    position: usize,
    scrollable: bool,
    read_only: bool,
    pub(super) subid: SubTransactionId,
}

impl Portal {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_text(&self) -> &str {
        &self.source_text
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn desc(&self) -> &TupleDesc {
        &self.desc
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_scrollable(&self) -> bool {
        self.scrollable
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn after_last(&self) -> usize {
        self.rows.len() + 1
    }

    /// Whether the move leaves the current position heading backward.
    fn moves_backward(&self, direction: FetchDirection, count: i64) -> bool {
        match direction {
            FetchDirection::Forward => false,
            FetchDirection::Backward => true,
            FetchDirection::Absolute => count < 0 || (count as u64) < self.position as u64,
            FetchDirection::Relative => count < 0,
        }
    }

    /// Advance the position and collect the rows passed over.
    fn advance(
        &mut self,
        direction: FetchDirection,
        count: i64,
        collect: bool,
    ) -> (u64, Vec<Tuple>) {
        let len = self.rows.len();
        let mut out = Vec::new();
        let mut moved = 0u64;
        match direction {
            FetchDirection::Forward | FetchDirection::Backward => {
                let forward = (direction == FetchDirection::Forward) == (count >= 0);
                let wanted = count.unsigned_abs();
                while moved < wanted {
                    let next = if forward {
                        self.position + 1
                    } else if self.position == 0 {
                        break;
                    } else {
                        self.position - 1
                    };
                    if next == 0 || next > len {
                        self.position = if forward { self.after_last() } else { 0 };
                        break;
                    }
                    self.position = next;
                    moved += 1;
                    if collect {
                        out.push(self.rows[next - 1].clone());
                    }
                }
            }
            FetchDirection::Absolute | FetchDirection::Relative => {
                let target = if direction == FetchDirection::Absolute {
                    if count >= 0 {
                        count
                    } else {
                        (len as i64 + 1).saturating_add(count)
                    }
                } else {
                    (self.position as i64).saturating_add(count)
                };
                self.position = target.clamp(0, self.after_last() as i64) as usize;
                if (1..=len).contains(&self.position) {
                    moved = 1;
                    if collect {
                        out.push(self.rows[self.position - 1].clone());
                    }
                }
            }
        }
        (moved, out)
    }
}

impl<E: QueryEngine> SpiContext<E> {
    /// Open a cursor over `plan`. Returns the portal name.
    pub fn cursor_open(
        &mut self,
        name: Option<&str>,
        plan: SpiPlan,
        values: Option<&[Option<Datum>]>,
        read_only: bool,
    ) -> SpiResult<String> {
        let prepared = self.lookup_plan(plan)?;
        let params = bind_params(prepared.nargs(), values)?;
        self.begin_call()?;
        let result = self.open_portal(name, &prepared, &params, read_only);
        self.end_call(true);
        result
    }

    /// Prepare `src` and open a cursor over it in one step.
    pub fn cursor_open_with_args(
        &mut self,
        name: Option<&str>,
        src: &str,
        argtypes: &[TypeId],
        values: Option<&[Option<Datum>]>,
        read_only: bool,
        options: CursorOptions,
    ) -> SpiResult<String> {
        if src.is_empty() {
            return Err(SpiResultCode::ErrorArgument.into());
        }
        let params = bind_params(argtypes.len(), values)?;
        self.begin_call()?;
        let result = self
            .build_plan(
                src,
                ParamTypes::Fixed(argtypes.to_vec()),
                options,
                PlanKind::Temporary,
            )
            .and_then(|prepared| self.open_portal(name, &prepared, &params, read_only));
        self.end_call(true);
        result
    }

    fn open_portal(
        &mut self,
        name: Option<&str>,
        plan: &PreparedPlan<E::Tree>,
        params: &[Option<Datum>],
        read_only: bool,
    ) -> SpiResult<String> {
        let source = match plan.sources.as_slice() {
            [only] => only,
            _ => {
                return Err(SpiError::InvalidCursorDefinition(
                    "cannot open multi-query plan as cursor".into(),
                ))
            }
        };
        let stmts = match &source.planned {
            Some(stmts) => stmts.clone(),
            None => self.engine.analyze(&source.raw, &plan.param_types)?,
        };
        let stmt = match stmts.as_slice() {
            [only] if only.returns_tuples() => only,
            _ => {
                return Err(SpiError::InvalidCursorDefinition(format!(
                    "cannot open {} query as cursor",
                    source.command_tag()
                )))
            }
        };

        let name = match name {
            Some(n) => {
                if self.portals.contains_key(n) {
                    return Err(SpiError::InvalidCursorState(format!(
                        "cursor \"{}\" already exists",
                        n
                    )));
                }
                n.to_string()
            }
            None => loop {
                self.next_portal += 1;
                let candidate = format!("<unnamed portal {}>", self.next_portal);
                if !self.portals.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        let scrollable = match plan.cursor_options.scroll {
            ScrollOption::Auto => stmt.supports_backward_scan && !stmt.has_row_marks,
            ScrollOption::Scroll if stmt.has_row_marks => {
                return Err(SpiError::FeatureNotSupported(
                    "DECLARE SCROLL CURSOR ... FOR UPDATE/SHARE is not supported".into(),
                ))
            }
            ScrollOption::Scroll => true,
            ScrollOption::NoScroll => false,
        };

        if read_only && !stmt.read_only {
            return Err(SpiError::FeatureNotSupported(format!(
                "{} is not allowed in a non-volatile function",
                stmt.tag
            )));
        }

        let snapshot = if read_only {
            self.engine.active_snapshot()
        } else {
            let cid = self.engine.command_counter_increment();
            let mut s = self.engine.transaction_snapshot();
            s.command_id = cid;
            Some(s)
        };

        let mut sink = VecSink::default();
        self.engine.execute(
            stmt,
            ExecRequest {
                params,
                snapshot: snapshot.as_ref(),
                crosscheck: None,
                fire_triggers: true,
                tcount: 0,
                sink: &mut sink,
            },
        )?;

        let desc = sink
            .desc
            .or_else(|| stmt.result_desc.clone())
            .unwrap_or_else(|| TupleDesc::new(Vec::new()));
        let portal = Portal {
            name: name.clone(),
            source_text: plan.source_text.clone(),
            tag: stmt.tag.clone(),
            desc,
            rows: sink.rows,
            position: 0,
            scrollable,
            read_only,
            subid: self.engine.current_subtransaction(),
        };
        self.portals.insert(name.clone(), portal);
        Ok(name)
    }

    pub fn cursor_find(&self, name: &str) -> Option<&Portal> {
        self.portals.get(name)
    }

    /// Fetch up to `count` rows into the result table.
    pub fn cursor_fetch(&mut self, name: &str, forward: bool, count: i64) -> SpiResult<()> {
        let direction = if forward {
            FetchDirection::Forward
        } else {
            FetchDirection::Backward
        };
        self.cursor_operation(name, direction, count, Destination::Spi)
    }

    /// Reposition without returning rows. `processed` is set to the rows
    /// passed over.
    pub fn cursor_move(&mut self, name: &str, forward: bool, count: i64) -> SpiResult<()> {
        let direction = if forward {
            FetchDirection::Forward
        } else {
            FetchDirection::Backward
        };
        self.cursor_operation(name, direction, count, Destination::None)
    }

    pub fn scroll_cursor_fetch(
        &mut self,
        name: &str,
        direction: FetchDirection,
        count: i64,
    ) -> SpiResult<()> {
        self.cursor_operation(name, direction, count, Destination::Spi)
    }

    pub fn scroll_cursor_move(
        &mut self,
        name: &str,
        direction: FetchDirection,
        count: i64,
    ) -> SpiResult<()> {
        self.cursor_operation(name, direction, count, Destination::None)
    }

    pub fn cursor_close(&mut self, name: &str) -> SpiResult<()> {
        self.portals.remove(name).map(|_| ()).ok_or_else(|| {
            SpiError::InvalidCursorState("invalid portal in SPI cursor close operation".into())
        })
    }

    fn cursor_operation(
        &mut self,
        name: &str,
        direction: FetchDirection,
        count: i64,
        dest: Destination,
    ) -> SpiResult<()> {
        if !self.portals.contains_key(name) {
            return Err(SpiError::InvalidCursorState(
                "invalid portal in SPI cursor operation".into(),
            ));
        }
        self.begin_call()?;
        let result = self.run_cursor(name, direction, count, dest);
        self.end_call(true);
        result
    }

    fn run_cursor(
        &mut self,
        name: &str,
        direction: FetchDirection,
        count: i64,
        dest: Destination,
    ) -> SpiResult<()> {
        self.processed = 0;
        self.tuptable = None;
        let level = self.level()?;
        let portal = self.portals.get_mut(name).ok_or_else(|| {
            SpiError::InvalidCursorState("invalid portal in SPI cursor operation".into())
        })?;
        if !portal.scrollable && portal.moves_backward(direction, count) {
            return Err(SpiError::InvalidCursorState(
                "cursor can only scan forward".into(),
            ));
        }
        let collect = dest == Destination::Spi;
        let (moved, rows) = portal.advance(direction, count, collect);
        let desc = portal.desc.clone();

        let frame = &mut self.stack[level];
        frame.reset_results();
        frame.processed = moved;
        if !collect {
            self.processed = moved;
            return Ok(());
        }

        {
            let mut receiver = SpiReceiver {
                frame,
                dest: Destination::Spi,
                initial: self.config.tuptable_size,
                limit: self.config.work_mem_limit,
            };
            receiver.startup(&desc)?;
            for row in rows {
                receiver.receive(row)?;
            }
            receiver.shutdown()?;
        }
        self.check_tuples("consistency check on SPI tuple count failed")?;

        let frame = &mut self.stack[level];
        self.processed = frame.processed;
        self.tuptable = frame.tuptable.take();
        Ok(())
    }
}
