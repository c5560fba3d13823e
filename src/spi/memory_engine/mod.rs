//! In-memory reference engine
//!
//! Tables live in a map. Each stored row remembers the command that
//! inserted it and the command that deleted it, which is all the snapshot
//! machinery of the call stack needs to observe.

mod sql;

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};

use self::sql::{CmpOp, Condition, CopyTarget, Expr, Projection, Select, Sql};
use super::engine::{
    ExecOutcome, ExecRequest, Operand, ParamTypes, PlannedStatement, QueryEngine, RawStatement,
    Snapshot, StatementKind, SubTransactionId, TupleSink, TOP_SUBTRANSACTION,
};
use super::errors::{SpiError, SpiResult};
use super::tuple::{Column, Datum, Tuple, TupleDesc, TypeId};

pub use self::sql::Sql as MemoryStatement;

#[derive(Debug, Clone)]
struct StoredRow {
    values: Vec<Option<Datum>>,
    oid: u64,
    inserted: u32,
    deleted: Option<u32>,
}

impl StoredRow {
    fn visible(&self, snapshot: Option<&Snapshot>) -> bool {
        match snapshot {
            None => self.deleted.is_none(),
            Some(s) => {
                self.inserted < s.command_id && self.deleted.map_or(true, |d| d >= s.command_id)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Table {
    columns: Vec<Column>,
    rows: Vec<StoredRow>,
}

impl Table {
    fn desc(&self) -> TupleDesc {
        TupleDesc::new(self.columns.clone())
    }

    fn column_index(&self, table: &str, name: &str) -> SpiResult<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| {
                SpiError::Engine(format!(
                    "column \"{}\" of relation \"{}\" does not exist",
                    name, table
                ))
            })
    }
}

/// Reference [`QueryEngine`] over in-memory tables.
#[derive(Debug)]
pub struct MemoryEngine {
    tables: BTreeMap<String, Table>,
    command_id: u32,
    snapshot_id: u64,
    next_oid: u64,
    subtransactions: Vec<SubTransactionId>,
    next_subtransaction: SubTransactionId,
    inflate_processed: bool,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            tables: BTreeMap::new(),
            command_id: 0,
            snapshot_id: 0,
            next_oid: 16_384,
            subtransactions: Vec::new(),
            next_subtransaction: TOP_SUBTRANSACTION + 1,
            inflate_processed: false,
        }
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// Live rows of `table`, ignoring snapshots.
    pub fn row_count(&self, table: &str) -> Option<usize> {
        self.tables
            .get(table)
            .map(|t| t.rows.iter().filter(|r| r.deleted.is_none()).count())
    }

    pub fn command_id(&self) -> u32 {
        self.command_id
    }

    pub fn begin_subtransaction(&mut self) -> SubTransactionId {
        let id = self.next_subtransaction;
        self.next_subtransaction += 1;
        self.subtransactions.push(id);
        id
    }

    /// Leave the innermost subtransaction, returning its id.
    pub fn end_subtransaction(&mut self) -> Option<SubTransactionId> {
        self.subtransactions.pop()
    }

    /// Report one more processed row than a statement produced.
    pub fn inflate_processed_count(&mut self, on: bool) {
        self.inflate_processed = on;
    }

    fn table(&self, name: &str) -> SpiResult<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| SpiError::Engine(format!("relation \"{}\" does not exist", name)))
    }

    fn table_mut(&mut self, name: &str) -> SpiResult<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| SpiError::Engine(format!("relation \"{}\" does not exist", name)))
    }

    fn expr_type(
        &self,
        expr: &Expr,
        table: Option<&Table>,
        params: &ParamTypes,
    ) -> SpiResult<TypeId> {
        match expr {
            Expr::Literal(Some(d)) => Ok(d.type_id()),
            Expr::Literal(None) => Ok(TypeId::Text),
            Expr::Param(n) => params.resolve(*n).ok_or_else(|| {
                SpiError::Engine(format!("there is no parameter ${}", n))
            }),
            Expr::Column(name) => table
                .and_then(|t| t.columns.iter().find(|c| &c.name == name))
                .map(|c| c.type_id)
                .ok_or_else(|| SpiError::Engine(format!("column \"{}\" does not exist", name))),
        }
    }

    /// Values and parameters only; column references are not assignable.
    fn check_assignable(&self, column: &Column, expr: &Expr, params: &ParamTypes) -> SpiResult<()> {
        if matches!(expr, Expr::Literal(None)) {
            return Ok(());
        }
        let found = self.expr_type(expr, None, params)?;
        if found == column.type_id || (column.type_id == TypeId::Float8 && found == TypeId::Int8) {
            Ok(())
        } else {
            Err(SpiError::Engine(format!(
                "column \"{}\" is of type {} but expression is of type {}",
                column.name,
                column.type_id.name(),
                found.name()
            )))
        }
    }

    fn check_filter(
        &self,
        table: &Table,
        name: &str,
        filter: &[Condition],
        params: &ParamTypes,
    ) -> SpiResult<()> {
        for cond in filter {
            table.column_index(name, &cond.column)?;
            self.expr_type(&cond.value, Some(table), params)?;
        }
        Ok(())
    }

    fn projection_desc(
        &self,
        projection: &Projection,
        table: Option<&Table>,
        params: &ParamTypes,
    ) -> SpiResult<TupleDesc> {
        match projection {
            Projection::All => match table {
                Some(t) => Ok(t.desc()),
                None => Err(SpiError::Engine(
                    "SELECT * with no tables specified is not valid".into(),
                )),
            },
            Projection::Items(items) => {
                let mut columns = Vec::with_capacity(items.len());
                for item in items {
                    let name = match item {
                        Expr::Column(c) => c.clone(),
                        _ => "?column?".to_string(),
                    };
                    columns.push(Column::new(name, self.expr_type(item, table, params)?));
                }
                Ok(TupleDesc::new(columns))
            }
        }
    }

    fn select_desc(&self, select: &Select, params: &ParamTypes) -> SpiResult<TupleDesc> {
        let table = match &select.from {
            Some(name) => {
                let t = self.table(name)?;
                self.check_filter(t, name, &select.filter, params)?;
                Some(t)
            }
            None => None,
        };
        self.projection_desc(&select.projection, table, params)
    }

    fn plan(
        &self,
        raw: &RawStatement<Sql>,
        params: &ParamTypes,
    ) -> SpiResult<PlannedStatement<Sql>> {
        let mut planned = PlannedStatement {
            kind: StatementKind::Utility,
            tag: raw.tag.clone(),
            can_set_tag: true,
            has_returning: false,
            has_row_marks: false,
            supports_backward_scan: false,
            read_only: false,
            result_desc: None,
            tree: raw.tree.clone(),
        };
        match &raw.tree {
            Sql::Select(select) => {
                planned.kind = StatementKind::Select;
                planned.result_desc = Some(self.select_desc(select, params)?);
                planned.has_row_marks = select.lock.is_some();
                planned.supports_backward_scan = true;
                planned.read_only = select.lock.is_none();
            }
            Sql::Insert {
                table,
                columns,
                rows,
                returning,
            } => {
                let t = self.table(table)?;
                let targets: Vec<usize> = match columns {
                    Some(names) => names
                        .iter()
                        .map(|n| t.column_index(table, n))
                        .collect::<SpiResult<_>>()?,
                    None => (0..t.columns.len()).collect(),
                };
                for row in rows {
                    if row.len() > targets.len() {
                        return Err(SpiError::Engine(
                            "INSERT has more expressions than target columns".into(),
                        ));
                    }
                    for (expr, &idx) in row.iter().zip(&targets) {
                        self.check_assignable(&t.columns[idx], expr, params)?;
                    }
                }
                planned.kind = StatementKind::Insert;
                self.plan_returning(&mut planned, returning, t, params)?;
            }
            Sql::Update {
                table,
                assignments,
                filter,
                returning,
            } => {
                let t = self.table(table)?;
                for (column, expr) in assignments {
                    let idx = t.column_index(table, column)?;
                    self.check_assignable(&t.columns[idx], expr, params)?;
                }
                self.check_filter(t, table, filter, params)?;
                planned.kind = StatementKind::Update;
                self.plan_returning(&mut planned, returning, t, params)?;
            }
            Sql::Delete {
                table,
                filter,
                returning,
            } => {
                let t = self.table(table)?;
                self.check_filter(t, table, filter, params)?;
                planned.kind = StatementKind::Delete;
                self.plan_returning(&mut planned, returning, t, params)?;
            }
            Sql::CreateTable { name, .. } => {
                if self.tables.contains_key(name) {
                    return Err(SpiError::Engine(format!("relation \"{}\" already exists", name)));
                }
            }
            Sql::CreateTableAs {
                query, select_into, ..
            } => {
                self.select_desc(query, params)?;
                planned.kind = StatementKind::CreateTableAs {
                    select_into: *select_into,
                };
            }
            Sql::DropTable { name } => {
                self.table(name)?;
            }
            Sql::ShowTables => {
                planned.read_only = true;
                planned.result_desc = Some(TupleDesc::new(vec![Column::new(
                    "table_name",
                    TypeId::Text,
                )]));
            }
            Sql::Copy { table, target, .. } => {
                self.table(table)?;
                planned.kind = StatementKind::Copy {
                    to_client: *target == CopyTarget::Client,
                };
            }
            Sql::Transaction => planned.kind = StatementKind::Transaction,
            Sql::Call { procedure, args } => {
                let mut operands = Vec::with_capacity(args.len());
                for arg in args {
                    operands.push(match arg {
                        Expr::Literal(v) => Operand::Literal(v.clone()),
                        Expr::Param(n) => {
                            self.expr_type(arg, None, params)?;
                            Operand::Param(*n)
                        }
                        Expr::Column(c) => {
                            return Err(SpiError::Engine(format!(
                                "column \"{}\" does not exist",
                                c
                            )))
                        }
                    });
                }
                planned.kind = StatementKind::Call {
                    procedure: procedure.clone(),
                    args: operands,
                };
            }
        }
        Ok(planned)
    }

    fn plan_returning(
        &self,
        planned: &mut PlannedStatement<Sql>,
        returning: &Option<Projection>,
        table: &Table,
        params: &ParamTypes,
    ) -> SpiResult<()> {
        if let Some(projection) = returning {
            planned.has_returning = true;
            planned.result_desc = Some(self.projection_desc(projection, Some(table), params)?);
        }
        Ok(())
    }

    fn next_oid(&mut self) -> u64 {
        let oid = self.next_oid;
        self.next_oid += 1;
        oid
    }
}

fn eval(
    expr: &Expr,
    row: Option<(&Table, &[Option<Datum>])>,
    params: &[Option<Datum>],
) -> Option<Datum> {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Param(n) => Operand::Param(*n).resolve(params),
        Expr::Column(name) => row.and_then(|(t, values)| {
            t.columns
                .iter()
                .position(|c| &c.name == name)
                .and_then(|i| values.get(i).cloned().flatten())
        }),
    }
}

fn compare(a: &Datum, b: &Datum) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Datum::Int(x), Datum::Int(y)) => Some(x.cmp(y)),
        (Datum::Int(x), Datum::Float(y)) => (*x as f64).partial_cmp(y),
        (Datum::Float(x), Datum::Int(y)) => x.partial_cmp(&(*y as f64)),
        (Datum::Float(x), Datum::Float(y)) => x.partial_cmp(y),
        (Datum::Text(x), Datum::Text(y)) => Some(x.cmp(y)),
        (Datum::Bool(x), Datum::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Conjunction of all conditions. Nulls never match.
fn matches(
    table: &Table,
    values: &[Option<Datum>],
    filter: &[Condition],
    params: &[Option<Datum>],
) -> bool {
    filter.iter().all(|cond| {
        let left = eval(&Expr::Column(cond.column.clone()), Some((table, values)), params);
        let right = eval(&cond.value, Some((table, values)), params);
        let ord = match (left, right) {
            (Some(l), Some(r)) => compare(&l, &r),
            _ => None,
        };
        match ord {
            None => false,
            Some(o) => match cond.op {
                CmpOp::Eq => o.is_eq(),
                CmpOp::NotEq => o.is_ne(),
                CmpOp::Lt => o.is_lt(),
                CmpOp::LtEq => o.is_le(),
                CmpOp::Gt => o.is_gt(),
                CmpOp::GtEq => o.is_ge(),
            },
        }
    })
}

fn coerce(value: Option<Datum>, type_id: TypeId) -> Option<Datum> {
    match (value, type_id) {
        (Some(Datum::Int(v)), TypeId::Float8) => Some(Datum::Float(v as f64)),
        (v, _) => v,
    }
}

fn project(
    projection: &Projection,
    table: Option<&Table>,
    values: &[Option<Datum>],
    params: &[Option<Datum>],
) -> Vec<Option<Datum>> {
    match projection {
        Projection::All => values.to_vec(),
        Projection::Items(items) => items
            .iter()
            .map(|e| eval(e, table.map(|t| (t, values)), params))
            .collect(),
    }
}

/// Sends rows to the sink while honoring the row cap.
struct Emitter<'a> {
    sink: &'a mut dyn TupleSink,
    tcount: u64,
    sent: u64,
}

impl Emitter<'_> {
    fn full(&self) -> bool {
        self.tcount > 0 && self.sent >= self.tcount
    }

    fn emit(&mut self, values: Vec<Option<Datum>>, oid: u64) -> SpiResult<()> {
        self.sent += 1;
        self.sink.receive(Tuple { values, oid })
    }
}

impl QueryEngine for MemoryEngine {
    type Tree = Sql;

    fn parse(&mut self, src: &str) -> SpiResult<Vec<RawStatement<Sql>>> {
        Ok(sql::parse_all(src)?
            .into_iter()
            .map(|p| RawStatement {
                text: p.text,
                tag: p.tag,
                tree: p.sql,
            })
            .collect())
    }

    fn analyze(
        &mut self,
        raw: &RawStatement<Sql>,
        params: &ParamTypes,
    ) -> SpiResult<Vec<PlannedStatement<Sql>>> {
        Ok(vec![self.plan(raw, params)?])
    }

    fn execute(
        &mut self,
        stmt: &PlannedStatement<Sql>,
        request: ExecRequest<'_>,
    ) -> SpiResult<ExecOutcome> {
        let ExecRequest {
            params,
            snapshot,
            tcount,
            sink,
            ..
        } = request;
        if let Some(desc) = &stmt.result_desc {
            sink.startup(desc)?;
        }
        let mut out = Emitter {
            sink,
            tcount,
            sent: 0,
        };
        let cid = self.command_id;
        let mut outcome = ExecOutcome::default();

        match &stmt.tree {
            Sql::Select(select) => {
                let rows = self.run_select(select, params, snapshot, tcount)?;
                for values in rows {
                    out.emit(values, 0)?;
                }
                outcome.processed = out.sent;
            }
            Sql::Insert {
                table,
                columns,
                rows,
                returning,
            } => {
                let t = self.table(table)?;
                let targets: Vec<usize> = match columns {
                    Some(names) => names
                        .iter()
                        .map(|n| t.column_index(table, n))
                        .collect::<SpiResult<_>>()?,
                    None => (0..t.columns.len()).collect(),
                };
                let types: Vec<TypeId> = t.columns.iter().map(|c| c.type_id).collect();
                let mut stored = Vec::with_capacity(rows.len());
                for row in rows {
                    let mut values = vec![None; types.len()];
                    for (expr, &idx) in row.iter().zip(&targets) {
                        values[idx] = coerce(eval(expr, None, params), types[idx]);
                    }
                    stored.push(values);
                }
                for values in stored {
                    let oid = self.next_oid();
                    let t = self.table_mut(table)?;
                    t.rows.push(StoredRow {
                        values: values.clone(),
                        oid,
                        inserted: cid,
                        deleted: None,
                    });
                    outcome.processed += 1;
                    outcome.last_oid = oid;
                    if let Some(p) = returning {
                        if !out.full() {
                            let t = self.table(table)?;
                            out.emit(project(p, Some(t), &values, params), oid)?;
                        }
                    }
                }
                if outcome.processed != 1 {
                    outcome.last_oid = 0;
                }
            }
            Sql::Update {
                table,
                assignments,
                filter,
                returning,
            } => {
                let t = self.table(table)?;
                let sets: Vec<(usize, Option<Datum>)> = assignments
                    .iter()
                    .map(|(c, e)| {
                        let idx = t.column_index(table, c)?;
                        Ok((idx, coerce(eval(e, None, params), t.columns[idx].type_id)))
                    })
                    .collect::<SpiResult<_>>()?;
                let targets: Vec<usize> = (0..t.rows.len())
                    .filter(|&i| {
                        let r = &t.rows[i];
                        r.visible(snapshot) && r.deleted.is_none() && matches(t, &r.values, filter, params)
                    })
                    .collect();
                let mut produced = Vec::new();
                for i in targets {
                    let oid = self.next_oid();
                    let t = self.table_mut(table)?;
                    t.rows[i].deleted = Some(cid);
                    let mut values = t.rows[i].values.clone();
                    for (idx, v) in &sets {
                        values[*idx] = v.clone();
                    }
                    t.rows.push(StoredRow {
                        values: values.clone(),
                        oid,
                        inserted: cid,
                        deleted: None,
                    });
                    produced.push((values, oid));
                }
                outcome.processed = produced.len() as u64;
                if let Some(p) = returning {
                    let t = self.table(table)?;
                    for (values, oid) in produced {
                        if out.full() {
                            break;
                        }
                        out.emit(project(p, Some(t), &values, params), oid)?;
                    }
                }
            }
            Sql::Delete {
                table,
                filter,
                returning,
            } => {
                let t = self.table_mut(table)?;
                let mut removed = Vec::new();
                for i in 0..t.rows.len() {
                    let hit = {
                        let r = &t.rows[i];
                        r.visible(snapshot)
                            && r.deleted.is_none()
                            && matches(t, &r.values, filter, params)
                    };
                    if hit {
                        t.rows[i].deleted = Some(cid);
                        removed.push((t.rows[i].values.clone(), t.rows[i].oid));
                    }
                }
                outcome.processed = removed.len() as u64;
                if let Some(p) = returning {
                    let t = self.table(table)?;
                    for (values, oid) in removed {
                        if out.full() {
                            break;
                        }
                        out.emit(project(p, Some(t), &values, params), oid)?;
                    }
                }
            }
            Sql::CreateTable { name, columns } => {
                if self.tables.contains_key(name) {
                    return Err(SpiError::Engine(format!("relation \"{}\" already exists", name)));
                }
                self.tables.insert(
                    name.clone(),
                    Table {
                        columns: columns.clone(),
                        rows: Vec::new(),
                    },
                );
            }
            Sql::CreateTableAs { name, query, .. } => {
                if self.tables.contains_key(name) {
                    return Err(SpiError::Engine(format!("relation \"{}\" already exists", name)));
                }
                let types = ParamTypes::Fixed(
                    params
                        .iter()
                        .map(|p| p.as_ref().map_or(TypeId::Text, Datum::type_id))
                        .collect(),
                );
                let desc = self.select_desc(query, &types)?;
                let rows = self.run_select(query, params, snapshot, 0)?;
                let mut stored = Vec::with_capacity(rows.len());
                for values in rows {
                    stored.push(StoredRow {
                        values,
                        oid: self.next_oid(),
                        inserted: cid,
                        deleted: None,
                    });
                }
                outcome.processed = stored.len() as u64;
                self.tables.insert(
                    name.clone(),
                    Table {
                        columns: desc.columns,
                        rows: stored,
                    },
                );
            }
            Sql::DropTable { name } => {
                if self.tables.remove(name).is_none() {
                    return Err(SpiError::Engine(format!("table \"{}\" does not exist", name)));
                }
            }
            Sql::ShowTables => {
                for name in self.table_names() {
                    if out.full() {
                        break;
                    }
                    out.emit(vec![Some(Datum::Text(name))], 0)?;
                }
                outcome.processed = out.sent;
            }
            Sql::Copy {
                table,
                to,
                target: CopyTarget::File(path),
            } => {
                outcome.processed = if *to {
                    self.copy_to(table, path, snapshot)?
                } else {
                    self.copy_from(table, path, cid)?
                };
            }
            Sql::Copy {
                target: CopyTarget::Client,
                ..
            } => {
                return Err(SpiError::Engine(
                    "COPY to or from the client is not supported here".into(),
                ))
            }
            Sql::Transaction | Sql::Call { .. } => {
                return Err(SpiError::Engine(format!(
                    "{} cannot be executed by the engine",
                    stmt.tag
                )))
            }
        }

        out.sink.shutdown()?;
        if self.inflate_processed {
            outcome.processed += 1;
        }
        Ok(outcome)
    }

    fn transaction_snapshot(&mut self) -> Snapshot {
        self.snapshot_id += 1;
        Snapshot {
            id: self.snapshot_id,
            command_id: self.command_id,
        }
    }

    fn active_snapshot(&self) -> Option<Snapshot> {
        Some(Snapshot {
            id: self.snapshot_id,
            command_id: self.command_id,
        })
    }

    fn command_counter_increment(&mut self) -> u32 {
        self.command_id += 1;
        self.command_id
    }

    fn current_subtransaction(&self) -> SubTransactionId {
        self.subtransactions
            .last()
            .copied()
            .unwrap_or(TOP_SUBTRANSACTION)
    }
}

impl MemoryEngine {
    fn run_select(
        &self,
        select: &Select,
        params: &[Option<Datum>],
        snapshot: Option<&Snapshot>,
        tcount: u64,
    ) -> SpiResult<Vec<Vec<Option<Datum>>>> {
        let mut rows = Vec::new();
        let limit = if tcount == 0 { usize::MAX } else { tcount as usize };
        match &select.from {
            None => rows.push(project(&select.projection, None, &[], params)),
            Some(name) => {
                let t = self.table(name)?;
                for r in &t.rows {
                    if rows.len() >= limit {
                        break;
                    }
                    if r.visible(snapshot) && matches(t, &r.values, &select.filter, params) {
                        rows.push(project(&select.projection, Some(t), &r.values, params));
                    }
                }
            }
        }
        rows.truncate(limit);
        Ok(rows)
    }

    fn copy_to(&self, table: &str, path: &str, snapshot: Option<&Snapshot>) -> SpiResult<u64> {
        let t = self.table(table)?;
        let mut file = fs::File::create(path)
            .map_err(|e| SpiError::Engine(format!("could not open file \"{}\" for writing: {}", path, e)))?;
        let mut count = 0;
        for r in t.rows.iter().filter(|r| r.visible(snapshot)) {
            let line: Vec<String> = r
                .values
                .iter()
                .map(|v| v.as_ref().map_or_else(|| "\\N".to_string(), Datum::to_string))
                .collect();
            writeln!(file, "{}", line.join("\t"))
                .map_err(|e| SpiError::Engine(format!("could not write to file \"{}\": {}", path, e)))?;
            count += 1;
        }
        Ok(count)
    }

    fn copy_from(&mut self, table: &str, path: &str, cid: u32) -> SpiResult<u64> {
        let types: Vec<TypeId> = self.table(table)?.columns.iter().map(|c| c.type_id).collect();
        let file = fs::File::open(path)
            .map_err(|e| SpiError::Engine(format!("could not open file \"{}\" for reading: {}", path, e)))?;
        let mut parsed = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line
                .map_err(|e| SpiError::Engine(format!("could not read file \"{}\": {}", path, e)))?;
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != types.len() {
                return Err(SpiError::Engine(format!(
                    "COPY {}, line {}: expected {} columns",
                    table,
                    n + 1,
                    types.len()
                )));
            }
            let mut values = Vec::with_capacity(fields.len());
            for (field, type_id) in fields.iter().zip(&types) {
                values.push(parse_field(field, *type_id).ok_or_else(|| {
                    SpiError::Engine(format!(
                        "COPY {}, line {}: invalid input syntax for type {}: \"{}\"",
                        table,
                        n + 1,
                        type_id.name(),
                        field
                    ))
                })?);
            }
            parsed.push(values);
        }
        let count = parsed.len() as u64;
        for values in parsed {
            let oid = self.next_oid();
            self.table_mut(table)?.rows.push(StoredRow {
                values,
                oid,
                inserted: cid,
                deleted: None,
            });
        }
        Ok(count)
    }
}

fn parse_field(field: &str, type_id: TypeId) -> Option<Option<Datum>> {
    if field == "\\N" {
        return Some(None);
    }
    let datum = match type_id {
        TypeId::Bool => match field {
            "t" | "true" => Datum::Bool(true),
            "f" | "false" => Datum::Bool(false),
            _ => return None,
        },
        TypeId::Int8 => Datum::Int(field.parse().ok()?),
        TypeId::Float8 => Datum::Float(field.parse().ok()?),
        TypeId::Text => Datum::Text(field.to_string()),
    };
    Some(Some(datum))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spi::engine::{DiscardSink, VecSink};

    fn run(
        engine: &mut MemoryEngine,
        src: &str,
        params: &[Option<Datum>],
    ) -> (ExecOutcome, VecSink) {
        let raws = engine.parse(src).unwrap();
        let mut sink = VecSink::default();
        let mut last = ExecOutcome::default();
        for raw in &raws {
            let types = ParamTypes::Fixed(
                params
                    .iter()
                    .map(|p| p.as_ref().map_or(TypeId::Text, Datum::type_id))
                    .collect(),
            );
            for stmt in engine.analyze(raw, &types).unwrap() {
                engine.command_counter_increment();
                let snap = engine.transaction_snapshot();
                last = engine
                    .execute(
                        &stmt,
                        ExecRequest {
                            params,
                            snapshot: Some(&snap),
                            crosscheck: None,
                            fire_triggers: true,
                            tcount: 0,
                            sink: &mut sink,
                        },
                    )
                    .unwrap();
            }
        }
        (last, sink)
    }

    fn engine_with_users() -> MemoryEngine {
        let mut e = MemoryEngine::new();
        run(&mut e, "create table users (id int8, name text)", &[]);
        run(
            &mut e,
            "insert into users values (1, 'ann'), (2, 'bob'), (3, 'cy')",
            &[],
        );
        e
    }

    #[test]
    fn test_insert_and_select() {
        let mut e = engine_with_users();
        let (outcome, sink) = run(&mut e, "select name from users where id >= $1", &[Some(Datum::Int(2))]);
        assert_eq!(outcome.processed, 2);
        assert_eq!(sink.rows.len(), 2);
        assert_eq!(sink.desc.unwrap().columns[0].name, "name");
        assert_eq!(e.row_count("users"), Some(3));
    }

    #[test]
    fn test_update_returning_and_delete() {
        let mut e = engine_with_users();
        let (outcome, sink) = run(&mut e, "update users set name = 'zed' where id = 2 returning id, name", &[]);
        assert_eq!(outcome.processed, 1);
        assert_eq!(sink.rows[0].values[1], Some(Datum::Text("zed".into())));
        let (outcome, _) = run(&mut e, "delete from users where id <> 2", &[]);
        assert_eq!(outcome.processed, 2);
        assert_eq!(e.row_count("users"), Some(1));
    }

    #[test]
    fn test_snapshot_hides_later_rows() {
        let mut e = engine_with_users();
        let early = Snapshot {
            id: 0,
            command_id: 1,
        };
        let raw = e.parse("select * from users").unwrap().remove(0);
        let stmt = e.analyze(&raw, &ParamTypes::None).unwrap().remove(0);
        let mut sink = VecSink::default();
        let outcome = e
            .execute(
                &stmt,
                ExecRequest {
                    params: &[],
                    snapshot: Some(&early),
                    crosscheck: None,
                    fire_triggers: true,
                    tcount: 0,
                    sink: &mut sink,
                },
            )
            .unwrap();
        assert_eq!(outcome.processed, 0);
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let mut e = engine_with_users();
        let raw = e.parse("insert into users values ('x', 'y')").unwrap().remove(0);
        let err = e.analyze(&raw, &ParamTypes::None).unwrap_err();
        assert_eq!(
            err,
            SpiError::Engine("column \"id\" is of type int8 but expression is of type text".into())
        );
    }

    #[test]
    fn test_copy_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.tsv");
        let path = path.to_string_lossy().to_string();
        let mut e = engine_with_users();
        let (outcome, _) = run(&mut e, &format!("copy users to '{}'", path), &[]);
        assert_eq!(outcome.processed, 3);
        run(&mut e, "create table copy_of (id int8, name text)", &[]);
        let (outcome, _) = run(&mut e, &format!("copy copy_of from '{}'", path), &[]);
        assert_eq!(outcome.processed, 3);
        assert_eq!(e.row_count("copy_of"), Some(3));
    }

    #[test]
    fn test_row_cap() {
        let mut e = engine_with_users();
        let raw = e.parse("select id from users").unwrap().remove(0);
        let stmt = e.analyze(&raw, &ParamTypes::None).unwrap().remove(0);
        let outcome = e
            .execute(
                &stmt,
                ExecRequest {
                    params: &[],
                    snapshot: None,
                    crosscheck: None,
                    fire_triggers: true,
                    tcount: 2,
                    sink: &mut DiscardSink,
                },
            )
            .unwrap();
        assert_eq!(outcome.processed, 2);
    }

    #[test]
    fn test_subtransaction_ids() {
        let mut e = MemoryEngine::new();
        assert_eq!(e.current_subtransaction(), TOP_SUBTRANSACTION);
        let a = e.begin_subtransaction();
        let b = e.begin_subtransaction();
        assert!(b > a);
        assert_eq!(e.current_subtransaction(), b);
        assert_eq!(e.end_subtransaction(), Some(b));
        assert_eq!(e.current_subtransaction(), a);
    }
}
