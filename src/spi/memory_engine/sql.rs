//! Statement grammar of the reference engine
//!
//! One table per statement, conjunctive comparisons, literals and `$n`
//! parameters. Keywords are case-insensitive and identifiers are folded to
//! lower case.

use std::fmt;

use crate::spi::errors::{SpiError, SpiResult};
use crate::spi::tuple::{Column, Datum, TypeId};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(String),
    Literal(Option<Datum>),
    Param(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: String,
    pub op: CmpOp,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    All,
    Items(Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLock {
    Update,
    Share,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub projection: Projection,
    pub from: Option<String>,
    pub filter: Vec<Condition>,
    pub lock: Option<RowLock>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CopyTarget {
    Client,
    File(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sql {
    CreateTable {
        name: String,
        columns: Vec<Column>,
    },
    CreateTableAs {
        name: String,
        query: Select,
        select_into: bool,
    },
    DropTable {
        name: String,
    },
    ShowTables,
    Select(Select),
    Insert {
        table: String,
        columns: Option<Vec<String>>,
        rows: Vec<Vec<Expr>>,
        returning: Option<Projection>,
    },
    Update {
        table: String,
        assignments: Vec<(String, Expr)>,
        filter: Vec<Condition>,
        returning: Option<Projection>,
    },
    Delete {
        table: String,
        filter: Vec<Condition>,
        returning: Option<Projection>,
    },
    Copy {
        table: String,
        to: bool,
        target: CopyTarget,
    },
    Transaction,
    Call {
        procedure: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Number(String),
    Str(String),
    Param(usize),
    Symbol(&'static str),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Word(w) | Token::Number(w) => f.write_str(w),
            Token::Str(s) => write!(f, "'{}'", s),
            Token::Param(n) => write!(f, "${}", n),
            Token::Symbol(s) => f.write_str(s),
        }
    }
}

struct Spanned {
    token: Token,
    start: usize,
    end: usize,
}

const SYMBOLS: [&str; 13] = [
    "<=", ">=", "<>", "!=", "(", ")", ",", "*", "=", "<", ">", ";", "-",
];

const RESERVED: [&str; 12] = [
    "from", "where", "into", "for", "and", "returning", "values", "set", "as", "to", "select",
    "null",
];

fn syntax_error(near: &str) -> SpiError {
    SpiError::Engine(format!("syntax error at or near \"{}\"", near))
}

fn lex(src: &str) -> SpiResult<Vec<Spanned>> {
    let bytes = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if src[i..].starts_with("--") {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        let start = i;
        let token = if c.is_ascii_alphabetic() || c == b'_' {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            Token::Word(src[start..i].to_string())
        } else if c.is_ascii_digit() {
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            Token::Number(src[start..i].to_string())
        } else if c == b'\'' {
            let mut text = String::new();
            i += 1;
            loop {
                match bytes.get(i) {
                    None => {
                        return Err(SpiError::Engine("unterminated quoted string".into()));
                    }
                    Some(b'\'') if bytes.get(i + 1) == Some(&b'\'') => {
                        text.push('\'');
                        i += 2;
                    }
                    Some(b'\'') => {
                        i += 1;
                        break;
                    }
                    Some(_) => {
                        let ch = src[i..].chars().next().unwrap_or_default();
                        text.push(ch);
                        i += ch.len_utf8().max(1);
                    }
                }
            }
            Token::Str(text)
        } else if c == b'$' {
            i += 1;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            let n = src[start + 1..i]
                .parse::<usize>()
                .map_err(|_| syntax_error("$"))?;
            Token::Param(n)
        } else {
            match SYMBOLS.iter().find(|s| src[i..].starts_with(**s)) {
                Some(s) => {
                    i += s.len();
                    Token::Symbol(s)
                }
                None => {
                    let ch = src[i..].chars().next().unwrap_or_default();
                    return Err(syntax_error(&ch.to_string()));
                }
            }
        };
        out.push(Spanned {
            token,
            start,
            end: i,
        });
    }
    Ok(out)
}

/// One statement cut out of the source.
pub struct Piece {
    pub text: String,
    pub tag: String,
    pub sql: Sql,
}

/// Split `src` on semicolons and parse each statement.
pub fn parse_all(src: &str) -> SpiResult<Vec<Piece>> {
    let tokens = lex(src)?;
    let mut pieces = Vec::new();
    let mut current: Vec<Spanned> = Vec::new();
    for spanned in tokens.into_iter().chain(std::iter::once(Spanned {
        token: Token::Symbol(";"),
        start: src.len(),
        end: src.len(),
    })) {
        if spanned.token != Token::Symbol(";") {
            current.push(spanned);
            continue;
        }
        if current.is_empty() {
            continue;
        }
        let start = current[0].start;
        let end = current[current.len() - 1].end;
        let tokens: Vec<Token> = current.drain(..).map(|s| s.token).collect();
        let (tag, sql) = Parser { tokens, pos: 0 }.statement()?;
        pieces.push(Piece {
            text: src[start..end].to_string(),
            tag,
            sql,
        });
    }
    Ok(pieces)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn error(&self) -> SpiError {
        match self.peek() {
            Some(t) => syntax_error(&t.to_string()),
            None => SpiError::Engine("syntax error at end of input".into()),
        }
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(kw))
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        let hit = self.at_keyword(kw);
        if hit {
            self.pos += 1;
        }
        hit
    }

    fn expect_keyword(&mut self, kw: &str) -> SpiResult<()> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(self.error())
        }
    }

    fn eat_symbol(&mut self, sym: &str) -> bool {
        let hit = matches!(self.peek(), Some(Token::Symbol(s)) if *s == sym);
        if hit {
            self.pos += 1;
        }
        hit
    }

    fn expect_symbol(&mut self, sym: &str) -> SpiResult<()> {
        if self.eat_symbol(sym) {
            Ok(())
        } else {
            Err(self.error())
        }
    }

    fn ident(&mut self) -> SpiResult<String> {
        match self.peek() {
            Some(Token::Word(w)) if !RESERVED.contains(&w.to_ascii_lowercase().as_str()) => {
                let name = w.to_ascii_lowercase();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.error()),
        }
    }

    fn end(&self) -> SpiResult<()> {
        match self.peek() {
            None => Ok(()),
            Some(_) => Err(self.error()),
        }
    }

    fn statement(mut self) -> SpiResult<(String, Sql)> {
        let first = match self.peek() {
            Some(Token::Word(w)) => w.to_ascii_uppercase(),
            _ => return Err(self.error()),
        };
        let parsed = match first.as_str() {
            "SELECT" => self.select_statement()?,
            "INSERT" => ("INSERT".to_string(), self.insert()?),
            "UPDATE" => ("UPDATE".to_string(), self.update()?),
            "DELETE" => ("DELETE".to_string(), self.delete()?),
            "CREATE" => self.create()?,
            "DROP" => {
                self.pos += 1;
                self.expect_keyword("table")?;
                let name = self.ident()?;
                ("DROP TABLE".to_string(), Sql::DropTable { name })
            }
            "SHOW" => {
                self.pos += 1;
                self.expect_keyword("tables")?;
                ("SHOW".to_string(), Sql::ShowTables)
            }
            "COPY" => ("COPY".to_string(), self.copy()?),
            "BEGIN" | "COMMIT" | "END" | "ROLLBACK" | "ABORT" => {
                self.pos += 1;
                let _ = self.eat_keyword("transaction") || self.eat_keyword("work");
                let tag = if first == "END" { "COMMIT".to_string() } else { first };
                (tag, Sql::Transaction)
            }
            "START" => {
                self.pos += 1;
                self.expect_keyword("transaction")?;
                ("START TRANSACTION".to_string(), Sql::Transaction)
            }
            "SAVEPOINT" | "RELEASE" => {
                self.pos += 1;
                self.eat_keyword("savepoint");
                self.ident()?;
                (first, Sql::Transaction)
            }
            "CALL" => ("CALL".to_string(), self.call()?),
            _ => return Err(self.error()),
        };
        self.end()?;
        Ok(parsed)
    }

    fn select_statement(&mut self) -> SpiResult<(String, Sql)> {
        let (select, into) = self.select()?;
        Ok(match into {
            Some(name) => (
                "SELECT INTO".to_string(),
                Sql::CreateTableAs {
                    name,
                    query: select,
                    select_into: true,
                },
            ),
            None => ("SELECT".to_string(), Sql::Select(select)),
        })
    }

    fn select(&mut self) -> SpiResult<(Select, Option<String>)> {
        self.expect_keyword("select")?;
        let projection = self.projection()?;
        let into = if self.eat_keyword("into") {
            Some(self.ident()?)
        } else {
            None
        };
        let from = if self.eat_keyword("from") {
            Some(self.ident()?)
        } else {
            None
        };
        let filter = self.filter()?;
        let lock = if self.eat_keyword("for") {
            if self.eat_keyword("update") {
                Some(RowLock::Update)
            } else {
                self.expect_keyword("share")?;
                Some(RowLock::Share)
            }
        } else {
            None
        };
        Ok((
            Select {
                projection,
                from,
                filter,
                lock,
            },
            into,
        ))
    }

    fn projection(&mut self) -> SpiResult<Projection> {
        if self.eat_symbol("*") {
            return Ok(Projection::All);
        }
        let mut items = vec![self.expr()?];
        while self.eat_symbol(",") {
            items.push(self.expr()?);
        }
        Ok(Projection::Items(items))
    }

    fn returning(&mut self) -> SpiResult<Option<Projection>> {
        if self.eat_keyword("returning") {
            Ok(Some(self.projection()?))
        } else {
            Ok(None)
        }
    }

    fn filter(&mut self) -> SpiResult<Vec<Condition>> {
        let mut conditions = Vec::new();
        if !self.eat_keyword("where") {
            return Ok(conditions);
        }
        loop {
            let column = self.ident()?;
            let op = match self.next() {
                Some(Token::Symbol("=")) => CmpOp::Eq,
                Some(Token::Symbol("<>")) | Some(Token::Symbol("!=")) => CmpOp::NotEq,
                Some(Token::Symbol("<")) => CmpOp::Lt,
                Some(Token::Symbol("<=")) => CmpOp::LtEq,
                Some(Token::Symbol(">")) => CmpOp::Gt,
                Some(Token::Symbol(">=")) => CmpOp::GtEq,
                _ => {
                    self.pos -= 1;
                    return Err(self.error());
                }
            };
            let value = self.expr()?;
            conditions.push(Condition { column, op, value });
            if !self.eat_keyword("and") {
                return Ok(conditions);
            }
        }
    }

    fn expr(&mut self) -> SpiResult<Expr> {
        let negative = self.eat_symbol("-");
        let expr = match self.peek().cloned() {
            Some(Token::Number(n)) => {
                self.pos += 1;
                let n = if negative { format!("-{}", n) } else { n };
                if n.contains('.') {
                    n.parse::<f64>()
                        .map(|v| Expr::Literal(Some(Datum::Float(v))))
                        .map_err(|_| syntax_error(&n))?
                } else {
                    n.parse::<i64>()
                        .map(|v| Expr::Literal(Some(Datum::Int(v))))
                        .map_err(|_| syntax_error(&n))?
                }
            }
            _ if negative => return Err(self.error()),
            Some(Token::Str(s)) => {
                self.pos += 1;
                Expr::Literal(Some(Datum::Text(s)))
            }
            Some(Token::Param(n)) => {
                self.pos += 1;
                Expr::Param(n)
            }
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("null") => {
                self.pos += 1;
                Expr::Literal(None)
            }
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("true") => {
                self.pos += 1;
                Expr::Literal(Some(Datum::Bool(true)))
            }
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("false") => {
                self.pos += 1;
                Expr::Literal(Some(Datum::Bool(false)))
            }
            _ => Expr::Column(self.ident()?),
        };
        Ok(expr)
    }

    fn expr_list(&mut self) -> SpiResult<Vec<Expr>> {
        self.expect_symbol("(")?;
        let mut items = Vec::new();
        if self.eat_symbol(")") {
            return Ok(items);
        }
        loop {
            items.push(self.expr()?);
            if self.eat_symbol(")") {
                return Ok(items);
            }
            self.expect_symbol(",")?;
        }
    }

    fn insert(&mut self) -> SpiResult<Sql> {
        self.expect_keyword("insert")?;
        self.expect_keyword("into")?;
        let table = self.ident()?;
        let columns = if self.eat_symbol("(") {
            let mut names = vec![self.ident()?];
            while self.eat_symbol(",") {
                names.push(self.ident()?);
            }
            self.expect_symbol(")")?;
            Some(names)
        } else {
            None
        };
        self.expect_keyword("values")?;
        let mut rows = vec![self.expr_list()?];
        while self.eat_symbol(",") {
            rows.push(self.expr_list()?);
        }
        let returning = self.returning()?;
        Ok(Sql::Insert {
            table,
            columns,
            rows,
            returning,
        })
    }

    fn update(&mut self) -> SpiResult<Sql> {
        self.expect_keyword("update")?;
        let table = self.ident()?;
        self.expect_keyword("set")?;
        let mut assignments = Vec::new();
        loop {
            let column = self.ident()?;
            self.expect_symbol("=")?;
            assignments.push((column, self.expr()?));
            if !self.eat_symbol(",") {
                break;
            }
        }
        let filter = self.filter()?;
        let returning = self.returning()?;
        Ok(Sql::Update {
            table,
            assignments,
            filter,
            returning,
        })
    }

    fn delete(&mut self) -> SpiResult<Sql> {
        self.expect_keyword("delete")?;
        self.expect_keyword("from")?;
        let table = self.ident()?;
        let filter = self.filter()?;
        let returning = self.returning()?;
        Ok(Sql::Delete {
            table,
            filter,
            returning,
        })
    }

    fn create(&mut self) -> SpiResult<(String, Sql)> {
        self.expect_keyword("create")?;
        self.expect_keyword("table")?;
        let name = self.ident()?;
        if self.eat_keyword("as") {
            let (query, into) = self.select()?;
            if into.is_some() {
                return Err(syntax_error("INTO"));
            }
            return Ok((
                "CREATE TABLE AS".to_string(),
                Sql::CreateTableAs {
                    name,
                    query,
                    select_into: false,
                },
            ));
        }
        self.expect_symbol("(")?;
        let mut columns = Vec::new();
        loop {
            let column = self.ident()?;
            let type_name = match self.next() {
                Some(Token::Word(w)) => w,
                _ => {
                    self.pos -= 1;
                    return Err(self.error());
                }
            };
            let type_id = TypeId::parse(&type_name).ok_or_else(|| {
                SpiError::Engine(format!("type \"{}\" does not exist", type_name))
            })?;
            columns.push(Column::new(column, type_id));
            if self.eat_symbol(")") {
                break;
            }
            self.expect_symbol(",")?;
        }
        Ok(("CREATE TABLE".to_string(), Sql::CreateTable { name, columns }))
    }

    fn copy(&mut self) -> SpiResult<Sql> {
        self.expect_keyword("copy")?;
        let table = self.ident()?;
        let to = if self.eat_keyword("to") {
            true
        } else {
            self.expect_keyword("from")?;
            false
        };
        let target = match self.next() {
            Some(Token::Word(w))
                if w.eq_ignore_ascii_case("stdout") || w.eq_ignore_ascii_case("stdin") =>
            {
                CopyTarget::Client
            }
            Some(Token::Str(path)) => CopyTarget::File(path),
            _ => {
                self.pos -= 1;
                return Err(self.error());
            }
        };
        Ok(Sql::Copy { table, to, target })
    }

    fn call(&mut self) -> SpiResult<Sql> {
        self.expect_keyword("call")?;
        let procedure = self.ident()?;
        let args = self.expr_list()?;
        Ok(Sql::Call { procedure, args })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(src: &str) -> Piece {
        let mut pieces = parse_all(src).unwrap();
        assert_eq!(pieces.len(), 1);
        pieces.remove(0)
    }

    #[test]
    fn test_split_on_semicolons() {
        let pieces = parse_all("insert into t values (1); ; select * from t;").unwrap();
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].tag, "INSERT");
        assert_eq!(pieces[0].text, "insert into t values (1)");
        assert_eq!(pieces[1].tag, "SELECT");
    }

    #[test]
    fn test_select_with_filter_and_lock() {
        let p = one("SELECT id, name FROM Users WHERE id >= $1 AND name <> 'x' FOR UPDATE");
        match p.sql {
            Sql::Select(s) => {
                assert_eq!(s.from.as_deref(), Some("users"));
                assert_eq!(s.filter.len(), 2);
                assert_eq!(s.filter[0].op, CmpOp::GtEq);
                assert_eq!(s.filter[0].value, Expr::Param(1));
                assert_eq!(s.lock, Some(RowLock::Update));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_select_into_and_create_as() {
        assert_eq!(one("select * into t2 from t").tag, "SELECT INTO");
        assert_eq!(one("create table t2 as select * from t").tag, "CREATE TABLE AS");
    }

    #[test]
    fn test_literals() {
        let p = one("insert into t values (-3, 2.5, 'it''s', true, null)");
        match p.sql {
            Sql::Insert { rows, .. } => assert_eq!(
                rows[0],
                vec![
                    Expr::Literal(Some(Datum::Int(-3))),
                    Expr::Literal(Some(Datum::Float(2.5))),
                    Expr::Literal(Some(Datum::Text("it's".into()))),
                    Expr::Literal(Some(Datum::Bool(true))),
                    Expr::Literal(None),
                ]
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_transaction_and_copy_tags() {
        assert_eq!(one("begin").tag, "BEGIN");
        assert_eq!(one("end").tag, "COMMIT");
        assert_eq!(one("savepoint a").tag, "SAVEPOINT");
        assert_eq!(
            one("copy t to stdout").sql,
            Sql::Copy {
                table: "t".into(),
                to: true,
                target: CopyTarget::Client
            }
        );
    }

    #[test]
    fn test_syntax_errors() {
        let err = parse_all("select from t").err().unwrap();
        assert_eq!(err, SpiError::Engine("syntax error at or near \"from\"".into()));
        let err = parse_all("insert into t values (1").err().unwrap();
        assert_eq!(err, SpiError::Engine("syntax error at end of input".into()));
        assert!(parse_all("select 'open").is_err());
        assert!(parse_all("merge into t").is_err());
    }
}
