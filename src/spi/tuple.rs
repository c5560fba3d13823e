//! Rows, row descriptors and the column helpers procedural callers use
//!
//! Column numbers are 1-based. Asking for column 0 or one past the end is a
//! routine `ERROR_NOATTRIBUTE` failure, not a raised error.

use std::fmt;

use super::codes::SpiResultCode;
use super::errors::{SpiError, SpiResult};

/// Column types understood by the reference engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeId {
    Bool,
    Int8,
    Float8,
    Text,
}

impl TypeId {
    pub fn oid(self) -> u32 {
        match self {
            TypeId::Bool => 16,
            TypeId::Int8 => 20,
            TypeId::Text => 25,
            TypeId::Float8 => 701,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TypeId::Bool => "bool",
            TypeId::Int8 => "int8",
            TypeId::Text => "text",
            TypeId::Float8 => "float8",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Some(TypeId::Bool),
            "int" | "int4" | "int8" | "integer" | "bigint" => Some(TypeId::Int8),
            "float" | "float8" | "double" => Some(TypeId::Float8),
            "text" | "varchar" => Some(TypeId::Text),
            _ => None,
        }
    }
}

/// A non-null column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Datum {
    pub fn type_id(&self) -> TypeId {
        match self {
            Datum::Bool(_) => TypeId::Bool,
            Datum::Int(_) => TypeId::Int8,
            Datum::Float(_) => TypeId::Float8,
            Datum::Text(_) => TypeId::Text,
        }
    }

    /// Bytes charged to a scope for holding this value.
    pub fn size(&self) -> u64 {
        match self {
            Datum::Bool(_) => 1,
            Datum::Int(_) | Datum::Float(_) => 8,
            Datum::Text(s) => s.len() as u64 + 4,
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Bool(true) => f.write_str("t"),
            Datum::Bool(false) => f.write_str("f"),
            Datum::Int(v) => write!(f, "{}", v),
            Datum::Float(v) => write!(f, "{}", v),
            Datum::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_id: TypeId,
}

impl Column {
    pub fn new(name: impl Into<String>, type_id: TypeId) -> Self {
        Self {
            name: name.into(),
            type_id,
        }
    }
}

/// Row descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TupleDesc {
    pub columns: Vec<Column>,
}

impl TupleDesc {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn natts(&self) -> usize {
        self.columns.len()
    }

    fn column(&self, fnumber: usize) -> SpiResult<&Column> {
        if fnumber == 0 || fnumber > self.natts() {
            return Err(SpiResultCode::ErrorNoAttribute.into());
        }
        Ok(&self.columns[fnumber - 1])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tuple {
    pub values: Vec<Option<Datum>>,
    /// Row identifier assigned on insert, 0 otherwise.
    pub oid: u64,
}

impl Tuple {
    pub fn new(values: Vec<Option<Datum>>) -> Self {
        Self { values, oid: 0 }
    }

    pub fn size(&self) -> u64 {
        16 + self
            .values
            .iter()
            .map(|v| v.as_ref().map_or(1, Datum::size))
            .sum::<u64>()
    }
}

/// Column number of `name`.
pub fn fnumber(desc: &TupleDesc, name: &str) -> SpiResult<usize> {
    desc.columns
        .iter()
        .position(|c| c.name == name)
        .map(|i| i + 1)
        .ok_or(SpiError::Routine(SpiResultCode::ErrorNoAttribute))
}

pub fn fname(desc: &TupleDesc, fnumber: usize) -> SpiResult<&str> {
    desc.column(fnumber).map(|c| c.name.as_str())
}

/// Text form of a column, `None` for null.
pub fn getvalue(tuple: &Tuple, desc: &TupleDesc, fnumber: usize) -> SpiResult<Option<String>> {
    Ok(getbinval(tuple, desc, fnumber)?.map(Datum::to_string))
}

pub fn getbinval<'a>(
    tuple: &'a Tuple,
    desc: &TupleDesc,
    fnumber: usize,
) -> SpiResult<Option<&'a Datum>> {
    desc.column(fnumber)?;
    match tuple.values.get(fnumber - 1) {
        Some(v) => Ok(v.as_ref()),
        None => Err(SpiResultCode::ErrorNoAttribute.into()),
    }
}

pub fn gettype(desc: &TupleDesc, fnumber: usize) -> SpiResult<&'static str> {
    desc.column(fnumber).map(|c| c.type_id.name())
}

pub fn gettypeid(desc: &TupleDesc, fnumber: usize) -> SpiResult<TypeId> {
    desc.column(fnumber).map(|c| c.type_id)
}

pub fn copytuple(tuple: &Tuple) -> Tuple {
    tuple.clone()
}

/// Copy of `tuple` with the listed columns replaced.
pub fn modifytuple(
    tuple: &Tuple,
    desc: &TupleDesc,
    attnums: &[usize],
    values: &[Option<Datum>],
) -> SpiResult<Tuple> {
    if attnums.len() != values.len() {
        return Err(SpiResultCode::ErrorArgument.into());
    }
    let mut out = tuple.clone();
    for (&attnum, value) in attnums.iter().zip(values) {
        desc.column(attnum)?;
        match out.values.get_mut(attnum - 1) {
            Some(slot) => *slot = value.clone(),
            None => return Err(SpiResultCode::ErrorNoAttribute.into()),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> TupleDesc {
        TupleDesc::new(vec![
            Column::new("id", TypeId::Int8),
            Column::new("name", TypeId::Text),
        ])
    }

    fn row() -> Tuple {
        Tuple::new(vec![Some(Datum::Int(7)), None])
    }

    fn no_attribute<T: std::fmt::Debug>(r: SpiResult<T>) -> bool {
        r.unwrap_err().code() == Some(SpiResultCode::ErrorNoAttribute)
    }

    #[test]
    fn test_fnumber_and_fname() {
        let d = desc();
        assert_eq!(fnumber(&d, "name").unwrap(), 2);
        assert!(no_attribute(fnumber(&d, "missing")));
        assert_eq!(fname(&d, 1).unwrap(), "id");
        assert!(no_attribute(fname(&d, 0)));
        assert!(no_attribute(fname(&d, 3)));
    }

    #[test]
    fn test_getvalue_text_and_null() {
        let (d, t) = (desc(), row());
        assert_eq!(getvalue(&t, &d, 1).unwrap().as_deref(), Some("7"));
        assert_eq!(getvalue(&t, &d, 2).unwrap(), None);
        assert_eq!(getbinval(&t, &d, 1).unwrap(), Some(&Datum::Int(7)));
        assert!(no_attribute(getvalue(&t, &d, 3)));
    }

    #[test]
    fn test_gettype() {
        let d = desc();
        assert_eq!(gettype(&d, 2).unwrap(), "text");
        assert_eq!(gettypeid(&d, 1).unwrap(), TypeId::Int8);
        assert!(no_attribute(gettype(&d, 0)));
    }

    #[test]
    fn test_modifytuple() {
        let (d, t) = (desc(), row());
        let m = modifytuple(&t, &d, &[2], &[Some(Datum::Text("x".into()))]).unwrap();
        assert_eq!(getvalue(&m, &d, 2).unwrap().as_deref(), Some("x"));
        assert_eq!(copytuple(&t), t);
        assert!(no_attribute(modifytuple(&t, &d, &[5], &[None])));
        let err = modifytuple(&t, &d, &[1, 2], &[None]).unwrap_err();
        assert_eq!(err.code(), Some(SpiResultCode::ErrorArgument));
    }
}
