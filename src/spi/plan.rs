//! Prepared plans and their handles
//!
//! A plan is owned by the frame that prepared it until it is promoted into
//! the saved registry. Callers hold a [`SpiPlan`] handle, never the plan;
//! a handle whose plan is gone, or whose magic is wrong, is rejected with
//! `ERROR_ARGUMENT`.

use std::rc::Rc;

use super::engine::{ParamTypes, PlannedStatement, RawStatement};

/// Marks a handle as produced by this module.
pub const PLAN_MAGIC: u32 = 569_278_163;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpiPlan {
    pub(super) id: u64,
    pub(super) magic: u32,
}

impl SpiPlan {
    pub(super) fn new(id: u64) -> Self {
        Self {
            id,
            magic: PLAN_MAGIC,
        }
    }

    /// Handle that refers to nothing.
    pub fn invalid() -> Self {
        Self { id: 0, magic: 0 }
    }

    pub fn from_raw(id: u64, magic: u32) -> Self {
        Self { id, magic }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_valid_magic(&self) -> bool {
        self.magic == PLAN_MAGIC
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    /// Dies with the frame that prepared it.
    Temporary,
    /// Survives frame exit.
    Saved,
    /// Analyzed at execution time; cannot be saved.
    OneShot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScrollOption {
    /// Decide from the plan's capability.
    #[default]
    Auto,
    Scroll,
    NoScroll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CursorOptions {
    pub scroll: ScrollOption,
}

impl CursorOptions {
    pub fn scroll() -> Self {
        Self {
            scroll: ScrollOption::Scroll,
        }
    }

    pub fn no_scroll() -> Self {
        Self {
            scroll: ScrollOption::NoScroll,
        }
    }
}

/// One statement of the source text, with its analysis when known.
#[derive(Debug, Clone)]
pub struct PlanSource<T> {
    pub raw: RawStatement<T>,
    pub planned: Option<Vec<PlannedStatement<T>>>,
}

impl<T> PlanSource<T> {
    pub fn command_tag(&self) -> &str {
        &self.raw.tag
    }
}

#[derive(Debug, Clone)]
pub struct PreparedPlan<T> {
    pub kind: PlanKind,
    pub source_text: String,
    pub sources: Vec<PlanSource<T>>,
    pub param_types: ParamTypes,
    pub cursor_options: CursorOptions,
}

impl<T> PreparedPlan<T> {
    pub fn nargs(&self) -> usize {
        self.param_types.nargs()
    }

    /// Bytes charged to the owning scope.
    pub fn footprint(&self) -> u64 {
        let sources: usize = self.sources.iter().map(|s| s.raw.text.len() + 64).sum();
        (self.source_text.len() + sources + 64) as u64
    }

    /// Exactly one statement, and it returns rows.
    pub fn is_cursor_plan(&self) -> bool {
        match self.sources.as_slice() {
            [only] => match &only.planned {
                Some(stmts) => stmts.iter().any(PlannedStatement::returns_tuples),
                None => false,
            },
            _ => false,
        }
    }
}

/// Registry slot holding a plan. Saved plans are shared by reference count
/// so a running statement keeps its plan alive even if it is freed.
#[derive(Debug)]
pub(super) struct PlanEntry<T> {
    pub plan: Rc<PreparedPlan<T>>,
    /// Frame index for temporary plans, `None` once saved.
    pub frame: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_magic() {
        assert!(SpiPlan::new(3).is_valid_magic());
        assert!(!SpiPlan::invalid().is_valid_magic());
        assert!(!SpiPlan::from_raw(3, 7).is_valid_magic());
        assert_eq!(SpiPlan::new(3).id(), 3);
    }

    #[test]
    fn test_multi_source_is_not_cursor_plan() {
        let raw = RawStatement {
            text: "x".to_string(),
            tag: "SELECT".to_string(),
            tree: (),
        };
        let plan = PreparedPlan {
            kind: PlanKind::Temporary,
            source_text: "x; x".into(),
            sources: vec![
                PlanSource {
                    raw: raw.clone(),
                    planned: None,
                },
                PlanSource { raw, planned: None },
            ],
            param_types: ParamTypes::None,
            cursor_options: CursorOptions::default(),
        };
        assert!(!plan.is_cursor_plan());
        assert_eq!(plan.sources[0].command_tag(), "SELECT");
        assert!(plan.footprint() > 0);
    }
}
