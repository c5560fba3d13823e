//! SPI call stack tests
//!
//! Exercises the frame stack the way procedures use it:
//! - A procedure reached through CALL connects its own frame
//! - Recursion grows the stack past its initial capacity
//! - Subtransaction abort unwinds frames a failed procedure left behind
//! - Transaction end clears every frame, temporary plan and cursor

use std::cell::Cell;
use std::rc::Rc;

use aerorepl::spi::{
    Datum, Destination, MemoryEngine, SpiConfig, SpiContext, SpiError, SpiResult, SpiResultCode,
};

// =============================================================================
// Fixtures
// =============================================================================

fn context() -> SpiContext<MemoryEngine> {
    SpiContext::new(MemoryEngine::new(), SpiConfig::default())
}

fn int_arg(args: &[Option<Datum>]) -> SpiResult<i64> {
    match args.first() {
        Some(Some(Datum::Int(n))) => Ok(*n),
        _ => Err(SpiError::Engine("expected an integer argument".into())),
    }
}

fn int_column(c: &SpiContext<MemoryEngine>) -> Vec<i64> {
    c.tuptable()
        .map(|t| {
            t.rows()
                .iter()
                .filter_map(|r| match &r.values[0] {
                    Some(Datum::Int(v)) => Some(*v),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

// =============================================================================
// Nested procedures
// =============================================================================

/// A procedure connects inside the caller's operation, does its own work
/// and finishes, leaving the caller's frame as it was.
#[test]
fn test_call_connects_nested_frame() {
    let mut c = context();
    c.register_procedure("audit", |c: &mut SpiContext<MemoryEngine>, args| {
        let id = int_arg(args)?;
        c.connect(Destination::Spi, None)?;
        assert_eq!((c.connected(), c.current(), c.depth()), (1, 0, 2));
        c.exec(&format!("insert into audit values ({})", id), 0)?;
        c.finish()?;
        Ok(())
    });

    c.connect(Destination::Spi, None).unwrap();
    c.exec("create table audit (id int8)", 0).unwrap();
    assert_eq!(c.exec("call audit(7)", 0).unwrap(), SpiResultCode::OkUtility);
    assert_eq!((c.connected(), c.current(), c.depth()), (0, -1, 1));

    c.exec("select id from audit", 0).unwrap();
    assert_eq!(int_column(&c), vec![7]);
    assert_eq!(c.finish().unwrap(), SpiResultCode::OkFinish);
}

/// A procedure that has not been registered is an engine error and does
/// not disturb the stack.
#[test]
fn test_call_unknown_procedure() {
    let mut c = context();
    c.connect(Destination::Spi, None).unwrap();
    let err = c.exec("call missing()", 0).unwrap_err();
    assert_eq!(err, SpiError::Engine("procedure missing() does not exist".into()));
    assert_eq!((c.connected(), c.current()), (0, -1));
}

/// Outside a running operation a second connect is refused.
#[test]
fn test_connect_outside_operation_refused() {
    let mut c = context();
    c.connect(Destination::Spi, None).unwrap();
    let err = c.connect(Destination::Spi, None).unwrap_err();
    assert_eq!(err.code(), Some(SpiResultCode::ErrorConnect));
    assert_eq!(c.depth(), 1);
}

/// Recursing through CALL deepens the stack past its initial capacity,
/// which doubles as needed, and unwinds back to one frame.
#[test]
fn test_recursive_calls_grow_stack() {
    let mut c = SpiContext::new(
        MemoryEngine::new(),
        SpiConfig {
            stack_size: 2,
            ..SpiConfig::default()
        },
    );
    let deepest = Rc::new(Cell::new(0usize));
    let seen = Rc::clone(&deepest);
    c.register_procedure("nest", move |c: &mut SpiContext<MemoryEngine>, args| {
        let n = int_arg(args)?;
        c.connect(Destination::Spi, None)?;
        seen.set(seen.get().max(c.depth()));
        if n > 0 {
            c.exec(&format!("call nest({})", n - 1), 0)?;
        }
        c.finish()?;
        Ok(())
    });

    c.connect(Destination::Spi, None).unwrap();
    c.exec("call nest(3)", 0).unwrap();
    assert_eq!(deepest.get(), 5);
    assert_eq!(c.stack_capacity(), 8);
    assert_eq!((c.connected(), c.current(), c.depth()), (0, -1, 1));
}

// =============================================================================
// Transaction boundaries
// =============================================================================

/// A procedure that fails while connected leaves its frame behind. Aborting
/// the subtransaction it ran in pops that frame and the caller resumes.
#[test]
fn test_subtransaction_abort_unwinds_failed_procedure() {
    let mut c = context();
    c.register_procedure("broken", |c: &mut SpiContext<MemoryEngine>, _args| {
        c.connect(Destination::Spi, None)?;
        c.exec("select id from nowhere", 0)?;
        c.finish()?;
        Ok(())
    });

    c.connect(Destination::Spi, None).unwrap();
    c.exec("create table t (id int8)", 0).unwrap();

    let sub = c.engine_mut().begin_subtransaction();
    assert!(c.exec("call broken()", 0).is_err());
    assert_eq!(c.depth(), 2);

    c.at_eosubxact(false, sub);
    c.engine_mut().end_subtransaction();
    assert_eq!((c.connected(), c.depth()), (0, 1));
    c.restore_connection();
    assert_eq!(c.current(), -1);

    c.exec("insert into t values (1)", 0).unwrap();
    c.exec("select id from t", 0).unwrap();
    assert_eq!(int_column(&c), vec![1]);
    c.finish().unwrap();
}

/// Committing a subtransaction whose frames are still connected pops them
/// as well, reporting the leak.
#[test]
fn test_subtransaction_commit_pops_leaked_frames() {
    let mut c = context();
    c.connect(Destination::Spi, None).unwrap();
    c.push();
    let sub = c.engine_mut().begin_subtransaction();
    c.connect(Destination::Spi, None).unwrap();

    c.at_eosubxact(true, sub);
    assert_eq!((c.connected(), c.depth()), (0, 1));
}

/// Transaction end forgets every frame, temporary plan and cursor, and
/// keeps saved plans.
#[test]
fn test_eoxact_resets_everything_but_saved_plans() {
    let mut c = context();
    c.connect(Destination::Spi, None).unwrap();
    c.exec("create table t (id int8)", 0).unwrap();
    c.exec("insert into t values (1), (2)", 0).unwrap();

    let temporary = c.prepare("select id from t", &[]).unwrap();
    let kept = c.prepare("select id from t", &[]).unwrap();
    c.keepplan(kept).unwrap();
    c.cursor_open(Some("open"), temporary, None, true).unwrap();
    c.push();
    c.connect(Destination::Spi, None).unwrap();

    c.at_eoxact(true);
    assert_eq!((c.connected(), c.current(), c.depth()), (-1, -1, 0));
    assert!(c.cursor_find("open").is_none());
    assert_eq!(c.saved_plan_count(), 1);

    // next transaction
    c.connect(Destination::Spi, None).unwrap();
    assert_eq!(
        c.execp(temporary, None, 0).unwrap_err().code(),
        Some(SpiResultCode::ErrorArgument)
    );
    assert_eq!(c.execp(kept, None, 0).unwrap(), SpiResultCode::OkSelect);
    assert_eq!(c.processed(), 2);
    c.finish().unwrap();
}
