//! CLI command implementations

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::observability::{log_event_with_fields, Event, Logger};
use crate::replication::{ReplicationServer, SenderContext, SlotManager, SystemClock};
use crate::spi::{getvalue, Destination, MemoryEngine, SpiContext, SpiError, SpiResultCode};
use crate::wal::{segment_file_name, LogPosition, SegmentDirLog};

use super::args::Command;
use super::config::ServerConfig;
use super::errors::{CliError, CliResult};
use super::io::{read_statements, write_error, write_response};

/// Dispatch a parsed command
pub fn run_command(command: Command) -> CliResult<()> {
    match command {
        Command::Serve { config } => serve(&config),
        Command::CheckConfig { config } => check_config(&config),
        Command::Lsn {
            position,
            segment_size,
        } => lsn(&position, segment_size),
        Command::Exec {
            sql,
            read_only,
            limit,
        } => {
            let statements = if sql.is_empty() {
                read_statements()?
            } else {
                sql
            };
            exec(&statements, read_only, limit)
        }
    }
}

/// Serve replication connections until Ctrl-C.
pub fn serve(config_path: &Path) -> CliResult<()> {
    let config = ServerConfig::load(config_path)?;
    Logger::set_min_severity(config.log_severity()?);

    let sender = config.to_sender_config()?;
    let path = config_path.display().to_string();
    log_event_with_fields(
        Event::ConfigLoaded,
        &[("config", &path), ("node_name", &sender.node_name)],
    );
    let log = SegmentDirLog::open(config.log_path(), sender.segment_size, config.timeline)?;
    let slots = match config.slot_path() {
        Some(dir) => SlotManager::open(dir)?,
        None => SlotManager::in_memory(),
    };
    let ctx = SenderContext::new(
        sender,
        Arc::new(log),
        Arc::new(slots),
        Arc::new(SystemClock),
    );
    let server = ReplicationServer::new(ctx, config.listen_addr.clone());

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::serve_failed(format!("could not start runtime: {}", e)))?;
    runtime.block_on(server.run())?;
    Ok(())
}

/// Validate a configuration file and print the effective settings.
pub fn check_config(config_path: &Path) -> CliResult<()> {
    let config = match ServerConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            write_error(e.code_str(), e.message())?;
            return Err(e);
        }
    };
    write_response(serde_json::to_value(&config)?)
}

/// Print the segment a position falls in.
pub fn lsn(position: &str, segment_size: u64) -> CliResult<()> {
    if !segment_size.is_power_of_two() {
        return Err(CliError::invalid_argument(format!(
            "segment size {} is not a power of two",
            segment_size
        )));
    }
    let pos = LogPosition::parse(position)
        .map_err(|e| CliError::invalid_argument(e.to_string()))?;
    write_response(describe_position(pos, segment_size))
}

fn describe_position(pos: LogPosition, segment_size: u64) -> Value {
    let segno = pos.segment_no(segment_size);
    json!({
        "position": pos.to_string(),
        "bytes": pos.as_u64(),
        "segment": segno,
        "segment_offset": pos.segment_offset(segment_size),
        "segment_start": pos.segment_start(segment_size).to_string(),
        "file": segment_file_name(1, segno, segment_size),
    })
}

/// Run statements through a connected frame and print one result per
/// statement. Stops at the first failure.
pub fn exec(statements: &[String], read_only: bool, limit: i64) -> CliResult<()> {
    let mut ctx = SpiContext::new(MemoryEngine::new(), Default::default());
    ctx.connect(Destination::Spi, None)?;
    for sql in statements {
        match ctx.execute(sql, read_only, limit) {
            Ok(code) => write_response(render_result(&ctx, sql, code)?)?,
            Err(e) => {
                let code = error_code(&e);
                write_error(&code, &e.to_string())?;
                ctx.restore_connection();
                ctx.finish()?;
                ctx.at_eoxact(false);
                return Err(e.into());
            }
        }
    }
    ctx.finish()?;
    ctx.at_eoxact(true);
    Ok(())
}

fn error_code(e: &SpiError) -> String {
    match e.code() {
        Some(code) => code.as_str().to_string(),
        None => match e {
            SpiError::DataCorrupted(_) => "SPI_DATA_CORRUPTED".to_string(),
            SpiError::OutOfMemory { .. } => "SPI_OUT_OF_MEMORY".to_string(),
            _ => "SPI_ERROR".to_string(),
        },
    }
}

fn render_result(
    ctx: &SpiContext<MemoryEngine>,
    sql: &str,
    code: SpiResultCode,
) -> CliResult<Value> {
    let mut data = json!({
        "statement": sql,
        "result": code.as_str(),
        "processed": ctx.processed(),
    });
    if ctx.last_oid() != 0 {
        data["last_oid"] = json!(ctx.last_oid());
    }
    if let Some(table) = ctx.tuptable() {
        let desc = table.desc();
        let columns: Vec<&str> = desc.columns.iter().map(|c| c.name.as_str()).collect();
        let mut rows = Vec::with_capacity(table.filled());
        for tuple in table.rows() {
            let row = (1..=desc.natts())
                .map(|i| getvalue(tuple, desc, i))
                .collect::<Result<Vec<_>, _>>()?;
            rows.push(row);
        }
        data["columns"] = json!(columns);
        data["rows"] = json!(rows);
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_position() {
        let pos = LogPosition::parse("1/2000010").unwrap();
        let v = describe_position(pos, 16 * 1024 * 1024);
        assert_eq!(v["position"], "1/2000010");
        assert_eq!(v["segment"], 258);
        assert_eq!(v["segment_offset"], 16);
        assert_eq!(v["segment_start"], "1/2000000");
        assert_eq!(v["file"], "000000010000000100000002");
    }

    #[test]
    fn test_lsn_rejects_bad_input() {
        assert_eq!(
            lsn("nonsense", 16 * 1024 * 1024).unwrap_err().code_str(),
            "AERO_CLI_INVALID_ARGUMENT"
        );
        assert!(lsn("0/10", 1000).is_err());
    }

    #[test]
    fn test_render_select_result() {
        let mut ctx = SpiContext::new(MemoryEngine::new(), Default::default());
        ctx.connect(Destination::Spi, None).unwrap();
        ctx.exec("create table t (id int8, name text)", 0).unwrap();
        ctx.exec("insert into t values (1, 'a'), (2, null)", 0).unwrap();
        let code = ctx.exec("select * from t", 0).unwrap();
        let v = render_result(&ctx, "select * from t", code).unwrap();
        assert_eq!(v["result"], "SPI_OK_SELECT");
        assert_eq!(v["processed"], 2);
        assert_eq!(v["columns"], json!(["id", "name"]));
        assert_eq!(v["rows"], json!([["1", "a"], ["2", null]]));
    }

    #[test]
    fn test_exec_stops_at_first_failure() {
        let err = exec(
            &["create table t (id int8)".to_string(), "begin".to_string()],
            false,
            0,
        )
        .unwrap_err();
        assert_eq!(err.code_str(), "AERO_CLI_EXEC_FAILED");
        assert!(exec(&["show tables".to_string()], true, 0).is_ok());
    }
}
