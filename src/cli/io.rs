//! JSON output and statement input for the CLI
//!
//! - Output: one JSON object per line on stdout
//! - Input: one statement per line on stdin

use std::io::{self, BufRead, Write};

use serde_json::Value;

use super::errors::CliResult;

/// Read statements from stdin, one per non-empty line.
pub fn read_statements() -> CliResult<Vec<String>> {
    let stdin = io::stdin();
    let mut statements = Vec::new();
    for line in stdin.lock().lines() {
        let line = line?;
        let trimmed = line.trim();
        if !trimmed.is_empty() && !trimmed.starts_with("--") {
            statements.push(trimmed.to_string());
        }
    }
    Ok(statements)
}

/// Write a success response to stdout
pub fn write_response(data: Value) -> CliResult<()> {
    write_line(&serde_json::json!({
        "status": "ok",
        "data": data
    }))
}

/// Write an error response to stdout
pub fn write_error(code: &str, message: &str) -> CliResult<()> {
    write_line(&serde_json::json!({
        "status": "error",
        "code": code,
        "message": message
    }))
}

fn write_line(value: &Value) -> CliResult<()> {
    let mut stdout = io::stdout();
    serde_json::to_writer(&mut stdout, value)?;
    writeln!(stdout)?;
    stdout.flush()?;
    Ok(())
}
