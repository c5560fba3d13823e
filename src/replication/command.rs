//! Replication command grammar
//!
//! ```text
//! IDENTIFY_SYSTEM | IDENTIFY_VERSION | IDENTIFY_MODE | IDENTIFY_MAXLSN
//! IDENTIFY_CONSISTENCY <pos>
//! IDENTIFY_CHANNEL <address>
//! CREATE_REPLICATION_SLOT <name> PHYSICAL [<pos>]
//! CREATE_REPLICATION_SLOT <name> LOGICAL <plugin>
//! DROP_REPLICATION_SLOT <name>
//! START_REPLICATION [SLOT <name>] [PHYSICAL] <pos>
//! START_REPLICATION SLOT <name> LOGICAL <pos> [( <opt> ['<value>'] [, ...] )]
//! FETCH_CHECKPOINT
//! ```
//!
//! Keywords are case-insensitive and a trailing `;` is allowed. Anything
//! else is a protocol violation.

use std::fmt;

use super::errors::{ReplicationError, ReplicationResult};
use crate::wal::LogPosition;

/// What kind of slot CREATE_REPLICATION_SLOT asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotSpec {
    Physical { restart: Option<LogPosition> },
    Logical { plugin: String },
}

/// Physical or logical START_REPLICATION.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartMode {
    Physical,
    Logical { options: Vec<(String, Option<String>)> },
}

/// A parsed replication command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationCommand {
    IdentifySystem,
    IdentifyVersion,
    IdentifyMode,
    IdentifyMaxLsn,
    IdentifyConsistency {
        position: LogPosition,
    },
    IdentifyChannel {
        address: String,
    },
    CreateSlot {
        name: String,
        spec: SlotSpec,
    },
    DropSlot {
        name: String,
    },
    StartReplication {
        slot: Option<String>,
        start: LogPosition,
        mode: StartMode,
    },
    FetchCheckpoint,
}

impl ReplicationCommand {
    /// Command name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ReplicationCommand::IdentifySystem => "IDENTIFY_SYSTEM",
            ReplicationCommand::IdentifyVersion => "IDENTIFY_VERSION",
            ReplicationCommand::IdentifyMode => "IDENTIFY_MODE",
            ReplicationCommand::IdentifyMaxLsn => "IDENTIFY_MAXLSN",
            ReplicationCommand::IdentifyConsistency { .. } => "IDENTIFY_CONSISTENCY",
            ReplicationCommand::IdentifyChannel { .. } => "IDENTIFY_CHANNEL",
            ReplicationCommand::CreateSlot { .. } => "CREATE_REPLICATION_SLOT",
            ReplicationCommand::DropSlot { .. } => "DROP_REPLICATION_SLOT",
            ReplicationCommand::StartReplication { .. } => "START_REPLICATION",
            ReplicationCommand::FetchCheckpoint => "FETCH_CHECKPOINT",
        }
    }

    pub fn parse(text: &str) -> ReplicationResult<Self> {
        let tokens = tokenize(text)?;
        let mut p = Parser { tokens, pos: 0 };
        let cmd = p.command()?;
        p.finish()?;
        Ok(cmd)
    }
}

impl fmt::Display for ReplicationCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    Position(LogPosition),
    LParen,
    RParen,
    Comma,
}

fn syntax_error(detail: impl fmt::Display) -> ReplicationError {
    ReplicationError::protocol_violation(format!("syntax error in replication command: {}", detail))
}

fn tokenize(text: &str) -> ReplicationResult<Vec<Token>> {
    let mut out = Vec::new();
    let mut chars = text.trim().trim_end_matches(';').chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                out.push(Token::LParen);
            }
            ')' => {
                chars.next();
                out.push(Token::RParen);
            }
            ',' => {
                chars.next();
                out.push(Token::Comma);
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => {
                            // doubled quote escapes itself
                            if chars.peek() == Some(&quote) {
                                chars.next();
                                s.push(quote);
                            } else {
                                break;
                            }
                        }
                        Some(ch) => s.push(ch),
                        None => return Err(syntax_error("unterminated quoted string")),
                    }
                }
                out.push(if quote == '\'' {
                    Token::Quoted(s)
                } else {
                    Token::Word(s)
                });
            }
            _ => {
                let mut word = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_whitespace() || matches!(ch, '(' | ')' | ',' | '\'' | '"') {
                        break;
                    }
                    word.push(ch);
                    chars.next();
                }
                if word.contains('/') {
                    let pos = LogPosition::parse(&word)
                        .map_err(|_| syntax_error(format!("invalid position \"{}\"", word)))?;
                    out.push(Token::Position(pos));
                } else {
                    out.push(Token::Word(word));
                }
            }
        }
    }
    Ok(out)
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

    fn peek_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(kw))
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.peek_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn word(&mut self, what: &str) -> ReplicationResult<String> {
        match self.next() {
            Some(Token::Word(w)) => Ok(w),
            Some(other) => Err(syntax_error(format!("expected {}, found {:?}", what, other))),
            None => Err(syntax_error(format!("expected {}", what))),
        }
    }

    fn position(&mut self) -> ReplicationResult<LogPosition> {
        match self.next() {
            Some(Token::Position(p)) => Ok(p),
            Some(other) => Err(syntax_error(format!("expected position, found {:?}", other))),
            None => Err(syntax_error("expected position")),
        }
    }

    fn finish(&self) -> ReplicationResult<()> {
        match self.peek() {
            None => Ok(()),
            Some(t) => Err(syntax_error(format!("unexpected trailing input {:?}", t))),
        }
    }

    fn command(&mut self) -> ReplicationResult<ReplicationCommand> {
        let head = self.word("command")?.to_ascii_uppercase();
        match head.as_str() {
            "IDENTIFY_SYSTEM" => Ok(ReplicationCommand::IdentifySystem),
            "IDENTIFY_VERSION" => Ok(ReplicationCommand::IdentifyVersion),
            "IDENTIFY_MODE" => Ok(ReplicationCommand::IdentifyMode),
            "IDENTIFY_MAXLSN" => Ok(ReplicationCommand::IdentifyMaxLsn),
            "IDENTIFY_CONSISTENCY" | "IDENTIFY_CONSISTENCE" => {
                Ok(ReplicationCommand::IdentifyConsistency {
                    position: self.position()?,
                })
            }
            "IDENTIFY_CHANNEL" => {
                let address = match self.next() {
                    Some(Token::Word(w)) | Some(Token::Quoted(w)) => w,
                    _ => return Err(syntax_error("expected channel address")),
                };
                Ok(ReplicationCommand::IdentifyChannel { address })
            }
            "CREATE_REPLICATION_SLOT" => {
                let name = self.word("slot name")?;
                let spec = if self.eat_keyword("PHYSICAL") {
                    let restart = match self.peek() {
                        Some(Token::Position(_)) => Some(self.position()?),
                        _ => None,
                    };
                    SlotSpec::Physical { restart }
                } else if self.eat_keyword("LOGICAL") {
                    SlotSpec::Logical {
                        plugin: self.word("output plugin")?,
                    }
                } else {
                    return Err(syntax_error("expected PHYSICAL or LOGICAL"));
                };
                Ok(ReplicationCommand::CreateSlot { name, spec })
            }
            "DROP_REPLICATION_SLOT" => Ok(ReplicationCommand::DropSlot {
                name: self.word("slot name")?,
            }),
            "START_REPLICATION" => self.start_replication(),
            "FETCH_CHECKPOINT" => Ok(ReplicationCommand::FetchCheckpoint),
            other => Err(syntax_error(format!("unknown command \"{}\"", other))),
        }
    }

    fn start_replication(&mut self) -> ReplicationResult<ReplicationCommand> {
        let slot = if self.eat_keyword("SLOT") {
            Some(self.word("slot name")?)
        } else {
            None
        };

        if self.eat_keyword("LOGICAL") {
            let slot = slot.ok_or_else(|| syntax_error("logical replication requires a slot"))?;
            let start = self.position()?;
            let options = if matches!(self.peek(), Some(Token::LParen)) {
                self.options()?
            } else {
                Vec::new()
            };
            return Ok(ReplicationCommand::StartReplication {
                slot: Some(slot),
                start,
                mode: StartMode::Logical { options },
            });
        }

        self.eat_keyword("PHYSICAL");
        Ok(ReplicationCommand::StartReplication {
            slot,
            start: self.position()?,
            mode: StartMode::Physical,
        })
    }

    fn options(&mut self) -> ReplicationResult<Vec<(String, Option<String>)>> {
        self.next(); // (
        let mut opts = Vec::new();
        loop {
            let key = self.word("option name")?;
            let value = match self.peek() {
                Some(Token::Quoted(_)) => match self.next() {
                    Some(Token::Quoted(v)) => Some(v),
                    _ => None,
                },
                _ => None,
            };
            opts.push((key, value));
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                _ => return Err(syntax_error("expected , or ) in option list")),
            }
        }
        Ok(opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identify_commands() {
        assert_eq!(
            ReplicationCommand::parse("IDENTIFY_SYSTEM").unwrap(),
            ReplicationCommand::IdentifySystem
        );
        assert_eq!(
            ReplicationCommand::parse("identify_mode;").unwrap(),
            ReplicationCommand::IdentifyMode
        );
        assert_eq!(
            ReplicationCommand::parse("IDENTIFY_CONSISTENCE 0/3000028").unwrap(),
            ReplicationCommand::IdentifyConsistency {
                position: LogPosition::new(0x300_0028)
            }
        );
    }

    #[test]
    fn test_identify_channel_accepts_address() {
        assert_eq!(
            ReplicationCommand::parse("IDENTIFY_CHANNEL 10.0.0.4").unwrap(),
            ReplicationCommand::IdentifyChannel {
                address: "10.0.0.4".into()
            }
        );
    }

    #[test]
    fn test_create_slots() {
        assert_eq!(
            ReplicationCommand::parse("CREATE_REPLICATION_SLOT east PHYSICAL 0/1000000").unwrap(),
            ReplicationCommand::CreateSlot {
                name: "east".into(),
                spec: SlotSpec::Physical {
                    restart: Some(LogPosition::new(0x100_0000))
                }
            }
        );
        assert_eq!(
            ReplicationCommand::parse("CREATE_REPLICATION_SLOT sub LOGICAL raw").unwrap(),
            ReplicationCommand::CreateSlot {
                name: "sub".into(),
                spec: SlotSpec::Logical {
                    plugin: "raw".into()
                }
            }
        );
    }

    #[test]
    fn test_start_physical_with_and_without_slot() {
        assert_eq!(
            ReplicationCommand::parse("START_REPLICATION 0/2000000").unwrap(),
            ReplicationCommand::StartReplication {
                slot: None,
                start: LogPosition::new(0x200_0000),
                mode: StartMode::Physical
            }
        );
        assert_eq!(
            ReplicationCommand::parse("START_REPLICATION SLOT east PHYSICAL 1/0").unwrap(),
            ReplicationCommand::StartReplication {
                slot: Some("east".into()),
                start: LogPosition::new(1 << 32),
                mode: StartMode::Physical
            }
        );
    }

    #[test]
    fn test_start_logical_options() {
        let cmd = ReplicationCommand::parse(
            "START_REPLICATION SLOT sub LOGICAL 0/0 (include_xids '1', skip_empty)",
        )
        .unwrap();
        assert_eq!(
            cmd,
            ReplicationCommand::StartReplication {
                slot: Some("sub".into()),
                start: LogPosition::INVALID,
                mode: StartMode::Logical {
                    options: vec![
                        ("include_xids".into(), Some("1".into())),
                        ("skip_empty".into(), None)
                    ]
                }
            }
        );
    }

    #[test]
    fn test_syntax_errors() {
        for bad in [
            "",
            "SELECT 1",
            "IDENTIFY_SYSTEM extra",
            "START_REPLICATION",
            "START_REPLICATION LOGICAL 0/0",
            "CREATE_REPLICATION_SLOT x",
            "IDENTIFY_CONSISTENCY nothex/1",
        ] {
            let err = ReplicationCommand::parse(bad).unwrap_err();
            assert!(err.is_fatal(), "{} should be fatal", bad);
        }
    }
}
