// command.rs — Owner command grammar.
//
//   .approve <tool|all> <code> [minutes]
//   .reset-trust [level]
//
// The parser turns message text into a typed `OwnerCommand`; nothing
// downstream looks at raw text again. The first line that starts with a
// command wins. Whether the sender may issue it is the caller's decision.

use std::str::FromStr;

use regex::Regex;
use tg_policy::ApprovalTarget;
use tg_taint::TrustLevel;

use crate::error::GuardError;

/// A parsed owner command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerCommand {
    Approve {
        target: ApprovalTarget,
        code: String,
        /// `None` means turn-scoped.
        duration_minutes: Option<u32>,
    },
    ResetTrust {
        /// `None` means reset to the most trusted level.
        level: Option<TrustLevel>,
    },
}

impl OwnerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            OwnerCommand::Approve { .. } => ".approve",
            OwnerCommand::ResetTrust { .. } => ".reset-trust",
        }
    }
}

/// A line looked like a command but could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedCommand {
    pub command: &'static str,
    pub problem: String,
}

impl std::fmt::Display for MalformedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.command, self.problem)
    }
}

const APPROVE_USAGE: &str = "usage: .approve <tool|all> <code> [minutes]";
const RESET_USAGE: &str = "usage: .reset-trust [trusted|shared|external|untrusted]";

/// Compiled command grammar.
#[derive(Debug, Clone)]
pub struct CommandParser {
    line: Regex,
}

impl CommandParser {
    pub fn new() -> Result<Self, GuardError> {
        Ok(Self {
            line: Regex::new(r"(?m)^[ \t]*\.(approve|reset-trust)(?:[ \t]+([^\r\n]*))?[ \t]*\r?$")?,
        })
    }

    /// Find and parse the first command in `text`.
    ///
    /// `Ok(None)` when the text holds no command at all.
    pub fn parse(&self, text: &str) -> Result<Option<OwnerCommand>, MalformedCommand> {
        let Some(captures) = self.line.captures(text) else {
            return Ok(None);
        };
        let args: Vec<&str> = captures
            .get(2)
            .map(|m| m.as_str().split_whitespace().collect())
            .unwrap_or_default();

        match &captures[1] {
            "approve" => parse_approve(&args).map(Some),
            _ => parse_reset(&args).map(Some),
        }
    }
}

fn parse_approve(args: &[&str]) -> Result<OwnerCommand, MalformedCommand> {
    let malformed = |problem: String| MalformedCommand {
        command: ".approve",
        problem,
    };

    let (target, code, minutes) = match args {
        [target, code] => (target, code, None),
        [target, code, minutes] => (target, code, Some(minutes)),
        _ => return Err(malformed(APPROVE_USAGE.to_string())),
    };

    let target = ApprovalTarget::from_str(target).map_err(|e| malformed(e.to_string()))?;
    if !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(malformed(format!("'{}' is not a valid code", code)));
    }
    let duration_minutes = match minutes {
        None => None,
        Some(raw) => match raw.parse::<u32>() {
            Ok(m) if m > 0 => Some(m),
            _ => {
                return Err(malformed(format!(
                    "'{}' is not a positive number of minutes",
                    raw
                )))
            }
        },
    };

    Ok(OwnerCommand::Approve {
        target,
        code: code.to_string(),
        duration_minutes,
    })
}

fn parse_reset(args: &[&str]) -> Result<OwnerCommand, MalformedCommand> {
    match args {
        [] => Ok(OwnerCommand::ResetTrust { level: None }),
        [level] => TrustLevel::from_str(level)
            .map(|level| OwnerCommand::ResetTrust { level: Some(level) })
            .map_err(|e| MalformedCommand {
                command: ".reset-trust",
                problem: format!("{}; {}", e, RESET_USAGE),
            }),
        _ => Err(MalformedCommand {
            command: ".reset-trust",
            problem: RESET_USAGE.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Option<OwnerCommand>, MalformedCommand> {
        CommandParser::new().unwrap().parse(text)
    }

    #[test]
    fn approve_forms() {
        assert_eq!(
            parse(".approve exec K7P2QX").unwrap(),
            Some(OwnerCommand::Approve {
                target: ApprovalTarget::Tool("exec".to_string()),
                code: "K7P2QX".to_string(),
                duration_minutes: None,
            })
        );
        assert_eq!(
            parse("sure\n  .approve ALL k7p2qx 30\nthanks").unwrap(),
            Some(OwnerCommand::Approve {
                target: ApprovalTarget::All,
                code: "k7p2qx".to_string(),
                duration_minutes: Some(30),
            })
        );
    }

    #[test]
    fn reset_forms() {
        assert_eq!(
            parse(".reset-trust").unwrap(),
            Some(OwnerCommand::ResetTrust { level: None })
        );
        assert_eq!(
            parse(".reset-trust Shared").unwrap(),
            Some(OwnerCommand::ResetTrust {
                level: Some(TrustLevel::Shared)
            })
        );
        assert!(parse(".reset-trust owner").is_err());
    }

    #[test]
    fn plain_text_is_not_a_command() {
        assert_eq!(parse("please approve exec K7P2QX").unwrap(), None);
        assert_eq!(parse("the .approve command is neat").unwrap(), None);
        assert_eq!(parse(".approved exec K7P2QX").unwrap(), None);
        assert_eq!(parse("").unwrap(), None);
    }

    #[test]
    fn malformed_approvals_are_reported() {
        assert!(parse(".approve exec").is_err());
        assert!(parse(".approve exec K7P2QX soon").is_err());
        assert!(parse(".approve exec K7P2QX 0").is_err());
        assert!(parse(".approve exec K7-2QX").is_err());
        let err = parse(".approve").unwrap_err();
        assert!(err.to_string().contains("usage"));
    }
}
