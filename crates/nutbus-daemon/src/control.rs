//! Actor control commands
//!
//! Subsystems take CONFIGURE/POLLING/$TERM over a broadcast channel,
//! fed by the control mailbox on the bus. POLLING recomputes the
//! derived TTLs (metric TTL = 2x interval, status TTL = 3x interval).

use std::path::PathBuf;
use tracing::{error, info, warn};

/// Control subject on the bus.
pub const CONTROL_SUBJECT: &str = "nutbus.control";

const DEFAULT_POLLING_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActorCommand {
    /// Load the NUT -> canonical mapping file.
    Configure(PathBuf),
    /// Set the polling interval in seconds.
    Polling(u64),
    /// Exit the main loop.
    Term,
}

/// Parse a control frame list. Unknown or incomplete commands yield
/// `None` with a log line; an invalid POLLING value falls back to the
/// default interval.
pub fn parse_command(frames: &[String]) -> Option<ActorCommand> {
    let mut iter = frames.iter();
    let command = match iter.next() {
        Some(command) => command.as_str(),
        None => {
            error!("control message has no frames");
            return None;
        }
    };

    match command {
        "$TERM" => {
            info!("got $TERM");
            Some(ActorCommand::Term)
        }
        "CONFIGURE" => match iter.next() {
            Some(mapping) => Some(ActorCommand::Configure(PathBuf::from(mapping))),
            None => {
                error!("expected CONFIGURE/mapping_file, got CONFIGURE alone");
                None
            }
        },
        "POLLING" => match iter.next() {
            Some(value) => {
                let secs = value.parse::<u64>().unwrap_or(0);
                if secs == 0 {
                    error!(%value, "invalid POLLING value, using default instead");
                    Some(ActorCommand::Polling(DEFAULT_POLLING_SECS))
                } else {
                    Some(ActorCommand::Polling(secs))
                }
            }
            None => {
                error!("expected POLLING/value, got POLLING alone");
                None
            }
        },
        other => {
            warn!(command = other, "unknown control command");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn known_commands_parse() {
        assert_eq!(parse_command(&frames(&["$TERM"])), Some(ActorCommand::Term));
        assert_eq!(
            parse_command(&frames(&["CONFIGURE", "/etc/nutbus/mapping.conf"])),
            Some(ActorCommand::Configure(PathBuf::from(
                "/etc/nutbus/mapping.conf"
            )))
        );
        assert_eq!(
            parse_command(&frames(&["POLLING", "15"])),
            Some(ActorCommand::Polling(15))
        );
    }

    #[test]
    fn invalid_polling_falls_back_to_default() {
        assert_eq!(
            parse_command(&frames(&["POLLING", "nonsense"])),
            Some(ActorCommand::Polling(30))
        );
        assert_eq!(
            parse_command(&frames(&["POLLING", "0"])),
            Some(ActorCommand::Polling(30))
        );
    }

    #[test]
    fn incomplete_and_unknown_commands_are_dropped() {
        assert_eq!(parse_command(&frames(&["CONFIGURE"])), None);
        assert_eq!(parse_command(&frames(&["POLLING"])), None);
        assert_eq!(parse_command(&frames(&["MAGIC"])), None);
        assert_eq!(parse_command(&[]), None);
    }
}
