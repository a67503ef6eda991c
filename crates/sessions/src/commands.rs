//! In-chat slash commands.
//!
//! Commands are applied to the session before anything is appended to the
//! context, so their text never reaches the model. Only known command names
//! are intercepted; other text starting with `/` is treated as chat.

use {serde::Serialize, thiserror::Error};

use crate::session::{ActivationMode, Session, ThinkingLevel, UsageMode};

pub const DEFAULT_COMPACT_KEEP: usize = 10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("/{command} expects one of: {expected}")]
    InvalidArgument {
        command: &'static str,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Reset,
    Compact(Option<usize>),
    Status,
    Think(ThinkingLevel),
    Verbose(bool),
    Usage(UsageMode),
    Activation(ActivationMode),
    Help,
}

/// Result of applying a command to a session.
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutcome {
    pub action: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CommandOutcome {
    fn new(action: &'static str, message: impl Into<String>) -> Self {
        Self {
            action,
            message: message.into(),
            data: None,
        }
    }
}

const HELP_TEXT: &str = "\
/reset (/new)            clear the conversation
/compact [n]             keep only the last n messages
/status                  show session status
/think <off|low|medium|high>
/verbose <on|off>
/usage <off|tokens|full>
/activation <mention|always>
/help                    show this help";

impl ChatCommand {
    /// Parse `text` as a command.
    ///
    /// Returns `None` when the text is not a known command.
    pub fn parse(text: &str) -> Option<Result<Self, CommandError>> {
        let rest = text.trim().strip_prefix('/')?;
        let mut parts = rest.split_whitespace();
        let name = parts.next()?.to_ascii_lowercase();
        let arg = parts.next().map(str::to_ascii_lowercase);
        let arg = arg.as_deref();

        let parsed = match name.as_str() {
            "reset" | "new" => Ok(Self::Reset),
            "status" => Ok(Self::Status),
            "help" => Ok(Self::Help),
            "compact" => match arg {
                None => Ok(Self::Compact(None)),
                Some(n) => n.parse().map(|n| Self::Compact(Some(n))).map_err(|_| {
                    CommandError::InvalidArgument {
                        command: "compact",
                        expected: "a message count",
                    }
                }),
            },
            "think" => match arg {
                Some("off") => Ok(Self::Think(ThinkingLevel::Off)),
                Some("low") => Ok(Self::Think(ThinkingLevel::Low)),
                Some("medium") => Ok(Self::Think(ThinkingLevel::Medium)),
                Some("high") => Ok(Self::Think(ThinkingLevel::High)),
                _ => Err(CommandError::InvalidArgument {
                    command: "think",
                    expected: "off, low, medium, high",
                }),
            },
            "verbose" => match arg {
                Some("on") => Ok(Self::Verbose(true)),
                Some("off") => Ok(Self::Verbose(false)),
                _ => Err(CommandError::InvalidArgument {
                    command: "verbose",
                    expected: "on, off",
                }),
            },
            "usage" => match arg {
                Some("off") => Ok(Self::Usage(UsageMode::Off)),
                Some("tokens") => Ok(Self::Usage(UsageMode::Tokens)),
                Some("full") => Ok(Self::Usage(UsageMode::Full)),
                _ => Err(CommandError::InvalidArgument {
                    command: "usage",
                    expected: "off, tokens, full",
                }),
            },
            "activation" => match arg {
                Some("mention") => Ok(Self::Activation(ActivationMode::Mention)),
                Some("always") => Ok(Self::Activation(ActivationMode::Always)),
                _ => Err(CommandError::InvalidArgument {
                    command: "activation",
                    expected: "mention, always",
                }),
            },
            _ => return None,
        };
        Some(parsed)
    }

    pub fn apply(&self, session: &mut Session) -> CommandOutcome {
        let outcome = match *self {
            Self::Reset => {
                session.reset();
                CommandOutcome::new("reset", "Session reset.")
            },
            Self::Compact(keep) => {
                let keep = keep.unwrap_or(DEFAULT_COMPACT_KEEP);
                let removed = session.compact(keep);
                CommandOutcome {
                    data: Some(serde_json::json!({
                        "removed": removed,
                        "contextLength": session.context.len(),
                    })),
                    ..CommandOutcome::new("compact", format!("Compacted: removed {removed} messages."))
                }
            },
            Self::Status => {
                let summary = session.summary();
                let message = format!(
                    "Session {}: {} messages in context, {} total, {} tokens, agent {}",
                    summary.id,
                    summary.context_length,
                    summary.message_count,
                    summary.token_count,
                    summary.agent_id,
                );
                CommandOutcome {
                    data: serde_json::to_value(&summary).ok(),
                    ..CommandOutcome::new("status", message)
                }
            },
            Self::Think(level) => {
                session.settings.thinking = level;
                CommandOutcome::new("think", format!("Thinking level set to {level:?}."))
            },
            Self::Verbose(on) => {
                session.settings.verbose = on;
                let state = if on { "on" } else { "off" };
                CommandOutcome::new("verbose", format!("Verbose mode {state}."))
            },
            Self::Usage(mode) => {
                session.settings.usage = mode;
                CommandOutcome::new("usage", format!("Usage footer set to {mode:?}."))
            },
            Self::Activation(mode) => {
                session.settings.activation = mode;
                CommandOutcome::new("activation", format!("Group activation set to {mode:?}."))
            },
            Self::Help => CommandOutcome::new("help", HELP_TEXT),
        };
        session.touch();
        outcome
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {
        super::*,
        crate::session::{ChatMessage, SessionSettings},
    };

    fn session() -> Session {
        Session::new("s", "main", "webchat", "c", SessionSettings::default())
    }

    #[test]
    fn plain_text_is_not_a_command() {
        assert!(ChatCommand::parse("hello there").is_none());
        assert!(ChatCommand::parse("/usr/bin is a path").is_none());
    }

    #[test]
    fn parses_aliases_and_arguments() {
        assert_eq!(ChatCommand::parse("/new").unwrap(), Ok(ChatCommand::Reset));
        assert_eq!(
            ChatCommand::parse("  /THINK high ").unwrap(),
            Ok(ChatCommand::Think(ThinkingLevel::High))
        );
        assert_eq!(
            ChatCommand::parse("/compact 4").unwrap(),
            Ok(ChatCommand::Compact(Some(4)))
        );
    }

    #[test]
    fn bad_argument_is_an_error() {
        assert!(matches!(
            ChatCommand::parse("/verbose maybe").unwrap(),
            Err(CommandError::InvalidArgument { command: "verbose", .. })
        ));
        assert!(ChatCommand::parse("/compact lots").unwrap().is_err());
    }

    #[test]
    fn reset_clears_context() {
        let mut s = session();
        s.push_message(ChatMessage::user("hi"));
        let outcome = ChatCommand::Reset.apply(&mut s);
        assert_eq!(outcome.action, "reset");
        assert!(s.context.is_empty());
    }

    #[test]
    fn settings_commands_mutate_session() {
        let mut s = session();
        ChatCommand::Verbose(true).apply(&mut s);
        ChatCommand::Usage(UsageMode::Full).apply(&mut s);
        ChatCommand::Activation(ActivationMode::Always).apply(&mut s);
        assert!(s.settings.verbose);
        assert_eq!(s.settings.usage, UsageMode::Full);
        assert_eq!(s.settings.activation, ActivationMode::Always);
    }

    #[test]
    fn status_reports_summary() {
        let mut s = session();
        s.push_message(ChatMessage::user("hi"));
        let outcome = ChatCommand::Status.apply(&mut s);
        assert_eq!(outcome.data.unwrap()["contextLength"], 1);
    }
}
