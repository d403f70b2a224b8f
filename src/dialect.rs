//! Protocol dialects
//!
//! The driver itself only moves lines. The dialect knows which lines
//! are capability probes, STARTTLS or authentication, which predicate
//! ends a reply, and whether a reply is positive.

use crate::completion::{Completion, FirstLine, ImapStatus, ImapTagged, SmtpReply};
use crate::record::Response;
use serde::Serialize;
use std::fmt;

/// Placeholder written instead of secrets in logs and transcripts.
pub const REDACTED: &str = "<redacted>";

/// Line protocol spoken on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Imap,
    Smtp,
}

/// Role of an outbound line in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// `CAPABILITY`, `EHLO`, `HELO`, `LHLO`.
    CapabilityProbe,
    StartTls,
    /// `LOGIN`, `AUTHENTICATE`, `AUTH`.
    Auth,
    /// A line answering a server credential prompt.
    Credential,
    Other,
}

impl Dialect {
    /// Classify `line` and extract its IMAP tag.
    ///
    /// While the server waits for a credential line every outbound
    /// line is a [`CommandKind::Credential`] and carries no tag.
    #[must_use]
    pub fn classify(self, line: &str, awaiting_credential: bool) -> (CommandKind, Option<String>) {
        if awaiting_credential {
            return (CommandKind::Credential, None);
        }

        let mut words = line.split_whitespace();
        let (tag, verb) = match self {
            Self::Imap => (words.next(), words.next()),
            Self::Smtp => (None, words.next()),
        };
        let verb = verb.map(str::to_ascii_uppercase).unwrap_or_default();

        let kind = match (self, verb.as_str()) {
            (Self::Imap, "CAPABILITY") | (Self::Smtp, "EHLO" | "HELO" | "LHLO") => {
                CommandKind::CapabilityProbe
            }
            (_, "STARTTLS") => CommandKind::StartTls,
            (Self::Imap, "LOGIN" | "AUTHENTICATE") | (Self::Smtp, "AUTH") => CommandKind::Auth,
            _ => CommandKind::Other,
        };
        (kind, tag.map(ToString::to_string))
    }

    /// Loggable form of `line` with credentials masked.
    #[must_use]
    pub fn redact(self, line: &str, kind: CommandKind) -> String {
        let keep = match (self, kind) {
            (_, CommandKind::Credential) => return REDACTED.to_string(),
            (Self::Imap, CommandKind::Auth) => {
                let verb = line.split_whitespace().nth(1).unwrap_or_default();
                if verb.eq_ignore_ascii_case("LOGIN") { 2 } else { 3 }
            }
            (Self::Smtp, CommandKind::Auth) => 2,
            _ => return line.to_string(),
        };

        let words: Vec<&str> = line.split_whitespace().collect();
        if words.len() <= keep {
            return line.to_string();
        }
        format!("{} {REDACTED}", words[..keep].join(" "))
    }

    /// Predicate for the server greeting.
    #[must_use]
    pub fn greeting_completion(self) -> Box<dyn Completion + Send + Sync> {
        match self {
            Self::Imap => Box::new(FirstLine),
            Self::Smtp => Box::new(SmtpReply::new()),
        }
    }

    /// Predicate for the reply to a command carrying `tag`.
    ///
    /// An IMAP reply without a tag to wait for can only be the
    /// greeting, so it falls back to the greeting predicate. SMTP
    /// accepts a bare base64 prompt only when `in_auth` is set.
    #[must_use]
    pub fn reply_completion(
        self,
        tag: Option<&str>,
        in_auth: bool,
    ) -> Box<dyn Completion + Send + Sync> {
        match (self, tag) {
            (Self::Imap, Some(tag)) => Box::new(ImapTagged::new(tag)),
            (Self::Imap, None) => Box::new(FirstLine),
            (Self::Smtp, _) if in_auth => Box::new(SmtpReply::expecting_prompt()),
            (Self::Smtp, _) => Box::new(SmtpReply::new()),
        }
    }

    /// Whether a complete reply reports success.
    ///
    /// IMAP: the tagged status is `OK`, or for the greeting (`tag` is
    /// `None`) the first line is `* OK` or `* PREAUTH`. SMTP: the final
    /// reply code is 2xx.
    #[must_use]
    pub fn is_positive(self, response: &Response, tag: Option<&str>) -> bool {
        match (self, tag) {
            (Self::Imap, Some(tag)) => response.imap_status(tag) == Some(ImapStatus::Ok),
            (Self::Imap, None) => response.lines().next().is_some_and(|line| {
                let upper = line.to_ascii_uppercase();
                upper.starts_with("* OK") || upper.starts_with("* PREAUTH")
            }),
            (Self::Smtp, _) => response
                .smtp_code()
                .is_some_and(|code| (200..300).contains(&code)),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Imap => "IMAP",
            Self::Smtp => "SMTP",
        })
    }
}
