//! Commands, responses and the exchange transcript

use crate::completion::{ImapStatus, imap_tagged_status, smtp_code, trim_line};
use crate::dialect::CommandKind;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::borrow::Cow;
use std::fmt;

/// One outbound line as sent.
///
/// The raw line is never serialized, displayed or debug-printed; all
/// three use the redacted form.
#[derive(Clone, Serialize)]
pub struct Command {
    #[serde(skip)]
    line: String,
    #[serde(rename = "line")]
    display: String,
    kind: CommandKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    tag: Option<String>,
    sent_at: DateTime<Utc>,
}

impl Command {
    pub(crate) fn new(
        line: String,
        display: String,
        kind: CommandKind,
        tag: Option<String>,
    ) -> Self {
        Self {
            line,
            display,
            kind,
            tag,
            sent_at: Utc::now(),
        }
    }

    /// The exact line written, without the CRLF terminator.
    #[must_use]
    pub fn line(&self) -> &str {
        &self.line
    }

    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        self.kind
    }

    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    #[must_use]
    pub const fn sent_at(&self) -> DateTime<Utc> {
        self.sent_at
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("line", &self.display)
            .field("kind", &self.kind)
            .field("tag", &self.tag)
            .field("sent_at", &self.sent_at)
            .finish()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

/// How much of a reply a [`Response`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseState {
    /// Raw bytes from [`Session::receive`](crate::Session::receive);
    /// completeness is the caller's call.
    Partial,
    Complete,
    /// The server is waiting for a credential line.
    Continuation,
}

/// Bytes received from the server.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    #[serde(rename = "text", serialize_with = "serialize_lossy")]
    raw: Vec<u8>,
    state: ResponseState,
    received_at: DateTime<Utc>,
}

impl Response {
    #[must_use]
    pub fn new(raw: Vec<u8>, state: ResponseState) -> Self {
        Self {
            raw,
            state,
            received_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.raw
    }

    /// The response decoded as UTF-8; invalid sequences are replaced.
    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.raw)
    }

    /// Non-empty lines without their terminators.
    pub fn lines(&self) -> impl Iterator<Item = Cow<'_, str>> {
        self.raw
            .split(|&b| b == b'\n')
            .map(trim_line)
            .filter(|line| !line.is_empty())
            .map(String::from_utf8_lossy)
    }

    #[must_use]
    pub fn final_line(&self) -> Option<Cow<'_, str>> {
        self.lines().last()
    }

    #[must_use]
    pub const fn state(&self) -> ResponseState {
        self.state
    }

    #[must_use]
    pub fn is_continuation(&self) -> bool {
        self.state == ResponseState::Continuation
    }

    #[must_use]
    pub const fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Reply code of the final SMTP line.
    #[must_use]
    pub fn smtp_code(&self) -> Option<u16> {
        self.final_line().and_then(|line| smtp_code(line.as_bytes()))
    }

    /// Status of the tagged completion line for `tag`. Lines inside
    /// `{n}` literals are message data and never match.
    #[must_use]
    pub fn imap_status(&self, tag: &str) -> Option<ImapStatus> {
        imap_tagged_status(&self.raw, tag)
    }

    /// Decoded text of a base64 credential prompt, e.g. `Username:`
    /// for `334 VXNlcm5hbWU6` or `+ VXNlcm5hbWU6`.
    #[must_use]
    pub fn decoded_prompt(&self) -> Option<String> {
        if !self.is_continuation() {
            return None;
        }
        let line = self.final_line()?;
        let payload = line
            .strip_prefix("334 ")
            .or_else(|| line.strip_prefix("+ "))
            .unwrap_or(&*line)
            .trim();
        let decoded = STANDARD.decode(payload).ok()?;
        Some(String::from_utf8_lossy(&decoded).into_owned())
    }
}

fn serialize_lossy<S: Serializer>(raw: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(raw))
}

/// A sent command and the responses observed before the next one.
///
/// The greeting record has no command.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExchangeRecord {
    pub command: Option<Command>,
    pub responses: Vec<Response>,
}

impl ExchangeRecord {
    #[must_use]
    pub const fn greeting() -> Self {
        Self {
            command: None,
            responses: Vec::new(),
        }
    }

    #[must_use]
    pub const fn for_command(command: Command) -> Self {
        Self {
            command: Some(command),
            responses: Vec::new(),
        }
    }

    /// The last response, i.e. the one that ended the exchange.
    #[must_use]
    pub fn final_response(&self) -> Option<&Response> {
        self.responses.last()
    }

    /// All response bytes of this exchange, decoded.
    #[must_use]
    pub fn text(&self) -> String {
        self.responses.iter().map(|r| r.text()).collect()
    }
}
