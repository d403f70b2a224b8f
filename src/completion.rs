//! Response completion predicates
//!
//! A predicate looks at the bytes accumulated so far and decides
//! whether the server has finished answering. It never guesses from
//! timing: only the protocol framing counts.
//!
//! ```text
//!   IMAP   * CAPABILITY IMAP4rev1 STARTTLS      <- untagged, keep reading
//!          a1 OK CAPABILITY completed           <- tagged, complete
//!
//!   SMTP   250-smtp.example.com                 <- dash, keep reading
//!          250 STARTTLS                         <- space, complete
//!          334 VXNlcm5hbWU6                     <- continuation
//! ```

/// Outcome of evaluating a predicate against an accumulated buffer.
///
/// `end` is the number of bytes that belong to the recognized
/// response. Anything past it belongs to the next exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// More bytes are needed.
    Pending,
    /// The response is complete.
    Complete { end: usize },
    /// The server is waiting for a client line (SMTP `334`, a bare
    /// base64 prompt, or an IMAP `+` continuation).
    Continuation { end: usize },
    /// The bytes up to `end` match no response shape the predicate
    /// accepts here.
    Malformed { end: usize },
}

impl Verdict {
    /// The boundary of a recognized response, if any.
    #[must_use]
    pub const fn end(self) -> Option<usize> {
        match self {
            Self::Pending | Self::Malformed { .. } => None,
            Self::Complete { end } | Self::Continuation { end } => Some(end),
        }
    }
}

/// A framing rule that decides when a response is complete.
///
/// Closures of type `Fn(&[u8]) -> Verdict` implement this trait, so
/// callers can pass ad-hoc predicates to
/// [`Session::read_until_complete`](crate::Session::read_until_complete).
pub trait Completion {
    fn evaluate(&self, buf: &[u8]) -> Verdict;
}

impl<F> Completion for F
where
    F: Fn(&[u8]) -> Verdict,
{
    fn evaluate(&self, buf: &[u8]) -> Verdict {
        self(buf)
    }
}

/// Complete once a line carrying the given IMAP tag and a status of
/// `OK`, `NO` or `BAD` has arrived.
///
/// Untagged lines are skipped, and so is the content of literals
/// (`{n}` at the end of a line followed by `n` raw bytes), so a
/// message body that happens to contain `a1 OK` does not end the
/// exchange early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImapTagged {
    tag: String,
}

impl ImapTagged {
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }

    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl Completion for ImapTagged {
    fn evaluate(&self, buf: &[u8]) -> Verdict {
        match scan_tagged(buf, self.tag.as_bytes()) {
            TaggedScan::Pending => Verdict::Pending,
            TaggedScan::Tagged { end, .. } => Verdict::Complete { end },
            TaggedScan::Continuation { end } => Verdict::Continuation { end },
        }
    }
}

/// Where a walk over IMAP response lines stopped.
enum TaggedScan {
    Pending,
    Tagged { end: usize, status: ImapStatus },
    Continuation { end: usize },
}

fn scan_tagged(buf: &[u8], tag: &[u8]) -> TaggedScan {
    let mut pos = 0;
    while let Some(end) = next_line_end(buf, pos) {
        let line = trim_line(&buf[pos..end]);

        if let Some(len) = literal_len(line) {
            // A length that cannot fit stays pending; the session's byte
            // bound turns it into a protocol violation.
            match end.checked_add(len) {
                Some(after) if after <= buf.len() => {
                    pos = after;
                    continue;
                }
                _ => return TaggedScan::Pending,
            }
        }

        if let Some(status) = imap_status_for(line, tag) {
            return TaggedScan::Tagged { end, status };
        }
        if line == b"+" || line.starts_with(b"+ ") {
            return TaggedScan::Continuation { end };
        }
        pos = end;
    }
    TaggedScan::Pending
}

/// Status of the completion line for `tag`, skipping literal content.
pub(crate) fn imap_tagged_status(buf: &[u8], tag: &str) -> Option<ImapStatus> {
    match scan_tagged(buf, tag.as_bytes()) {
        TaggedScan::Tagged { status, .. } => Some(status),
        TaggedScan::Pending | TaggedScan::Continuation { .. } => None,
    }
}

/// Complete at the first full line. Used for the IMAP greeting, which
/// is a single untagged line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FirstLine;

impl Completion for FirstLine {
    fn evaluate(&self, buf: &[u8]) -> Verdict {
        next_line_end(buf, 0).map_or(Verdict::Pending, |end| Verdict::Complete { end })
    }
}

/// Complete at the final line of an SMTP reply.
///
/// `<code>-text` lines continue the reply; `<code> text` (or a bare
/// `<code>`) ends it. A final `334` is a credential prompt and yields
/// [`Verdict::Continuation`]. A reply opening with a line without any
/// status code is a bare base64 prompt while authenticating
/// ([`SmtpReply::expecting_prompt`]) and malformed otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SmtpReply {
    prompts: bool,
}

impl SmtpReply {
    /// Plain replies only.
    #[must_use]
    pub const fn new() -> Self {
        Self { prompts: false }
    }

    /// Also accept a bare base64 prompt, as some servers send during
    /// `AUTH LOGIN`.
    #[must_use]
    pub const fn expecting_prompt() -> Self {
        Self { prompts: true }
    }
}

impl Completion for SmtpReply {
    fn evaluate(&self, buf: &[u8]) -> Verdict {
        let mut pos = 0;
        while let Some(end) = next_line_end(buf, pos) {
            let line = trim_line(&buf[pos..end]);
            let first = pos == 0;
            pos = end;

            match smtp_code(line) {
                Some(_) if line.get(3) == Some(&b'-') => {}
                Some(334) => return Verdict::Continuation { end },
                Some(_) => return Verdict::Complete { end },
                None if first && self.prompts && !line.is_empty() => {
                    return Verdict::Continuation { end };
                }
                None => return Verdict::Malformed { end },
            }
        }
        Verdict::Pending
    }
}

/// Status word of an IMAP tagged completion line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ImapStatus {
    Ok,
    No,
    Bad,
}

/// The status of `line` if it is the tagged completion for `tag`.
fn imap_status_for(line: &[u8], tag: &[u8]) -> Option<ImapStatus> {
    let rest = line.strip_prefix(tag)?.strip_prefix(b" ")?;
    let word_len = rest.iter().position(|&b| b == b' ').unwrap_or(rest.len());
    let word = &rest[..word_len];
    if word.eq_ignore_ascii_case(b"OK") {
        Some(ImapStatus::Ok)
    } else if word.eq_ignore_ascii_case(b"NO") {
        Some(ImapStatus::No)
    } else if word.eq_ignore_ascii_case(b"BAD") {
        Some(ImapStatus::Bad)
    } else {
        None
    }
}

/// The three-digit reply code at the start of an SMTP line.
pub(crate) fn smtp_code(line: &[u8]) -> Option<u16> {
    let digits = line.get(..3)?;
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    match line.get(3) {
        None | Some(b' ' | b'-') => {}
        Some(_) => return None,
    }
    digits
        .iter()
        .try_fold(0u16, |acc, d| Some(acc * 10 + u16::from(d - b'0')))
}

/// Index one past the next `\n` at or after `from`.
pub(crate) fn next_line_end(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .iter()
        .position(|&b| b == b'\n')
        .map(|i| from + i + 1)
}

/// Strip the trailing CRLF (or bare LF) from a line.
pub(crate) fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Length announced by a trailing IMAP literal marker (`{n}` or `~{n}`).
fn literal_len(line: &[u8]) -> Option<usize> {
    let inner = line.strip_suffix(b"}")?;
    let open = inner.iter().rposition(|&b| b == b'{')?;
    let digits = &inner[open + 1..];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    // Overlong digit runs still mark a literal, just one that never fits.
    Some(
        std::str::from_utf8(digits)
            .ok()
            .and_then(|d| d.parse().ok())
            .unwrap_or(usize::MAX),
    )
}
