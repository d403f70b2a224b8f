//! Mail proxy probe library
//!
//! Drives client-side IMAP and SMTP handshakes against a mail proxy
//! and records what happened: greeting, capability probe, STARTTLS
//! with an in-place TLS upgrade, and authentication (IMAP `LOGIN`,
//! SMTP `AUTH LOGIN` with its two base64 prompts).
//!
//! Replies are delimited by protocol framing ([`completion`]), never by
//! fixed delays, and every wait carries an explicit timeout. An
//! authentication rejection is a reported [`Phase`], not an [`Error`].

pub mod completion;
mod config;
mod dialect;
mod error;
mod phase;
mod probe;
mod record;
mod session;
mod transport;

pub use completion::{Completion, ImapStatus, Verdict};
pub use config::{ProbeConfig, SessionOptions};
pub use dialect::{CommandKind, Dialect};
pub use error::{Error, Result};
pub use phase::Phase;
pub use probe::{Credentials, ImapProbe, ProbeReport, SmtpProbe, TagGenerator};
pub use record::{Command, ExchangeRecord, Response, ResponseState};
pub use session::{CancelHandle, Session};
pub use transport::TlsTrust;
