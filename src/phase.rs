//! Handshake phase tracking
//!
//! ```text
//!   Init -> Connected -> Greeted -> AwaitingCaps -> CapsKnown
//!        -> AwaitingTlsAck -> TlsAckReceived -> Secured -> AwaitingCaps ...
//!        -> AwaitingAuthResult <-> AwaitingCredential
//!        -> Authenticated | AuthFailed
//!   any -> Closed
//! ```
//!
//! The phase describes where the exchange is; it does not gate what the
//! caller may send. The one hard gate is the transport upgrade, which
//! requires [`Phase::TlsAckReceived`].

use crate::dialect::CommandKind;
use serde::Serialize;
use std::fmt;

/// Where a session is in its handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No transport yet.
    #[default]
    Init,
    /// Transport established, nothing read.
    Connected,
    /// Server greeting received.
    Greeted,
    /// Capability probe (`CAPABILITY`, `EHLO`) sent.
    AwaitingCaps,
    /// Capability reply read.
    CapsKnown,
    /// `STARTTLS` sent, acknowledgement not yet fully read.
    AwaitingTlsAck,
    /// `STARTTLS` accepted; the transport may be upgraded.
    TlsAckReceived,
    /// Transport upgraded to TLS.
    Secured,
    /// Authentication command sent.
    AwaitingAuthResult,
    /// Server prompted for a credential line.
    AwaitingCredential,
    Authenticated,
    /// Server rejected the credentials. A reported outcome, not an error.
    AuthFailed,
    /// Terminal.
    Closed,
}

/// What the session just observed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Opened,
    /// Any bytes arrived.
    Received,
    Sent(CommandKind),
    /// A complete reply was read; `positive` per the dialect's rules.
    Completed { positive: bool },
    /// The server asked for a credential line.
    Continuation,
    Upgraded,
    Closed,
}

impl Phase {
    /// The phase after `event`.
    #[must_use]
    pub(crate) const fn next(self, event: Event) -> Self {
        match (self, event) {
            (Self::Closed, _) | (_, Event::Closed) => Self::Closed,
            (Self::Init, Event::Opened) => Self::Connected,
            (Self::Connected, Event::Received | Event::Completed { .. }) => Self::Greeted,

            (_, Event::Sent(CommandKind::CapabilityProbe)) => Self::AwaitingCaps,
            (_, Event::Sent(CommandKind::StartTls)) => Self::AwaitingTlsAck,
            (_, Event::Sent(CommandKind::Auth | CommandKind::Credential)) => {
                Self::AwaitingAuthResult
            }

            (Self::AwaitingCaps, Event::Completed { .. }) => Self::CapsKnown,
            (Self::AwaitingTlsAck, Event::Completed { positive: true }) => Self::TlsAckReceived,
            (Self::AwaitingTlsAck, Event::Completed { positive: false }) => Self::CapsKnown,
            (Self::AwaitingAuthResult, Event::Continuation) => Self::AwaitingCredential,
            (Self::AwaitingAuthResult, Event::Completed { positive: true }) => {
                Self::Authenticated
            }
            (Self::AwaitingAuthResult, Event::Completed { positive: false }) => Self::AuthFailed,
            (Self::TlsAckReceived, Event::Upgraded) => Self::Secured,

            (phase, _) => phase,
        }
    }

    /// Whether authentication has reached a verdict.
    #[must_use]
    pub const fn is_auth_settled(self) -> bool {
        matches!(self, Self::Authenticated | Self::AuthFailed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Connected => "CONNECTED",
            Self::Greeted => "GREETED",
            Self::AwaitingCaps => "AWAITING_CAPS",
            Self::CapsKnown => "CAPS_KNOWN",
            Self::AwaitingTlsAck => "AWAITING_TLS_ACK",
            Self::TlsAckReceived => "TLS_ACK_RECEIVED",
            Self::Secured => "SECURED",
            Self::AwaitingAuthResult => "AWAITING_AUTH_RESULT",
            Self::AwaitingCredential => "AWAITING_CREDENTIAL",
            Self::Authenticated => "AUTHENTICATED",
            Self::AuthFailed => "AUTH_FAILED",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}
