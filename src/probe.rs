//! Scripted probes against a local mail proxy
//!
//! Each probe opens one session, walks a fixed handshake, closes the
//! session whatever happened and reports the transcript.
//!
//! ```text
//!   IMAP  greeting [STARTTLS, CAPABILITY] a1 LOGIN, a2 LIST "" "*", a3 LOGOUT
//!   SMTP  greeting, EHLO [STARTTLS, EHLO] AUTH LOGIN, user, password, QUIT
//! ```

use crate::config::{ProbeConfig, SessionOptions};
use crate::dialect::{Dialect, REDACTED};
use crate::error::{Error, Result};
use crate::phase::Phase;
use crate::record::ExchangeRecord;
use crate::session::Session;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use std::fmt;
use tracing::info;

/// Username and password for LOGIN and AUTH LOGIN.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Arguments of an IMAP `LOGIN` as two quoted strings.
    #[must_use]
    pub fn imap_login_args(&self) -> String {
        format!("{} {}", quote(&self.username), quote(&self.password))
    }

    /// Base64 answer to the AUTH LOGIN username prompt.
    #[must_use]
    pub fn username_b64(&self) -> String {
        STANDARD.encode(&self.username)
    }

    /// Base64 answer to the AUTH LOGIN password prompt.
    #[must_use]
    pub fn password_b64(&self) -> String {
        STANDARD.encode(&self.password)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &REDACTED)
            .finish()
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// IMAP tags `a1`, `a2`, ... unique within one session.
#[derive(Debug, Clone)]
pub struct TagGenerator {
    prefix: String,
    next: u32,
}

impl TagGenerator {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: 1,
        }
    }
}

impl Default for TagGenerator {
    fn default() -> Self {
        Self::new("a")
    }
}

impl Iterator for TagGenerator {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let tag = format!("{}{}", self.prefix, self.next);
        self.next = self.next.checked_add(1)?;
        Some(tag)
    }
}

/// Result of one probe run.
#[derive(Debug, Serialize)]
pub struct ProbeReport {
    pub dialect: Dialect,
    /// Phase reached before the session was closed.
    pub phase: Phase,
    /// Whether the transport had been upgraded to TLS.
    pub encrypted: bool,
    pub transcript: Vec<ExchangeRecord>,
}

impl ProbeReport {
    #[must_use]
    pub fn authenticated(&self) -> bool {
        self.phase == Phase::Authenticated
    }
}

/// Close `session` and turn the outcome of its steps into a report.
async fn finish(mut session: Session, outcome: Result<()>) -> Result<ProbeReport> {
    let phase = session.phase();
    let encrypted = session.is_encrypted();
    let dialect = session.dialect();
    session.close().await;
    outcome?;

    info!("{} probe finished in phase {}", dialect, phase);
    Ok(ProbeReport {
        dialect,
        phase,
        encrypted,
        transcript: session.into_transcript(),
    })
}

fn next_tag(tags: &mut TagGenerator) -> Result<String> {
    tags.next()
        .ok_or_else(|| Error::Usage("IMAP tag space exhausted".into()))
}

/// IMAP probes (login, folder listing, OAuth2 trigger)
pub struct ImapProbe {
    config: ProbeConfig,
    options: SessionOptions,
}

impl ImapProbe {
    /// # Errors
    ///
    /// Returns an error if the configured CA file cannot be loaded.
    pub fn new(config: ProbeConfig) -> Result<Self> {
        let options = config.session_options()?;
        Ok(Self { config, options })
    }

    #[must_use]
    pub const fn with_options(config: ProbeConfig, options: SessionOptions) -> Self {
        Self { config, options }
    }

    /// Log in, list all folders if authenticated, log out.
    ///
    /// A rejected login is reported through [`ProbeReport::phase`].
    ///
    /// # Errors
    ///
    /// Returns transport errors: connect, timeout, closed connection,
    /// failed upgrade.
    pub async fn login_list_logout(&self, starttls: bool) -> Result<ProbeReport> {
        let mut session: Session = Session::new(Dialect::Imap, self.options.clone());
        let outcome = self.login_list_logout_steps(&mut session, starttls).await;
        finish(session, outcome).await
    }

    /// Send a single LOGIN so the proxy starts its authorization flow.
    ///
    /// A proxy that holds the reply while it waits for OAuth2 consent
    /// is not a failure: the report then ends in
    /// [`Phase::AwaitingAuthResult`].
    ///
    /// # Errors
    ///
    /// Returns transport errors other than the reply timeout.
    pub async fn trigger_login(&self) -> Result<ProbeReport> {
        let mut session: Session = Session::new(Dialect::Imap, self.options.clone());
        let outcome = self.trigger_login_steps(&mut session).await;
        finish(session, outcome).await
    }

    async fn login_list_logout_steps(&self, session: &mut Session, starttls: bool) -> Result<()> {
        let timeout = self.config.timeout;
        let mut tags = TagGenerator::default();

        self.greet(session).await?;
        if starttls {
            session
                .command(&format!("{} STARTTLS", next_tag(&mut tags)?), timeout)
                .await?;
            session
                .upgrade_transport(&self.config.tls_server_name, timeout)
                .await?;
            session
                .command(&format!("{} CAPABILITY", next_tag(&mut tags)?), timeout)
                .await?;
        }

        let login = format!(
            "{} LOGIN {}",
            next_tag(&mut tags)?,
            self.config.credentials.imap_login_args()
        );
        session.command(&login, timeout).await?;

        if session.phase() == Phase::Authenticated {
            session
                .command(&format!("{} LIST \"\" \"*\"", next_tag(&mut tags)?), timeout)
                .await?;
        }
        session
            .command(&format!("{} LOGOUT", next_tag(&mut tags)?), timeout)
            .await?;
        Ok(())
    }

    async fn trigger_login_steps(&self, session: &mut Session) -> Result<()> {
        self.greet(session).await?;

        let login = format!("a1 LOGIN {}", self.config.credentials.imap_login_args());
        match session.command(&login, self.config.timeout).await {
            Err(Error::Timeout { .. }) => {
                info!("No LOGIN reply yet; the proxy may be waiting for authorization");
                Ok(())
            }
            other => other.map(drop),
        }
    }

    async fn greet(&self, session: &mut Session) -> Result<()> {
        session
            .open(&self.config.imap_addr(), self.config.timeout)
            .await?;
        session.read_greeting(self.config.timeout).await?;
        Ok(())
    }
}

/// SMTP probes (EHLO, STARTTLS, AUTH LOGIN)
pub struct SmtpProbe {
    config: ProbeConfig,
    options: SessionOptions,
}

impl SmtpProbe {
    /// # Errors
    ///
    /// Returns an error if the configured CA file cannot be loaded.
    pub fn new(config: ProbeConfig) -> Result<Self> {
        let options = config.session_options()?;
        Ok(Self { config, options })
    }

    #[must_use]
    pub const fn with_options(config: ProbeConfig, options: SessionOptions) -> Self {
        Self { config, options }
    }

    /// EHLO, optionally STARTTLS and EHLO again, AUTH LOGIN, QUIT.
    ///
    /// Username and password are sent as two separate base64 lines,
    /// each answering its own server prompt.
    ///
    /// # Errors
    ///
    /// Returns transport errors: connect, timeout, closed connection,
    /// failed upgrade.
    pub async fn auth_login(&self, starttls: bool) -> Result<ProbeReport> {
        let mut session: Session = Session::new(Dialect::Smtp, self.options.clone());
        let outcome = self.auth_login_steps(&mut session, starttls).await;
        finish(session, outcome).await
    }

    async fn auth_login_steps(&self, session: &mut Session, starttls: bool) -> Result<()> {
        let timeout = self.config.timeout;
        let ehlo = format!("EHLO {}", self.config.helo_name);

        session.open(&self.config.smtp_addr(), timeout).await?;
        session.read_greeting(timeout).await?;
        session.command(&ehlo, timeout).await?;

        if starttls {
            session.command("STARTTLS", timeout).await?;
            session
                .upgrade_transport(&self.config.tls_server_name, timeout)
                .await?;
            session.command(&ehlo, timeout).await?;
        }

        session.command("AUTH LOGIN", timeout).await?;
        let credentials = &self.config.credentials;
        for answer in [credentials.username_b64(), credentials.password_b64()] {
            if session.phase() != Phase::AwaitingCredential {
                break;
            }
            session.command(&answer, timeout).await?;
        }

        session.command("QUIT", timeout).await?;
        Ok(())
    }
}
