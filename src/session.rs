//! Protocol session driver
//!
//! One [`Session`] drives one client-side handshake against one
//! server. Replies are delimited by completion predicates, never by
//! sleeping:
//!
//! ```text
//!   open ──> read_greeting ──> command("EHLO local")
//!        ──> command("STARTTLS") ──> upgrade_transport(host)
//!        ──> command("EHLO local") ──> command("AUTH LOGIN") ...
//!        ──> close
//! ```
//!
//! Everything that waits takes an explicit timeout. A timeout leaves
//! the phase untouched; the caller decides whether to retry.

use crate::completion::{Completion, Verdict};
use crate::config::SessionOptions;
use crate::dialect::{CommandKind, Dialect};
use crate::error::{Error, Result};
use crate::phase::{Event, Phase};
use crate::record::{Command, ExchangeRecord, Response, ResponseState};
use crate::transport::{Transport, server_name, tls_connector};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Upper bound for the orderly shutdown in [`Session::close`].
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Closes a session from another task.
///
/// Any read the session is waiting on fails with
/// [`Error::ConnectionClosed`], and every later operation does too.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Client side of one line-oriented protocol session.
///
/// The session exclusively owns its transport; independent sessions
/// can run on separate tasks without any shared state.
pub struct Session<S = TcpStream> {
    dialect: Dialect,
    options: SessionOptions,
    transport: Transport<S>,
    phase: Phase,
    /// Received bytes not yet handed to the caller.
    pending: Vec<u8>,
    transcript: Vec<ExchangeRecord>,
    issued_tags: HashSet<String>,
    /// Tag of the last tagged IMAP command; continuation answers
    /// complete on it.
    open_tag: Option<String>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl Session<TcpStream> {
    /// Create a session and open it against `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connect`] if the connection is refused or not
    /// established within `timeout`.
    pub async fn connect(
        dialect: Dialect,
        options: SessionOptions,
        addr: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let mut session = Self::new(dialect, options);
        session.open(addr, timeout).await?;
        Ok(session)
    }

    /// Establish the plain TCP transport. No data is exchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connect`] on refusal or when `timeout` elapses,
    /// and [`Error::Usage`] if the session was already opened.
    pub async fn open(&mut self, addr: &str, timeout: Duration) -> Result<()> {
        self.ensure_detached()?;
        debug!("Connecting to {} server at {}", self.dialect, addr);

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::Connect {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(Error::Connect {
                    addr: addr.to_string(),
                    reason: format!("timed out after {timeout:?}"),
                });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }

        info!("Connected to {} server at {}", self.dialect, addr);
        self.attach(stream)
    }
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[must_use]
    pub fn new(dialect: Dialect, options: SessionOptions) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            dialect,
            options,
            transport: Transport::Detached,
            phase: Phase::Init,
            pending: Vec::new(),
            transcript: Vec::new(),
            issued_tags: HashSet::new(),
            open_tag: None,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        }
    }

    /// Use an already connected byte stream as the plain transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Usage`] if the session was already opened.
    pub fn attach(&mut self, stream: S) -> Result<()> {
        self.ensure_detached()?;
        self.transport = Transport::Plain(stream);
        self.advance(Event::Opened);
        Ok(())
    }

    #[must_use]
    pub const fn dialect(&self) -> Dialect {
        self.dialect
    }

    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether the active transport is the TLS one.
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.transport.is_encrypted()
    }

    /// Bytes received past the last recognized response boundary.
    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        &self.pending
    }

    #[must_use]
    pub fn transcript(&self) -> &[ExchangeRecord] {
        &self.transcript
    }

    #[must_use]
    pub fn into_transcript(self) -> Vec<ExchangeRecord> {
        self.transcript
    }

    /// A handle that closes this session from elsewhere.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.cancel_tx),
        }
    }

    /// Wait for at least one byte, up to `max_bytes`.
    ///
    /// Bytes left over from an earlier [`read_until_complete`] are
    /// returned first without touching the transport. The result may
    /// be any fragment of a reply.
    ///
    /// [`read_until_complete`]: Self::read_until_complete
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if nothing arrives before `timeout`
    /// (a zero timeout fails at once on an idle connection), and
    /// [`Error::ConnectionClosed`] if the peer is gone.
    pub async fn receive(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>> {
        self.ensure_open()?;
        if max_bytes == 0 {
            return Err(Error::Usage("receive needs room for at least one byte".into()));
        }

        if self.pending.is_empty() {
            let deadline = Instant::now() + timeout;
            self.fill(max_bytes, deadline, timeout, "receive").await?;
        }

        let take = max_bytes.min(self.pending.len());
        let bytes: Vec<u8> = self.pending.drain(..take).collect();
        self.record_response(Response::new(bytes.clone(), ResponseState::Partial));
        Ok(bytes)
    }

    /// Write `text` followed by CRLF as a single write.
    ///
    /// The line is classified by the session's dialect and moves the
    /// phase (capability probe, STARTTLS, authentication, credential).
    /// It opens a new exchange record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Usage`] for text containing CR or LF, a reused
    /// IMAP tag, or STARTTLS on an encrypted transport, and
    /// [`Error::ConnectionClosed`] if the peer has closed.
    pub async fn send_line(&mut self, text: &str) -> Result<()> {
        self.ensure_open()?;
        if text.contains(['\r', '\n']) {
            return Err(Error::Usage("a command must be a single line".into()));
        }

        let (kind, tag) = self
            .dialect
            .classify(text, self.phase == Phase::AwaitingCredential);
        if kind == CommandKind::StartTls && self.transport.is_encrypted() {
            return Err(Error::Usage("STARTTLS on an encrypted transport".into()));
        }
        if self.dialect == Dialect::Imap
            && let Some(tag) = &tag
            && !self.issued_tags.insert(tag.clone())
        {
            return Err(Error::Usage(format!("IMAP tag {tag} was already used")));
        }

        let shown = self.dialect.redact(text, kind);
        debug!(">> {}", shown);

        let mut wire = String::with_capacity(text.len() + 2);
        wire.push_str(text);
        wire.push_str("\r\n");
        if let Err(e) = self.transport.write_all(wire.as_bytes()).await {
            return Err(self.transport_failure(e));
        }

        if self.dialect == Dialect::Imap && tag.is_some() {
            self.open_tag.clone_from(&tag);
        }
        self.transcript
            .push(ExchangeRecord::for_command(Command::new(
                text.to_string(),
                shown,
                kind,
                tag,
            )));
        self.advance(Event::Sent(kind));
        Ok(())
    }

    /// Accumulate bytes until `completion` recognizes a response.
    ///
    /// Returns exactly the bytes up to the recognized boundary; the
    /// rest stays buffered for the next exchange. A continuation
    /// (credential prompt) is returned as a
    /// [`ResponseState::Continuation`] response and moves the phase to
    /// [`Phase::AwaitingCredential`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when `timeout` elapses first,
    /// [`Error::ConnectionClosed`] if the peer is gone, and
    /// [`Error::ProtocolViolation`] when the predicate rejects the
    /// bytes or no response shape is recognized within the configured
    /// read or byte bound. A rejected reply is recorded as partial and
    /// leaves the phase unchanged.
    pub async fn read_until_complete<C>(
        &mut self,
        completion: &C,
        timeout: Duration,
    ) -> Result<Response>
    where
        C: Completion + ?Sized,
    {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;
        let mut reads = 0usize;

        let (end, state) = loop {
            match completion.evaluate(&self.pending) {
                Verdict::Complete { end } => break (end, ResponseState::Complete),
                Verdict::Continuation { end } => break (end, ResponseState::Continuation),
                Verdict::Malformed { end } => {
                    let end = end.min(self.pending.len());
                    let bytes: Vec<u8> = self.pending.drain(..end).collect();
                    warn!("<< malformed reply: {}", String::from_utf8_lossy(&bytes).trim_end());
                    self.record_response(Response::new(bytes, ResponseState::Partial));
                    return Err(Error::ProtocolViolation(
                        "reply line without a status code".to_string(),
                    ));
                }
                Verdict::Pending => {}
            }

            if self.pending.len() >= self.options.max_response_bytes {
                return Err(Error::ProtocolViolation(format!(
                    "no complete response within {} bytes",
                    self.pending.len()
                )));
            }
            if reads >= self.options.max_reads {
                return Err(Error::ProtocolViolation(format!(
                    "no complete response after {reads} reads"
                )));
            }
            reads += 1;
            self.fill(self.options.read_chunk, deadline, timeout, "response")
                .await?;
        };

        let end = end.min(self.pending.len());
        let response = Response::new(self.pending.drain(..end).collect(), state);
        debug!(
            "<< {} bytes ({:?}) in {} reads",
            response.bytes().len(),
            state,
            reads
        );
        trace!("<< {}", response.text());

        let event = if state == ResponseState::Continuation {
            Event::Continuation
        } else {
            let positive = self
                .dialect
                .is_positive(&response, self.open_tag.as_deref());
            Event::Completed { positive }
        };
        self.advance(event);
        self.record_response(response.clone());
        Ok(response)
    }

    /// Read the server greeting.
    ///
    /// # Errors
    ///
    /// Same as [`read_until_complete`](Self::read_until_complete).
    pub async fn read_greeting(&mut self, timeout: Duration) -> Result<Response> {
        let completion = self.dialect.greeting_completion();
        self.read_until_complete(completion.as_ref(), timeout).await
    }

    /// Read the reply to the last command with the dialect's predicate.
    ///
    /// # Errors
    ///
    /// Same as [`read_until_complete`](Self::read_until_complete).
    pub async fn read_reply(&mut self, timeout: Duration) -> Result<Response> {
        let in_auth = matches!(
            self.phase,
            Phase::AwaitingAuthResult | Phase::AwaitingCredential
        );
        let completion = self
            .dialect
            .reply_completion(self.open_tag.as_deref(), in_auth);
        self.read_until_complete(completion.as_ref(), timeout).await
    }

    /// Send `line` and read its reply.
    ///
    /// # Errors
    ///
    /// Any error of [`send_line`](Self::send_line) or
    /// [`read_reply`](Self::read_reply).
    pub async fn command(&mut self, line: &str, timeout: Duration) -> Result<Response> {
        self.send_line(line).await?;
        self.read_reply(timeout).await
    }

    /// Replace the plain transport with TLS over the same stream.
    ///
    /// Only valid once the STARTTLS acknowledgement has been fully
    /// read ([`Phase::TlsAckReceived`]). Buffered plaintext is
    /// discarded: anything the server sent after its acknowledgement
    /// was not protected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Upgrade`] when called out of order, twice, or
    /// when the handshake or certificate validation against
    /// `expected_host` fails, and [`Error::Timeout`] if the handshake
    /// does not finish within `timeout`. A failed handshake leaves the
    /// session closed.
    pub async fn upgrade_transport(&mut self, expected_host: &str, timeout: Duration) -> Result<()> {
        self.ensure_open()?;
        if self.transport.is_encrypted() {
            return Err(Error::Upgrade("transport is already encrypted".into()));
        }
        if self.phase != Phase::TlsAckReceived {
            return Err(Error::Upgrade(format!(
                "STARTTLS acknowledgement not received (phase {})",
                self.phase
            )));
        }

        let connector = tls_connector(&self.options.tls)?;
        let name = server_name(expected_host)?;

        let stream = match self.transport.take() {
            Transport::Plain(stream) => stream,
            other => {
                self.transport = other;
                return Err(Error::Upgrade("no plain transport to upgrade".into()));
            }
        };

        if !self.pending.is_empty() {
            warn!(
                "Discarding {} plaintext bytes received after the STARTTLS acknowledgement",
                self.pending.len()
            );
            self.pending.clear();
        }

        debug!("Starting TLS handshake, expecting {}", expected_host);
        let mut cancel = self.cancel_rx.clone();
        let handshake = tokio::select! {
            biased;
            _ = cancel.wait_for(|cancelled| *cancelled) => None,
            res = tokio::time::timeout(timeout, connector.connect(name, stream)) => Some(res),
        };

        match handshake {
            Some(Ok(Ok(tls_stream))) => {
                self.transport = Transport::Tls(Box::new(tls_stream));
                self.advance(Event::Upgraded);
                info!("Transport upgraded to TLS ({})", expected_host);
                Ok(())
            }
            Some(Ok(Err(e))) => {
                self.abandon();
                Err(Error::Upgrade(format!(
                    "TLS handshake with {expected_host} failed: {e}"
                )))
            }
            Some(Err(_)) => {
                self.abandon();
                Err(Error::Timeout {
                    operation: "TLS handshake",
                    after: timeout,
                })
            }
            None => {
                self.abandon();
                Err(Error::ConnectionClosed)
            }
        }
    }

    /// Close the active transport. Idempotent; never fails.
    pub async fn close(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }

        let mut transport = self.transport.take();
        match tokio::time::timeout(CLOSE_GRACE, transport.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Shutdown failed: {}", e),
            Err(_) => debug!("Shutdown did not finish within {:?}", CLOSE_GRACE),
        }
        drop(transport);

        self.pending.clear();
        self.advance(Event::Closed);
        debug!("{} session closed", self.dialect);
    }

    // -- private helpers --

    fn advance(&mut self, event: Event) {
        let next = self.phase.next(event);
        if next != self.phase {
            debug!("Phase {} -> {}", self.phase, next);
            self.phase = next;
        }
    }

    fn ensure_detached(&self) -> Result<()> {
        match self.transport {
            Transport::Detached => Ok(()),
            _ => Err(Error::Usage("session was already opened".into())),
        }
    }

    fn ensure_open(&mut self) -> Result<()> {
        if *self.cancel_rx.borrow() {
            if self.phase != Phase::Closed {
                info!("{} session cancelled", self.dialect);
                self.abandon();
            }
            return Err(Error::ConnectionClosed);
        }
        match self.transport {
            Transport::Detached => Err(Error::Usage("session is not open".into())),
            Transport::Closed => Err(Error::ConnectionClosed),
            Transport::Plain(_) | Transport::Tls(_) => Ok(()),
        }
    }

    /// Drop the transport without an orderly shutdown.
    fn abandon(&mut self) {
        self.transport = Transport::Closed;
        self.pending.clear();
        self.advance(Event::Closed);
    }

    fn transport_failure(&mut self, err: std::io::Error) -> Error {
        let err = Error::from_transport(err);
        if matches!(err, Error::ConnectionClosed) {
            debug!("Peer closed the connection");
            self.abandon();
        }
        err
    }

    /// One read of at most `max` bytes into the pending buffer.
    async fn fill(
        &mut self,
        max: usize,
        deadline: Instant,
        timeout: Duration,
        operation: &'static str,
    ) -> Result<usize> {
        let mut chunk = vec![0u8; max];
        let mut cancel = self.cancel_rx.clone();

        let read = tokio::select! {
            biased;
            _ = cancel.wait_for(|cancelled| *cancelled) => None,
            res = tokio::time::timeout_at(deadline, self.transport.read(&mut chunk)) => Some(res),
        };

        match read {
            None => {
                info!("{} session cancelled", self.dialect);
                self.abandon();
                Err(Error::ConnectionClosed)
            }
            Some(Err(_)) => Err(Error::Timeout {
                operation,
                after: timeout,
            }),
            Some(Ok(Ok(0))) => {
                debug!("Peer closed the connection");
                self.abandon();
                Err(Error::ConnectionClosed)
            }
            Some(Ok(Ok(n))) => {
                self.pending.extend_from_slice(&chunk[..n]);
                self.advance(Event::Received);
                Ok(n)
            }
            Some(Ok(Err(e))) => Err(self.transport_failure(e)),
        }
    }

    fn record_response(&mut self, response: Response) {
        if let Some(record) = self.transcript.last_mut() {
            record.responses.push(response);
        } else {
            let mut record = ExchangeRecord::greeting();
            record.responses.push(response);
            self.transcript.push(record);
        }
    }
}
