//! Fake IMAP server
//!
//! Speaks the slice of IMAP4rev1 a probe walks through:
//!
//! ```text
//!   S: * OK [CAPABILITY IMAP4rev1 STARTTLS AUTH=PLAIN] Fake IMAP ready
//!   C: a1 STARTTLS
//!   S: a1 OK Begin TLS negotiation now
//!      <TLS handshake>
//!   C: a2 CAPABILITY
//!   S: * CAPABILITY IMAP4rev1 AUTH=PLAIN
//!   S: a2 OK CAPABILITY completed
//!   C: a3 LOGIN "user" "pass"
//!   S: a3 OK LOGIN completed
//!   C: a4 LIST "" "*"
//!   S: * LIST (\HasNoChildren) "/" "INBOX"
//!   S: a4 OK LIST completed
//!   C: a5 LOGOUT
//!   S: * BYE Logging out
//!   S: a5 OK LOGOUT completed
//! ```
//!
//! Commands are parsed with `imap-codec`. STARTTLS is matched on the
//! raw line before decoding.

use super::account::Account;
use super::io::{WireLine, WireLog, write_line};
use super::tls::TestCert;
use imap_codec::CommandCodec;
use imap_codec::decode::Decoder;
use imap_codec::imap_types::command::CommandBody;
use rustls::pki_types::CertificateDer;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

/// A fake IMAP server on localhost with an OS-assigned port.
pub struct FakeImapServer {
    port: u16,
    cert: CertificateDer<'static>,
    cert_pem: String,
    log: WireLog,
    handle: tokio::task::JoinHandle<()>,
}

impl FakeImapServer {
    /// Bind to `127.0.0.1:0` and serve `account` until dropped.
    pub async fn start(account: Account) -> Self {
        let tls = TestCert::generate();
        Self::start_with_cert(account, tls).await
    }

    pub async fn start_with_cert(account: Account, tls: TestCert) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let port = listener.local_addr().unwrap().port();
        let log = WireLog::default();
        let account = Arc::new(account);

        let acceptor = tls.acceptor.clone();
        let conn_log = log.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _addr)) = listener.accept().await else {
                    break;
                };
                let acceptor = acceptor.clone();
                let account = account.clone();
                let log = conn_log.clone();
                tokio::spawn(async move {
                    handle_connection(stream, acceptor, &account, &log).await;
                });
            }
        });

        Self {
            port,
            cert: tls.der,
            cert_pem: tls.pem,
            log,
            handle,
        }
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    pub fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    /// The certificate presented after STARTTLS.
    pub fn cert(&self) -> CertificateDer<'static> {
        self.cert.clone()
    }

    /// The same certificate in PEM form.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Every line received so far, across connections.
    pub fn received(&self) -> Vec<WireLine> {
        self.log.lines()
    }
}

impl Drop for FakeImapServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// How a command loop ended.
enum Next<S> {
    /// STARTTLS was acknowledged; the caller performs the handshake.
    StartTls(S),
    Done,
}

async fn handle_connection(
    stream: TcpStream,
    acceptor: TlsAcceptor,
    account: &Account,
    log: &WireLog,
) {
    let mut reader = BufReader::new(stream);
    let greeting = if account.starttls {
        "* OK [CAPABILITY IMAP4rev1 STARTTLS LOGINDISABLED] Fake IMAP ready\r\n"
    } else {
        "* OK [CAPABILITY IMAP4rev1 AUTH=PLAIN] Fake IMAP ready\r\n"
    };
    if write_line(&mut reader, greeting).await.is_err() {
        return;
    }

    let Next::StartTls(tcp) = serve(reader, false, account, log).await else {
        return;
    };
    let Ok(tls_stream) = acceptor.accept(tcp).await else {
        return;
    };
    serve(BufReader::new(tls_stream), true, account, log).await;
}

/// Run the command loop until LOGOUT, EOF or an accepted STARTTLS.
async fn serve<S: AsyncRead + AsyncWrite + Unpin>(
    mut reader: BufReader<S>,
    encrypted: bool,
    account: &Account,
    log: &WireLog,
) -> Next<S> {
    let codec = CommandCodec::default();

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return Next::Done,
            Ok(_) => {}
        }
        log.push(encrypted, &line);

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut words = trimmed.split_whitespace();
        let raw_tag = words.next().unwrap_or("*").to_string();

        if words
            .next()
            .is_some_and(|verb| verb.eq_ignore_ascii_case("STARTTLS"))
        {
            let reply = if encrypted {
                format!("{raw_tag} BAD Already in TLS\r\n")
            } else if account.starttls {
                format!("{raw_tag} OK Begin TLS negotiation now\r\n")
            } else {
                format!("{raw_tag} BAD STARTTLS not supported\r\n")
            };
            if write_line(&mut reader, &reply).await.is_err() {
                return Next::Done;
            }
            if !encrypted && account.starttls {
                return Next::StartTls(reader.into_inner());
            }
            continue;
        }

        let Ok((_, command)) = codec.decode(line.as_bytes()) else {
            let reply = format!("{raw_tag} BAD Parse error\r\n");
            if write_line(&mut reader, &reply).await.is_err() {
                return Next::Done;
            }
            continue;
        };
        let tag = command.tag.inner();

        let reply = match command.body {
            CommandBody::Capability => {
                let caps = if encrypted || !account.starttls {
                    "IMAP4rev1 AUTH=PLAIN"
                } else {
                    "IMAP4rev1 STARTTLS LOGINDISABLED"
                };
                format!("* CAPABILITY {caps}\r\n{tag} OK CAPABILITY completed\r\n")
            }
            CommandBody::Noop => format!("{tag} OK NOOP completed\r\n"),
            CommandBody::Login { .. } => {
                if let Some(delay) = account.login_delay {
                    tokio::time::sleep(delay).await;
                }
                if login_matches(trimmed, account) {
                    format!("{tag} OK LOGIN completed\r\n")
                } else {
                    format!("{tag} NO [AUTHENTICATIONFAILED] Invalid credentials\r\n")
                }
            }
            CommandBody::List { .. } => {
                let mut reply = String::new();
                for folder in &account.folders {
                    reply.push_str(&format!("* LIST (\\HasNoChildren) \"/\" \"{folder}\"\r\n"));
                }
                reply.push_str(&format!("{tag} OK LIST completed\r\n"));
                reply
            }
            CommandBody::Logout => {
                let reply = format!("* BYE Logging out\r\n{tag} OK LOGOUT completed\r\n");
                let _ = write_line(&mut reader, &reply).await;
                return Next::Done;
            }
            _ => format!("{tag} BAD Unknown command\r\n"),
        };

        if write_line(&mut reader, &reply).await.is_err() {
            return Next::Done;
        }
    }
}

/// Compare the two arguments of `tag LOGIN user pass` with the account.
fn login_matches(line: &str, account: &Account) -> bool {
    let args = line
        .splitn(3, ' ')
        .nth(2)
        .map(parse_args)
        .unwrap_or_default();
    matches!(args.as_slice(), [user, pass] if *user == account.username && *pass == account.password)
}

/// Split IMAP atoms and quoted strings, undoing `\"` and `\\`.
fn parse_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c == ' ' {
            chars.next();
            continue;
        }
        let mut arg = String::new();
        if c == '"' {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => arg.extend(chars.next()),
                    '"' => break,
                    _ => arg.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ' ' {
                    break;
                }
                arg.push(c);
                chars.next();
            }
        }
        args.push(arg);
    }
    args
}
