//! Fake SMTP submission server
//!
//! ```text
//!   S: 220 fake.local ESMTP ready
//!   C: EHLO local
//!   S: 250-fake.local
//!   S: 250-STARTTLS
//!   S: 250 AUTH LOGIN PLAIN
//!   C: STARTTLS
//!   S: 220 Ready to start TLS
//!      <TLS handshake, EHLO again>
//!   C: AUTH LOGIN
//!   S: 334 VXNlcm5hbWU6
//!   C: <base64 username>
//!   S: 334 UGFzc3dvcmQ6
//!   C: <base64 password>
//!   S: 235 2.7.0 Authentication successful
//!   C: QUIT
//!   S: 221 Bye
//! ```
//!
//! The EHLO reply is written one line per flush so clients see it
//! arrive in pieces.

use super::account::Account;
use super::io::{WireLine, WireLog, write_line};
use super::tls::TestCert;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rustls::pki_types::CertificateDer;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

/// `Username:` in base64.
const USERNAME_PROMPT: &str = "VXNlcm5hbWU6";
/// `Password:` in base64.
const PASSWORD_PROMPT: &str = "UGFzc3dvcmQ6";

/// A fake SMTP server on localhost with an OS-assigned port.
pub struct FakeSmtpServer {
    port: u16,
    cert: CertificateDer<'static>,
    cert_pem: String,
    log: WireLog,
    handle: tokio::task::JoinHandle<()>,
}

impl FakeSmtpServer {
    /// Bind to `127.0.0.1:0` and serve `account` until dropped.
    pub async fn start(account: Account) -> Self {
        Self::start_with_cert(account, TestCert::generate()).await
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

    pub fn cert(&self) -> CertificateDer<'static> {
        self.cert.clone()
    }

    /// The same certificate in PEM form.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn received(&self) -> Vec<WireLine> {
        self.log.lines()
    }
}

impl Drop for FakeSmtpServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

enum Next<S> {
    StartTls(S),
    Done,
}

/// Where an AUTH LOGIN exchange stands.
enum Auth {
    Idle,
    WantUsername,
    WantPassword(String),
    Done,
}

async fn handle_connection(
    stream: TcpStream,
    acceptor: TlsAcceptor,
    account: &Account,
    log: &WireLog,
) {
    let mut reader = BufReader::new(stream);
    if write_line(&mut reader, "220 fake.local ESMTP ready\r\n")
        .await
        .is_err()
    {
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

async fn serve<S: AsyncRead + AsyncWrite + Unpin>(
    mut reader: BufReader<S>,
    encrypted: bool,
    account: &Account,
    log: &WireLog,
) -> Next<S> {
    let mut auth = Auth::Idle;

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return Next::Done,
            Ok(_) => {}
        }
        log.push(encrypted, &line);
        let trimmed = line.trim();

        // Credential answers are not commands.
        match std::mem::replace(&mut auth, Auth::Idle) {
            Auth::WantUsername => {
                let user = decode(trimmed);
                auth = Auth::WantPassword(user);
                if write_line(&mut reader, &prompt(account, PASSWORD_PROMPT))
                    .await
                    .is_err()
                {
                    return Next::Done;
                }
                continue;
            }
            Auth::WantPassword(user) => {
                let reply = if user == account.username && decode(trimmed) == account.password {
                    auth = Auth::Done;
                    "235 2.7.0 Authentication successful\r\n"
                } else {
                    "535 5.7.8 Authentication credentials invalid\r\n"
                };
                if write_line(&mut reader, reply).await.is_err() {
                    return Next::Done;
                }
                continue;
            }
            previous => auth = previous,
        }

        let upper = trimmed.to_ascii_uppercase();
        let verb = upper.split_whitespace().next().unwrap_or_default();

        match verb {
            "EHLO" | "HELO" => {
                let mut lines = vec!["250-fake.local".to_string()];
                if account.starttls && !encrypted {
                    lines.push("250-STARTTLS".to_string());
                }
                lines.push("250-SIZE 10240000".to_string());
                lines.push("250 AUTH LOGIN PLAIN".to_string());
                for line in lines {
                    if write_line(&mut reader, &format!("{line}\r\n")).await.is_err() {
                        return Next::Done;
                    }
                }
            }
            "STARTTLS" => {
                let reply = if encrypted {
                    "503 5.5.1 TLS already active\r\n"
                } else if account.starttls {
                    "220 2.0.0 Ready to start TLS\r\n"
                } else {
                    "454 4.7.0 TLS not available\r\n"
                };
                if write_line(&mut reader, reply).await.is_err() {
                    return Next::Done;
                }
                if !encrypted && account.starttls {
                    return Next::StartTls(reader.into_inner());
                }
            }
            "AUTH" => {
                let reply = if matches!(auth, Auth::Done) {
                    "503 5.5.1 Already authenticated\r\n".to_string()
                } else if account.require_tls && !encrypted {
                    "530 5.7.0 Must issue a STARTTLS command first\r\n".to_string()
                } else if upper == "AUTH LOGIN" {
                    auth = Auth::WantUsername;
                    prompt(account, USERNAME_PROMPT)
                } else {
                    "504 5.5.4 Unrecognized authentication type\r\n".to_string()
                };
                if write_line(&mut reader, &reply).await.is_err() {
                    return Next::Done;
                }
            }
            "NOOP" => {
                if write_line(&mut reader, "250 2.0.0 OK\r\n").await.is_err() {
                    return Next::Done;
                }
            }
            "QUIT" => {
                let _ = write_line(&mut reader, "221 2.0.0 Bye\r\n").await;
                return Next::Done;
            }
            _ => {
                if write_line(&mut reader, "502 5.5.2 Command not recognized\r\n")
                    .await
                    .is_err()
                {
                    return Next::Done;
                }
            }
        }
    }
}

fn prompt(account: &Account, text: &str) -> String {
    if account.bare_prompts {
        format!("{text}\r\n")
    } else {
        format!("334 {text}\r\n")
    }
}

fn decode(line: &str) -> String {
    STANDARD
        .decode(line)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_default()
}
