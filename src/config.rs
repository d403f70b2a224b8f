//! Probe configuration

use crate::error::{Error, Result};
use crate::probe::Credentials;
use crate::transport::TlsTrust;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Driver tuning shared by every session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Most bytes taken from the transport per read.
    pub read_chunk: usize,
    /// Reads allowed per response before giving up.
    pub max_reads: usize,
    /// Largest response accumulated before giving up.
    pub max_response_bytes: usize,
    pub tls: TlsTrust,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            read_chunk: 64 * 1024,
            max_reads: 1024,
            max_response_bytes: 1024 * 1024,
            tls: TlsTrust::default(),
        }
    }
}

/// Where and how to probe a local mail proxy
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub host: String,
    pub imap_port: u16,
    pub smtp_port: u16,
    pub credentials: Credentials,
    /// Name the certificate presented after STARTTLS must match.
    pub tls_server_name: String,
    /// Deadline for every connect, reply and handshake.
    pub timeout: Duration,
    /// Argument of `EHLO`.
    pub helo_name: String,
    /// Accept any certificate during the upgrade.
    pub tls_insecure: bool,
    /// Extra PEM root certificates to trust instead of the web PKI.
    pub ca_file: Option<PathBuf>,
}

impl ProbeConfig {
    /// Load probe configuration from environment variables
    ///
    /// Reads from `.env` file if present. Required variables:
    /// - `PROBE_USERNAME`
    /// - `PROBE_PASSWORD`
    ///
    /// Optional (with defaults):
    /// - `PROBE_HOST` (default: `127.0.0.1`)
    /// - `PROBE_IMAP_PORT` (default: `1993`)
    /// - `PROBE_SMTP_PORT` (default: `1587`)
    /// - `PROBE_TLS_SERVER_NAME` (default: the host)
    /// - `PROBE_TIMEOUT_SECS` (default: `10`)
    /// - `PROBE_HELO_NAME` (default: `local`)
    /// - `PROBE_TLS_INSECURE` (default: `false`)
    /// - `PROBE_CA_FILE` (default: unset)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a required variable is missing or a
    /// value does not parse.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Same as [`ProbeConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let host = lookup("PROBE_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let username = lookup("PROBE_USERNAME")
            .ok_or_else(|| Error::Config("PROBE_USERNAME not set".into()))?;
        let password = lookup("PROBE_PASSWORD")
            .ok_or_else(|| Error::Config("PROBE_PASSWORD not set".into()))?;

        Ok(Self {
            imap_port: parse_or(&lookup, "PROBE_IMAP_PORT", 1993)?,
            smtp_port: parse_or(&lookup, "PROBE_SMTP_PORT", 1587)?,
            credentials: Credentials::new(username, password),
            tls_server_name: lookup("PROBE_TLS_SERVER_NAME").unwrap_or_else(|| host.clone()),
            timeout: Duration::from_secs(parse_or(&lookup, "PROBE_TIMEOUT_SECS", 10)?),
            helo_name: lookup("PROBE_HELO_NAME").unwrap_or_else(|| "local".to_string()),
            tls_insecure: parse_flag(&lookup, "PROBE_TLS_INSECURE")?,
            ca_file: lookup("PROBE_CA_FILE").map(PathBuf::from),
            host,
        })
    }

    #[must_use]
    pub fn imap_addr(&self) -> String {
        format!("{}:{}", self.host, self.imap_port)
    }

    #[must_use]
    pub fn smtp_addr(&self) -> String {
        format!("{}:{}", self.host, self.smtp_port)
    }

    /// Session options with the trust policy this configuration asks for.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `ca_file` cannot be loaded.
    pub fn session_options(&self) -> Result<SessionOptions> {
        let tls = if self.tls_insecure {
            TlsTrust::AcceptAny
        } else if let Some(path) = &self.ca_file {
            TlsTrust::from_pem_file(path)?
        } else {
            TlsTrust::WebPki
        };
        Ok(SessionOptions {
            tls,
            ..SessionOptions::default()
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key).map_or(Ok(default), |raw| {
        raw.trim()
            .parse()
            .map_err(|e| Error::Config(format!("Invalid {key}: {e}")))
    })
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<bool> {
    match lookup(key).as_deref().map(str::trim) {
        None | Some("" | "0" | "false" | "no" | "off") => Ok(false),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some(other) => Err(Error::Config(format!("Invalid {key}: {other}"))),
    }
}
