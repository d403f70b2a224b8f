#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! CLI for probing a local IMAP/SMTP mail proxy

use clap::{Parser, Subcommand};
use mail_probe::{ImapProbe, ProbeConfig, ProbeReport, SmtpProbe};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mail-probe")]
#[command(about = "Drive IMAP and SMTP handshakes against a mail proxy")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Log in over IMAP, list folders, log out
    Imap {
        /// Upgrade the connection with STARTTLS first
        #[arg(long)]
        starttls: bool,
    },

    /// Send a single IMAP LOGIN to start the proxy's authorization flow
    ImapLogin,

    /// EHLO and AUTH LOGIN over SMTP
    Smtp {
        /// Upgrade the connection with STARTTLS first
        #[arg(long)]
        starttls: bool,
    },

    /// Run the IMAP and SMTP probes side by side
    All {
        /// Upgrade both connections with STARTTLS first
        #[arg(long)]
        starttls: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = ProbeConfig::from_env()?;

    let reports = match args.command {
        Command::Imap { starttls } => {
            vec![ImapProbe::new(config)?.login_list_logout(starttls).await?]
        }
        Command::ImapLogin => vec![ImapProbe::new(config)?.trigger_login().await?],
        Command::Smtp { starttls } => vec![SmtpProbe::new(config)?.auth_login(starttls).await?],
        Command::All { starttls } => {
            let imap = ImapProbe::new(config.clone())?;
            let smtp = SmtpProbe::new(config)?;
            let (imap, smtp) = tokio::join!(
                imap.login_list_logout(starttls),
                smtp.auth_login(starttls)
            );
            vec![imap?, smtp?]
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            print_report(report);
        }
    }

    Ok(())
}

fn print_report(report: &ProbeReport) {
    println!("== {} ==", report.dialect);

    for record in &report.transcript {
        if let Some(command) = &record.command {
            println!(">> {command}");
        }
        for response in &record.responses {
            for line in response.lines() {
                println!("<< {line}");
            }
            if let Some(prompt) = response.decoded_prompt() {
                println!("   (prompt: {prompt})");
            }
        }
    }

    println!(
        "phase: {}{}",
        report.phase,
        if report.encrypted { " (TLS)" } else { "" }
    );
}
