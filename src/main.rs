//! CLI entry point for `mboxstore`.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use mboxstore::config::{self, Config};
use mboxstore::model::attribute::{flags_to_string, string_to_flags};
use mboxstore::{Envelope, Flags, FormatRegistry, MailboxBackend, MailboxEvent};

#[derive(Parser)]
#[command(
    name = "mboxstore",
    version,
    about = "Inspect and maintain mbox mailboxes",
    after_help = "Mailboxes may be given as plain paths or as mbox:/path URLs."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Show mailbox statistics
    Stats {
        mailbox: String,
        #[arg(long)]
        json: bool,
    },
    /// List messages
    List {
        mailbox: String,
        #[arg(long)]
        json: bool,
    },
    /// Print one message
    Show {
        mailbox: String,
        /// Message number, starting at 1
        msgno: usize,
        /// Print only the header block
        #[arg(long)]
        headers: bool,
    },
    /// Set or clear status flags (letters from "OAFRTd")
    Flag {
        mailbox: String,
        msgno: usize,
        letters: String,
        /// Clear the flags instead of setting them
        #[arg(long)]
        clear: bool,
    },
    /// Mark messages deleted and expunge them
    Delete {
        mailbox: String,
        #[arg(required = true)]
        msgnos: Vec<usize>,
        /// Only mark; leave removal to a later expunge
        #[arg(long)]
        keep: bool,
    },
    /// Remove deleted messages
    Expunge { mailbox: String },
    /// Write pending flag and UID changes into the file
    Sync { mailbox: String },
    /// Append a message read from a file ("-" for stdin)
    Append {
        mailbox: String,
        file: PathBuf,
        /// Initial status letters
        #[arg(long, default_value = "")]
        flags: String,
        /// Envelope sender for the separator line
        #[arg(long)]
        sender: Option<String>,
    },
    /// Write the default configuration file
    InitConfig,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = config::load_config();

    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    let registry = FormatRegistry::with_defaults();

    match cli.command {
        Commands::Stats { mailbox, json } => cmd_stats(&registry, &config, &mailbox, json),
        Commands::List { mailbox, json } => cmd_list(&registry, &config, &mailbox, json),
        Commands::Show {
            mailbox,
            msgno,
            headers,
        } => cmd_show(&registry, &config, &mailbox, msgno, headers),
        Commands::Flag {
            mailbox,
            msgno,
            letters,
            clear,
        } => cmd_flag(&registry, &config, &mailbox, msgno, &letters, clear),
        Commands::Delete {
            mailbox,
            msgnos,
            keep,
        } => cmd_delete(&registry, &config, &mailbox, &msgnos, keep),
        Commands::Expunge { mailbox } => cmd_expunge(&registry, &config, &mailbox, true),
        Commands::Sync { mailbox } => cmd_expunge(&registry, &config, &mailbox, false),
        Commands::Append {
            mailbox,
            file,
            flags,
            sender,
        } => cmd_append(&registry, &config, &mailbox, &file, &flags, sender),
        Commands::InitConfig => cmd_init_config(&config),
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_path = config::log_file_path(config);
    let log_dir = config::cache_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_name = log_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "mboxstore.log".into());
        let file_appender = tracing_appender::rolling::never(&log_dir, file_name);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

/// Open a mailbox with a progress bar attached to its scans.
fn open(
    registry: &FormatRegistry,
    config: &Config,
    url: &str,
) -> anyhow::Result<(Box<dyn MailboxBackend>, ProgressBar)> {
    let mailbox = registry
        .open(url, config)
        .with_context(|| format!("cannot open {url}"))?;

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} Scanning [{bar:40.cyan/blue}] {pos}%")
            .expect("valid template")
            .progress_chars("#>-"),
    );
    let bar = pb.clone();
    mailbox.subscribe(Arc::new(move |event: &MailboxEvent| match event {
        MailboxEvent::Progress { percent } => bar.set_position(u64::from(*percent)),
        MailboxEvent::Corrupt { reason } => bar.println(format!("  mailbox corrupt: {reason}")),
        _ => {}
    }));
    Ok((mailbox, pb))
}

/// Count messages, clearing the progress bar once the scan is done.
fn scan(mailbox: &dyn MailboxBackend, pb: &ProgressBar) -> anyhow::Result<usize> {
    let count = mailbox.messages_count();
    pb.finish_and_clear();
    Ok(count?)
}

fn cmd_stats(registry: &FormatRegistry, config: &Config, url: &str, json: bool) -> anyhow::Result<()> {
    use humansize::{format_size, BINARY};

    let (mailbox, pb) = open(registry, config, url)?;
    let start = Instant::now();
    let count = scan(mailbox.as_ref(), &pb)?;
    let elapsed = start.elapsed();

    let file_size = std::fs::metadata(mailbox.path()).map(|m| m.len()).unwrap_or(0);
    let recent = mailbox.messages_recent()?;
    let unseen = mailbox.message_unseen()?;
    let uidvalidity = mailbox.uidvalidity()?;
    let uidnext = mailbox.uidnext()?;

    if json {
        let stats = serde_json::json!({
            "file": mailbox.path().to_string_lossy(),
            "file_size": file_size,
            "message_count": count,
            "recent": recent,
            "first_unseen": unseen,
            "uidvalidity": uidvalidity,
            "uidnext": uidnext,
            "scan_time_ms": elapsed.as_millis(),
        });
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!();
    println!("  {:<20} {}", "File", mailbox.path().display());
    println!("  {:<20} {}", "File size", format_size(file_size, BINARY));
    println!("  {:<20} {}", "Messages", count);
    println!("  {:<20} {}", "Recent", recent);
    if unseen > 0 {
        println!("  {:<20} {}", "First unseen", unseen);
    }
    println!("  {:<20} {}", "UIDVALIDITY", uidvalidity);
    println!("  {:<20} {}", "UIDNEXT", uidnext);
    println!("  {:<20} {:.2?}", "Scan time", elapsed);
    println!();
    Ok(())
}

fn cmd_list(registry: &FormatRegistry, config: &Config, url: &str, json: bool) -> anyhow::Result<()> {
    use humansize::{format_size, BINARY};

    let (mailbox, pb) = open(registry, config, url)?;
    let count = scan(mailbox.as_ref(), &pb)?;

    let mut rows = Vec::with_capacity(count);
    for msgno in 1..=count {
        let view = mailbox.get_message(msgno)?;
        let envelope = view.envelope()?;
        rows.push((
            msgno,
            view.uid(),
            flags_to_string(view.flags()?),
            envelope,
            view.header_value("Subject")?.unwrap_or_default(),
            view.size()?,
        ));
    }

    if json {
        let items: Vec<serde_json::Value> = rows
            .iter()
            .map(|(msgno, uid, flags, envelope, subject, size)| {
                serde_json::json!({
                    "msgno": msgno,
                    "uid": uid,
                    "flags": flags,
                    "sender": envelope.sender,
                    "date": envelope.date_time().map(|d| d.to_rfc3339()),
                    "subject": subject,
                    "size": size,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    println!(
        "  {:<5} {:<6} {:<6} {:<17} {:<25} {:<36} {:>8}",
        "#", "UID", "Flags", "Date", "From", "Subject", "Size"
    );
    println!("  {}", "-".repeat(109));
    for (msgno, uid, flags, envelope, subject, size) in &rows {
        let date = envelope
            .date_time()
            .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        let from: String = envelope.sender.chars().take(24).collect();
        let subject: String = subject.chars().take(35).collect();
        println!(
            "  {:<5} {:<6} {:<6} {:<17} {:<25} {:<36} {:>8}",
            msgno,
            uid,
            flags,
            date,
            from,
            subject,
            format_size(*size, BINARY)
        );
    }
    Ok(())
}

fn cmd_show(
    registry: &FormatRegistry,
    config: &Config,
    url: &str,
    msgno: usize,
    headers_only: bool,
) -> anyhow::Result<()> {
    let (mailbox, pb) = open(registry, config, url)?;
    scan(mailbox.as_ref(), &pb)?;
    let view = mailbox
        .get_message(msgno)
        .with_context(|| format!("no message {msgno} in {url}"))?;

    let mut out = std::io::stdout().lock();
    out.write_all(&view.headers()?)?;
    if !headers_only {
        out.write_all(&view.body()?)?;
    }
    out.flush()?;
    Ok(())
}

fn cmd_flag(
    registry: &FormatRegistry,
    config: &Config,
    url: &str,
    msgno: usize,
    letters: &str,
    clear: bool,
) -> anyhow::Result<()> {
    let bits = string_to_flags(letters);
    if bits.is_empty() {
        anyhow::bail!("no known status letters in '{letters}'");
    }
    let (mailbox, pb) = open(registry, config, url)?;
    scan(mailbox.as_ref(), &pb)?;
    let view = mailbox.get_message(msgno)?;
    let flags = if clear {
        view.unset_flags(bits)?
    } else {
        view.set_flags(bits)?
    };
    mailbox.sync()?;
    println!("  {msgno}: {}", flags_to_string(flags));
    Ok(())
}

fn cmd_delete(
    registry: &FormatRegistry,
    config: &Config,
    url: &str,
    msgnos: &[usize],
    keep: bool,
) -> anyhow::Result<()> {
    let (mailbox, pb) = open(registry, config, url)?;
    scan(mailbox.as_ref(), &pb)?;
    for &msgno in msgnos {
        mailbox
            .get_message(msgno)
            .and_then(|view| view.set_flags(Flags::DELETED))
            .with_context(|| format!("cannot mark message {msgno}"))?;
    }
    if keep {
        mailbox.sync()?;
        println!("  Marked {} message(s) deleted", msgnos.len());
    } else {
        let before = mailbox.messages_count()?;
        mailbox.expunge()?;
        let after = mailbox.messages_count()?;
        println!("  Removed {} message(s), {after} left", before - after);
    }
    Ok(())
}

fn cmd_expunge(registry: &FormatRegistry, config: &Config, url: &str, remove: bool) -> anyhow::Result<()> {
    let (mailbox, pb) = open(registry, config, url)?;
    let before = scan(mailbox.as_ref(), &pb)?;
    let start = Instant::now();
    if remove {
        mailbox.expunge()?;
    } else {
        mailbox.sync()?;
    }
    let after = mailbox.messages_count()?;
    println!(
        "  {} {} in {:.2?}: {before} -> {after} message(s)",
        if remove { "Expunged" } else { "Synced" },
        mailbox.path().display(),
        start.elapsed()
    );
    Ok(())
}

fn cmd_append(
    registry: &FormatRegistry,
    config: &Config,
    url: &str,
    file: &std::path::Path,
    letters: &str,
    sender: Option<String>,
) -> anyhow::Result<()> {
    let raw = if file.as_os_str() == "-" {
        let mut buf = Vec::new();
        std::io::Read::read_to_end(&mut std::io::stdin().lock(), &mut buf)?;
        buf
    } else {
        std::fs::read(file).with_context(|| format!("cannot read {}", file.display()))?
    };
    let envelope = sender.map(|s| Envelope::new(s, chrono::Utc::now()));

    let (mailbox, pb) = open(registry, config, url)?;
    scan(mailbox.as_ref(), &pb)?;
    let msgno = mailbox.append(&raw, envelope.as_ref(), string_to_flags(letters))?;
    println!("  Appended message {msgno} to {}", mailbox.path().display());
    Ok(())
}

fn cmd_init_config(config: &Config) -> anyhow::Result<()> {
    config::save_config(config)?;
    if let Some(path) = config::config_file_path() {
        println!("  Wrote {}", path.display());
    }
    Ok(())
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "mboxstore", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::stdout().write_all(&buf)?;
    Ok(())
}
