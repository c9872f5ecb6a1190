use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use spool::lock::{lock_owner, DirectoryLock};
use spool::repository::discover_queues;
use spool::segment_store::queue_dir_name;
use spool::{decode, QueueLog, Record};

#[derive(Parser)]
#[command(name = "spool-cli", version, about = "Session queue inspection tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the queues stored in a data directory.
    List { data_dir: PathBuf },
    /// Show cursors and segment usage of one client's queue.
    Inspect { data_dir: PathBuf, client_id: String },
    /// Print unread records without consuming them.
    Dump {
        data_dir: PathBuf,
        client_id: String,
        #[arg(long = "limit")]
        limit: Option<usize>,
        #[arg(long = "payloads")]
        payloads: bool,
    },
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut out = io::BufWriter::new(io::stdout());
    match cli.command {
        Commands::List { data_dir } => cmd_list(&data_dir, &mut out)?,
        Commands::Inspect {
            data_dir,
            client_id,
        } => cmd_inspect(&data_dir, &client_id, &mut out)?,
        Commands::Dump {
            data_dir,
            client_id,
            limit,
            payloads,
        } => cmd_dump(&data_dir, &client_id, limit, payloads, &mut out)?,
    }
    out.flush()?;
    Ok(())
}

/// Takes the repository lock so a running broker is never read mid-write.
fn lock_data_dir(data_dir: &Path) -> Result<DirectoryLock> {
    if !data_dir.is_dir() {
        bail!("{} is not a directory", data_dir.display());
    }
    DirectoryLock::acquire(data_dir).with_context(|| match lock_owner(data_dir) {
        Ok(Some(pid)) => format!("{} is in use by pid {pid}", data_dir.display()),
        _ => format!("cannot lock {}", data_dir.display()),
    })
}

fn open_queue(data_dir: &Path, client_id: &str) -> Result<QueueLog> {
    let dir = data_dir.join(queue_dir_name(client_id));
    if !dir.is_dir() {
        bail!("no queue for client {client_id} in {}", data_dir.display());
    }
    QueueLog::open(&dir).with_context(|| format!("opening queue {}", dir.display()))
}

fn cmd_list(data_dir: &Path, out: &mut dyn Write) -> Result<()> {
    let _lock = lock_data_dir(data_dir)?;
    for (client_id, dir) in discover_queues(data_dir)? {
        let log = QueueLog::open(&dir)?;
        let stats = log.stats();
        writeln!(
            out,
            "client={} dir={} segments={} free={} unread_bytes={}",
            client_id,
            dir.file_name().and_then(|name| name.to_str()).unwrap_or("?"),
            stats.segments,
            stats.free_segments,
            stats.unread_bytes
        )?;
    }
    Ok(())
}

fn cmd_inspect(data_dir: &Path, client_id: &str, out: &mut dyn Write) -> Result<()> {
    let _lock = lock_data_dir(data_dir)?;
    let log = open_queue(data_dir, client_id)?;
    let stats = log.stats();
    writeln!(out, "client={client_id} dir={}", log.dir().display())?;
    writeln!(
        out,
        "read={} write={} unread_bytes={}",
        stats.read_cursor, stats.write_cursor, stats.unread_bytes
    )?;
    match log.checkpoint() {
        Some(checkpoint) => writeln!(out, "checkpoint={checkpoint}")?,
        None => writeln!(out, "checkpoint=none")?,
    }
    writeln!(out, "head_index={} pages={:?}", log.head_index(), log.pages())?;
    writeln!(out, "free_pages={:?}", log.free_pages())?;
    Ok(())
}

fn cmd_dump(
    data_dir: &Path,
    client_id: &str,
    limit: Option<usize>,
    payloads: bool,
    out: &mut dyn Write,
) -> Result<()> {
    let _lock = lock_data_dir(data_dir)?;
    let log = open_queue(data_dir, client_id)?;
    let limit = limit.unwrap_or(usize::MAX);
    for (seq, frame) in log.records().take(limit).enumerate() {
        let record = frame.and_then(|bytes| decode(&bytes));
        match record {
            Ok(record) => {
                writeln!(out, "#{seq} {record}")?;
                if payloads {
                    if let Record::Published(msg) = &record {
                        writeln!(out, "    {}", hexdump(&msg.payload))?;
                    }
                }
            }
            Err(err) => writeln!(out, "#{seq} unreadable: {err}")?,
        }
    }
    Ok(())
}

fn hexdump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
