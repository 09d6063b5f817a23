//! DriveBridge CLI - Local and WebDAV drives from the terminal
//!
//! Usage:
//!   drivebridge-cli drives list                          Show drives and quota
//!   drivebridge-cli drives add <name> <url> <user>       Save a WebDAV drive
//!   drivebridge-cli ls [path] --drive <id>               List a directory
//!   drivebridge-cli transfer <items>.. --from A --to B --dest /dir [--move]
//!   drivebridge-cli upload <files>.. --drive <id> --dest /dir
//!   drivebridge-cli cat <path> --drive <id> [--range bytes=0-99]
//!   drivebridge-cli serve                                Range server for local media

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use drivebridge::config::{default_config_dir, load_config};
use drivebridge::logging::{self, LogConfig};
use drivebridge::{
    DriveEngine, DriveKind, NewDrive, TransferEvent, TransferHandle, TransferMode, TransferReport,
    TransferRequest, LOCAL_DRIVE_ID,
};
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

#[derive(Parser)]
#[command(
    name = "drivebridge-cli",
    about = "DriveBridge CLI - browse and move files across Local and WebDAV drives",
    version
)]
struct Cli {
    /// Configuration directory (default: <config dir>/drivebridge)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
    /// Override the local sandbox root
    #[arg(long, global = true)]
    sandbox: Option<PathBuf>,
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    /// JSON log lines
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage saved drives
    Drives {
        #[command(subcommand)]
        action: DriveAction,
    },
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
        #[arg(short, long, default_value = LOCAL_DRIVE_ID)]
        drive: String,
    },
    /// Create a directory (with parents)
    Mkdir {
        path: String,
        #[arg(short, long, default_value = LOCAL_DRIVE_ID)]
        drive: String,
    },
    /// Delete files or directories
    Rm {
        #[arg(required = true)]
        paths: Vec<String>,
        #[arg(short, long, default_value = LOCAL_DRIVE_ID)]
        drive: String,
    },
    /// Move entries within one drive
    Mv {
        #[arg(required = true)]
        paths: Vec<String>,
        /// Destination directory
        #[arg(long)]
        to: String,
        #[arg(short, long, default_value = LOCAL_DRIVE_ID)]
        drive: String,
    },
    /// Rename one entry in place
    Rename {
        path: String,
        new_name: String,
        #[arg(short, long, default_value = LOCAL_DRIVE_ID)]
        drive: String,
    },
    /// Copy or move entries between drives
    Transfer {
        #[arg(required = true)]
        items: Vec<String>,
        #[arg(long, default_value = LOCAL_DRIVE_ID)]
        from: String,
        #[arg(long)]
        to: String,
        /// Destination directory
        #[arg(long, default_value = "/")]
        dest: String,
        /// Delete the sources once transferred
        #[arg(long = "move")]
        move_items: bool,
    },
    /// Copy host files or folders onto a drive
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(short, long, default_value = LOCAL_DRIVE_ID)]
        drive: String,
        #[arg(long, default_value = "/")]
        dest: String,
    },
    /// Search names below a directory
    Find {
        pattern: String,
        #[arg(default_value = "/")]
        path: String,
        #[arg(short, long, default_value = LOCAL_DRIVE_ID)]
        drive: String,
    },
    /// Write a file (or a byte range of it) to stdout or a file
    Cat {
        path: String,
        #[arg(short, long, default_value = LOCAL_DRIVE_ID)]
        drive: String,
        /// HTTP Range value, e.g. bytes=0-1023
        #[arg(long)]
        range: Option<String>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Serve the local sandbox over HTTP with byte ranges until Ctrl+C
    Serve,
}

#[derive(Subcommand)]
enum DriveAction {
    /// List drives with quota
    List {
        #[arg(long)]
        json: bool,
    },
    /// Save a WebDAV drive (password read from stdin when not given)
    Add {
        name: String,
        url: String,
        username: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// Rename a drive
    Rename { id: String, name: String },
    /// Remove a saved drive
    Remove { id: String },
    /// Check a WebDAV account without saving it
    Test {
        url: String,
        username: String,
        #[arg(long)]
        password: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(LogConfig {
        json: cli.json_logs,
        verbose: cli.verbose,
    });

    let config_dir = cli.config_dir.clone().unwrap_or_else(default_config_dir);
    let mut config = load_config(&config_dir);
    if let Some(sandbox) = &cli.sandbox {
        config.cache_dir = sandbox.join(".cache");
        config.sandbox_root = sandbox.clone();
    }
    let engine = DriveEngine::open(config).context("Failed to open drive engine")?;

    match cli.command {
        Commands::Drives { action } => drives(&engine, action).await?,
        Commands::Ls { path, drive } => {
            let listing = engine.list_directory(&path, &drive).await?;
            for entry in &listing.files {
                if entry.is_directory {
                    println!("{:>12}  {:<25}  {}/", "-", entry.mtime.as_deref().unwrap_or(""), entry.name);
                } else {
                    println!("{:>12}  {:<25}  {}", entry.size, entry.mtime.as_deref().unwrap_or(""), entry.name);
                }
            }
        }
        Commands::Mkdir { path, drive } => engine.create_directory(&path, &drive).await?,
        Commands::Rm { paths, drive } => engine.delete_items(&paths, &drive).await?,
        Commands::Mv { paths, to, drive } => engine.move_items(&paths, &to, &drive).await?,
        Commands::Rename { path, new_name, drive } => {
            let new_path = engine.rename_item(&path, &new_name, &drive).await?;
            println!("{}", new_path);
        }
        Commands::Transfer {
            items,
            from,
            to,
            dest,
            move_items,
        } => {
            let mode = if move_items { TransferMode::Move } else { TransferMode::Copy };
            let handle = engine
                .transfer(TransferRequest {
                    items,
                    source_drive_id: from,
                    dest_drive_id: to,
                    dest_path: dest,
                    mode,
                })
                .await?;
            summarize(follow(&engine, handle).await?)?;
        }
        Commands::Upload { files, drive, dest } => {
            let handle = engine.upload(&dest, files, &drive).await?;
            summarize(follow(&engine, handle).await?)?;
        }
        Commands::Find { pattern, path, drive } => {
            for entry in engine.search(&path, &pattern, &drive).await? {
                println!("{}", entry.path);
            }
        }
        Commands::Cat {
            path,
            drive,
            range,
            output,
        } => cat(&engine, &path, &drive, range.as_deref(), output).await?,
        Commands::Serve => {
            let server = engine.start_range_server().await?;
            println!("Serving {:?} at {}", engine.config().sandbox_root, server.base_url());
            println!("Press Ctrl+C to stop");
            tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
            server.shutdown().await;
        }
    }

    Ok(())
}

async fn drives(engine: &DriveEngine, action: DriveAction) -> Result<()> {
    match action {
        DriveAction::List { json } => {
            let drives = engine.list_drives().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&drives)?);
                return Ok(());
            }
            for drive in drives {
                let kind = match &drive.kind {
                    DriveKind::Local => "local".to_string(),
                    DriveKind::WebDav { url, username } => format!("webdav {}@{}", username, url),
                };
                let quota = match drive.quota {
                    Some(q) => format!("{} used / {} total", human_bytes(q.used), human_bytes(q.total)),
                    None => "quota unknown".to_string(),
                };
                println!("{:<38} {:<20} {:<40} {}", drive.id, drive.name, kind, quota);
            }
        }
        DriveAction::Add {
            name,
            url,
            username,
            password,
        } => {
            let secret = password_or_stdin(password)?;
            let view = engine
                .add_drive(NewDrive {
                    name,
                    url,
                    username,
                    secret,
                })
                .await?;
            println!("Added drive {} ({})", view.name, view.id);
        }
        DriveAction::Rename { id, name } => {
            let view = engine.rename_drive(&id, &name).await?;
            println!("Renamed drive {} to {}", view.id, view.name);
        }
        DriveAction::Remove { id } => {
            engine.remove_drive(&id).await?;
            println!("Removed drive {}", id);
        }
        DriveAction::Test { url, username, password } => {
            let secret = password_or_stdin(password)?;
            let candidate = NewDrive {
                name: "connection test".to_string(),
                url,
                username,
                secret,
            };
            engine.test_connection(&candidate).await?;
            println!("Connection test: OK");
        }
    }
    Ok(())
}

fn password_or_stdin(password: Option<String>) -> Result<SecretString> {
    if let Some(p) = password {
        return Ok(SecretString::from(p));
    }
    eprint!("Password: ");
    let mut line = String::new();
    std::io::stdin().read_line(&mut line).context("Failed to read password")?;
    Ok(SecretString::from(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// Render progress until the request finishes. The first Ctrl+C cancels it.
async fn follow(engine: &DriveEngine, mut handle: TransferHandle) -> Result<TransferReport> {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{msg:30!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {binary_bytes_per_sec}")?
            .progress_chars("=> "),
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancelled = false;

    loop {
        tokio::select! {
            event = handle.events.recv() => match event {
                Some(TransferEvent::ItemStarted(task)) => {
                    bar.set_position(0);
                    bar.set_length(task.bytes_total);
                    bar.set_message(task.source_path);
                }
                Some(TransferEvent::Progress(p)) => {
                    bar.set_length(p.bytes_total);
                    bar.set_position(p.bytes_done);
                    bar.set_message(format!("[{}/{}] {}", p.item_index, p.item_count, p.item_name));
                }
                Some(TransferEvent::ItemFinished(task, Some(err))) => {
                    bar.println(format!("✗ {}: {}", task.source_path, err.message));
                }
                Some(TransferEvent::ItemFinished(..)) => {}
                None => break,
            },
            _ = &mut ctrl_c, if !cancelled => {
                cancelled = true;
                engine.cancel(handle.id);
                bar.println("Cancelling...");
            }
        }
    }

    bar.finish_and_clear();
    handle.join.await.context("Transfer task failed")
}

fn summarize(report: TransferReport) -> Result<()> {
    use drivebridge::TransferState;
    println!(
        "{} done, {} failed, {} cancelled",
        report.count(TransferState::Done),
        report.count(TransferState::Error),
        report.count(TransferState::Cancelled)
    );
    if !report.is_success() {
        bail!("Transfer {} did not complete", report.id);
    }
    Ok(())
}

async fn cat(
    engine: &DriveEngine,
    path: &str,
    drive: &str,
    range: Option<&str>,
    output: Option<PathBuf>,
) -> Result<()> {
    let mut response = engine.read_raw(path, drive, range).await?;
    if !response.status.is_success() {
        let mut message = Vec::new();
        while let Some(chunk) = response.body.next().await {
            message.extend_from_slice(&chunk?);
        }
        bail!("{}: {}", response.status, String::from_utf8_lossy(&message));
    }

    let mut sink: Box<dyn tokio::io::AsyncWrite + Unpin + Send> = match &output {
        Some(file) => Box::new(
            tokio::fs::File::create(file)
                .await
                .with_context(|| format!("Failed to create {:?}", file))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };
    while let Some(chunk) = response.body.next().await {
        sink.write_all(&chunk?).await?;
    }
    sink.flush().await?;
    Ok(())
}

fn human_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", n)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
