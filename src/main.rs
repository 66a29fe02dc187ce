use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use ftptree::{
    Client, ConfigManager, DEFAULT_FTP_PORT, DirectoryEntry, FtpSession, NoProgress,
    ServerProfile, SessionPool, Settings, TransferError, download_tree, ignore_patterns,
    init_tracing, upload_tree,
};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Navigate, list and mirror directory trees on FTP servers"
)]
struct Args {
    /// Named server profile from the config file
    #[arg(long, global = true, conflicts_with = "host")]
    profile: Option<String>,

    /// Server host (instead of --profile)
    #[arg(long, global = true)]
    host: Option<String>,

    #[arg(long, global = true, default_value_t = DEFAULT_FTP_PORT)]
    port: u16,

    #[arg(long, global = true, default_value = "anonymous")]
    user: String,

    #[arg(long, global = true, default_value = "")]
    password: String,

    /// Alternative config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Log per-file transfer progress
    #[arg(short, long, global = true)]
    progress: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List a remote directory
    Ls {
        #[arg(default_value = ".")]
        path: String,
        /// Show kind, permissions, size and timestamp
        #[arg(short, long)]
        long: bool,
        /// Include `.` and `..`
        #[arg(short, long)]
        all: bool,
    },
    /// Download one file
    Get {
        remote: String,
        /// Defaults to the remote file name in the current directory
        local: Option<PathBuf>,
    },
    /// Upload one file; a remote path ending in `/` keeps the local name
    Put { local: PathBuf, remote: String },
    /// Upload a local directory tree
    UploadTree {
        local: PathBuf,
        remote: String,
        /// Skip names matching this glob pattern, e.g. `*.tmp` or `[._]*` (repeatable)
        #[arg(long = "ignore", action = clap::ArgAction::Append)]
        ignore: Vec<String>,
    },
    /// Download a remote directory tree
    DownloadTree { remote: String, local: PathBuf },
    /// Download several files in parallel over a session pool
    Fetch {
        #[arg(required = true)]
        remotes: Vec<String>,
        #[arg(long)]
        into: PathBuf,
    },
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.log_file.as_deref())?;

    let manager = match &args.config {
        Some(path) => ConfigManager::with_path(path)?,
        None => ConfigManager::new()?,
    };
    let profile = resolve_profile(&args, &manager)?;
    let settings = manager.settings().clone();

    let errors = match &args.command {
        Command::Fetch { remotes, into } => fetch(&profile, &settings, remotes, into)?,
        command => {
            let session = FtpSession::connect(&profile)?.with_block_size(settings.block_size);
            let mut client = Client::with_options(session, settings.client_options());
            if !args.progress {
                client.set_progress_sink(Box::new(NoProgress));
            }
            let result = run(&mut client, command);
            client.close();
            result?
        }
    };

    if errors.is_empty() {
        return Ok(ExitCode::SUCCESS);
    }
    for error in &errors {
        eprintln!("failed: {error}");
    }
    eprintln!("{} transfer(s) failed", errors.len());
    Ok(ExitCode::FAILURE)
}

fn resolve_profile(args: &Args, manager: &ConfigManager) -> Result<ServerProfile> {
    if let Some(name) = &args.profile {
        return manager
            .profile(name)
            .cloned()
            .with_context(|| format!("No profile named {name} in {}", manager.path().display()));
    }
    let Some(host) = &args.host else {
        bail!("Either --profile or --host is required");
    };
    let profile = ServerProfile::new(
        "command-line".to_string(),
        host.clone(),
        args.port,
        args.user.clone(),
        args.password.clone(),
    );
    profile.validate()?;
    Ok(profile)
}

fn run(client: &mut Client<FtpSession>, command: &Command) -> Result<Vec<TransferError>> {
    match command {
        Command::Ls { path, long, all } => {
            if *long {
                for entry in client.list_entries(path, !*all)? {
                    println!("{}", format_entry(&entry));
                }
            } else {
                for name in client.list_names(path, !*all)? {
                    println!("{name}");
                }
            }
        }
        Command::Get { remote, local } => {
            let local = match local {
                Some(local) => local.clone(),
                None => PathBuf::from(file_name(remote)?),
            };
            let written = client.get_to_path(remote, &local)?;
            info!("{} -> {} ({} bytes)", remote, local.display(), written);
        }
        Command::Put { local, remote } => {
            let size = client.put_file(local, remote)?;
            info!("{} -> {} ({} bytes)", local.display(), remote, size);
        }
        Command::UploadTree {
            local,
            remote,
            ignore,
        } => {
            let ignore = ignore_patterns(ignore.as_slice())?;
            let outcome = upload_tree(client, local, remote, Some(&ignore))?;
            info!("Uploaded tree into {}", outcome.root);
            return Ok(outcome.errors);
        }
        Command::DownloadTree { remote, local } => {
            let outcome = download_tree(client, remote, local)?;
            info!("Downloaded tree into {}", outcome.root);
            return Ok(outcome.errors);
        }
        Command::Fetch { .. } => bail!("fetch runs on the session pool"),
    }
    Ok(Vec::new())
}

fn fetch(
    profile: &ServerProfile,
    settings: &Settings,
    remotes: &[String],
    into: &Path,
) -> Result<Vec<TransferError>> {
    std::fs::create_dir_all(into)
        .with_context(|| format!("Failed to create {}", into.display()))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let mut pool = SessionPool::connect(profile, settings).await?;
        let mut errors = Vec::new();
        for remote in remotes {
            let local = match file_name(remote) {
                Ok(name) => into.join(name),
                Err(e) => {
                    errors.push(TransferError::new(remote.as_str(), into.display().to_string(), e));
                    continue;
                }
            };
            if let Err(e) = pool.spawn_download(remote.as_str(), local.clone()).await {
                errors.push(TransferError::new(remote.as_str(), local.display().to_string(), e));
            }
        }
        errors.extend(pool.close().await);
        Ok::<_, anyhow::Error>(errors)
    })
}

fn file_name(remote: &str) -> Result<&str> {
    match remote.rsplit('/').next() {
        Some(name) if !name.is_empty() => Ok(name),
        _ => bail!("{remote} does not name a file"),
    }
}

fn format_entry(entry: &DirectoryEntry) -> String {
    format!(
        "{}{} {:>8} {:>8} {:>12} {} {}",
        entry.kind.flag(),
        entry.permissions().unwrap_or("---------"),
        entry.owner().unwrap_or("-"),
        entry.group().unwrap_or("-"),
        entry.size,
        entry.timestamp.format("%Y-%m-%d %H:%M"),
        entry.name
    )
}
