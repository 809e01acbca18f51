//! replifsctl - operate a replicated union filesystem from the shell.
//!
//! Every command mounts the replica described by `--config`, runs one
//! operation through it and unmounts, so pending heals are drained before
//! the process exits.
//!
//! ```bash
//! replifsctl -c replica.ron check-config
//! replifsctl -c replica.ron status /docs/a.txt
//! replifsctl -c replica.ron heal /docs /docs/a.txt
//! echo hello | replifsctl -c replica.ron put /docs/hello.txt
//! replifsctl -c replica.ron -v cat /docs/hello.txt
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::{EnvFilter, fmt};

use replifs_kernel::{Bindex, FileType, HealOutcome, MountConfig, ReplicaFs};

/// Bytes moved per read or write call.
const CHUNK: u32 = 1024 * 1024;

/// Control tool for replifs replicas.
#[derive(Parser, Debug)]
#[command(name = "replifsctl")]
#[command(about = "Inspect, heal and edit a replicated union filesystem")]
struct Args {
    /// Mount configuration (RON)
    #[arg(short, long)]
    config: PathBuf,

    /// Raise log verbosity above the config's debug_level (repeatable)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the config and print it with defaults filled in
    CheckConfig,
    /// Print the replication rules and the default policy
    Rules,
    /// Per-branch state of an object
    Status { path: PathBuf },
    /// Heal objects now
    Heal {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: PathBuf,
    },
    /// Print a file
    Cat { path: PathBuf },
    /// Replace a file's contents with stdin, or with --from
    Put {
        path: PathBuf,
        #[arg(long)]
        from: Option<PathBuf>,
    },
    /// Create a directory
    Mkdir {
        path: PathBuf,
        /// Octal permission bits
        #[arg(long, default_value = "755", value_parser = parse_mode)]
        mode: u32,
    },
    /// Remove a file, symlink or empty directory
    Rm { path: PathBuf },
    /// Rename an object
    Mv { from: PathBuf, to: PathBuf },
    /// Capacity of the smallest branch
    Df,
}

fn parse_mode(s: &str) -> Result<u32, String> {
    let digits = s.strip_prefix("0o").unwrap_or(s);
    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|mode| *mode <= 0o7777)
        .ok_or_else(|| format!("invalid octal mode: {s}"))
}

#[derive(Serialize)]
struct HealReport {
    path: PathBuf,
    bindex: Bindex,
    outcome: HealOutcome,
}

#[derive(Serialize)]
struct RulesReport {
    default: replifs_kernel::RaidType,
    rules: Vec<replifs_kernel::Rule>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn kind_label(kind: FileType) -> &'static str {
    match kind {
        FileType::File => "file",
        FileType::Directory => "dir",
        FileType::Symlink => "symlink",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = MountConfig::load(&args.config)
        .await
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.debug_level = config.debug_level.saturating_add(args.verbose);

    // Logs go to stderr; stdout carries command output.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter()));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::CheckConfig => print_json(&config),
        Command::Rules => {
            let rules = config.rule_tree()?.map(|tree| tree.dump()).unwrap_or_default();
            print_json(&RulesReport {
                default: config.default_raid,
                rules,
            })
        }
        command => {
            let fs = ReplicaFs::mount(&config).await.context("mounting replica")?;
            let outcome = run(&fs, command).await;
            let healed = fs.unmount().await;
            if healed > 0 {
                tracing::info!(healed, "drained pending heals");
            }
            outcome
        }
    }
}

async fn run(fs: &ReplicaFs, command: Command) -> Result<()> {
    match command {
        Command::Status { path } => print_json(&fs.status(&path).await?),
        Command::Heal { paths } => {
            let mut reports = Vec::new();
            for path in paths {
                let outcomes = fs
                    .heal(&path)
                    .await
                    .with_context(|| format!("healing {}", path.display()))?;
                reports.extend(outcomes.into_iter().map(|(bindex, outcome)| HealReport {
                    path: path.clone(),
                    bindex,
                    outcome,
                }));
            }
            print_json(&reports)
        }
        Command::Ls { path } => {
            for entry in fs.readdir(&path).await? {
                println!("{}\t{}", kind_label(entry.kind), entry.name);
            }
            Ok(())
        }
        Command::Cat { path } => cat(fs, &path).await,
        Command::Put { path, from } => {
            let data = match from {
                Some(file) => tokio::fs::read(&file)
                    .await
                    .with_context(|| format!("reading {}", file.display()))?,
                None => {
                    let mut buf = Vec::new();
                    tokio::io::stdin().read_to_end(&mut buf).await?;
                    buf
                }
            };
            put(fs, &path, &data).await
        }
        Command::Mkdir { path, mode } => {
            fs.mkdir(&path, mode).await?;
            Ok(())
        }
        Command::Rm { path } => {
            if fs.getattr(&path).await?.is_dir() {
                fs.rmdir(&path).await?;
            } else {
                fs.unlink(&path).await?;
            }
            Ok(())
        }
        Command::Mv { from, to } => {
            fs.rename(&from, &to).await?;
            Ok(())
        }
        Command::Df => print_json(&fs.statfs().await?),
        other => bail!("{other:?} does not run against a mounted replica"),
    }
}

async fn cat(fs: &ReplicaFs, path: &Path) -> Result<()> {
    let attr = fs.getattr(path).await?;
    if attr.is_dir() {
        bail!("{} is a directory", path.display());
    }

    let mut stdout = tokio::io::stdout();
    let mut offset = 0u64;
    loop {
        let chunk = fs.read(path, offset, CHUNK).await?;
        if chunk.is_empty() {
            break;
        }
        stdout.write_all(&chunk).await?;
        offset += chunk.len() as u64;
    }
    stdout.flush().await?;
    Ok(())
}

async fn put(fs: &ReplicaFs, path: &Path, data: &[u8]) -> Result<()> {
    match fs.getattr(path).await {
        Ok(attr) if attr.is_file() => fs.truncate(path, 0).await?,
        Ok(_) => bail!("{} is not a regular file", path.display()),
        Err(e) if e.is_not_found() => {
            fs.create(path, 0o644).await?;
        }
        Err(e) => return Err(e.into()),
    }

    let mut offset = 0u64;
    for chunk in data.chunks(CHUNK as usize) {
        let written = fs.write(path, offset, chunk).await?;
        offset += u64::from(written);
    }
    tracing::info!(path = %path.display(), bytes = offset, "file written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("755"), Ok(0o755));
        assert_eq!(parse_mode("0o1777"), Ok(0o1777));
        assert!(parse_mode("9").is_err());
        assert!(parse_mode("77777").is_err());
    }

    #[test]
    fn test_parse_subcommands() {
        let args = Args::try_parse_from(["replifsctl", "-c", "r.ron", "-vv", "mkdir", "/d", "--mode", "700"])
            .unwrap();
        assert_eq!(args.verbose, 2);
        assert!(matches!(args.command, Command::Mkdir { mode: 0o700, .. }));

        assert!(Args::try_parse_from(["replifsctl", "-c", "r.ron", "heal"]).is_err());
    }
}
