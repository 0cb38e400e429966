//! Command-line front end for named cross-process condition variables and
//! semaphores.
//!
//! Every command opens its object by name, so independent invocations
//! rendezvous through the shared directory alone. Condition variable waits
//! are guarded by a named mutex `<name>.guard` that plays the caller's lock.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use shm_sync::{
    destroy_cond, destroy_mutex, destroy_semaphore, Cond, IpcLock, NamedMutex, OpenMode, Semaphore,
    ShmConfig,
};
use tracing_subscriber::{fmt, EnvFilter};

/// Exit status of `wait` and `sem acquire` when the timeout expired first.
const EXIT_TIMED_OUT: u8 = 2;

/// Create, wait on, and signal shared-memory condition variables and semaphores.
#[derive(Parser, Debug)]
#[command(author, version, about = "Drive named shared-memory condition variables and semaphores", long_about = None)]
struct Cli {
    /// Directory holding the named objects (defaults to $SHM_SYNC_DIR or /dev/shm).
    #[arg(long, global = true, value_name = "DIR")]
    dir: Option<PathBuf>,

    /// Waiter slots per condition variable; must match every cooperating process.
    #[arg(long, global = true, value_name = "N")]
    max_waiters: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Target {
    /// Base name of the condition variable.
    #[arg(short, long)]
    name: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the condition variable and its guard mutex.
    Create(Target),
    /// Block until signaled; exits with status 2 on timeout.
    Wait {
        #[command(flatten)]
        target: Target,
        /// Give up after this many milliseconds.
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },
    /// Wake one waiter.
    Signal(Target),
    /// Wake every current waiter.
    Broadcast(Target),
    /// Print the number of registered waiters.
    Waiters(Target),
    /// Remove the condition variable and its guard mutex.
    Destroy(Target),
    /// Counting semaphores.
    #[command(subcommand)]
    Sem(SemCommand),
}

/// Semaphore name, checked by hand so a missing flag reports `required: --name`.
#[derive(Args, Debug)]
struct SemTarget {
    /// Base name of the semaphore.
    #[arg(short, long)]
    name: Option<String>,
}

impl SemTarget {
    fn name(&self) -> Result<&str> {
        self.name
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| anyhow!("required: --name"))
    }
}

#[derive(Subcommand, Debug)]
enum SemCommand {
    /// Create (or reset) a semaphore holding `--size` units.
    Create {
        #[command(flatten)]
        target: SemTarget,
        /// Initial number of units; must be at least 1.
        #[arg(short, long)]
        size: Option<u32>,
    },
    /// Take one unit, blocking while none is available; exits with status 2 on timeout.
    Acquire {
        #[command(flatten)]
        target: SemTarget,
        /// Give up after this many milliseconds.
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },
    /// Return one unit, waking a blocked acquirer.
    Release(SemTarget),
    /// Print the number of available units.
    Value(SemTarget),
    /// Remove the semaphore.
    Destroy(SemTarget),
}

impl Cli {
    fn config(&self) -> ShmConfig {
        let config = match &self.dir {
            Some(dir) => ShmConfig::with_dir(dir),
            None => ShmConfig::from_env(),
        };
        match self.max_waiters {
            Some(max) => config.max_cond_waiters(max),
            None => config,
        }
    }
}

fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = cli.config();

    match cli.command {
        Command::Create(target) => handle_create(&target.name, &config)?,
        Command::Wait { target, timeout_ms } => {
            let woken = handle_wait(&target.name, timeout_ms.map(Duration::from_millis), &config)?;
            if !woken {
                println!("timed out");
                return Ok(ExitCode::from(EXIT_TIMED_OUT));
            }
            println!("woken");
        }
        Command::Signal(target) => {
            open_cond(&target.name, &config)?.signal();
            println!("signaled {}", target.name);
        }
        Command::Broadcast(target) => {
            open_cond(&target.name, &config)?.broadcast();
            println!("broadcast {}", target.name);
        }
        Command::Waiters(target) => {
            println!("{}", open_cond(&target.name, &config)?.waiter_count());
        }
        Command::Destroy(target) => handle_destroy(&target.name, &config)?,
        Command::Sem(command) => return handle_sem(command, &config),
    }

    Ok(ExitCode::SUCCESS)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Ignore error if already set.
    let _ = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn guard_name(name: &str) -> String {
    format!("{name}.guard")
}

fn handle_create(name: &str, config: &ShmConfig) -> Result<()> {
    let guard = NamedMutex::new(&guard_name(name), OpenMode::OpenOrCreate, config)
        .with_context(|| format!("failed to create guard mutex for {name:?}"))?;
    let cond = Cond::<_>::create(name, guard, config)
        .with_context(|| format!("failed to create cond {name:?}"))?;
    tracing::info!(max_waiters = config.max_cond_waiters, "created cond {name:?}");
    cond.close().context("failed to close cond")?;
    println!("created {name}");
    Ok(())
}

fn open_cond(name: &str, config: &ShmConfig) -> Result<Cond<NamedMutex>> {
    let guard = NamedMutex::open(&guard_name(name), config)
        .with_context(|| format!("failed to open guard mutex for {name:?}"))?;
    Cond::open(name, guard, config).with_context(|| format!("failed to open cond {name:?}"))
}

fn handle_wait(name: &str, timeout: Option<Duration>, config: &ShmConfig) -> Result<bool> {
    let cond = open_cond(name, config)?;
    cond.locker().lock();
    tracing::info!(?timeout, "waiting on {name:?}");
    let woken = match timeout {
        Some(timeout) => cond.wait_timeout(timeout),
        None => {
            cond.wait();
            true
        }
    };
    cond.locker().unlock();
    cond.close().context("failed to close cond")?;
    Ok(woken)
}

fn handle_destroy(name: &str, config: &ShmConfig) -> Result<()> {
    destroy_cond(name, config).with_context(|| format!("failed to destroy cond {name:?}"))?;
    destroy_mutex(&guard_name(name), config)
        .with_context(|| format!("failed to destroy guard mutex for {name:?}"))?;
    println!("destroyed {name}");
    Ok(())
}

fn handle_sem(command: SemCommand, config: &ShmConfig) -> Result<ExitCode> {
    match command {
        SemCommand::Create { target, size } => {
            let name = target.name()?;
            let size = size.filter(|size| *size >= 1).ok_or_else(|| anyhow!("required: --size"))?;
            let sem = Semaphore::new(name, OpenMode::CreateTruncate, size, config)
                .with_context(|| format!("creating semaphore {name:?}"))?;
            tracing::info!(size, "created semaphore {name:?}");
            sem.close().context("failed to close semaphore")?;
            println!("created {name}");
        }
        SemCommand::Acquire { target, timeout_ms } => {
            let name = target.name()?;
            let sem = open_sem(name, config)?;
            let acquired = match timeout_ms {
                Some(ms) => sem.wait_timeout(Duration::from_millis(ms)),
                None => {
                    sem.wait();
                    true
                }
            };
            sem.close().context("failed to close semaphore")?;
            if !acquired {
                println!("timed out");
                return Ok(ExitCode::from(EXIT_TIMED_OUT));
            }
            println!("acquired {name}");
        }
        SemCommand::Release(target) => {
            let name = target.name()?;
            let sem = open_sem(name, config)?;
            sem.signal(1);
            sem.close().context("failed to close semaphore")?;
            println!("released {name}");
        }
        SemCommand::Value(target) => {
            let name = target.name()?;
            println!("{}", open_sem(name, config)?.value());
        }
        SemCommand::Destroy(target) => {
            let name = target.name()?;
            destroy_semaphore(name, config)
                .with_context(|| format!("failed to destroy semaphore {name:?}"))?;
            println!("destroyed {name}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn open_sem(name: &str, config: &ShmConfig) -> Result<Semaphore> {
    Semaphore::open(name, config).with_context(|| format!("opening semaphore {name:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_options_apply_after_subcommand() {
        let cli = Cli::parse_from([
            "shm-cond",
            "wait",
            "--name",
            "jobs",
            "--dir",
            "/tmp/x",
            "--max-waiters",
            "4",
            "--timeout-ms",
            "50",
        ]);
        let config = cli.config();
        assert_eq!(config.dir, PathBuf::from("/tmp/x"));
        assert_eq!(config.max_cond_waiters, 4);
        match cli.command {
            Command::Wait { target, timeout_ms } => {
                assert_eq!(target.name, "jobs");
                assert_eq!(timeout_ms, Some(50));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn semaphore_flags_are_validated_by_hand() {
        let cli = Cli::parse_from(["shm-cond", "sem", "create", "--size", "2"]);
        match cli.command {
            Command::Sem(SemCommand::Create { target, size }) => {
                assert_eq!(size, Some(2));
                let err = target.name().expect_err("name missing");
                assert_eq!(err.to_string(), "required: --name");
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::parse_from(["shm-cond", "sem", "release", "-n", "slots"]);
        match cli.command {
            Command::Sem(SemCommand::Release(target)) => {
                assert_eq!(target.name().expect("name"), "slots");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn guard_is_derived_from_base_name() {
        assert_eq!(guard_name("jobs"), "jobs.guard");
    }
}
