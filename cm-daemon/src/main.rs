//! Chassis Manager Daemon (chassisd)
//!
//! Owns the hardware-state cache for a switch chassis and keeps it current.
//!
//! # Threads
//! - **Entity poller**: presence, init, power and child polling every cycle
//! - **Remote poller**: external-control group aggregation
//! - **Job consumer**: slow hardware work in submission order
//! - **Request handler**: bus requests against the shared cache
//!
//! All four share one cache behind a single lock taken with a bounded wait.
//! Notifications are emitted after the lock is released, to the tracing log and
//! the JSON notification journal.

mod handler;
mod poll_loop;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use chassis::journal::{init_journal, log_event};
use chassis::JournalSink;
use cm_core::constants::paths;
use cm_core::{
    config_path, load_config, validate_config, Cache, FileNvram, Job, JobQueue, Nvram,
    NotificationSink, PlatformConfig, SharedCache, SimHal,
};
use cm_protocol::Notification;
use serde_json::json;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Global shutdown flag for clean termination
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

// ============================================================================
// Notification fan-out
// ============================================================================

/// Sends every notification to the tracing log and the journal
struct DaemonSink {
    log: cm_core::LogSink,
    journal: JournalSink,
}

impl NotificationSink for DaemonSink {
    fn notify(&self, notification: &Notification) {
        self.log.notify(notification);
        self.journal.notify(notification);
    }
}

// ============================================================================
// Process setup
// ============================================================================

/// Set restrictive umask
fn set_secure_umask() {
    // SAFETY: umask only sets the file creation mask for the process.
    unsafe { libc::umask(0o077) };
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());

        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        eprintln!("PANIC at {}: {}", location, message);
    }));
}

fn init_logging(log_level: &str) -> bool {
    let use_journald = std::path::Path::new("/run/systemd/journal/socket").exists();
    if use_journald {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(log_level))
                    .init();
                return true;
            }
            Err(e) => {
                eprintln!("Failed to create journald layer: {}, falling back to stderr", e);
            }
        }
    }
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .with_env_filter(log_level)
        .init();
    false
}

// ============================================================================
// CLI
// ============================================================================

struct Options {
    config: Option<PathBuf>,
    console: bool,
}

fn print_help() {
    eprintln!("chassisd {} - switch chassis platform manager", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    chassisd [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -c, --config PATH   Platform configuration file");
    eprintln!("        --console       Serve JSON requests on stdin/stdout");
    eprintln!("    -v, --version       Print version");
    eprintln!("    -h, --help          Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    CHASSISD_LOG        Log level (trace, debug, info, warn, error)");
    eprintln!("    {}    Platform configuration path", paths::CONFIG_ENV);
}

fn parse_args() -> Option<Options> {
    let args: Vec<String> = std::env::args().collect();
    let mut options = Options { config: None, console: false };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                return None;
            }
            "-v" | "--version" => {
                println!("chassisd {}", VERSION);
                return None;
            }
            "--console" => options.console = true,
            "-c" | "--config" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
                options.config = Some(PathBuf::from(&args[i]));
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }
    Some(options)
}

// ============================================================================
// Startup
// ============================================================================

fn load_platform(options: &Options) -> anyhow::Result<PlatformConfig> {
    let path = options.config.clone().unwrap_or_else(config_path);
    let config = load_config(&path).with_context(|| format!("loading {:?}", path))?;
    validate_config(&config).context("platform configuration rejected")?;
    Ok(config)
}

/// Queue the NVRAM load; the cache runs without NVRAM until it completes
fn queue_nvram_load(
    queue: &JobQueue,
    cache: SharedCache,
    config: &PlatformConfig,
) -> anyhow::Result<()> {
    let path = config.nvram.path.clone();
    let size = config.nvram.size;
    queue.push(Job::blocking("nvram-load", move || {
        let device = match FileNvram::open(&path, size) {
            Ok(device) => device,
            Err(e) => {
                error!("NVRAM unavailable at {:?}: {}", path, e);
                return;
            }
        };
        let mut nvram = Nvram::new(Box::new(device));
        if let Err(e) = nvram.load() {
            warn!("NVRAM load reported: {}", e);
        }
        let entries = nvram.entries().len();
        match cache.acquire() {
            Ok(mut guard) => {
                guard.attach_nvram(nvram);
                info!(entries, "NVRAM attached");
            }
            Err(e) => error!("Could not attach NVRAM: {}", e),
        }
    }))?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    install_panic_hook();
    set_secure_umask();

    let Some(options) = parse_args() else {
        return Ok(());
    };

    let log_level = std::env::var("CHASSISD_LOG").unwrap_or_else(|_| "info".to_string());
    let use_journald = init_logging(&log_level);
    info!("STARTUP: chassisd {} starting", VERSION);
    info!("STARTUP: Logging to {}", if use_journald { "systemd journal" } else { "stderr" });

    let config = match load_platform(&options) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };

    let journal_path = config
        .journal_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(paths::JOURNAL_FILE));
    let journal_path = init_journal(&journal_path);
    info!("STARTUP: Notification journal at {:?}", journal_path);

    let poll_interval = Duration::from_millis(config.intervals.poll_ms);
    let remote_interval = Duration::from_millis(config.intervals.remote_poll_ms);
    let job_idle = Duration::from_millis(config.intervals.job_idle_ms);

    let hal = SimHal::populated(&config);
    let cache = Cache::build(config.clone(), Box::new(hal)).context("building the hardware cache")?;
    log_event(
        "startup",
        json!({
            "version": VERSION,
            "entities": cache.entities().len(),
            "keys": cache.store().len(),
        }),
    );
    let cache = SharedCache::new(cache);

    let queue = JobQueue::create("chassisd")?;
    queue_nvram_load(&queue, cache.clone(), &config)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    if let Err(e) = ctrlc::set_handler(|| {
        info!("SIGNAL: Received SIGINT/SIGTERM - initiating shutdown");
        SHUTDOWN.store(true, Ordering::SeqCst);
    }) {
        warn!("Failed to set signal handler: {}", e);
    }

    let sink: Arc<dyn NotificationSink> =
        Arc::new(DaemonSink { log: cm_core::LogSink, journal: JournalSink });
    let (requests, incoming) = mpsc::channel();

    let mut workers = Vec::new();
    {
        let (cache, sink, shutdown) = (cache.clone(), Arc::clone(&sink), Arc::clone(&shutdown));
        workers.push(thread::spawn(move || {
            poll_loop::run_entity_poll(cache, sink, poll_interval, shutdown)
        }));
    }
    {
        let (cache, sink, shutdown) = (cache.clone(), Arc::clone(&sink), Arc::clone(&shutdown));
        workers.push(thread::spawn(move || {
            poll_loop::run_remote_poll(cache, sink, remote_interval, shutdown)
        }));
    }
    {
        let (queue, shutdown) = (Arc::clone(&queue), Arc::clone(&shutdown));
        workers.push(thread::spawn(move || queue.run_consumer(&shutdown, job_idle)));
    }
    {
        let (cache, sink, shutdown) = (cache.clone(), Arc::clone(&sink), Arc::clone(&shutdown));
        workers.push(thread::spawn(move || handler::run_handler(cache, sink, incoming, shutdown)));
    }
    info!("STARTUP: {} worker threads running", workers.len());

    if options.console {
        let stdin = std::io::stdin();
        if let Err(e) = handler::run_console(&requests, stdin.lock(), std::io::stdout()) {
            error!("Console stopped: {:#}", e);
        }
        SHUTDOWN.store(true, Ordering::SeqCst);
    }

    while !SHUTDOWN.load(Ordering::SeqCst) {
        poll_loop::sleep_interruptible(&SHUTDOWN, Duration::from_secs(1));
    }
    shutdown.store(true, Ordering::SeqCst);
    drop(requests);

    for worker in workers {
        if worker.join().is_err() {
            error!("Worker thread panicked");
        }
    }
    log_event("shutdown", json!({ "version": VERSION }));
    info!("SHUTDOWN: chassisd stopped");
    Ok(())
}
