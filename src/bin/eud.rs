//! eud - attach to a running GPU workload and stream its debug events.
//!
//! Monitors process and module lifecycle, acknowledges module loads, and
//! optionally stops the workload once to prove thread control end to end.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use colored::Colorize;

use eudebug::{
    ApiEvent, Config, DebugError, DebugSession, DeviceInfo, DeviceTopology, SessionRegistry,
    ThreadSelector,
};

/// eud: GPU application debugger event monitor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Process to attach to
    pid: u64,

    /// DRM render node carrying the debug interface
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// Tile count of the device
    #[arg(long, default_value_t = 1)]
    tiles: u32,

    /// Slices per tile
    #[arg(long, default_value_t = 8)]
    slices: u32,

    /// Subslices per slice
    #[arg(long, default_value_t = 4)]
    subslices: u32,

    /// EUs per subslice
    #[arg(long, default_value_t = 8)]
    eus: u32,

    /// Threads per EU
    #[arg(long, default_value_t = 8)]
    threads: u32,

    /// Transfer GPU memory through mmap instead of pread/pwrite
    #[arg(long, default_value_t = false)]
    mmap: bool,

    /// Attention wait after an interrupt, in milliseconds
    #[arg(long)]
    interrupt_timeout_ms: Option<u64>,

    /// Stop all threads once after attach, then resume them as they report
    #[arg(long, default_value_t = false)]
    stop: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        match args.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        },
    ))
    .init();

    let mut config = Config::from_env(args.pid);
    if let Some(device) = &args.device {
        config.device_path = device.clone();
    }
    config.mmap_access |= args.mmap;
    if let Some(ms) = args.interrupt_timeout_ms {
        config.interrupt_timeout = Duration::from_millis(ms);
    }
    let device = DeviceInfo::new(DeviceTopology::uniform(
        args.tiles,
        args.slices,
        args.subslices,
        args.eus,
        args.threads,
    ));

    println!(
        "[*] eud v{} - attaching to pid {}",
        env!("CARGO_PKG_VERSION"),
        args.pid
    );
    let registry = SessionRegistry::new();
    let session = attach(&registry, config, device)?;
    println!("{}", "[*] attached".green());

    if args.stop {
        session
            .interrupt(ThreadSelector::all())
            .context("interrupt request")?;
        println!("[*] interrupt of all threads queued");
    }

    monitor(&session, args.stop)
}

#[cfg(target_os = "linux")]
fn attach(
    registry: &std::sync::Arc<SessionRegistry>,
    config: Config,
    device: DeviceInfo,
) -> anyhow::Result<DebugSession> {
    registry
        .attach(config, device)
        .context("attach to debuggee")
}

#[cfg(not(target_os = "linux"))]
fn attach(
    _registry: &std::sync::Arc<SessionRegistry>,
    _config: Config,
    _device: DeviceInfo,
) -> anyhow::Result<DebugSession> {
    anyhow::bail!("the prelim debugger uapi is linux-only")
}

/// Streams events until the debuggee exits or the session detaches.
fn monitor(session: &DebugSession, resume_stops: bool) -> anyhow::Result<()> {
    loop {
        let event = match session.read_event(Some(Duration::from_millis(1000))) {
            Ok(event) => event,
            Err(DebugError::NotReady) => continue,
            Err(DebugError::DeviceLost) => {
                println!("{}", "[!] device lost".red());
                return Ok(());
            }
            Err(err) => return Err(err).context("event stream"),
        };

        match &event {
            ApiEvent::ProcessEntry => println!("{}", "[*] process entered".green()),
            ApiEvent::ProcessExit => {
                println!("[*] process exited");
                return Ok(());
            }
            ApiEvent::Detached { reason } => {
                println!("{} detached: {:?}", "[!]".red(), reason);
                return Ok(());
            }
            ApiEvent::ModuleLoad {
                load,
                module_begin,
                module_end,
                ..
            } => {
                println!(
                    "[*] module loaded at {} ({} bytes image)",
                    format!("{:#x}", load).cyan(),
                    module_end - module_begin
                );
            }
            ApiEvent::ModuleUnload { load, .. } => {
                println!("{}", format!("[*] module at {:#x} unloaded", load).dimmed());
            }
            ApiEvent::ThreadStopped { thread } => {
                println!("{} threads {} stopped", "[*]".yellow(), thread);
                if resume_stops {
                    match session.resume(*thread) {
                        Ok(()) => println!("[*] resumed {}", thread),
                        Err(err) => println!("{} resume failed: {}", "[!]".red(), err),
                    }
                }
            }
            ApiEvent::ThreadUnavailable { thread } => {
                println!("{} threads {} unavailable", "[!]".red(), thread);
            }
        }

        if event.needs_ack() {
            session.acknowledge_event(&event).context("event ack")?;
            log::debug!("acknowledged {:?}", event);
        }
    }
}
