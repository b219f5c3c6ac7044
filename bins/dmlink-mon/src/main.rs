//! Host monitor CLI: attach to a target's shared log region over a debug
//! server and turn it into a terminal session.

use clap::{Parser, ValueEnum};
use dmlink_config::MonitorConfig;
use dmlink_monitor::{Monitor, MonitorOptions, TerminalConsole};
use dmlink_probe::{GdbProbe, ProbeBackend, ProbeError, TelnetProbe};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Exit code after a user interrupt, once the terminal is restored.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "dmlink-mon", version, about = "Debug-monitor link host console")]
struct Cli {
    /// Debug server host.
    #[arg(long)]
    host: Option<String>,

    /// Debug server port.
    #[arg(long)]
    port: Option<u16>,

    /// Region base address on the target (hex with 0x prefix, or decimal).
    #[arg(long, value_parser = parse_addr)]
    addr: Option<u64>,

    /// Polling interval in milliseconds.
    #[arg(long)]
    interval: Option<u64>,

    /// Hold the region lock across each tick.
    #[arg(long)]
    blocking: bool,

    /// Read the whole region in one probe round-trip per tick.
    #[arg(long)]
    snapshot: bool,

    /// Prefix each drained line with a wall-clock timestamp.
    #[arg(long)]
    time: bool,

    /// File whose raw bytes are queued as firmware input at startup.
    #[arg(long)]
    input_file: Option<PathBuf>,

    /// File whose lines answer firmware input requests before stdin.
    #[arg(long)]
    init_script: Option<PathBuf>,

    /// Use the remote-serial-protocol backend instead of the telnet
    /// console.
    #[arg(long)]
    gdb: bool,

    /// Log verbosity.
    #[arg(long, value_enum)]
    trace_level: Option<TraceLevel>,

    /// TOML configuration file; flags given on the command line win.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TraceLevel {
    Error,
    Warn,
    Info,
    Verbose,
}

impl TraceLevel {
    fn as_filter(self) -> &'static str {
        match self {
            TraceLevel::Error => "error",
            TraceLevel::Warn => "warn",
            TraceLevel::Info => "info",
            TraceLevel::Verbose => "trace",
        }
    }

    fn name(self) -> &'static str {
        match self {
            TraceLevel::Error => "error",
            TraceLevel::Warn => "warn",
            TraceLevel::Info => "info",
            TraceLevel::Verbose => "verbose",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "error" => Some(TraceLevel::Error),
            "warn" => Some(TraceLevel::Warn),
            "info" => Some(TraceLevel::Info),
            "verbose" => Some(TraceLevel::Verbose),
            _ => None,
        }
    }
}

fn parse_addr(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| format!("'{s}' is not a valid address"))
}

/// Either wire dialect behind the one backend trait the monitor needs.
enum Backend {
    Telnet(TelnetProbe),
    Gdb(GdbProbe),
}

impl ProbeBackend for Backend {
    fn read_memory(&mut self, addr: u64, len: usize) -> Result<Vec<u8>, ProbeError> {
        match self {
            Backend::Telnet(p) => p.read_memory(addr, len),
            Backend::Gdb(p) => p.read_memory(addr, len),
        }
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<(), ProbeError> {
        match self {
            Backend::Telnet(p) => p.write_memory(addr, data),
            Backend::Gdb(p) => p.write_memory(addr, data),
        }
    }

    fn disconnect(&mut self) -> Result<(), ProbeError> {
        match self {
            Backend::Telnet(p) => p.disconnect(),
            Backend::Gdb(p) => p.disconnect(),
        }
    }
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version are normal exits; anything else is an
            // argument failure.
            use clap::error::ErrorKind;
            let code: u8 = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let mut cfg = match &cli.config {
        Some(path) => match MonitorConfig::load(path.display().to_string()) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("dmlink-mon: {e}");
                return ExitCode::from(1);
            }
        },
        None => MonitorConfig::default(),
    };
    apply_cli(&mut cfg, &cli);

    let level = TraceLevel::from_name(&cfg.trace_level).unwrap_or(TraceLevel::Info);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.as_filter())),
        )
        .with_writer(std::io::stderr)
        .init();

    unsafe {
        libc::signal(
            libc::SIGINT,
            on_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }

    match run(cfg) {
        Ok(()) if INTERRUPTED.load(Ordering::SeqCst) => ExitCode::from(EXIT_INTERRUPTED),
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Connect(e)) => {
            error!(error = %e, "could not reach the debug server");
            ExitCode::from(1)
        }
        Err(RunError::Setup(msg)) => {
            error!(%msg, "setup failed");
            ExitCode::from(1)
        }
        Err(RunError::Session(e)) => {
            error!(error = %e, "session failed");
            ExitCode::from(1)
        }
    }
}

enum RunError {
    Connect(ProbeError),
    Setup(String),
    Session(dmlink_monitor::MonitorError),
}

fn apply_cli(cfg: &mut MonitorConfig, cli: &Cli) {
    if let Some(host) = &cli.host {
        cfg.host = host.clone();
    }
    if let Some(port) = cli.port {
        cfg.port = port;
    }
    if let Some(addr) = cli.addr {
        cfg.addr = addr;
    }
    if let Some(interval) = cli.interval {
        cfg.interval_ms = interval;
    }
    cfg.blocking |= cli.blocking;
    cfg.snapshot |= cli.snapshot;
    cfg.time |= cli.time;
    cfg.gdb |= cli.gdb;
    if let Some(level) = cli.trace_level {
        cfg.trace_level = level.name().to_string();
    }
    if let Some(p) = &cli.init_script {
        cfg.init_script = Some(p.display().to_string());
    }
    if let Some(p) = &cli.input_file {
        cfg.input_file = Some(p.display().to_string());
    }
}

fn run(cfg: MonitorConfig) -> Result<(), RunError> {
    let backend = if cfg.gdb {
        Backend::Gdb(GdbProbe::connect(&cfg.host, cfg.port).map_err(RunError::Connect)?)
    } else {
        Backend::Telnet(TelnetProbe::connect(&cfg.host, cfg.port).map_err(RunError::Connect)?)
    };
    info!(
        host = %cfg.host,
        port = cfg.port,
        addr = format_args!("{:#x}", cfg.addr),
        dialect = if cfg.gdb { "remote-serial" } else { "telnet" },
        "connected"
    );

    let opts = MonitorOptions {
        region_addr: cfg.addr,
        interval: Duration::from_millis(cfg.interval_ms),
        blocking: cfg.blocking,
        snapshot: cfg.snapshot,
        timestamps: cfg.time,
    };
    let mut monitor = Monitor::new(backend, TerminalConsole::new(), opts);

    if let Some(path) = &cfg.init_script {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RunError::Setup(format!("init script '{path}': {e}")))?;
        monitor.push_script_lines(text.lines().map(str::to_string));
    }
    if let Some(path) = &cfg.input_file {
        let bytes = std::fs::read(path)
            .map_err(|e| RunError::Setup(format!("input file '{path}': {e}")))?;
        monitor.queue_input(&bytes);
    }

    // Relay the signal flag into the monitor's stop handle so the loop
    // winds down between ticks.
    let stop = monitor.stop_handle();
    std::thread::spawn(move || {
        while !INTERRUPTED.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(50));
        }
        stop.store(true, Ordering::SeqCst);
    });

    monitor.run().map_err(RunError::Session)
}
