//! profbudget CLI: replay accounting traces through the budget controller.

use std::fs;
use std::future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use profbudget_core::config::ControllerConfig;
use profbudget_core::id::{PeerId, Timestamp};
use profbudget_core::update::UpdateMessage;
use profbudget_core::wire::WireUpdate;
use profbudget_host::error::ChannelError;
use profbudget_host::local::{LocalSource, RecordingLocalSource, UpdateCallback};
use profbudget_host::registry::{PeerRegistry, RegistrySnapshot};
use profbudget_host::remote::{PeerChannel, UpdateFuture};
use profbudget_mem::sink::Eviction;

#[derive(Parser)]
#[command(name = "profbudget")]
#[command(about = "Global memory budget for profiler buffers across processes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSON-lines accounting trace and print the evictions it causes
    Replay {
        /// Path to the trace file
        #[arg(short, long)]
        trace: PathBuf,

        /// Budget for `start` events that carry neither bytes nor entries
        #[arg(long)]
        budget_bytes: Option<u64>,

        /// Record and print the diagnostic log of each controller
        #[arg(long)]
        diagnostic_log: bool,

        /// Peer id of the host process in the trace
        #[arg(long, default_value = "0")]
        local_peer: u64,
    },

    /// Show the byte budget for a sampler configured in entries
    ExplainBudget {
        /// Requested buffer entries
        #[arg(short, long)]
        entries: u32,
    },
}

/// One line of a replay trace.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum TraceEvent {
    Start {
        #[serde(default)]
        budget_bytes: Option<u64>,
        #[serde(default)]
        entries: Option<u32>,
    },
    Stop,
    Connect {
        peer: PeerId,
    },
    Disconnect {
        peer: PeerId,
    },
    /// Update from a remote peer.
    Update {
        peer: PeerId,
        update: WireUpdate,
    },
    /// Update from the host's own buffer; applied before the next remote one.
    Local {
        update: WireUpdate,
    },
    /// Apply the pending local update now.
    Flush,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ReplayedEviction {
    /// 1-based trace line that caused the eviction.
    line: usize,
    owner: PeerId,
    at: Timestamp,
}

#[derive(Debug, Serialize)]
struct ReplayReport {
    evictions: Vec<ReplayedEviction>,
    violations: Vec<String>,
    /// Diagnostic logs of controllers destroyed during or at the end of the replay.
    diagnostic_logs: Vec<Value>,
    snapshot: RegistrySnapshot,
}

/// Shared record of every eviction request, in issue order.
#[derive(Default)]
struct EvictionLog {
    entries: Mutex<Vec<Eviction>>,
}

impl EvictionLog {
    fn push(&self, owner: PeerId, at: Timestamp) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Eviction { owner, at });
    }

    fn take(&self) -> Vec<Eviction> {
        std::mem::take(&mut *self.entries.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Remote peer stand-in: updates come from the trace, commands are recorded.
struct TraceChannel {
    peer: PeerId,
    log: Arc<EvictionLog>,
}

impl PeerChannel for TraceChannel {
    fn await_next_update(&self) -> UpdateFuture {
        // The replay delivers updates itself; nothing ever arrives here.
        Box::pin(future::pending::<Result<UpdateMessage, ChannelError>>())
    }

    fn destroy_at_or_before(&self, at: Timestamp) {
        self.log.push(self.peer, at);
    }
}

/// Host buffer stand-in that shares the eviction log with the channels.
struct TraceLocal {
    peer: PeerId,
    inner: RecordingLocalSource,
    log: Arc<EvictionLog>,
}

impl LocalSource for TraceLocal {
    fn set_update_callback(&self, callback: Option<UpdateCallback>) {
        self.inner.set_update_callback(callback);
    }

    fn destroy_at_or_before(&self, at: Timestamp) {
        self.inner.destroy_at_or_before(at);
        self.log.push(self.peer, at);
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Replay {
            trace,
            budget_bytes,
            diagnostic_log,
            local_peer,
        } => {
            if let Err(e) = run_replay(&trace, budget_bytes, diagnostic_log, local_peer) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::ExplainBudget { entries } => {
            if let Err(e) = explain_budget(entries) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }
}

fn run_replay(
    trace_path: &PathBuf,
    budget_bytes: Option<u64>,
    diagnostic_log: bool,
    local_peer: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let text = fs::read_to_string(trace_path)?;

    let mut config = ControllerConfig::from_env();
    if diagnostic_log {
        config.diagnostic_log = true;
    }
    config.validate()?;

    let report = replay(&text, config, budget_bytes, PeerId::new(local_peer))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn replay(
    text: &str,
    config: ControllerConfig,
    default_budget: Option<u64>,
    local_id: PeerId,
) -> Result<ReplayReport, Box<dyn std::error::Error>> {
    let log = Arc::new(EvictionLog::default());
    let local = Arc::new(TraceLocal {
        peer: local_id,
        inner: RecordingLocalSource::new(),
        log: Arc::clone(&log),
    });
    let mut registry = PeerRegistry::new(
        local_id,
        Some(local.clone() as Arc<dyn LocalSource>),
        config,
    );

    let mut evictions = Vec::new();
    let mut violations = Vec::new();
    let mut diagnostic_logs = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with('#') {
            continue;
        }
        let event: TraceEvent = serde_json::from_str(raw)
            .map_err(|e| format!("line {}: invalid trace event: {}", line, e))?;
        tracing::debug!(line, ?event, "replaying");

        match event {
            TraceEvent::Start {
                budget_bytes,
                entries,
            } => match (budget_bytes, entries, default_budget) {
                (Some(bytes), _, _) => registry.sampling_started(bytes),
                (None, Some(entries), _) => registry.sampling_started_entries(entries),
                (None, None, Some(bytes)) => registry.sampling_started(bytes),
                (None, None, None) => {
                    return Err(format!("line {}: start needs budget_bytes or entries", line).into())
                }
            },
            TraceEvent::Stop => {
                collect_diagnostics(&registry, &mut diagnostic_logs);
                registry.sampling_stopped();
            }
            TraceEvent::Connect { peer } => {
                let channel = Arc::new(TraceChannel {
                    peer,
                    log: Arc::clone(&log),
                });
                registry
                    .peer_connected(peer, channel)
                    .map_err(|e| format!("line {}: {}", line, e))?;
            }
            TraceEvent::Disconnect { peer } => registry.peer_disconnected(peer),
            TraceEvent::Update { peer, update } => {
                if let Err(e) = registry.deliver_update(peer, UpdateMessage::from(update)) {
                    violations.push(format!("line {}: {}", line, e));
                }
            }
            TraceEvent::Local { update } => local.inner.emit(UpdateMessage::from(update)),
            TraceEvent::Flush => registry.flush_local(),
        }

        evictions.extend(log.take().into_iter().map(|e| ReplayedEviction {
            line,
            owner: e.owner,
            at: e.at,
        }));
    }

    collect_diagnostics(&registry, &mut diagnostic_logs);
    let snapshot = registry.snapshot();
    Ok(ReplayReport {
        evictions,
        violations,
        diagnostic_logs,
        snapshot,
    })
}

fn collect_diagnostics(registry: &PeerRegistry, out: &mut Vec<Value>) {
    if let Some(diag) = registry.controller().and_then(|c| c.diagnostic_log()) {
        out.push(diag.to_json());
    }
}

fn explain_budget(entries: u32) -> Result<(), Box<dyn std::error::Error>> {
    let config = ControllerConfig::from_env();
    config.validate()?;
    let clamped = config.clamp_entries(entries);
    let budget = config.budget_for_entries(entries);

    println!("Requested entries: {}", entries);
    if clamped != entries {
        println!(
            "Clamped entries:   {} (range {}..={})",
            clamped, config.min_entries, config.max_entries
        );
    }
    println!("Bytes per entry:   {}", config.bytes_per_entry);
    println!(
        "Budget:            {} bytes ({:.2} MB)",
        budget,
        budget as f64 / 1_048_576.0
    );
    Ok(())
}
