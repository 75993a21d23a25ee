//! `sonarlink-cli` – SonarLink Command Line Interface
//!
//! This binary is the ignition switch for the sonar-to-MQTT pipeline.  It:
//!
//! 1. Resolves the configuration from `~/.sonarlink/config.toml` (or
//!    `--config`), falling back to built-in defaults, with `SONARLINK_*`
//!    environment overrides.
//! 2. Initialises tracing (and OTLP export when configured) before the
//!    Tokio runtime exists.
//! 3. Runs the [`Supervisor`] against the Firmata bridge and the MQTT broker,
//!    or against a simulated bridge and the in-process bus (`--simulate`).
//! 4. Intercepts **Ctrl-C** / SIGTERM and shuts the pipeline down in order.
//!
//! # Exit codes
//!
//! | Code | Meaning |
//! |---|---|
//! | 0 | Operator interrupt, or a link died while running and every sensor was closed |
//! | 2 | Initialisation failed (configuration, bridge, broker) |

mod args;
mod config;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use tracing::{error, info, warn};

use sonarlink_hal::{BridgeConnector, FirmataConnector, SimBridge, SimConnector, list_ports};
use sonarlink_middleware::{BusConnector, LinkConnector, MqttConnector, ReadingBus};
use sonarlink_runtime::{RunOutcome, Shutdown, Supervisor, init_tracing};
use sonarlink_types::{MonitorConfig, SonarError};

const EXIT_OK: i32 = 0;
const EXIT_INIT_FAILED: i32 = 2;

/// Grace period for blocking work (an abandoned serial handshake) when the
/// runtime is torn down.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let args = match args::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}: {}\n\n{}", "error".red().bold(), e, args::USAGE);
            return EXIT_INIT_FAILED;
        }
    };
    if args.help {
        println!("{}", args::USAGE);
        return EXIT_OK;
    }

    // ── Structured logging ────────────────────────────────────────────────
    // RUST_LOG filters, SONARLINK_LOG_FORMAT=json switches to JSON lines,
    // OTEL_EXPORTER_OTLP_ENDPOINT enables span export.
    let _telemetry = init_tracing("sonarlink");

    print_banner();

    let path = args.config.clone().unwrap_or_else(config::config_path);

    if args.init_config {
        return init_config(&path);
    }
    if args.list_ports {
        return print_ports();
    }

    let cfg = match config::resolve(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(path = %path.display(), error = %e, "configuration unusable");
            println!("{}: {}", "Config error".red(), e);
            return EXIT_INIT_FAILED;
        }
    };
    print_summary(&cfg, &path, args.simulate);

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Shutdown::new();
    let trigger = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Interrupt received – shutting down …".yellow().bold());
        trigger.trigger();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; Ctrl-C will not shut down cleanly");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "cannot start async runtime");
            return EXIT_INIT_FAILED;
        }
    };

    let result = runtime.block_on(async {
        let (bridges, links) = connectors(&cfg, args.simulate);
        let supervisor = Supervisor::new(cfg, bridges, links);
        info!(run_id = %supervisor.run_id(), "supervisor starting");
        supervisor.run(shutdown.signal()).await
    });
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);

    report(&result);
    exit_code(&result)
}

// Real hardware and broker, or the simulated pair with a logging subscriber.
// Must run inside the runtime: the simulation spawns its logger.
fn connectors(
    cfg: &MonitorConfig,
    simulate: bool,
) -> (Arc<dyn BridgeConnector>, Arc<dyn LinkConnector>) {
    if !simulate {
        return (
            Arc::new(FirmataConnector::new(cfg.bridge.clone())),
            Arc::new(MqttConnector),
        );
    }

    let bus = ReadingBus::default();
    let mut published = bus.subscribe_topic(cfg.base_topic.clone());
    tokio::spawn(async move {
        while let Some(msg) = published.recv().await {
            info!(topic = %msg.topic, payload = %msg.payload, "published");
        }
    });
    (
        Arc::new(SimConnector::new(|| SimBridge::new().with_auto_echo())),
        Arc::new(BusConnector::new(bus)),
    )
}

// A stopped poll loop has already closed every channel, so the process
// ends cleanly whatever stopped it.
fn exit_code(result: &Result<RunOutcome, SonarError>) -> i32 {
    match result {
        Err(_) => EXIT_INIT_FAILED,
        Ok(_) => EXIT_OK,
    }
}

fn report(result: &Result<RunOutcome, SonarError>) {
    match result {
        Err(e) => println!("  {} {}", "✗ Initialisation failed:".red().bold(), e),
        Ok(outcome) => {
            let ticks = outcome.report.as_ref().map_or(0, |r| r.ticks);
            match outcome.fatal_error() {
                Some(e) => {
                    error!(error = %e, ticks, "poll loop stopped on link loss");
                    println!("  {} {} (after {} ticks)", "✗ Link lost:".red().bold(), e, ticks);
                }
                None => println!(
                    "  {} {} ticks published across {} attempt(s).",
                    "✓ Stopped.".green(),
                    ticks,
                    outcome.attempts
                ),
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// One-shot commands
// ─────────────────────────────────────────────────────────────────────────────

fn init_config(path: &Path) -> i32 {
    match config::save_to(&MonitorConfig::default(), path) {
        Ok(()) => {
            println!(
                "  {} Default config written to {}",
                "✓".green().bold(),
                path.display().to_string().bold()
            );
            EXIT_OK
        }
        Err(e) => {
            println!("{}: {}", "Error saving config".red(), e);
            EXIT_INIT_FAILED
        }
    }
}

fn print_ports() -> i32 {
    match list_ports() {
        Ok(ports) => {
            println!("  Available serial ports:");
            if ports.is_empty() {
                println!("    {}", "(none)".dimmed());
            }
            for port in &ports {
                println!("    • {}", port);
            }
            EXIT_OK
        }
        Err(e) => {
            println!("{}: {}", "Error listing ports".red(), e);
            EXIT_INIT_FAILED
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ____                    __    _      __  "#.bold().cyan());
    println!("{}", r#"  / __/__  ___  ___ _____ / /   (_)__  / /__"#.bold().cyan());
    println!("{}", r#" _\ \/ _ \/ _ \/ _ `/ __// /__ / / _ \/  '_/"#.bold().cyan());
    println!("{}", r#"/___/\___/_//_/\_,_/_/  /____//_/_//_/_/\_\ "#.bold().cyan());
    println!();
    let version = format!("v{}", env!("CARGO_PKG_VERSION"));
    println!("  {} {}", "SonarLink".bold(), version.dimmed());
    println!("  Ultrasonic range sensors → MQTT");
    println!();
}

fn print_summary(cfg: &MonitorConfig, path: &Path, simulate: bool) {
    let source = if path.exists() {
        path.display().to_string()
    } else {
        "built-in defaults".to_string()
    };
    println!("  Config:   {}", source.bold());
    if simulate {
        println!("  Mode:     {}", "simulation (no hardware, no broker)".yellow());
    } else {
        println!("  Broker:   {}:{}", cfg.broker.host, cfg.broker.port);
        let port = cfg.bridge.serial_port.as_deref().unwrap_or("auto-detect");
        println!("  Bridge:   {} @ {} baud", port, cfg.bridge.baud_rate);
    }
    println!(
        "  Sensors:  {} → {}<id> every {} s",
        cfg.sensors.len(),
        cfg.base_topic.cyan(),
        cfg.poll_interval_secs
    );
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sonarlink_runtime::{LoopReport, StopReason};

    fn outcome(report: Option<LoopReport>) -> Result<RunOutcome, SonarError> {
        Ok(RunOutcome {
            run_id: uuid::Uuid::nil(),
            attempts: 1,
            report,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        })
    }

    #[test]
    fn interrupt_exits_zero() {
        assert_eq!(exit_code(&outcome(None)), EXIT_OK);
        let report = LoopReport {
            reason: StopReason::Interrupted,
            ticks: 12,
            close_failures: 0,
        };
        assert_eq!(exit_code(&outcome(Some(report))), EXIT_OK);
    }

    #[test]
    fn link_loss_after_cleanup_exits_zero() {
        let report = LoopReport {
            reason: StopReason::TransportLost(SonarError::BrokerConnection("gone".into())),
            ticks: 3,
            close_failures: 0,
        };
        let result = outcome(Some(report));
        assert!(result.as_ref().unwrap().fatal_error().is_some());
        assert_eq!(exit_code(&result), EXIT_OK);

        let report = LoopReport {
            reason: StopReason::BridgeLost(SonarError::BridgeConnection("unplugged".into())),
            ticks: 0,
            close_failures: 1,
        };
        assert_eq!(exit_code(&outcome(Some(report))), EXIT_OK);
    }

    #[test]
    fn init_failure_exits_two() {
        let err = Err(SonarError::Configuration("no sensors".into()));
        assert_eq!(exit_code(&err), EXIT_INIT_FAILED);
    }
}
