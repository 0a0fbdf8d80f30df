//! `foreman-cli` – Foreman Command Line Interface
//!
//! The `foreman` binary wires the orchestration stack together and hands the
//! operator a shell.  It:
//!
//! 1. Loads `~/.foreman/config.toml`, writing defaults on first run, and
//!    applies `FOREMAN_*` environment overrides.
//! 2. Registers the enabled simulated agents and starts them as a batch.
//!    Any startup failure is fatal once the whole batch has been attempted.
//! 3. Starts the executor and drops the operator into the REPL.
//! 4. On `/quit`, end of input, or **Ctrl-C**, stops the executor (letting an
//!    in-flight task finish) and stops every service in reverse order.

mod agents;
mod config;
mod repl;

use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use tokio::sync::Notify;
use tracing::warn;

use foreman_runtime::{Executor, OrchestrationContext, Pipeline, ServiceManager, telemetry};

fn main() -> ExitCode {
    let _telemetry = telemetry::init_tracing("foreman");

    print_banner();
    let cfg = load_config();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start async runtime".red(), e);
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> ExitCode {
    let ctx = Arc::new(OrchestrationContext::new(
        Arc::new(cfg.role_policy()),
        cfg.gate_config(),
    ));

    // ── Services ──────────────────────────────────────────────────────────
    let registered = agents::register_enabled(&ctx, &cfg.agents);
    println!(
        "  Registered {} simulated agent(s): {}",
        registered.len(),
        registered.join(", ").bold()
    );

    let manager = ServiceManager::new(Arc::clone(&ctx));
    let started = manager.start_all().await;
    if !started.is_clean() {
        for (name, e) in &started.failed {
            println!("  {} {}: {}", "✗".red().bold(), name.bold(), e);
        }
        println!("{}", "  Service startup failed; shutting down.".red().bold());
        manager.stop_all().await;
        return ExitCode::FAILURE;
    }

    // ── Executor ──────────────────────────────────────────────────────────
    let executor = Arc::new(Executor::new(
        Arc::clone(&ctx),
        Pipeline::standard(),
        cfg.executor_config(),
    ));
    executor.start();
    let printer = repl::spawn_event_printer(&ctx.bus);

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(Notify::new());
    let shutdown_signal = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – initiating graceful shutdown …".yellow().bold());
        shutdown_signal.notify_one();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    repl::run(Arc::clone(&ctx), shutdown).await;

    // ── Shutdown ──────────────────────────────────────────────────────────
    println!("{}", "  Waiting for the current task to finish …".dimmed());
    executor.shutdown().await;
    printer.abort();

    let stopped = manager.stop_all().await;
    for (name, e) in &stopped.failed {
        println!("  {} {}: {}", "✗".red().bold(), name.bold(), e);
    }
    let left = ctx.queue.size();
    if left > 0 {
        println!("  {} task(s) left in the queue.", left.to_string().yellow());
    }
    println!("{}", "  ✓ Exiting Foreman.".green());

    if stopped.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

fn load_config() -> config::Config {
    let mut cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let cfg = config::Config::default();
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };
    config::apply_env_overrides(&mut cfg);
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ____                                 "#.bold().cyan());
    println!("{}", r#"  / __/__  _______ __ _  ___ ____      "#.bold().cyan());
    println!("{}", r#" / _// _ \/ __/ -_)  ' \/ _ `/ _ \     "#.bold().cyan());
    println!("{}", r#"/_/  \___/_/  \__/_/_/_/\_,_/_//_/     "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Foreman".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Agent Orchestration Kernel");
    println!();
}
