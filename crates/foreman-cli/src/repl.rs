//! REPL – the operator shell.
//!
//! Supported slash-commands:
//!   /enqueue <id> <feature…>  – queue a task
//!   /queue                    – list waiting tasks
//!   /services                 – list registered services
//!   /pending                  – list approval requests awaiting a decision
//!   /approve <id>             – approve a pending request
//!   /reject <id> [reason]     – reject a pending request
//!   /help                     – show this list
//!   /quit | /exit             – shut down gracefully
//!
//! Pipeline and approval events are echoed as they happen.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use colored::Colorize;
use foreman_middleware::{EventBus, Topic};
use foreman_runtime::OrchestrationContext;
use foreman_types::{ApprovalState, EventPayload, Task};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A parsed operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Enqueue { id: String, feature: String },
    Queue,
    Services,
    Pending,
    Approve(Uuid),
    Reject { id: Uuid, reason: String },
    Help,
    Quit,
}

/// Parse one input line.  Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };

    let cmd = match head {
        "/enqueue" => {
            let Some((id, feature)) = rest.split_once(char::is_whitespace) else {
                return Err("usage: /enqueue <id> <feature…>".to_string());
            };
            let feature = feature.trim();
            if id.is_empty() || feature.is_empty() {
                return Err("usage: /enqueue <id> <feature…>".to_string());
            }
            Command::Enqueue {
                id: id.to_string(),
                feature: feature.to_string(),
            }
        }
        "/queue" => Command::Queue,
        "/services" => Command::Services,
        "/pending" => Command::Pending,
        "/approve" => Command::Approve(parse_request_id(rest, "usage: /approve <id>")?),
        "/reject" => {
            let (id, reason) = match rest.split_once(char::is_whitespace) {
                Some((id, reason)) => (id, reason.trim()),
                None => (rest, ""),
            };
            let reason = if reason.is_empty() {
                "rejected by operator"
            } else {
                reason
            };
            Command::Reject {
                id: parse_request_id(id, "usage: /reject <id> [reason]")?,
                reason: reason.to_string(),
            }
        }
        "/help" => Command::Help,
        "/quit" | "/exit" => Command::Quit,
        other => return Err(format!("unknown command '{other}'")),
    };
    Ok(Some(cmd))
}

fn parse_request_id(raw: &str, usage: &str) -> Result<Uuid, String> {
    if raw.is_empty() {
        return Err(usage.to_string());
    }
    Uuid::parse_str(raw).map_err(|e| format!("'{raw}' is not a request id: {e}"))
}

/// Entry point for the interactive REPL.
///
/// Returns on `/quit`, end of input, or when `shutdown` is notified.
pub async fn run(ctx: Arc<OrchestrationContext>, shutdown: Arc<Notify>) {
    let mut lines = spawn_stdin_reader();
    let approver = operator_name();

    prompt();
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            line = lines.recv() => {
                let Some(line) = line else { break };
                match parse(&line) {
                    Ok(None) => {}
                    Ok(Some(Command::Quit)) => {
                        println!("{}", "Goodbye.".green());
                        break;
                    }
                    Ok(Some(cmd)) => dispatch(&ctx, cmd, &approver),
                    Err(msg) => println!(
                        "{} {}. Type {} for available commands.",
                        "Error:".red(),
                        msg.yellow(),
                        "/help".bold()
                    ),
                }
                prompt();
            }
        }
    }
}

/// Print pipeline and approval events until aborted.
pub fn spawn_event_printer(bus: &EventBus) -> JoinHandle<()> {
    let mut tasks = bus.subscribe_to(Topic::Tasks);
    let mut approvals = bus.subscribe_to(Topic::Approvals);
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                Some(e) = tasks.recv() => e,
                Some(e) = approvals.recv() => e,
                else => break,
            };
            if let Some(line) = describe(&event.payload) {
                println!("\n  {line}");
            }
        }
    })
}

fn describe(payload: &EventPayload) -> Option<String> {
    let line = match payload {
        EventPayload::TaskEnqueued { task_id, feature_name } => {
            format!("{} {} ({})", "queued".cyan(), task_id.bold(), feature_name)
        }
        EventPayload::StageCompleted { task_id, stage, service } => {
            format!("{} {} {} by {}", "✓".green(), task_id.bold(), stage, service.dimmed())
        }
        EventPayload::StageSkipped { task_id, stage, service } => format!(
            "{} {} {} ({} not registered)",
            "–".yellow(),
            task_id.bold(),
            stage,
            service.dimmed()
        ),
        EventPayload::TaskCompleted { task_id, stages } => format!(
            "{} {} completed [{}]",
            "✓".green().bold(),
            task_id.bold(),
            stages.join(", ")
        ),
        EventPayload::TaskFailed { task_id, stage, reason } => format!(
            "{} {} failed at {}: {}",
            "✗".red().bold(),
            task_id.bold(),
            stage,
            reason.red()
        ),
        EventPayload::ApprovalRequested(req) => format!(
            "{} {} on {} for {} – {}\n    {} /approve {} or /reject {}",
            "approval needed:".yellow().bold(),
            req.action.bold(),
            req.resource.bold(),
            req.agent_name,
            req.justification,
            "→".yellow(),
            req.id,
            req.id
        ),
        EventPayload::ApprovalResolved { request_id, state } => {
            let state = match state {
                ApprovalState::Approved { .. } => state.to_string().green(),
                ApprovalState::Pending => state.to_string().normal(),
                _ => state.to_string().red(),
            };
            format!("approval {} {}", request_id.to_string().dimmed(), state)
        }
        _ => return None,
    };
    Some(line)
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn dispatch(ctx: &OrchestrationContext, cmd: Command, approver: &str) {
    match cmd {
        Command::Enqueue { id, feature } => {
            ctx.queue.enqueue(Task::new(id, feature));
        }
        Command::Queue => cmd_queue(ctx),
        Command::Services => cmd_services(ctx),
        Command::Pending => cmd_pending(ctx),
        Command::Approve(id) => match ctx.approvals().approve(id, approver) {
            Ok(req) => println!("{} {} on {}", "✓ Approved".green(), req.action, req.resource),
            Err(e) => println!("{}: {}", "Cannot approve".red(), e),
        },
        Command::Reject { id, reason } => match ctx.approvals().reject(id, approver, &reason) {
            Ok(req) => println!("{} {} on {}", "✗ Rejected".red(), req.action, req.resource),
            Err(e) => println!("{}: {}", "Cannot reject".red(), e),
        },
        Command::Help => cmd_help(),
        Command::Quit => {}
    }
}

fn cmd_help() {
    println!();
    println!("{}", "Foreman Commands".bold().underline());
    println!("  {}  – queue a task", "/enqueue <id> <feature…>".bold().cyan());
    println!("  {}                     – list waiting tasks", "/queue".bold().cyan());
    println!("  {}                  – list registered services", "/services".bold().cyan());
    println!("  {}                   – list pending approvals", "/pending".bold().cyan());
    println!("  {}              – approve a request", "/approve <id>".bold().cyan());
    println!("  {}      – reject a request", "/reject <id> [reason]".bold().cyan());
    println!("  {}               – exit", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_queue(ctx: &OrchestrationContext) {
    let tasks = ctx.queue.snapshot();
    if tasks.is_empty() {
        println!("  {}", "queue is empty".dimmed());
        return;
    }
    for (i, task) in tasks.iter().enumerate() {
        println!("  {:>3}. {} ({})", i + 1, task.id.bold(), task.feature_name);
    }
}

fn cmd_services(ctx: &OrchestrationContext) {
    let names = ctx.registry.list();
    if names.is_empty() {
        println!("  {}", "no services registered".dimmed());
        return;
    }
    for name in names {
        println!("  • {}", name.bold());
    }
}

fn cmd_pending(ctx: &OrchestrationContext) {
    let pending = ctx.approvals().list_pending();
    if pending.is_empty() {
        println!("  {}", "nothing awaiting approval".dimmed());
        return;
    }
    for req in pending {
        println!(
            "  {} {} on {} by {} (expires {})",
            req.id.to_string().yellow(),
            req.action.bold(),
            req.resource.bold(),
            req.agent_name,
            req.expires_at.format("%H:%M:%S UTC")
        );
        println!("      {}", req.justification.dimmed());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt() {
    print!("{} ", "foreman>".bold().cyan());
    io::stdout().flush().ok();
}

fn operator_name() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "operator".to_string())
}

/// Read stdin on a plain thread; blocking reads never touch the runtime.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    eprintln!("{}: {}", "Read error".red(), e);
                    break;
                }
            }
        }
    });
    rx
}
