//! CLI entry point for the `DeepSeek` agent.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use dotenvy::dotenv;
use tokio::io::{AsyncBufReadExt, BufReader};

use deepseek_agent::client::DeepSeekClient;
use deepseek_agent::config::Config;
use deepseek_agent::core::{ApprovalMode, Event, TurnOutcomeStatus};
use deepseek_agent::logging;
use deepseek_agent::models::{EntryKind, EntryStatus};
use deepseek_agent::session::{SessionHandle, SessionOptions, connect_tool_servers, spawn_session};

#[derive(Parser, Debug)]
#[command(
    name = "deepseek-agent",
    author,
    version,
    about = "Tool-using coding agent for DeepSeek",
    long_about = "Runs a tool-using conversation against DeepSeek or any OpenAI-compatible backend.\n\nNot affiliated with DeepSeek Inc."
)]
struct Cli {
    /// Send a one-shot prompt (non-interactive)
    #[arg(short, long)]
    prompt: Option<String>,

    /// Path to config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model to use (overrides config)
    #[arg(short, long)]
    model: Option<String>,

    /// YOLO mode: approve every tool call without asking
    #[arg(long)]
    yolo: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Workspace directory for file operations
    #[arg(short, long)]
    workspace: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let mut config = Config::load(cli.config.clone())?;
    if let Some(model) = cli.model {
        config.model = Some(model);
    }
    if let Some(workspace) = cli.workspace {
        config.workspace = Some(workspace.display().to_string());
    }

    let client = DeepSeekClient::new(&config)?;
    let mut options = SessionOptions::from_config(&config);
    if cli.yolo {
        options.approval_mode = ApprovalMode::Auto;
    }
    options.mcp_pool = connect_tool_servers(&config.mcp_config_path()).await?;

    let handle = spawn_session(Arc::new(client), options).await;
    logging::debug(format!("Session {} started", handle.session_id));

    let result = match cli.prompt {
        Some(prompt) => {
            handle.send(prompt).await?;
            run_loop(&handle, true).await
        }
        None => {
            println!(
                "{}",
                "DeepSeek agent. Type a message, /model NAME to switch models, /quit to exit. Ctrl-C cancels a running turn."
                    .dimmed()
            );
            print_prompt();
            run_loop(&handle, false).await
        }
    };

    let _ = handle.shutdown().await;
    // The event channel closes once the session has torn down.
    while handle.recv_event().await.is_some() {}
    result
}

fn print_prompt() {
    print!("{} ", ">".bold().cyan());
    let _ = std::io::stdout().flush();
}

/// Drive the session from stdin until the user quits (or, in one-shot mode,
/// until the first turn completes).
async fn run_loop(handle: &SessionHandle, one_shot: bool) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending_approval: Option<String> = None;
    let mut busy = one_shot;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();

                if let Some(id) = pending_approval.take() {
                    match line {
                        "y" | "yes" => handle.approve_once(id).await?,
                        "s" | "session" => handle.approve_for_session(id).await?,
                        _ => handle.deny(id).await?,
                    }
                    continue;
                }
                if line.is_empty() {
                    if !busy {
                        print_prompt();
                    }
                    continue;
                }
                if matches!(line, "/quit" | "/exit") {
                    break;
                }
                if let Some(model) = line.strip_prefix("/model ").map(str::trim)
                    && !model.is_empty()
                {
                    handle.set_model(model).await?;
                    println!("{}", format!("Model set to {model} from the next turn").dimmed());
                    if !busy {
                        print_prompt();
                    }
                    continue;
                }
                if busy {
                    println!("{}", "A turn is still running; press Ctrl-C to cancel it.".yellow());
                    continue;
                }
                busy = true;
                handle.send(line).await?;
            }
            event = handle.recv_event() => {
                let Some(event) = event else { break };
                if let Event::ApprovalRequired { id, .. } = &event {
                    pending_approval = Some(id.clone());
                }
                let finished = matches!(event, Event::TurnComplete { .. });
                render_event(&event);
                if finished {
                    busy = false;
                    if one_shot {
                        break;
                    }
                    print_prompt();
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if busy {
                    handle.cancel();
                    println!("{}", "Cancelling...".yellow());
                } else {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn render_event(event: &Event) {
    match event {
        Event::EntryAdded { entry } => match entry.kind {
            EntryKind::Assistant => {
                if entry.status == Some(EntryStatus::Error) {
                    println!("{}", entry.content.red());
                } else {
                    println!("{}", entry.content);
                }
            }
            EntryKind::Tool => println!("{} {}", "tool".dimmed(), entry.content.dimmed()),
            EntryKind::User | EntryKind::Command => {}
        },
        Event::EntryStatus { status, .. } => {
            if *status == EntryStatus::Error {
                println!("{}", "  tool failed".red());
            }
        }
        Event::ApprovalRequired {
            tool_name,
            description,
            ..
        } => {
            println!("{} {}", "Approval required:".bold().yellow(), tool_name.bold());
            println!("  {description}");
            print!("  [y] once  [s] this session  [n] deny: ");
            let _ = std::io::stdout().flush();
        }
        Event::TurnComplete { usage, status, .. } => {
            let label = match status {
                TurnOutcomeStatus::Completed => "done".green(),
                TurnOutcomeStatus::Interrupted => "interrupted".yellow(),
                TurnOutcomeStatus::Failed => "failed".red(),
            };
            println!(
                "{} {}",
                label,
                format!(
                    "({} prompt / {} completion tokens)",
                    usage.prompt_tokens, usage.completion_tokens
                )
                .dimmed()
            );
        }
        Event::Error { message, .. } => eprintln!("{} {message}", "error:".red().bold()),
        Event::Status { message } => println!("{}", message.yellow()),
        Event::TokenProgress { .. } | Event::TurnStarted { .. } => {}
    }
}
