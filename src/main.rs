mod analyzer;
mod client;
mod config;
mod consolidation;
mod context;
mod conversation;
mod error;
mod feedback;
mod patch;
mod project_fs;
mod prompts;
mod tokens;

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};

use client::HttpClient;
use config::Config;
use consolidation::{apply::ApplyReport, Engine, PassOutcome};
use project_fs::ProjectFs;

#[derive(Parser, Debug)]
#[command(
    name = "kai",
    about = "A conversation-driven coding assistant that turns chat transcripts into applied file changes",
    long_about = None,
)]
struct Args {
    /// Project root (defaults to the current directory)
    #[arg(long, global = true, default_value = ".")]
    project: PathBuf,

    /// Generate shell completions and print to stdout (bash, zsh, fish, elvish)
    #[arg(long, value_name = "SHELL")]
    completions: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a message in a named conversation and print the assistant reply
    Chat {
        name: String,
        /// Message text; read from stdin when omitted
        message: Option<String>,
    },
    /// Run a full consolidation pass for a conversation
    Consolidate { name: String },
    /// Rebuild the project analysis cache
    Analyze,
    /// Show or set the persisted context mode (full, analysis_cache, dynamic)
    ContextMode { mode: Option<String> },
    /// List conversations
    List,
    /// Delete conversation logs
    Delete {
        names: Vec<String>,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() {
    init_tracing();
    let args = Args::parse();

    if let Some(shell) = args.completions.clone() {
        if let Err(e) = generate_completions(&shell) {
            eprintln!("kai: {e}");
            std::process::exit(1);
        }
        return;
    }

    if let Err(e) = run(args).await {
        eprintln!("kai: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("KAI_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: Args) -> Result<()> {
    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    let root = args.project.canonicalize().unwrap_or(args.project);
    let config = Config::load(&root)?;

    match command {
        Command::Chat { name, message } => {
            let engine = build_engine(config, &root)?;
            let prompt = match message {
                Some(m) => m,
                None => read_stdin_prompt()?,
            };
            let reply = engine.chat(&name, &prompt).await?;
            println!("{reply}");
        }

        Command::Consolidate { name } => {
            let engine = build_engine(config, &root)?;
            install_cancel_handler(&engine);
            match engine.consolidate(&name).await? {
                PassOutcome::Success(report) => {
                    print_report(&report);
                    println!("consolidation succeeded");
                }
                PassOutcome::Exhausted(report) => {
                    print_report(&report);
                    anyhow::bail!("feedback loops still failing after the autofix budget");
                }
                PassOutcome::Cancelled => {
                    println!("consolidation cancelled");
                }
            }
        }

        Command::Analyze => {
            let engine = build_engine(config, &root)?;
            let cache = engine.analyze().await?;
            let summarized = cache.entries.iter().filter(|e| e.summary.is_some()).count();
            println!(
                "analyzed {} files ({summarized} summarized)",
                cache.entries.len()
            );
        }

        Command::ContextMode { mode } => match mode {
            None => match config.context.mode {
                Some(mode) => println!("{mode}"),
                None => {
                    // Nothing persisted yet: compute the auto-selection and
                    // offer to save it.
                    let engine = build_engine(config.clone(), &root)?;
                    let selected = engine.auto_select_mode().await?;
                    println!("auto-selected: {selected}");
                    if confirm(&format!("Persist '{selected}' to {}?", config::CONFIG_FILE))? {
                        let mut config = config;
                        config.context.mode = Some(selected);
                        config.save(&root)?;
                        println!("context mode set to {selected}");
                    } else {
                        println!("not persisted — the mode is re-selected on each run");
                    }
                }
            },
            Some(raw) => {
                let parsed = raw
                    .parse::<config::ContextMode>()
                    .map_err(anyhow::Error::msg)?;
                let mut config = config;
                config.context.mode = Some(parsed);
                config.save(&root)?;
                println!("context mode set to {parsed}");
            }
        },

        Command::List => {
            let fs = open_project_fs(&config, &root);
            let names = conversation::list(&fs, &config.project.chats_dir)?;
            if names.is_empty() {
                println!("no conversations yet");
            }
            for name in names {
                let log = conversation::ConversationLog::open(&fs, &config.project.chats_dir, &name)?;
                println!("{name}  ({} messages)", log.messages().len());
            }
        }

        Command::Delete { names, yes } => {
            if names.is_empty() {
                anyhow::bail!("no conversation names given");
            }
            if !yes && !confirm(&format!("Delete {} conversation(s)?", names.len()))? {
                println!("aborted");
                return Ok(());
            }
            let fs = open_project_fs(&config, &root);
            for name in names {
                if conversation::delete(&fs, &config.project.chats_dir, &name)? {
                    println!("deleted {name}");
                } else {
                    println!("{name} not found");
                }
            }
        }
    }

    Ok(())
}

fn open_project_fs(config: &Config, root: &Path) -> ProjectFs {
    ProjectFs::new(root, &config.project.chats_dir, &config.analysis.cache_file_path)
}

fn build_engine(config: Config, root: &Path) -> Result<Engine> {
    let api_key = Config::api_key()?;
    let fs = open_project_fs(&config, root);
    let client = HttpClient::from_config(&config, api_key);
    Ok(Engine::new(config, fs, Box::new(client)))
}

/// Ctrl-C requests cooperative cancellation; the pass stops at the next
/// stage boundary.
fn install_cancel_handler(engine: &Engine) {
    let flag = engine.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancelling after the current stage...");
            flag.store(true, std::sync::atomic::Ordering::Relaxed);
        }
    });
}

fn read_stdin_prompt() -> Result<String> {
    let mut buffer = String::new();
    std::io::stdin().read_to_string(&mut buffer)?;
    let prompt = buffer.trim().to_string();
    if prompt.is_empty() {
        anyhow::bail!("no message provided (pass one as an argument or on stdin)");
    }
    Ok(prompt)
}

fn confirm(question: &str) -> Result<bool> {
    use std::io::Write;
    print!("{question} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn print_report(report: &ApplyReport) {
    for (path, outcome) in &report.per_file {
        println!("  {:>8}  {path}", outcome.label());
    }
    println!(
        "  {} applied, {} skipped, {} failed",
        report.success, report.skipped, report.failed
    );
}

fn generate_completions(shell_name: &str) -> Result<()> {
    use clap_complete::{generate, Shell};

    let shell: Shell = match shell_name.to_lowercase().as_str() {
        "bash" => Shell::Bash,
        "zsh" => Shell::Zsh,
        "fish" => Shell::Fish,
        "elvish" => Shell::Elvish,
        other => anyhow::bail!("unknown shell: {other} (supported: bash, zsh, fish, elvish)"),
    };

    let mut cmd = Args::command();
    generate(shell, &mut cmd, "kai", &mut std::io::stdout());
    Ok(())
}
