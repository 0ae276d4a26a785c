use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use quill_cli::{
    format_report, format_session, format_sessions, open_manager, parse_session_id, CliError,
    OfflineProvider, DEFAULT_DATA_DIR,
};
use quill_context::SessionManager;
use quill_core::SessionId;
use quill_runtime::{AIProvider, GeminiProvider};
use rustyline::completion::{Completer, Pair};
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::{Context, Editor, Helper};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "quill_cli=info,quill_context=info,quill_runtime=warn";

const REPL_COMMANDS: &[&str] = &[
    "/new", "/use", "/sessions", "/show", "/compact", "/preview", "/notes", "/rules", "/help",
    "/exit", "/quit",
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplCommand {
    New(String),
    Use(String),
    Sessions,
    Show,
    Compact,
    Preview,
    Notes,
    Rules,
    Help,
    Say(String),
    Exit,
    Empty,
    Unknown(String),
}

#[derive(Default)]
struct ReplHelper;

impl Helper for ReplHelper {}
impl Hinter for ReplHelper {
    type Hint = String;
}
impl Highlighter for ReplHelper {}
impl Validator for ReplHelper {}

impl Completer for ReplHelper {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Pair>)> {
        let pos = pos.min(line.len());
        let input = &line[..pos];
        if input.contains(char::is_whitespace) {
            return Ok((pos, Vec::new()));
        }

        let pairs = complete_candidates(input)
            .into_iter()
            .map(|candidate| Pair {
                display: candidate.to_string(),
                replacement: candidate.to_string(),
            })
            .collect();
        Ok((0, pairs))
    }
}

fn parse_command(line: &str) -> ReplCommand {
    let line = line.trim();
    if line.is_empty() {
        return ReplCommand::Empty;
    }
    if !line.starts_with('/') {
        return ReplCommand::Say(line.to_string());
    }

    let mut parts = line.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let tail = parts.next().map(str::trim).unwrap_or_default();

    match command {
        "/exit" | "/quit" => ReplCommand::Exit,
        "/help" | "/?" => ReplCommand::Help,
        "/new" => ReplCommand::New(tail.to_string()),
        "/use" if !tail.is_empty() => ReplCommand::Use(tail.to_string()),
        "/use" => ReplCommand::Unknown("usage: /use <session_id>".to_string()),
        "/sessions" => ReplCommand::Sessions,
        "/show" => ReplCommand::Show,
        "/compact" => ReplCommand::Compact,
        "/preview" => ReplCommand::Preview,
        "/notes" => ReplCommand::Notes,
        "/rules" => ReplCommand::Rules,
        _ => ReplCommand::Unknown(format!("unknown command: {line}")),
    }
}

fn help_text() -> String {
    [
        "Commands:",
        "  <message>              Send a message in the current session",
        "  /new [title]           Start a new session",
        "  /use <session_id>      Switch to an existing session",
        "  /sessions              List sessions",
        "  /show                  Show the current session",
        "  /compact               Summarize the middle of the current session",
        "  /preview               Show what the next turn would send",
        "  /notes                 Export context notes as YAML",
        "  /rules                 Export replacement rules as YAML",
        "  /help                  Show this help",
        "  /exit | /quit          Exit",
    ]
    .join("\n")
}

struct ReplState {
    manager: SessionManager,
    current: Option<SessionId>,
}

impl ReplState {
    async fn current_or_new(&mut self) -> Result<SessionId, CliError> {
        if let Some(id) = self.current {
            return Ok(id);
        }
        let id = self.manager.create_session("").await?;
        self.current = Some(id);
        Ok(id)
    }

    fn require_current(&self) -> Result<SessionId, CliError> {
        self.current
            .ok_or_else(|| CliError::InvalidArgument("no session selected; use /new or /use".into()))
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn provider() -> Arc<dyn AIProvider> {
    match GeminiProvider::from_env() {
        Ok(provider) => Arc::new(provider),
        Err(err) => {
            tracing::warn!(error = %err, "Gemini provider unavailable; model calls will fail");
            Arc::new(OfflineProvider::new(err))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    if std::env::args().count() > 1 {
        let cli = quill_cli::Cli::parse();
        let manager = open_manager(&cli.data_dir, cli.model.clone(), provider()).await?;
        match quill_cli::run(cli, &manager).await {
            Ok(output) => println!("{output}"),
            Err(err) => {
                eprintln!("{} {err}", "error:".red());
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let data_dir = std::env::var("QUILL_DATA_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string());
    let model = std::env::var("QUILL_MODEL").ok();
    let manager = open_manager(&PathBuf::from(data_dir), model, provider()).await?;
    let mut state = ReplState {
        current: manager.list_sessions().await.first().map(|session| session.id),
        manager,
    };

    let mut editor = Editor::<ReplHelper, rustyline::history::DefaultHistory>::new()?;
    editor.set_helper(Some(ReplHelper));
    let history = history_file();
    let _ = editor.load_history(&history);

    println!("{}", "Quill interactive mode. Type `/help`.".bright_green());
    if let Some(id) = state.current {
        println!("{} {}", "resuming session".green(), id.to_string().cyan());
    }

    loop {
        match editor.readline("quill> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(trimmed);
                match run_repl_command(&mut state, parse_command(trimmed)).await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(err) => eprintln!("{} {}", "error:".red(), err),
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted)
            | Err(rustyline::error::ReadlineError::Eof) => {
                println!();
                break;
            }
            Err(err) => {
                eprintln!("{} {err}", "error:".red());
                break;
            }
        }
    }

    if let Err(err) = editor.save_history(&history) {
        eprintln!("{} failed to save history: {err}", "warning:".yellow());
    }
    Ok(())
}

async fn run_repl_command(state: &mut ReplState, command: ReplCommand) -> Result<bool, CliError> {
    match command {
        ReplCommand::New(title) => {
            let id = state.manager.create_session(title).await?;
            state.current = Some(id);
            println!("{} {}", "session created:".green(), id.to_string().cyan());
        }
        ReplCommand::Use(raw) => {
            let id = parse_session_id(&raw)?;
            let session = state.manager.get_session(id).await?;
            state.current = Some(id);
            println!("{} {}", "using".green(), session.display_title().cyan());
        }
        ReplCommand::Sessions => {
            println!("{}", format_sessions(&state.manager.list_sessions().await));
        }
        ReplCommand::Show => {
            let session = state.manager.get_session(state.require_current()?).await?;
            println!("{}", format_session(&session));
        }
        ReplCommand::Compact => {
            let report = state.manager.compact(state.require_current()?).await?;
            println!("{}", format_report(&report).green());
        }
        ReplCommand::Preview => {
            let assembled = state.manager.preview(state.require_current()?).await?;
            if !assembled.note_text.is_empty() {
                println!("{}", "notes:".bright_blue());
                println!("{}", assembled.note_text.dimmed());
            }
            println!(
                "{} turns{}",
                assembled.request.contents.len(),
                if assembled.compacted { " (summary applied)" } else { "" }
            );
        }
        ReplCommand::Notes => println!("{}", state.manager.export_notes().await?),
        ReplCommand::Rules => println!("{}", state.manager.export_rules().await?),
        ReplCommand::Help => {
            println!("{}", help_text().bright_blue());
        }
        ReplCommand::Say(text) => {
            let id = state.current_or_new().await?;
            let outcome = state.manager.send_message(id, text).await?;
            if let Some(thoughts) = &outcome.message.thoughts {
                println!("{}", thoughts.dimmed());
            }
            println!("{}", "model:".bright_magenta());
            println!("{}", outcome.message.content);
        }
        ReplCommand::Exit => {
            println!("{}", "bye".bright_green());
            return Ok(true);
        }
        ReplCommand::Empty => {}
        ReplCommand::Unknown(message) => {
            println!("{} {message}", "warning:".yellow());
            println!("{}", "Type `/help` for available commands.".yellow());
        }
    }

    Ok(false)
}

fn history_file() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".quill-history");
    }
    PathBuf::from(".quill-history")
}

fn complete_candidates(prefix: &str) -> BTreeSet<&'static str> {
    REPL_COMMANDS
        .iter()
        .copied()
        .filter(|command| command.starts_with(prefix))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{complete_candidates, help_text, parse_command, ReplCommand};

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(
            parse_command("  hello world "),
            ReplCommand::Say("hello world".to_string())
        );
    }

    #[test]
    fn parse_use_requires_session_id() {
        assert_eq!(
            parse_command("/use"),
            ReplCommand::Unknown("usage: /use <session_id>".to_string())
        );
        assert_eq!(
            parse_command("/use 0190-abc"),
            ReplCommand::Use("0190-abc".to_string())
        );
    }

    #[test]
    fn parse_new_takes_optional_title() {
        assert_eq!(parse_command("/new"), ReplCommand::New(String::new()));
        assert_eq!(
            parse_command("/new The lighthouse"),
            ReplCommand::New("The lighthouse".to_string())
        );
        assert_eq!(
            parse_command("/frobnicate"),
            ReplCommand::Unknown("unknown command: /frobnicate".to_string())
        );
    }

    #[test]
    fn complete_candidates_matches_prefix() {
        let candidates = complete_candidates("/s");
        assert!(candidates.contains("/sessions"));
        assert!(candidates.contains("/show"));
        assert!(!candidates.contains("/compact"));
    }

    #[test]
    fn help_text_lists_commands() {
        let help = help_text();
        for command in REPL_COMMANDS_FOR_HELP {
            assert!(help.contains(command), "help text missing `{command}`");
        }
    }

    const REPL_COMMANDS_FOR_HELP: &[&str] = &[
        "/new [title]",
        "/use <session_id>",
        "/sessions",
        "/show",
        "/compact",
        "/preview",
        "/notes",
        "/rules",
    ];
}
