use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use quill_context::{CompactionReport, ContextError, Session, SessionManager};
use quill_core::SessionId;
use quill_runtime::{AIProvider, GenerateRequest, GenerateResponse, ProviderError, ProviderStream};
use quill_store::JsonFileStore;
use thiserror::Error;

pub const DEFAULT_DATA_DIR: &str = ".quill";

#[derive(Debug, Clone, Parser)]
#[command(
    name = "quill",
    version,
    about = "Quill chat client",
    long_about = "Quill chat client: sessions with summary compaction, context notes and response replacement rules"
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "QUILL_DATA_DIR",
        default_value = DEFAULT_DATA_DIR,
        help = "Directory holding sessions and settings"
    )]
    pub data_dir: PathBuf,
    #[arg(long, global = true, env = "QUILL_MODEL", help = "Model name override")]
    pub model: Option<String>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    #[command(about = "Create a session")]
    NewSession {
        #[arg(help = "Optional session title")]
        title: Option<String>,
    },
    #[command(about = "List sessions, most recent first")]
    Sessions,
    #[command(about = "Print a session's history and compaction state")]
    Show {
        #[arg(help = "Session ID")]
        session: String,
    },
    #[command(about = "Send a message and print the reply")]
    Send {
        #[arg(help = "Session ID")]
        session: String,
        #[arg(help = "Message body")]
        text: String,
    },
    #[command(about = "Summarize the middle of a session")]
    Compact {
        #[arg(help = "Session ID")]
        session: String,
    },
    #[command(about = "Show the request the next turn would send")]
    Preview {
        #[arg(help = "Session ID")]
        session: String,
    },
    #[command(about = "Delete a session")]
    DeleteSession {
        #[arg(help = "Session ID")]
        session: String,
    },
    #[command(about = "Manage context notes")]
    Notes {
        #[command(subcommand)]
        command: CollectionCommand,
    },
    #[command(about = "Manage response replacement rules")]
    Rules {
        #[command(subcommand)]
        command: CollectionCommand,
    },
    #[command(about = "Run the replacement rules over some text")]
    ApplyRules {
        #[arg(help = "Input text")]
        text: String,
    },
}

#[derive(Debug, Clone, Subcommand)]
pub enum CollectionCommand {
    #[command(about = "Replace the whole list from a multi-document YAML file")]
    Import {
        #[arg(help = "YAML file; an empty file clears the list")]
        file: PathBuf,
    },
    #[command(about = "Print the list as multi-document YAML")]
    Export,
    #[command(about = "Print a short listing")]
    List,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("io error: {0}")]
    Io(String),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Stand-in used when no API key is configured; every call reports why.
#[derive(Debug, Clone)]
pub struct OfflineProvider {
    reason: ProviderError,
}

impl OfflineProvider {
    pub fn new(reason: ProviderError) -> Self {
        Self { reason }
    }
}

#[async_trait]
impl AIProvider for OfflineProvider {
    fn name(&self) -> &'static str {
        "offline"
    }

    async fn generate(&self, _req: GenerateRequest) -> Result<GenerateResponse, ProviderError> {
        Err(self.reason.clone())
    }

    async fn generate_stream(&self, _req: GenerateRequest) -> Result<ProviderStream, ProviderError> {
        Err(self.reason.clone())
    }

    async fn count_tokens(&self, _req: GenerateRequest) -> Result<u32, ProviderError> {
        Err(self.reason.clone())
    }
}

/// Open the file store under `data_dir` and restore everything in it.
pub async fn open_manager(
    data_dir: &Path,
    model: Option<String>,
    provider: Arc<dyn AIProvider>,
) -> Result<SessionManager, CliError> {
    let store = Arc::new(JsonFileStore::new(data_dir));
    let manager = SessionManager::new(store, provider);
    manager.load().await?;

    if let Some(model) = model.filter(|model| !model.trim().is_empty()) {
        let mut settings = manager.settings().await;
        if settings.model_name != model {
            settings.model_name = model;
            manager.update_settings(settings).await?;
        }
    }
    Ok(manager)
}

pub fn parse_session_id(raw: &str) -> Result<SessionId, CliError> {
    raw.parse::<SessionId>()
        .map_err(|err| CliError::InvalidArgument(err.to_string()))
}

pub async fn run(cli: Cli, manager: &SessionManager) -> Result<String, CliError> {
    match cli.command {
        Commands::NewSession { title } => {
            let id = manager.create_session(title.unwrap_or_default()).await?;
            Ok(format!("session created: {id}"))
        }
        Commands::Sessions => Ok(format_sessions(&manager.list_sessions().await)),
        Commands::Show { session } => {
            let session = manager.get_session(parse_session_id(&session)?).await?;
            Ok(format_session(&session))
        }
        Commands::Send { session, text } => {
            let id = parse_session_id(&session)?;
            if text.trim().is_empty() {
                return Err(CliError::InvalidArgument("message is empty".to_string()));
            }
            let outcome = manager.send_message(id, text).await?;
            Ok(outcome.message.content)
        }
        Commands::Compact { session } => {
            let report = manager.compact(parse_session_id(&session)?).await?;
            Ok(format_report(&report))
        }
        Commands::Preview { session } => {
            let assembled = manager.preview(parse_session_id(&session)?).await?;
            let mut output = String::new();
            for turn in &assembled.request.contents {
                output.push_str(&format!("[{}] {}\n", turn.role, turn.text));
            }
            output.push_str(&format!(
                "{} turns, {} eligible messages{}",
                assembled.request.contents.len(),
                assembled.eligible_count,
                if assembled.compacted { ", summary applied" } else { "" }
            ));
            Ok(output)
        }
        Commands::DeleteSession { session } => {
            let id = parse_session_id(&session)?;
            manager.delete_session(id).await?;
            Ok(format!("session deleted: {id}"))
        }
        Commands::Notes { command } => match command {
            CollectionCommand::Import { file } => {
                let count = manager.import_notes(&read_file(&file)?).await?;
                Ok(format!("{count} notes imported"))
            }
            CollectionCommand::Export => Ok(manager.export_notes().await?),
            CollectionCommand::List => {
                let notes = manager.notes().await;
                if notes.is_empty() {
                    return Ok("no notes".to_string());
                }
                Ok(notes
                    .notes()
                    .iter()
                    .enumerate()
                    .map(|(i, note)| {
                        format!(
                            "{}. [{}] {} ({})",
                            i + 1,
                            note.kind,
                            note.title,
                            note.effective_keywords().join(", ")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
        },
        Commands::Rules { command } => match command {
            CollectionCommand::Import { file } => {
                let count = manager.import_rules(&read_file(&file)?).await?;
                Ok(format!("{count} rules imported"))
            }
            CollectionCommand::Export => Ok(manager.export_rules().await?),
            CollectionCommand::List => {
                let rules = manager.rules().await;
                if rules.is_empty() {
                    return Ok("no rules".to_string());
                }
                Ok(rules
                    .rules()
                    .iter()
                    .enumerate()
                    .map(|(i, rule)| format!("{}. /{}/ -> {}", i + 1, rule.pattern, rule.replacement))
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
        },
        Commands::ApplyRules { text } => Ok(manager.apply_rules(&text).await),
    }
}

fn read_file(path: &Path) -> Result<String, CliError> {
    std::fs::read_to_string(path).map_err(|err| CliError::Io(format!("{}: {err}", path.display())))
}

pub fn format_sessions(sessions: &[Session]) -> String {
    if sessions.is_empty() {
        return "no sessions".to_string();
    }
    sessions
        .iter()
        .map(|session| {
            format!(
                "{}  {}  ({} messages{})",
                session.id,
                session.display_title(),
                session.messages.len(),
                if session.compaction.is_some() { ", compacted" } else { "" }
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_session(session: &Session) -> String {
    let mut output = format!("{} ({})\n", session.display_title(), session.id);
    for (index, message) in session.messages.iter().enumerate() {
        output.push_str(&format!("{index:>4} [{}] {}\n", message.role, message.content));
    }

    let current = session.current_total_tokens();
    match &session.compaction {
        Some(state) => {
            output.push_str(&format!(
                "summary of {}-{}: {}\n",
                state.start_index, state.end_index, state.summary_text
            ));
            output.push_str(&format!(
                "tokens: {current} (about {} without compaction)",
                state.original_token_estimate(current)
            ));
        }
        None => output.push_str(&format!("tokens: {current}")),
    }
    output
}

pub fn format_report(report: &CompactionReport) -> String {
    format!(
        "compacted {} of {} messages ({}-{}): {} -> {} tokens, {} saved",
        report.compacted_count,
        report.total_messages,
        report.state.start_index,
        report.state.end_index,
        report.state.original_token_count,
        report.state.compressed_token_count,
        report.state.tokens_saved()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_runtime::{MockProvider, UsageMetadata};

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("quill").chain(args.iter().copied()))
    }

    async fn manager(dir: &Path, provider: Arc<MockProvider>) -> SessionManager {
        open_manager(dir, None, provider).await.unwrap()
    }

    fn new_id(output: &str) -> String {
        output.trim_start_matches("session created: ").to_string()
    }

    #[test]
    fn cli_parses_send_command() {
        let cli = cli(&["--data-dir", "/tmp/q", "send", "abc", "hello there"]);
        assert_eq!(cli.data_dir, PathBuf::from("/tmp/q"));
        match cli.command {
            Commands::Send { session, text } => {
                assert_eq!(session, "abc");
                assert_eq!(text, "hello there");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_parses_nested_collection_commands() {
        match cli(&["rules", "import", "rules.yaml"]).command {
            Commands::Rules {
                command: CollectionCommand::Import { file },
            } => assert_eq!(file, PathBuf::from("rules.yaml")),
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(matches!(
            cli(&["notes", "list"]).command,
            Commands::Notes {
                command: CollectionCommand::List
            }
        ));
    }

    #[test]
    fn invalid_session_id_is_an_argument_error() {
        assert!(matches!(
            parse_session_id("not-a-uuid"),
            Err(CliError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn send_and_show_round_trip_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockProvider::new());
        provider.enqueue_generate(Ok(GenerateResponse {
            content: "Hi!".to_string(),
            usage: Some(UsageMetadata {
                total_token_count: 42,
                thoughts_token_count: None,
                prompt_token_count: 30,
                candidates_token_count: 12,
            }),
            ..Default::default()
        }));

        let manager = manager(dir.path(), provider.clone()).await;
        let id = new_id(&run(cli(&["new-session", "greeting"]), &manager).await.unwrap());
        let reply = run(cli(&["send", &id, "hello"]), &manager).await.unwrap();
        assert_eq!(reply, "Hi!");

        let reopened = open_manager(dir.path(), None, provider).await.unwrap();
        let shown = run(cli(&["show", &id]), &reopened).await.unwrap();
        assert!(shown.starts_with("greeting"));
        assert!(shown.contains("[user] hello"));
        assert!(shown.contains("[model] Hi!"));
        assert!(shown.ends_with("tokens: 42"));
    }

    #[tokio::test]
    async fn compact_on_short_session_reports_nothing_to_compact() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Arc::new(MockProvider::new())).await;
        let id = new_id(&run(cli(&["new-session"]), &manager).await.unwrap());

        let err = run(cli(&["compact", &id]), &manager).await.unwrap_err();
        assert!(matches!(
            err,
            CliError::Context(ContextError::EmptySelection { total: 0 })
        ));
    }

    #[tokio::test]
    async fn compact_reports_tokens_saved() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockProvider::new());
        provider.enqueue_count_tokens(Ok(25));
        provider.enqueue_generate(Ok(GenerateResponse {
            content: "The story so far.".to_string(),
            usage: Some(UsageMetadata {
                total_token_count: 340,
                thoughts_token_count: None,
                prompt_token_count: 300,
                candidates_token_count: 40,
            }),
            ..Default::default()
        }));
        let manager = manager(dir.path(), provider).await;

        let mut session = Session::new("long");
        for i in 0..30 {
            session.push(quill_core::Message::user(format!("line {i}")));
        }
        let id = manager.insert_session(session).await.unwrap();

        let output = run(cli(&["compact", &id.to_string()]), &manager)
            .await
            .unwrap();
        assert_eq!(
            output,
            "compacted 5 of 30 messages (5-9): 275 -> 40 tokens, 235 saved"
        );
    }

    #[tokio::test]
    async fn rules_import_then_apply() {
        let dir = tempfile::tempdir().unwrap();
        let rules = dir.path().join("rules.yaml");
        std::fs::write(&rules, "pattern: a+\nreplacement: a\n---\npattern: b\nreplacement: c\n")
            .unwrap();
        let manager = manager(dir.path(), Arc::new(MockProvider::new())).await;

        let imported = run(cli(&["rules", "import", rules.to_str().unwrap()]), &manager)
            .await
            .unwrap();
        assert_eq!(imported, "2 rules imported");
        assert_eq!(run(cli(&["apply-rules", "aaab"]), &manager).await.unwrap(), "ac");
        assert_eq!(
            run(cli(&["rules", "list"]), &manager).await.unwrap(),
            "1. /a+/ -> a\n2. /b/ -> c"
        );
    }

    #[tokio::test]
    async fn notes_import_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let notes = dir.path().join("notes.yaml");
        std::fs::write(
            &notes,
            "type: keyword\ntitle: Aria\ncontent: A bard\nkeywords: [bard]\n---\ntype: moment\ntitle: Rain\ncontent: wet\nkeywords: []\n",
        )
        .unwrap();
        let manager = manager(dir.path(), Arc::new(MockProvider::new())).await;

        run(cli(&["notes", "import", notes.to_str().unwrap()]), &manager)
            .await
            .unwrap();
        assert_eq!(
            run(cli(&["notes", "list"]), &manager).await.unwrap(),
            "1. [keyword] Aria (bard)\n2. [moment] Rain (Rain)"
        );
    }

    #[tokio::test]
    async fn offline_provider_reports_configuration_error() {
        let provider = OfflineProvider::new(ProviderError::MissingConfig("GEMINI_API_KEY".into()));
        let err = provider
            .generate(GenerateRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::MissingConfig("GEMINI_API_KEY".into()));
    }

    #[tokio::test]
    async fn model_override_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockProvider::new());
        open_manager(dir.path(), Some("gemini-2.5-pro".to_string()), provider.clone())
            .await
            .unwrap();

        let reopened = manager(dir.path(), provider).await;
        assert_eq!(reopened.settings().await.model_name, "gemini-2.5-pro");
    }
}
