//! Session manager: the per-turn pipeline plus persistence of its inputs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use quill_core::{CompactionState, Message, Note, ReplacementRule, SessionId};
use quill_runtime::{collect_stream, AIProvider};
use quill_store::{load, save, stores, KeyValueStore};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::assembler::{AssembledRequest, ContextAssembler};
use crate::compaction::{CompactionEngine, CompactionPlan, Summary};
use crate::error::{ContextError, ContextResult};
use crate::filter::{EligibilityFilter, NonEmptyFilter};
use crate::interchange;
use crate::notes::NoteBook;
use crate::replacer::ResponseReplacer;
use crate::session::Session;
use crate::settings::Settings;

/// Keys under the `settings` store.
pub mod keys {
    pub const APP: &str = "app";
    pub const NOTES: &str = "contextNotes";
    pub const RULES: &str = "responseReplacements";
}

/// Result of one chat turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// Model message as stored, after replacement rules
    pub message: Message,
    pub note_text: String,
    pub compacted: bool,
}

/// Result of a successful compaction.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionReport {
    pub state: CompactionState,
    pub compacted_count: usize,
    pub total_messages: usize,
}

/// Owns sessions, notes, rules and settings and runs turns against a provider.
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<SessionId, Session>>>,
    notes: RwLock<NoteBook>,
    replacer: RwLock<ResponseReplacer>,
    settings: RwLock<Settings>,
    store: Arc<dyn KeyValueStore>,
    provider: Arc<dyn AIProvider>,
    filter: Arc<dyn EligibilityFilter>,
    rng: Mutex<StdRng>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn KeyValueStore>, provider: Arc<dyn AIProvider>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            notes: RwLock::new(NoteBook::default()),
            replacer: RwLock::new(ResponseReplacer::default()),
            settings: RwLock::new(Settings::default()),
            store,
            provider,
            filter: Arc::new(NonEmptyFilter),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn EligibilityFilter>) -> Self {
        self.filter = filter;
        self
    }

    /// Deterministic note sampling.
    pub fn with_rng_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    /// Restore settings, notes, rules and every stored session.
    pub async fn load(&self) -> ContextResult<()> {
        let store = self.store.as_ref();

        let settings = load::<Settings>(store, stores::SETTINGS, keys::APP)
            .await?
            .unwrap_or_default()
            .normalized();
        let notes = load::<Vec<Note>>(store, stores::SETTINGS, keys::NOTES)
            .await?
            .unwrap_or_default();
        let rules = load::<Vec<ReplacementRule>>(store, stores::SETTINGS, keys::RULES)
            .await?
            .unwrap_or_default();

        *self.notes.write().await = NoteBook::new(notes, settings.note_settings());
        *self.replacer.write().await = ResponseReplacer::new(rules);
        *self.settings.write().await = settings;

        let mut restored = HashMap::new();
        for key in store.keys(stores::SESSIONS).await? {
            match load::<Session>(store, stores::SESSIONS, &key).await {
                Ok(Some(session)) => {
                    restored.insert(session.id, session);
                }
                Ok(None) => {}
                Err(err) => warn!(key = %key, error = %err, "Skipping unreadable session"),
            }
        }
        info!(sessions = restored.len(), "Loaded state");
        *self.sessions.write().await = restored;
        Ok(())
    }

    pub async fn create_session(&self, title: impl Into<String>) -> ContextResult<SessionId> {
        let session = Session::new(title);
        let id = session.id;
        self.persist_session(&session).await?;
        self.sessions.write().await.insert(id, session);
        debug!(session = %id, "Created session");
        Ok(id)
    }

    /// Track a session built elsewhere and persist it.
    pub async fn insert_session(&self, session: Session) -> ContextResult<SessionId> {
        let id = session.id;
        self.persist_session(&session).await?;
        self.sessions.write().await.insert(id, session);
        Ok(id)
    }

    pub async fn get_session(&self, id: SessionId) -> ContextResult<Session> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(ContextError::NotFound(id))
    }

    /// Sessions, most recently updated first.
    pub async fn list_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }

    /// Re-read one session from the store, replacing the in-memory copy.
    pub async fn load_session(&self, id: SessionId) -> ContextResult<Session> {
        let session: Session = load(self.store.as_ref(), stores::SESSIONS, &id.to_string())
            .await?
            .ok_or(ContextError::NotFound(id))?;
        self.sessions.write().await.insert(id, session.clone());
        Ok(session)
    }

    pub async fn delete_session(&self, id: SessionId) -> ContextResult<()> {
        self.sessions
            .write()
            .await
            .remove(&id)
            .ok_or(ContextError::NotFound(id))?;
        quill_store::delete(self.store.as_ref(), stores::SESSIONS, &id.to_string()).await?;
        Ok(())
    }

    /// Build the request the next turn would send, without sending it.
    pub async fn preview(&self, id: SessionId) -> ContextResult<AssembledRequest> {
        let session = self.get_session(id).await?;
        let assembler = self.assembler().await;
        let notes = self.notes.read().await.clone();
        Ok(self.assemble(&assembler, &session, &notes))
    }

    /// Run one chat turn: send the user message, post-process and store the reply.
    ///
    /// The user message and the reply are appended together once the model
    /// answers; a failed turn leaves the session unchanged.
    pub async fn send_message(
        &self,
        id: SessionId,
        text: impl Into<String>,
    ) -> ContextResult<TurnOutcome> {
        let user_message = Message::user(text);
        let mut session = self.get_session(id).await?;
        session.push(user_message.clone());

        let assembler = self.assembler().await;
        let notes = self.notes.read().await.clone();
        let assembled = self.assemble(&assembler, &session, &notes);

        let response = if assembler.settings().streaming_output {
            collect_stream(self.provider.generate_stream(assembled.request).await?).await?
        } else {
            self.provider.generate(assembled.request).await?
        };

        let content = assembler.finish(&*self.replacer.read().await, &response.content);
        let mut message = Message::model(content);
        if let Some(usage) = response.usage {
            message = message.with_usage(usage);
        }
        if let Some(thoughts) = response.thoughts {
            message = message.with_thoughts(thoughts);
        }

        let snapshot = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(&id).ok_or(ContextError::NotFound(id))?;
            session.push(user_message);
            session.push(message.clone());
            session.clone()
        };
        self.persist_session(&snapshot).await?;

        debug!(
            session = %id,
            reply_chars = message.content.len(),
            tokens = snapshot.current_total_tokens(),
            "Turn complete"
        );
        Ok(TurnOutcome {
            message,
            note_text: assembled.note_text,
            compacted: assembled.compacted,
        })
    }

    /// Summarize the middle of a session's history.
    ///
    /// A second call while one is pending fails with
    /// [`ContextError::CompactionInFlight`]. On any failure before commit the
    /// previous compaction stays in place.
    pub async fn compact(&self, id: SessionId) -> ContextResult<CompactionReport> {
        let settings = self.settings().await;
        let engine = CompactionEngine::from_settings(&settings);

        let (plan, total_before) = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(&id).ok_or(ContextError::NotFound(id))?;
            session.begin_compaction()?;

            let plan = engine.plan(&self.filter.eligible(&session.messages));
            if plan.is_empty() {
                session.end_compaction();
                info!(session = %id, total = plan.total_messages, "Nothing to compact");
                return Err(ContextError::EmptySelection {
                    total: plan.total_messages,
                });
            }
            (plan, session.current_total_tokens())
        };

        let summary = match self
            .summarize(&engine, &plan, total_before, settings.compression_prompt_token_count)
            .await
        {
            Ok(summary) => summary,
            Err(err) => {
                if let Some(session) = self.sessions.write().await.get_mut(&id) {
                    session.end_compaction();
                }
                warn!(session = %id, error = %err, "Compaction failed");
                return Err(err);
            }
        };

        let (state, snapshot) = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(&id).ok_or(ContextError::NotFound(id))?;
            session.end_compaction();
            let state = engine.commit(session, &plan, &summary)?;
            (state, session.clone())
        };
        self.persist_session(&snapshot).await?;

        Ok(CompactionReport {
            state,
            compacted_count: plan.compacted_count(),
            total_messages: plan.total_messages,
        })
    }

    async fn summarize(
        &self,
        engine: &CompactionEngine,
        plan: &CompactionPlan,
        total_before: u64,
        cached_instruction_tokens: Option<u32>,
    ) -> ContextResult<Summary> {
        let instruction_tokens = match cached_instruction_tokens {
            Some(count) => count,
            None => {
                let count = engine.instruction_tokens(self.provider.as_ref()).await;
                self.cache_instruction_tokens(engine.instruction_prompt(), count)
                    .await;
                count
            }
        };

        engine
            .summarize(self.provider.as_ref(), plan, instruction_tokens, total_before)
            .await
    }

    async fn cache_instruction_tokens(&self, prompt: &str, count: u32) {
        let snapshot = {
            let mut settings = self.settings.write().await;
            if settings.compression_prompt != prompt {
                return;
            }
            settings.compression_prompt_token_count = Some(count);
            settings.clone()
        };
        if let Err(err) = save(self.store.as_ref(), stores::SETTINGS, keys::APP, &snapshot).await {
            warn!(error = %err, "Could not cache instruction token count");
        }
    }

    pub async fn settings(&self) -> Settings {
        self.settings.read().await.clone()
    }

    /// Replace and persist the settings.
    pub async fn update_settings(&self, settings: Settings) -> ContextResult<()> {
        let mut settings = settings.normalized();
        {
            let current = self.settings.read().await;
            if settings.compression_prompt != current.compression_prompt {
                settings.compression_prompt_token_count = None;
            }
        }
        save(self.store.as_ref(), stores::SETTINGS, keys::APP, &settings).await?;
        self.notes
            .write()
            .await
            .update_settings(settings.note_settings());
        *self.settings.write().await = settings;
        Ok(())
    }

    pub async fn notes(&self) -> NoteBook {
        self.notes.read().await.clone()
    }

    /// Edit the note list; the whole list is persisted when `edit` succeeds.
    pub async fn edit_notes<T>(
        &self,
        edit: impl FnOnce(&mut NoteBook) -> ContextResult<T>,
    ) -> ContextResult<T> {
        let mut notes = self.notes.write().await;
        let mut draft = notes.clone();
        let value = edit(&mut draft)?;
        save(self.store.as_ref(), stores::SETTINGS, keys::NOTES, draft.notes()).await?;
        *notes = draft;
        Ok(value)
    }

    pub async fn rules(&self) -> ResponseReplacer {
        self.replacer.read().await.clone()
    }

    /// Edit the rule list; the whole list is persisted when `edit` succeeds.
    pub async fn edit_rules<T>(
        &self,
        edit: impl FnOnce(&mut ResponseReplacer) -> ContextResult<T>,
    ) -> ContextResult<T> {
        let mut replacer = self.replacer.write().await;
        let mut draft = replacer.clone();
        let value = edit(&mut draft)?;
        save(self.store.as_ref(), stores::SETTINGS, keys::RULES, draft.rules()).await?;
        *replacer = draft;
        Ok(value)
    }

    /// Replace every note from YAML. Blank input clears the list.
    pub async fn import_notes(&self, yaml: &str) -> ContextResult<usize> {
        if yaml.trim().is_empty() {
            return self
                .edit_notes(|notes| {
                    notes.clear();
                    Ok(0)
                })
                .await;
        }
        let imported = interchange::notes_from_yaml(yaml)?;
        self.edit_notes(|notes| {
            notes.replace_all(imported)?;
            Ok(notes.len())
        })
        .await
    }

    pub async fn export_notes(&self) -> ContextResult<String> {
        interchange::notes_to_yaml(self.notes.read().await.notes())
    }

    /// Replace every rule from YAML. Blank input clears the list.
    pub async fn import_rules(&self, yaml: &str) -> ContextResult<usize> {
        let imported = if yaml.trim().is_empty() {
            Vec::new()
        } else {
            interchange::rules_from_yaml(yaml)?
        };
        self.edit_rules(|replacer| {
            replacer.replace_all(imported);
            Ok(replacer.len())
        })
        .await
    }

    pub async fn export_rules(&self) -> ContextResult<String> {
        interchange::rules_to_yaml(self.replacer.read().await.rules())
    }

    /// Run the replacement rules over arbitrary text.
    pub async fn apply_rules(&self, text: &str) -> String {
        self.replacer.read().await.apply(text)
    }

    async fn assembler(&self) -> ContextAssembler {
        ContextAssembler::new(self.settings().await, Arc::clone(&self.filter))
    }

    fn assemble(
        &self,
        assembler: &ContextAssembler,
        session: &Session,
        notes: &NoteBook,
    ) -> AssembledRequest {
        match self.rng.lock() {
            Ok(mut rng) => assembler.assemble(session, notes, &mut *rng),
            Err(poisoned) => assembler.assemble(session, notes, &mut *poisoned.into_inner()),
        }
    }

    async fn persist_session(&self, session: &Session) -> ContextResult<()> {
        save(
            self.store.as_ref(),
            stores::SESSIONS,
            &session.id.to_string(),
            session,
        )
        .await
        .map_err(|err| {
            error!(session = %session.id, error = %err, "Failed to persist session");
            ContextError::Persistence(err)
        })
    }
}
