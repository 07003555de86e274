//! The per-thread submission pipeline and event stream consumer.
//!
//! One call to [`submit`] drives a full turn: resolve the session, supersede
//! any running submission, subscribe to the agent's event stream, submit the
//! prompt, and stream parts back into the thread until the turn settles.

use crate::agent::types::{
    AgentEvent, MessageInfo, Part, PartDetail, PromptPart, ToolState,
};
use crate::agent::AgentClient;
use crate::bridge::cancel::{AbortHandle, AbortReason};
use crate::bridge::permission::{render_permission_request, PendingPermission};
use crate::state::SharedState;
use crate::{markdown, tables, DISCORD_MESSAGE_LIMIT, THREAD_TITLE_LIMIT};
use futures::StreamExt as _;
use serenity::http::Http;
use serenity::model::id::{ChannelId, MessageId};
use serenity::model::channel::ReactionType;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Grace period before a superseding submission takes over.
const DEBOUNCE_DELAY: Duration = Duration::from_millis(200);

/// Typing indicator heartbeat (Discord expires one after ~10 s).
const TYPING_INTERVAL: Duration = Duration::from_secs(8);

/// Delay before typing resumes after a step flush, so a finished session
/// doesn't flash the indicator.
const TYPING_RESTART_DELAY: Duration = Duration::from_millis(300);

/// How long to keep draining events after the prompt call returns.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// One prompt submission into a thread.
pub struct SubmitRequest {
    pub thread_id: ChannelId,
    pub prompt: String,
    /// Image/PDF attachments forwarded as typed file parts.
    pub file_parts: Vec<PromptPart>,
    pub directory: PathBuf,
    /// Message to decorate with ✅/❌ reactions.
    pub triggering: Option<(ChannelId, MessageId)>,
}

/// Run the full submission pipeline for one user turn.
pub async fn submit(state: SharedState, http: Arc<Http>, request: SubmitRequest) {
    if let Err(error) = submit_inner(state, http.clone(), &request).await {
        tracing::error!(%error, thread_id = %request.thread_id, "submission failed");
        let text = format!("✗ Unexpected bot Error: [{}]\n{error}", error_name(&error));
        let _ = post_chunks(&http, request.thread_id, &text).await;
        if let Some((channel, message)) = request.triggering {
            react(&http, channel, message, "❌").await;
        }
    }
}

fn error_name(error: &crate::Error) -> &'static str {
    match error {
        crate::Error::Agent(_) => "AgentError",
        crate::Error::Discord(_) => "DiscordError",
        crate::Error::Sqlx(_) | crate::Error::Db(_) => "DatabaseError",
        _ => "Error",
    }
}

async fn submit_inner(
    state: SharedState,
    http: Arc<Http>,
    request: &SubmitRequest,
) -> crate::Result<()> {
    let started = Instant::now();
    let client = state.agents.client_for(&request.directory).await?;
    let thread_key = request.thread_id.to_string();

    // Resolve or create the session, persisting the binding before any post.
    let session = resolve_session(&state, &client, &thread_key, &request.prompt).await?;
    let session_id = session.id.clone();

    // Supersede any running submission for this session.
    let (handle, had_previous) = state.aborts.supersede(&session_id);
    if had_previous {
        tokio::time::sleep(DEBOUNCE_DELAY).await;
        if handle.is_aborted() {
            // We lost the debounce race to an even newer submission.
            return Ok(());
        }
    }

    // Subscribe before submitting; abort during subscribe exits silently.
    let events = tokio::select! {
        _ = handle.cancelled() => {
            state.aborts.remove(&session_id, &handle);
            return Ok(());
        }
        events = client.events() => events?,
    };

    let typing = Typing::new(http.clone(), request.thread_id);
    let mut stream = StreamConsumer {
        state: state.clone(),
        http: http.clone(),
        client: client.clone(),
        handle: handle.clone(),
        typing,
        thread_id: request.thread_id,
        thread_key: thread_key.clone(),
        session_id: session_id.clone(),
        directory: request.directory.clone(),
        triggering: request.triggering,
        current_message: None,
        parts: Vec::new(),
        emitted: HashSet::new(),
        context: ContextTracker::default(),
    };

    let submit_fut = submit_turn(&client, &session_id, request);
    tokio::pin!(submit_fut);
    tokio::pin!(events);

    let mut submit_done = false;
    let mut events_done = false;
    let mut idle_seen = false;

    loop {
        tokio::select! {
            biased;
            _ = handle.cancelled() => break,
            result = &mut submit_fut, if !submit_done => {
                submit_done = true;
                match result {
                    Ok(()) if idle_seen || events_done => handle.abort(AbortReason::Finished),
                    Ok(()) => {}
                    Err(error) => {
                        if !handle.is_aborted() {
                            stream.fail(&format!("✗ Unexpected bot Error: [AgentError]\n{error}")).await;
                        }
                    }
                }
            }
            maybe_event = events.next(), if !events_done => {
                match maybe_event {
                    Some(event) => {
                        if stream.handle_event(event).await {
                            idle_seen = true;
                            if submit_done {
                                handle.abort(AbortReason::Finished);
                            }
                        }
                    }
                    None => {
                        tracing::debug!(session_id = %session_id, "event stream ended");
                        events_done = true;
                        if submit_done {
                            handle.abort(AbortReason::Finished);
                        }
                    }
                }
            }
            _ = tokio::time::sleep(DRAIN_TIMEOUT), if submit_done => {
                handle.abort(AbortReason::Finished);
            }
        }
    }

    stream.typing.stop();

    match handle.reason() {
        Some(AbortReason::Finished) | None => {
            stream.flush_unemitted().await;
            if let Some((channel, message)) = request.triggering {
                react(&http, channel, message, "✅").await;
            }
            let footer = stream.footer(started.elapsed());
            let _ = post_chunks(&http, request.thread_id, &footer).await;
        }
        // Superseded: the newer submission owns the thread now.
        Some(AbortReason::NewRequest) => {}
        // Error already surfaced, abort confirmation posted by the command.
        Some(AbortReason::Error) | Some(AbortReason::UserAbort) => {}
    }

    state.aborts.remove(&session_id, &handle);
    Ok(())
}

/// Look up the thread's session, healing a binding the agent no longer
/// recognizes, or create a fresh session titled from the prompt.
async fn resolve_session(
    state: &SharedState,
    client: &AgentClient,
    thread_key: &str,
    prompt: &str,
) -> crate::Result<crate::agent::types::Session> {
    if let Some(bound) = state.db.thread_session(thread_key).await? {
        match client.get_session(&bound).await {
            Ok(session) => return Ok(session),
            Err(crate::error::AgentError::SessionNotFound(_)) => {
                tracing::info!(thread = thread_key, session_id = %bound, "dropping stale session binding");
                state.db.unbind_thread(thread_key).await?;
            }
            Err(error) => return Err(error.into()),
        }
    }

    let title = crate::truncate_chars(prompt, THREAD_TITLE_LIMIT);
    let session = client.create_session(Some(title)).await?;
    state.db.bind_thread(thread_key, &session.id).await?;
    Ok(session)
}

/// Send the turn to the agent: a slash command if the prompt parses as one,
/// a regular prompt otherwise.
async fn submit_turn(
    client: &AgentClient,
    session_id: &str,
    request: &SubmitRequest,
) -> Result<(), crate::error::AgentError> {
    if let Some((command, arguments)) = parse_slash_command(&request.prompt) {
        return client.command(session_id, command, arguments).await;
    }

    let mut parts = vec![PromptPart::Text {
        text: request.prompt.clone(),
    }];
    parts.extend(request.file_parts.iter().cloned());
    client
        .prompt(session_id, parts, Some(system_prompt(session_id)))
        .await
}

/// `/name rest` → `(name, rest)`. Anything else is a plain prompt.
pub fn parse_slash_command(prompt: &str) -> Option<(&str, &str)> {
    let trimmed = prompt.trim_start();
    let rest = trimmed.strip_prefix('/')?;
    let (name, arguments) = match rest.split_once(char::is_whitespace) {
        Some((name, arguments)) => (name, arguments.trim()),
        None => (rest, ""),
    };
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':')
    {
        return None;
    }
    Some((name, arguments))
}

fn system_prompt(session_id: &str) -> String {
    format!(
        "You are replying through a Discord bridge (agent session {session_id}). \
         Discord renders a limited markdown dialect: bold, italics, inline code, \
         fenced code blocks, lists, links, and headings up to level 3. \
         Never use heading levels deeper than ### and never emit GFM tables; \
         use short aligned plain-text lists instead."
    )
}

/// Per-turn event consumer state.
struct StreamConsumer {
    state: SharedState,
    http: Arc<Http>,
    client: AgentClient,
    handle: AbortHandle,
    typing: Typing,
    thread_id: ChannelId,
    thread_key: String,
    session_id: String,
    directory: PathBuf,
    triggering: Option<(ChannelId, MessageId)>,
    current_message: Option<String>,
    parts: Vec<Part>,
    emitted: HashSet<String>,
    context: ContextTracker,
}

#[derive(Default)]
struct ContextTracker {
    catalog_fetched: bool,
    limit: Option<u64>,
    announced_decile: u64,
    percent: Option<u64>,
    provider_id: Option<String>,
    model_id: Option<String>,
}

impl StreamConsumer {
    /// Process one event. Returns true when the session went idle.
    async fn handle_event(&mut self, event: AgentEvent) -> bool {
        match event {
            AgentEvent::MessageUpdated { info } => {
                if info.session_id == self.session_id && info.role == "assistant" {
                    self.track_assistant_message(info).await;
                }
            }
            AgentEvent::PartUpdated { part } => {
                if part.session_id == self.session_id {
                    self.track_part(part).await;
                }
            }
            AgentEvent::SessionError { session_id, error } => {
                if session_id.as_deref() == Some(self.session_id.as_str()) {
                    let message = error.map(|e| e.data.message).unwrap_or_default();
                    self.fail(&format!("✗ opencode session error: {message}")).await;
                }
            }
            AgentEvent::PermissionUpdated(info) => {
                if info.session_id == self.session_id {
                    self.surface_permission(info).await;
                }
            }
            AgentEvent::PermissionReplied { session_id } => {
                if session_id == self.session_id {
                    self.state.permissions.clear_for_session(&session_id);
                }
            }
            AgentEvent::SessionIdle { session_id } => {
                return session_id == self.session_id;
            }
            AgentEvent::Other => {}
        }
        false
    }

    async fn track_assistant_message(&mut self, info: MessageInfo) {
        self.current_message = Some(info.id.clone());
        if let Some(provider) = &info.provider_id {
            self.context.provider_id = Some(provider.clone());
        }
        if let Some(model) = &info.model_id {
            self.context.model_id = Some(model.clone());
        }

        let Some(tokens) = info.tokens else { return };
        let used = tokens.total();
        if used == 0 {
            return;
        }

        if !self.context.catalog_fetched {
            self.context.catalog_fetched = true;
            let known = self.context.provider_id.clone().zip(self.context.model_id.clone());
            if let Some((provider, model)) = known {
                match self.client.providers().await {
                    Ok(catalog) => {
                        self.context.limit = catalog.context_limit(&provider, &model);
                    }
                    Err(error) => {
                        tracing::debug!(%error, "provider catalog fetch failed");
                    }
                }
            }
        }

        let Some(limit) = self.context.limit else { return };
        self.context.percent = Some(used * 100 / limit);
        let decile = used * 10 / limit;
        if decile > self.context.announced_decile {
            self.context.announced_decile = decile;
            let note = format!("◼︎ context usage {}%", decile * 10);
            let _ = post_chunks(&self.http, self.thread_id, &note).await;
        }
    }

    async fn track_part(&mut self, part: Part) {
        if matches!(part.detail, PartDetail::StepStart) {
            self.typing.start();
        }

        // Parts from older assistant messages (or user echoes) are ignored.
        if self.current_message.as_deref() != Some(part.message_id.as_str()) {
            return;
        }

        let step_finish = matches!(part.detail, PartDetail::StepFinish);
        let emit_now = match &part.detail {
            PartDetail::Tool { state, .. } => matches!(state, ToolState::Running { .. }),
            PartDetail::Reasoning { text } => !text.trim().is_empty(),
            _ => false,
        };

        match self.parts.iter_mut().find(|p| p.id == part.id) {
            Some(existing) => *existing = part.clone(),
            None => self.parts.push(part.clone()),
        }

        if emit_now {
            self.emit_single(&part).await;
        }

        if step_finish {
            self.flush_unemitted().await;
            self.typing.stop();
            // Keep the indicator off briefly; a session that just finished
            // must not flash typing.
            if !self.handle.is_aborted() {
                self.typing.start_delayed(TYPING_RESTART_DELAY);
            }
        }
    }

    async fn surface_permission(&mut self, info: crate::agent::types::PermissionInfo) {
        let text = render_permission_request(&info);
        let posted = post_chunks(&self.http, self.thread_id, &text).await;
        let message_id = posted
            .ok()
            .and_then(|ids| ids.first().copied())
            .map(|id| id.to_string())
            .unwrap_or_default();

        self.state.permissions.set(
            &self.thread_key,
            PendingPermission {
                permission_id: info.id.clone(),
                session_id: info.session_id.clone(),
                kind: info.kind.clone(),
                title: info.title.clone(),
                pattern: info.pattern_text(),
                message_id,
                directory: self.directory.clone(),
            },
        );
    }

    /// Emit one part immediately (running tools, reasoning).
    async fn emit_single(&mut self, part: &Part) {
        if self.emitted.contains(&part.id) || self.state.part_already_sent(&part.id).await {
            self.emitted.insert(part.id.clone());
            return;
        }
        let rendered = crate::format::render_part(part);
        if rendered.is_empty() {
            return;
        }
        if let Ok(ids) = post_chunks(&self.http, self.thread_id, &rendered).await {
            if let Some(first) = ids.first() {
                let _ = self
                    .state
                    .record_sent_part(&part.id, &first.to_string(), &self.thread_key)
                    .await;
            }
            self.emitted.insert(part.id.clone());
        }
    }

    /// Flush everything collected so far that has not been posted yet.
    async fn flush_unemitted(&mut self) {
        let mut batch: Vec<(String, String)> = Vec::new();
        for part in &self.parts {
            if self.emitted.contains(&part.id) {
                continue;
            }
            if self.state.part_already_sent(&part.id).await {
                self.emitted.insert(part.id.clone());
                continue;
            }
            let rendered = crate::format::render_part(part);
            if rendered.is_empty() {
                continue;
            }
            batch.push((part.id.clone(), rendered));
        }
        if batch.is_empty() {
            return;
        }

        let combined: String = batch
            .iter()
            .map(|(_, rendered)| format!("{rendered}\n\n"))
            .collect();

        if let Ok(ids) = post_chunks(&self.http, self.thread_id, &combined).await {
            let first = ids.first().map(MessageId::to_string).unwrap_or_default();
            for (part_id, _) in &batch {
                let _ = self
                    .state
                    .record_sent_part(part_id, &first, &self.thread_key)
                    .await;
                self.emitted.insert(part_id.clone());
            }
        }
    }

    /// Post a terminal error, react ❌, and stop the bridge for this turn.
    async fn fail(&mut self, text: &str) {
        let _ = post_chunks(&self.http, self.thread_id, text).await;
        if let Some((channel, message)) = self.triggering {
            react(&self.http, channel, message, "❌").await;
        }
        self.handle.abort(AbortReason::Error);
    }

    fn footer(&self, elapsed: Duration) -> String {
        let mut footer = format!("_Completed in {}_", format_duration(elapsed));
        if let Some(percent) = self.context.percent {
            footer.push_str(&format!(" ⋅ {percent}%"));
        }
        footer.push_str(&format!(" ⋅ {}", self.session_id));
        let model = match (&self.context.provider_id, &self.context.model_id) {
            (Some(provider), Some(model)) => format!("{provider}/{model}"),
            (None, Some(model)) => model.clone(),
            _ => "unknown model".to_owned(),
        };
        footer.push_str(&format!(" ⋅ {model}"));
        footer
    }
}

fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else {
        format!("{}m{}s", secs / 60, secs % 60)
    }
}

/// Replay a resumed session into a thread: skip all but the last 30
/// assistant parts, post them as one combined message, and record every
/// replayed part against that message so it is never re-emitted.
pub const RESUME_PART_LIMIT: usize = 30;

pub async fn resume_session(
    state: &SharedState,
    http: &Arc<Http>,
    thread_id: ChannelId,
    client: &AgentClient,
    session_id: &str,
) -> crate::Result<()> {
    let thread_key = thread_id.to_string();
    state.db.bind_thread(&thread_key, session_id).await?;

    let messages = client.messages(session_id).await?;
    let assistant_parts: Vec<&Part> = messages
        .iter()
        .filter(|message| message.info.role == "assistant")
        .flat_map(|message| message.parts.iter())
        .collect();

    let total = assistant_parts.len();
    let skipped = total.saturating_sub(RESUME_PART_LIMIT);
    if skipped > 0 {
        let notice = format!("Skipped {skipped} older assistant parts, resuming from the tail.");
        let _ = post_chunks(http, thread_id, &notice).await;
    }

    let tail = &assistant_parts[skipped..];
    let combined: String = tail
        .iter()
        .map(|part| crate::format::render_part(part))
        .filter(|rendered| !rendered.is_empty())
        .map(|rendered| format!("{rendered}\n\n"))
        .collect();

    if combined.is_empty() {
        return Ok(());
    }

    let ids = post_chunks(http, thread_id, &combined).await?;
    let first = ids.first().map(MessageId::to_string).unwrap_or_default();
    for part in tail {
        state.record_sent_part(&part.id, &first, &thread_key).await?;
    }
    Ok(())
}

/// Render → table-normalize → escape → chunk → post.
pub async fn post_chunks(
    http: &Arc<Http>,
    channel_id: ChannelId,
    content: &str,
) -> crate::Result<Vec<MessageId>> {
    let normalized = tables::normalize_tables(content);
    let escaped = markdown::escape_backticks_in_code_blocks(&normalized);
    let chunks = markdown::split_markdown(&escaped, DISCORD_MESSAGE_LIMIT);

    let mut ids = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        if chunk.trim().is_empty() {
            continue;
        }
        let message = channel_id.say(http, chunk).await?;
        ids.push(message.id);
    }
    Ok(ids)
}

/// Best-effort unicode reaction.
pub async fn react(http: &Arc<Http>, channel_id: ChannelId, message_id: MessageId, emoji: &str) {
    let reaction = ReactionType::Unicode(emoji.to_owned());
    if let Err(error) = http.create_reaction(channel_id, message_id, &reaction).await {
        tracing::debug!(%error, %channel_id, "failed to add reaction");
    }
}

/// Cooperative typing indicator with an 8 s heartbeat.
struct Typing {
    http: Arc<Http>,
    channel_id: ChannelId,
    task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Typing {
    fn new(http: Arc<Http>, channel_id: ChannelId) -> Self {
        Self {
            http,
            channel_id,
            task: std::sync::Mutex::new(None),
        }
    }

    fn start(&self) {
        self.spawn(Duration::ZERO);
    }

    fn start_delayed(&self, delay: Duration) {
        self.spawn(delay);
    }

    fn spawn(&self, delay: Duration) {
        let http = self.http.clone();
        let channel_id = self.channel_id;
        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            loop {
                if let Err(error) = http.broadcast_typing(channel_id).await {
                    tracing::debug!(%error, %channel_id, "typing heartbeat failed");
                }
                tokio::time::sleep(TYPING_INTERVAL).await;
            }
        });
        let mut slot = self.task.lock().expect("typing task lock poisoned");
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    fn stop(&self) {
        let mut slot = self.task.lock().expect("typing task lock poisoned");
        if let Some(task) = slot.take() {
            task.abort();
        }
    }
}

impl Drop for Typing {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_commands_parse() {
        assert_eq!(parse_slash_command("/init"), Some(("init", "")));
        assert_eq!(
            parse_slash_command("/review the last commit"),
            Some(("review", "the last commit"))
        );
        assert_eq!(parse_slash_command("plain text"), None);
        assert_eq!(parse_slash_command("/"), None);
        assert_eq!(parse_slash_command("/not a command!"), Some(("not", "a command!")));
        assert_eq!(parse_slash_command("/bad!name args"), None);
    }

    #[test]
    fn durations_format_compactly() {
        assert_eq!(format_duration(Duration::from_secs(7)), "7s");
        assert_eq!(format_duration(Duration::from_secs(59)), "59s");
        assert_eq!(format_duration(Duration::from_secs(61)), "1m1s");
        assert_eq!(format_duration(Duration::from_secs(150)), "2m30s");
    }

    #[test]
    fn system_prompt_names_the_session_and_bans_tables() {
        let prompt = system_prompt("ses_42");
        assert!(prompt.contains("ses_42"));
        assert!(prompt.contains("never emit GFM tables"));
        assert!(prompt.contains("###"));
    }
}
