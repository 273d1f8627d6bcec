// Interactive session: one REPL turn at a time against live state.
//
// The loop is modeled as an explicit phase machine rather than nested
// branching so error recovery and interrupts have one well-defined landing
// spot: every failure path ends back at AwaitingInput, and only `quit` or
// end-of-input reach Terminated.

use std::collections::VecDeque;

use anyhow::Result;
use dialoguer::{History, Input};
use tracing::debug;

use crate::api::{ApiClient, CancelFlag};
use crate::dispatch::{Dispatcher, Outcome};
use crate::error::CatalogError;
use crate::limiter::AcquireMode;
use crate::query::{CatalogQuery, CatalogResult};
use crate::ui;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    AwaitingInput,
    Dispatching,
    Rendering,
    Terminated,
}

/// Per-session context. Owned by the session alone; mutated only between
/// turns. `current_query` moves forward only on successful dispatch, so a
/// failed command leaves the previous context available for `next` and
/// `export`.
pub struct SessionState {
    pub current_query: Option<CatalogQuery>,
    pub last_results: Option<CatalogResult>,
    /// Append-only log of submitted lines.
    pub history: Vec<String>,
    /// Every result page fetched this session, in order; feeds `dump`.
    pub collected: Vec<CatalogResult>,
}

impl SessionState {
    pub fn new() -> Self {
        SessionState {
            current_query: None,
            last_results: None,
            history: Vec::new(),
            collected: Vec::new(),
        }
    }

    pub fn record_line(&mut self, line: &str) {
        self.history.push(line.to_string());
    }

    pub fn record_success(&mut self, query: CatalogQuery, results: CatalogResult) {
        self.current_query = Some(query);
        self.collected.push(results.clone());
        self.last_results = Some(results);
    }
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::new()
    }
}

/// Prompt history adapter for dialoguer (most recent first).
#[derive(Default)]
struct PromptHistory {
    entries: VecDeque<String>,
}

impl<T: ToString> History<T> for PromptHistory {
    fn read(&self, pos: usize) -> Option<String> {
        self.entries.get(pos).cloned()
    }

    fn write(&mut self, val: &T) {
        self.entries.push_front(val.to_string());
    }
}

pub struct Session<'a> {
    client: &'a ApiClient,
    cancel: CancelFlag,
    state: SessionState,
    phase: SessionPhase,
}

impl<'a> Session<'a> {
    pub fn new(client: &'a ApiClient, cancel: CancelFlag) -> Self {
        Session { client, cancel, state: SessionState::new(), phase: SessionPhase::Idle }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Run the REPL until quit or end-of-input.
    pub fn run(&mut self) -> Result<()> {
        self.greet();
        let mut prompt_history = PromptHistory::default();

        while self.phase != SessionPhase::Terminated {
            self.phase = SessionPhase::AwaitingInput;
            // A SIGINT delivered while sitting at the prompt is stale by
            // the time a command runs; clear it.
            self.cancel.take();

            let line: String = match Input::new()
                .with_prompt("cratedig")
                .allow_empty(true)
                .history_with(&mut prompt_history)
                .interact_text()
            {
                Ok(line) => line,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    println!("Use `quit` to leave.");
                    continue;
                }
                // End of input: terminal closed or stdin exhausted.
                Err(_) => {
                    self.phase = SessionPhase::Terminated;
                    break;
                }
            };

            self.handle_line(&line);
        }

        // Drop would flush too, but surface the error while we still can.
        self.client.cache().flush()?;
        println!("Goodbye!");
        Ok(())
    }

    fn greet(&mut self) {
        ui::banner();
        if self.client.has_token() {
            match self.client.identity(AcquireMode::Block) {
                Ok(username) => println!("Authenticated as {username}."),
                Err(e) => ui::render_error(&e),
            }
        } else {
            println!("No DISCOGS_TOKEN set; requests may be rejected.");
        }
        self.phase = SessionPhase::AwaitingInput;
    }

    /// One full turn: Dispatching then Rendering. An empty line is a no-op
    /// that lands straight back at AwaitingInput.
    pub fn handle_line(&mut self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            self.phase = SessionPhase::AwaitingInput;
            return;
        }

        self.state.record_line(trimmed);
        self.phase = SessionPhase::Dispatching;

        let mut parts = trimmed.split_whitespace();
        let name = parts.next().unwrap_or_default().to_string();
        let args: Vec<String> = parts.map(str::to_string).collect();

        let dispatcher = Dispatcher::new(self.client, AcquireMode::Block);
        let spinner = ui::spinner("fetching…");
        let turn = dispatcher.dispatch(&name, &args, &mut self.state);
        spinner.finish_and_clear();

        self.phase = SessionPhase::Rendering;
        match turn {
            Ok(Outcome::Quit) => {
                self.phase = SessionPhase::Terminated;
                return;
            }
            Ok(outcome) => ui::render_outcome(&outcome),
            Err(CatalogError::Interrupted) => {
                debug!("turn interrupted");
                println!("Interrupted.");
            }
            Err(e) => ui::render_error(&e),
        }

        // Persist what this turn cached before the next prompt.
        if let Err(e) = self.client.cache().flush() {
            tracing::warn!(error = %e, "cache flush failed");
        }
        self.phase = SessionPhase::AwaitingInput;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{ok, status, FakeTransport};
    use crate::api::{ApiClient, CancelFlag, ClientConfig};
    use crate::cache::ResponseCache;
    use crate::limiter::RateLimiter;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_client(
        transport: Arc<FakeTransport>,
        dir: &std::path::Path,
        cancel: CancelFlag,
    ) -> ApiClient {
        let config = ClientConfig {
            base_url: "https://api.test".into(),
            token: None,
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            timeout: Duration::from_secs(1),
        };
        let cache = ResponseCache::open(dir.join("cache.json")).unwrap();
        let limiter = RateLimiter::new(100, Duration::from_secs(60), Duration::from_secs(1));
        ApiClient::new(config, Box::new(transport), cache, limiter, cancel)
    }

    fn artist_page() -> String {
        serde_json::json!({
            "pagination": { "page": 1, "pages": 1, "items": 1 },
            "results": [ { "id": 7, "title": "Miles Davis" } ]
        })
        .to_string()
    }

    #[test]
    fn successful_turn_returns_to_awaiting_input() {
        let dir = tempdir().unwrap();
        let cancel = CancelFlag::new();
        let transport = FakeTransport::new(vec![ok(&artist_page())]);
        let client = test_client(transport, dir.path(), cancel.clone());
        let mut session = Session::new(&client, cancel);

        session.handle_line("search-artist miles davis");
        assert_eq!(session.phase(), SessionPhase::AwaitingInput);
        assert!(session.state().current_query.is_some());
        assert_eq!(session.state().history, vec!["search-artist miles davis"]);
    }

    #[test]
    fn empty_line_is_a_noop() {
        let dir = tempdir().unwrap();
        let cancel = CancelFlag::new();
        let transport = FakeTransport::new(vec![]);
        let client = test_client(transport.clone(), dir.path(), cancel.clone());
        let mut session = Session::new(&client, cancel);

        session.handle_line("   ");
        assert_eq!(session.phase(), SessionPhase::AwaitingInput);
        assert!(session.state().history.is_empty());
        assert_eq!(transport.calls(), 0);
    }

    #[test]
    fn errors_do_not_terminate_the_session() {
        let dir = tempdir().unwrap();
        let cancel = CancelFlag::new();
        let transport = FakeTransport::new(vec![status(500), status(500), status(401)]);
        let client = test_client(transport, dir.path(), cancel.clone());
        let mut session = Session::new(&client, cancel);

        // Transient after retries, then unauthorized, then a local error.
        session.handle_line("search-artist miles");
        assert_eq!(session.phase(), SessionPhase::AwaitingInput);
        session.handle_line("search-label blue note");
        assert_eq!(session.phase(), SessionPhase::AwaitingInput);
        session.handle_line("no-such-command");
        assert_eq!(session.phase(), SessionPhase::AwaitingInput);
        // All three turns landed in the append-only history.
        assert_eq!(session.state().history.len(), 3);
    }

    #[test]
    fn malformed_response_returns_to_awaiting_input_without_cache_write() {
        let dir = tempdir().unwrap();
        let cancel = CancelFlag::new();
        let body = serde_json::json!({ "results": [] }).to_string();
        let transport = FakeTransport::new(vec![ok(&body)]);
        let client = test_client(transport, dir.path(), cancel.clone());
        let mut session = Session::new(&client, cancel);

        session.handle_line("search-artist miles");
        assert_eq!(session.phase(), SessionPhase::AwaitingInput);
        assert_eq!(client.cache().len(), 0);
        assert!(session.state().current_query.is_none());
    }

    #[test]
    fn quit_terminates() {
        let dir = tempdir().unwrap();
        let cancel = CancelFlag::new();
        let transport = FakeTransport::new(vec![]);
        let client = test_client(transport, dir.path(), cancel.clone());
        let mut session = Session::new(&client, cancel);

        session.handle_line("quit");
        assert_eq!(session.phase(), SessionPhase::Terminated);
    }

    #[test]
    fn interrupt_lands_back_at_awaiting_input_with_context_intact() {
        let dir = tempdir().unwrap();
        let cancel = CancelFlag::new();
        let transport = FakeTransport::new(vec![ok(&artist_page())]);
        let client = test_client(transport, dir.path(), cancel.clone());
        let mut session = Session::new(&client, cancel.clone());

        session.handle_line("search-artist miles");
        let before = session.state().current_query.clone();

        // SIGINT arrives before the next turn's fetch.
        cancel.set();
        session.handle_line("search-artist coltrane");
        assert_eq!(session.phase(), SessionPhase::AwaitingInput);
        assert_eq!(session.state().current_query, before);
    }
}
