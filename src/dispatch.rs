// Command dispatch: a fixed table mapping command names onto catalog
// queries. Argument validation happens entirely before any network call, so
// a typo never costs rate-limit quota. Both the one-shot CLI and the REPL
// funnel through `dispatch`.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::debug;

use crate::api::ApiClient;
use crate::error::CatalogError;
use crate::limiter::AcquireMode;
use crate::query::{CatalogQuery, CatalogResult, EntityType};
use crate::session::SessionState;
use crate::ui;

/// What a successful dispatch hands to the renderer.
#[derive(Debug)]
pub enum Outcome {
    Results(CatalogResult),
    Message(String),
    Help,
    Quit,
}

#[derive(Debug, Clone, Copy)]
enum CommandKind {
    Search(EntityType),
    ListReleases,
    Next,
    Export,
    Dump,
    Help,
    Quit,
}

pub struct CommandSpec {
    pub name: &'static str,
    pub usage: &'static str,
    kind: CommandKind,
}

/// The full command table, in help-screen order. Quit aliases are handled
/// in `lookup` rather than listed.
pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "search-artist",
        usage: "search-artist <terms> [key=value ...]   search artists",
        kind: CommandKind::Search(EntityType::Artist),
    },
    CommandSpec {
        name: "search-release",
        usage: "search-release <terms> [key=value ...]  search releases",
        kind: CommandKind::Search(EntityType::Release),
    },
    CommandSpec {
        name: "search-label",
        usage: "search-label <terms> [key=value ...]    search labels",
        kind: CommandKind::Search(EntityType::Label),
    },
    CommandSpec {
        name: "search-marketplace",
        usage: "search-marketplace <terms> [key=value ...]  search listings for sale",
        kind: CommandKind::Search(EntityType::Marketplace),
    },
    CommandSpec {
        name: "list-releases",
        usage: "list-releases <artist-id>               browse an artist's releases",
        kind: CommandKind::ListReleases,
    },
    CommandSpec {
        name: "next",
        usage: "next                                    fetch the next result page",
        kind: CommandKind::Next,
    },
    CommandSpec {
        name: "export",
        usage: "export <file.csv>                       write last results to CSV",
        kind: CommandKind::Export,
    },
    CommandSpec {
        name: "dump",
        usage: "dump <file.csv>                         write every page fetched this session to CSV",
        kind: CommandKind::Dump,
    },
    CommandSpec {
        name: "help",
        usage: "help                                    show this list",
        kind: CommandKind::Help,
    },
    CommandSpec {
        name: "quit",
        usage: "quit | exit | q                         leave the session",
        kind: CommandKind::Quit,
    },
];

/// Command names for prompt completion and help.
pub fn command_names() -> Vec<&'static str> {
    COMMANDS.iter().map(|c| c.name).collect()
}

fn lookup(name: &str) -> Option<CommandKind> {
    // Accept kebab-case and snake_case spellings alike.
    let normalized = name.to_ascii_lowercase().replace('_', "-");
    match normalized.as_str() {
        "exit" | "q" | "bye" => return Some(CommandKind::Quit),
        "h" => return Some(CommandKind::Help),
        _ => {}
    }
    COMMANDS
        .iter()
        .find(|c| c.name == normalized)
        .map(|c| c.kind)
}

/// Split search arguments into free-text terms and `key=value` filters.
/// Filter keys must be unique; a duplicate is a validation error, not a
/// silent overwrite.
fn parse_search_args(args: &[String]) -> Result<(String, BTreeMap<String, String>), CatalogError> {
    let mut terms: Vec<&str> = Vec::new();
    let mut filters = BTreeMap::new();
    for arg in args {
        match arg.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                if filters.insert(key.to_string(), value.to_string()).is_some() {
                    return Err(CatalogError::InvalidArgs(format!("duplicate filter `{key}`")));
                }
            }
            Some(_) => {
                return Err(CatalogError::InvalidArgs(format!("bad filter `{arg}`")));
            }
            None => terms.push(arg),
        }
    }
    let terms = terms.join(" ");
    if terms.trim().is_empty() {
        return Err(CatalogError::InvalidArgs("search terms are required".into()));
    }
    Ok((terms, filters))
}

pub struct Dispatcher<'a> {
    client: &'a ApiClient,
    mode: AcquireMode,
}

impl<'a> Dispatcher<'a> {
    pub fn new(client: &'a ApiClient, mode: AcquireMode) -> Self {
        Dispatcher { client, mode }
    }

    /// Map one command onto an API call (or a local action) against the
    /// live session state. `state.current_query` only moves forward on
    /// success, so a failed command leaves the previous context intact.
    pub fn dispatch(
        &self,
        name: &str,
        args: &[String],
        state: &mut SessionState,
    ) -> Result<Outcome, CatalogError> {
        let kind = lookup(name)
            .ok_or_else(|| CatalogError::UnknownCommand(name.to_string()))?;
        debug!(command = name, args = ?args, "dispatching");

        match kind {
            CommandKind::Search(entity) => {
                let (terms, filters) = parse_search_args(args)?;
                let mut query = CatalogQuery::new(entity, terms);
                query.filters = filters;
                let result = self.client.execute(&query, self.mode)?;
                state.record_success(query, result.clone());
                Ok(Outcome::Results(result))
            }
            CommandKind::ListReleases => {
                let [raw_id] = args else {
                    return Err(CatalogError::InvalidArgs("usage: list-releases <artist-id>".into()));
                };
                let artist_id: u64 = raw_id.parse().map_err(|_| {
                    CatalogError::InvalidArgs(format!("`{raw_id}` is not an artist id"))
                })?;
                let query = CatalogQuery::artist_releases(artist_id);
                let result = self.client.execute(&query, self.mode)?;
                state.record_success(query, result.clone());
                Ok(Outcome::Results(result))
            }
            CommandKind::Next => {
                if !args.is_empty() {
                    return Err(CatalogError::InvalidArgs("`next` takes no arguments".into()));
                }
                let query = state
                    .current_query
                    .clone()
                    .ok_or_else(|| CatalogError::InvalidArgs("no search to page through".into()))?;
                let cursor = state
                    .last_results
                    .as_ref()
                    .and_then(|r| r.next_cursor.clone())
                    .ok_or_else(|| CatalogError::InvalidArgs("no further pages".into()))?;
                let query = query.with_cursor(cursor);
                let result = self.client.execute(&query, self.mode)?;
                state.record_success(query, result.clone());
                Ok(Outcome::Results(result))
            }
            CommandKind::Export => {
                let [file] = args else {
                    return Err(CatalogError::InvalidArgs("usage: export <file.csv>".into()));
                };
                let results = state.last_results.as_ref().ok_or_else(|| {
                    CatalogError::InvalidArgs("nothing to export; search first".into())
                })?;
                let rows = ui::write_csv(Path::new(file), results).map_err(|e| {
                    CatalogError::InvalidArgs(format!("cannot write {file}: {e}"))
                })?;
                Ok(Outcome::Message(format!("wrote {rows} rows to {file}")))
            }
            CommandKind::Dump => {
                let [file] = args else {
                    return Err(CatalogError::InvalidArgs("usage: dump <file.csv>".into()));
                };
                if state.collected.is_empty() {
                    return Err(CatalogError::InvalidArgs(
                        "nothing to dump; run some searches first".into(),
                    ));
                }
                let rows = ui::write_csv_all(Path::new(file), &state.collected).map_err(|e| {
                    CatalogError::InvalidArgs(format!("cannot write {file}: {e}"))
                })?;
                Ok(Outcome::Message(format!(
                    "wrote {rows} rows ({} pages) to {file}",
                    state.collected.len()
                )))
            }
            CommandKind::Help => Ok(Outcome::Help),
            CommandKind::Quit => Ok(Outcome::Quit),
        }
    }
}
