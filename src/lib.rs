// Library root
// -----------
// The binary (`main.rs`) wires these modules into a one-shot command or an
// interactive session.
//
// Module responsibilities:
// - `api`: HTTP client for the catalog API; applies the cache and the rate
//   limiter, retries transient failures, validates response shapes.
// - `cache`: durable response cache keyed by request fingerprint.
// - `limiter`: sliding-window rate limiter for the remote quota.
// - `query`: catalog query/result types and per-entity response parsing.
// - `dispatch`: command table and argument validation.
// - `session`: the interactive REPL and its state machine.
// - `ui`: rendering of results, errors and CSV export.
pub mod api;
pub mod cache;
pub mod dispatch;
pub mod error;
pub mod fingerprint;
pub mod limiter;
pub mod query;
pub mod session;
pub mod ui;
