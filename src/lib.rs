//! # Endpoint Workbench
//!
//! Editor-side engine that presents one remote API endpoint definition as
//! several independently editable documents ("facets"): its
//! configuration, query template, cache configuration, cache template,
//! parameters, and test results.
//!
//! The engine keeps these documents synchronised with a backend
//! configuration service, lays them out together when a resource is
//! opened, and runs expand/test/validate round trips against the backend.
//!
//! ## Architecture
//!
//! ```text
//!  UI host ──envelopes──▶ ┌────────────────────┐
//!          ◀─replies────  │ CorrelationChannel │
//!                         └─────────┬──────────┘
//!                                   ▼
//!                         ┌────────────────────┐     ┌──────────────┐
//!                         │  WorkbenchMessages │────▶│  Workbench   │
//!                         └─────────┬──────────┘     └──────┬───────┘
//!                                   ▼                       ▼
//!                    ┌──────────────────────────┐   ┌───────────────┐
//!                    │ ContentProviderRegistry  │   │ ConfigBackend │
//!                    └──────────────────────────┘   └───────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`identity`] | Resource path ↔ slug |
//! | [`facets`] | Facets, panel slots, virtual and file addresses |
//! | [`storage`] | Per-facet storage resolution and parameter sidecars |
//! | [`content`] | Virtual document providers |
//! | [`channel`] | Request/response correlation over message streams |
//! | [`orchestrator`] | Open, save, expand, test, validate |
//! | [`parameters`] | Effective parameter resolution |
//! | [`history`] | Persisted test state and execution history |
//! | [`backend`] | Backend configuration service client |
//! | [`executor`] | Live REST test execution |
//! | [`diagnostics`] | Validation issues as positioned diagnostics |
//! | [`host`] | Host capability traits |
//! | [`messages`] | UI message dispatch |
//! | [`stdio`] | NDJSON stdio bridge |
//! | [`store`] | Key-value persistence |
//! | [`config`] | TOML configuration |

pub mod backend;
pub mod channel;
pub mod config;
pub mod content;
pub mod diagnostics;
pub mod error;
pub mod executor;
pub mod facets;
pub mod history;
pub mod host;
pub mod identity;
pub mod messages;
pub mod models;
pub mod orchestrator;
pub mod parameters;
pub mod stdio;
pub mod storage;
pub mod store;
