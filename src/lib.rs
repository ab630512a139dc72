//! # Vault Context
//!
//! Bounded, traversal-safe context assembly over a local markdown vault,
//! with model answers streamed back token by token.
//!
//! A caller asks a question about a folder of notes. The pipeline picks the
//! relevant material (explicitly selected documents, semantic search
//! excerpts, or lexically ranked documents), packs it under a byte cap, and
//! forwards it with the question to a chat-completion service.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────┐   ┌──────────────┐
//! │ PathGuard  │──▶│   Scanner   │──▶│   Selector   │
//! │ (sandbox)  │   │ (metadata)  │   │  (lexical)   │
//! └────────────┘   └─────────────┘   └──────┬───────┘
//!                                           │
//!                  ┌─────────────┐   ┌──────▼───────┐   ┌────────────┐
//!                  │  Semantic   │──▶│  Retrieval   │──▶│ Completion │
//!                  │ embed+match │   │  (assembly)  │   │ (streamed) │
//!                  └─────────────┘   └──────────────┘   └─────┬──────┘
//!                                                             │
//!                                        ┌──────────┐   ┌─────▼────┐
//!                                        │   CLI    │   │   HTTP   │
//!                                        │  (vctx)  │   │  (axum)  │
//!                                        └──────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! vctx scan --root ~/notes
//! vctx select "what bugs were reported" --root ~/notes
//! vctx ask "what bugs were reported" --root ~/notes
//! vctx serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy and message scrubbing |
//! | [`models`] | Core data types and document ids |
//! | [`path_guard`] | Sandbox checks for roots and document paths |
//! | [`markdown`] | Front-matter parsing and previews |
//! | [`scanner`] | Concurrent vault enumeration and document reads |
//! | [`selector`] | Keyword scoring, filtering, and stats |
//! | [`semantic`] | Embedding and vector search providers |
//! | [`retrieval`] | Context routing and capped assembly |
//! | [`prompt`] | Prompt and context rendering |
//! | [`completion`] | Streaming chat completion with retries |
//! | [`dedup`] | In-flight request deduplication |
//! | [`server`] | HTTP API |
//! | [`cli`] | `vctx` command implementations |

pub mod cli;
pub mod completion;
pub mod config;
pub mod dedup;
pub mod error;
pub mod markdown;
pub mod models;
pub mod path_guard;
pub mod prompt;
pub mod retrieval;
pub mod scanner;
pub mod selector;
pub mod semantic;
pub mod server;
