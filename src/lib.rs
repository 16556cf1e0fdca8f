//! # docchunk
//!
//! Document ingestion pipeline: fetch a document by URL, convert it to
//! markdown with an external converter, split the markdown into bounded
//! chunks annotated with the pages they span, and optionally derive
//! summaries, questions and embeddings from each chunk.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────────────────────────────────┐   ┌──────────┐
//! │ CLI/HTTP │──▶│ Pipeline                                │──▶│  SQLite  │
//! │  tasks   │   │ Convert ▶ Chunk ▶ Derivatives ▶ Embed   │   │  store   │
//! └──────────┘   └─────────────────────────────────────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docchunk init
//! docchunk task create https://example.com/paper.pdf --wait
//! docchunk process-pending
//! docchunk serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`chunk`] | Splitters, page annotation, chunk records |
//! | [`pipeline`] | Stage chain and task state handling |
//! | [`task`] | Task lifecycle transitions |
//! | [`tasks`] | Caller operations |
//! | [`store`] | Persistence trait, SQLite and in-memory stores |
//! | [`fetch`] | Document download |
//! | [`convert`] | External markdown converter and page counting |
//! | [`completion`] | LLM completion providers |
//! | [`embedding`] | Embedding providers |
//! | [`stats`] | Processing history and statistics |
//! | [`server`] | HTTP API |
//! | [`config`] | TOML configuration |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation and prompt seeding |

pub mod chunk;
pub mod completion;
pub mod config;
pub mod convert;
pub mod db;
pub mod embedding;
pub mod error;
pub mod fetch;
mod http;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod server;
pub mod stats;
pub mod store;
pub mod task;
pub mod task_cmd;
pub mod tasks;
