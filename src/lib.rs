//! # TableTalk
//!
//! A hybrid query core for exploratory data analysis over CSV files. A
//! dataset is ingested into three parallel chunk streams (analytical
//! summaries, row windows, per-column profiles) embedded in a vector store;
//! questions are classified, answered from summaries when they suffice, and
//! routed back to the raw table (whole or fragmented) when they do not.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐   ┌───────────────┐   ┌────────────┐
//! │  CSV    │──▶│ Chunk + Embed │──▶│   SQLite    │
//! │  file   │   │ (3 streams)   │   │ vectors+mem │
//! └─────────┘   └───────────────┘   └─────┬──────┘
//!                                         │
//!               ┌─────────────────────────┤
//!               ▼                         ▼
//!        ┌─────────────┐          ┌──────────────┐
//!        │  Analyzer   │          │   Planner    │
//!        │ simple/     │─────────▶│ rag_only /   │
//!        │ complex     │          │ csv_fallback/│
//!        └─────────────┘          │ fragmented   │
//!                                 └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! tabletalk init                          # create database
//! tabletalk ingest data/transactions.csv  # chunk + embed a dataset
//! tabletalk ask "Qual a média de Amount?" --source transactions_ab12cd34
//! tabletalk stats                         # chunk counts per dataset
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`table`] | CSV parsing and column statistics |
//! | [`chunker`] | The three chunk streams |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`vector_store`] | Vector persistence and similarity search |
//! | [`memory`] | Sessions, interactions, query cache |
//! | [`analyzer`] | Question classification |
//! | [`fragmenter`] | Token-budgeted query splitting |
//! | [`processor`] | The hybrid planner |
//! | [`session`] | Outward-facing facade |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod analyzer;
pub mod chunker;
pub mod config;
pub mod csv_store;
pub mod db;
pub mod embedding;
pub mod error;
pub mod fragmenter;
pub mod ingest;
pub mod llm;
pub mod memory;
pub mod migrate;
pub mod models;
pub mod processor;
pub mod session;
pub mod table;
pub mod vector_store;
