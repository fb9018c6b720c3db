//! # rag-chat core
//!
//! Runtime-free logic for rag-chat: data models, the error taxonomy,
//! collaborator traits, chunking, ranking, the grounding policy, and
//! prompt assembly.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. Everything
//! that suspends on the network lives behind the traits in [`store`],
//! [`embedding`] and [`services`], implemented by the `rag-chat` app
//! crate (or by the in-memory backends in [`store::memory`] for tests and
//! local runs).

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod grounding;
pub mod ids;
pub mod models;
pub mod prompt;
pub mod ranking;
pub mod services;
pub mod store;
