//! # weave-core
//!
//! A compiler for markdown documents that carry typed data blocks, and the incremental
//! core of a language service on top of it.
//!
//! ## Overview
//!
//! weave-core reads a project of markdown documents whose fenced blocks declare data
//! models, entities, directory configuration and project rules, and compiles them into
//! a validated, cross-referenced knowledge graph. Entities refer to each other with
//! `[[...]]` references that resolve by content hash, by exact handle or logical id
//! through lexical scopes, or by fuzzy match collapsed to the newest version of an
//! entity.
//!
//! ### Key Features
//!
//! - **Staged pipeline**: Scan → Link → Validate, with optional project rules (Spec)
//! - **Lexical scopes**: global → directory → file, with shadowing and scope boundaries
//! - **Stable identity**: every entity has a content hash that ignores comments,
//!   whitespace and key order
//! - **Evolution chains**: `former` / `derived_from` links merge fields along a chain;
//!   forks and cycles are reported and cut deterministically
//! - **Error tolerance**: problems in user documents are collected as diagnostics and
//!   never abort a compile
//! - **Incremental updates**: a single-file edit re-scans one file and re-validates
//!   the project, with the same result as a fresh compile
//! - **Language service** (`service` feature): shared workspace, debounced validation
//!   and filesystem watching
//!
//! ## Architecture
//!
//! - **[`codec`]**: the pipeline (`ProjectCompiler`, `Linker`, `GraphBuilder`), the
//!   collaborator traits (`DocParser`, `SchemaEngine`, `SandboxedExecutor`,
//!   `SpecRunner`) and their built-in implementations, diagnostics
//! - **[`properties`]**: blocks, entities, source locations, canonical hashing
//! - **[`reference`]**: the `[[...]]` query syntax
//! - **[`symbols`]**: scope tree and symbol table
//! - **[`resolver`]**: reference resolution and projection
//! - **[`graph`]**: dependency graph and evolution index
//! - **[`query`]**: completion, hover and go-to-definition
//! - **[`config`]**: `weave.toml`
//! - **[`event`]** / **`watch`**: the language service
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//! use weave_core::codec::ProjectCompiler;
//!
//! let mut compiler = ProjectCompiler::new("./docs")?;
//! let output = compiler.compile();
//! println!("{} entities", output.entities.len());
//! println!("{}", output.diagnostics);
//!
//! // incremental edit
//! let report = compiler.update_file(
//!     Path::new("people/alice.td"),
//!     "```entity User: alice @people/alice\nname: Alice\n```\n",
//! );
//! assert!(!report.has_errors());
//!
//! // resolution as an editor would ask for it
//! let result = compiler.resolve_reference("people/alice.name", Path::new("notes.td"));
//! println!("{result:?}");
//! # Ok::<(), weave_core::WeaveError>(())
//! ```
//!
//! ## Document Syntax
//!
//! ````markdown
//! ```model:User
//! name: str
//! role: str = ${DEFAULT_ROLE}
//! manager: Ref[User]?
//! ```
//!
//! ```entity User: alice @people/alice
//! name: Alice
//! ```
//!
//! ```entity User: bob
//! name: Bob
//! manager: [[alice]]
//! greeting: "Reports to [[alice.name]]"
//! ```
//! ````
//!
//! A directory's `config.td` holds `config` blocks (TOML) that set variables and
//! aliases for that directory; `spec` blocks hold project rules checked after a clean
//! validation.

pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod properties;
pub mod query;
pub mod reference;
pub mod resolver;
pub mod symbols;
#[cfg(feature = "service")]
pub mod watch;

pub use codec::compiler::{compile, CompileOutput, ProjectCompiler};
pub use error::*;
