//! Scope tree and symbol table.
//!
//! # Module Organization
//!
//! - [`scope`]: lexical scopes (global → directory → file) with handle bindings and
//!   inherited variables
//! - [`table`]: the project-wide [`SymbolTable`]: scopes plus the logical-id,
//!   content-hash, schema-name and fuzzy indices
//!
//! Lookup walks from the innermost scope outwards, stops at a boundary scope and
//! then falls back to the global logical-id index.

mod scope;
mod table;

#[cfg(test)]
mod tests;

use thiserror::Error;

use crate::properties::{BlockKey, Target};

pub use scope::{Binding, Scope, ScopeId, ScopeKind, ScopeTree};
pub use table::{FuzzyEntry, SymbolTable};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SymbolError {
    #[error("handle '{handle}' is already bound in this scope by {existing}")]
    DuplicateHandle { handle: String, existing: BlockKey },
    #[error("identifier '{id}' is already registered to {existing}")]
    DuplicateId { id: String, existing: Target },
}
