//! # Resolved intermediate representation
//!
//! The input of the backend: a fully type-checked program in which every
//! name is already resolved to a definition id and every type has a known
//! size. The front end that produces it is not part of this crate.
//!
//! ## Conventions
//!
//! - Definitions live in arenas on [`program::Program`] and are referenced by
//!   small integer ids.
//! - Every expression carries its type; operators do not perform implicit
//!   conversions, casts are explicit.

pub mod node;
pub mod program;
pub mod types;
