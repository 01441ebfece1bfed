//! Core domain library shared by the sync worker.
//!
//! Provides:
//! - Spaced repetition scheduler (SuperMemo-2 derived `practice`)
//! - Shared types (Card, CardType, Grade, Definition, ...)
//!
//! Everything here is pure: no I/O, no async, no persistence. The worker
//! applies scheduler output back to its document store as a patch.

pub mod error;
pub mod scheduler;
pub mod types;

pub use error::{CoreError, Result};
pub use scheduler::practice;
pub use types::{Card, CardType, CharacterGlyph, Definition, Grade, WordModelStats};
