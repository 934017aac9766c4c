//! Document state management and text utilities.
//!
//! This module provides:
//! - `extract_regions` / `updated_host_text` for locating and rewriting
//!   CDATA regions in host text
//! - `Session` and `SessionStore` for per-host tracking and region bindings
//! - `LineIndex` for byte offset -> LSP position conversion

pub mod locator;
mod session;
mod text;

pub use locator::{extract_regions, updated_host_text, CDATA_CLOSE, CDATA_OPEN};
pub use session::{RegionKey, Session, SessionState, SessionStore};
pub use text::LineIndex;
