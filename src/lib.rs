//! Inject `<script>` and `<link rel="stylesheet">` elements into a document,
//! creating each script at most once and telling every requester when it is ready.

pub mod attrs;
pub mod dom;
pub mod entry;
pub mod error;
pub mod loader;

pub use dom::{Document, Signal};
pub use error::LoadFailure;
pub use loader::{LoadStatus, Loader, ScriptOptions, StylesheetOptions};
