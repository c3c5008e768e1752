// Runs a page manifest through the loader against an in-memory document.

mod fetch;
mod manifest;
mod page;
mod session;

pub use manifest::Manifest;
pub use page::render;
pub use session::Session;
