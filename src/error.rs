use thiserror::Error;

/// Why a script never became available.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LoadFailure {
    /// The element reported an error instead of completing.
    #[error("script `{url}` failed to load")]
    Network { url: String },

    /// The element could not be created or attached.
    #[error("could not attach script `{url}`: {reason}")]
    Dom { url: String, reason: String },
}

