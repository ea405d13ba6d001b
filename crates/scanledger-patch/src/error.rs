//! Error types for patch operations.

/// Result type alias for patch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Patch error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A tombstone survived into an applied document.
    ///
    /// Applying a patch must consume every deletion marker; a `null` left in
    /// the result at any depth means the patch or the input document was
    /// corrupt. The application that produced it must be discarded.
    #[error("tombstone leaked into applied document at `{path}`")]
    TombstoneLeak {
        /// Dotted path to the first leaked tombstone.
        path: String,
    },

    /// A replacement value embeds a `null` below a non-document position.
    ///
    /// `null` is only meaningful as a deletion marker for an object key; a
    /// wire patch carrying it inside a list or as a bare scalar cannot be
    /// applied without leaking it.
    #[error("patch embeds a tombstone inside a replacement value at `{path}`")]
    EmbeddedTombstone {
        /// Dotted path to the embedded tombstone.
        path: String,
    },

    /// The patch deletes the entire document.
    ///
    /// A top-level tombstone has no surrounding key to remove, so applying it
    /// could only produce a bare `null`.
    #[error("patch is a top-level tombstone")]
    TopLevelTombstone,
}
