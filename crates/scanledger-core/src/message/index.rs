//! Inverted token index over merged message bodies.

use std::collections::HashMap;

use super::model::Message;

/// Reference into a message cache: which stream, which key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    /// Cache key of the owning stream.
    pub stream: String,
    /// Key of the referenced message.
    pub key: String,
}

/// Inverted index from lowercased body tokens to message references.
///
/// Append-only: extended as pages merge, rebuilt from cache contents on
/// restore. Holds references, never message copies.
#[derive(Debug, Default)]
pub struct TokenIndex {
    entries: HashMap<String, Vec<MessageRef>>,
}

impl TokenIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes the bodies of `messages` under `stream`.
    ///
    /// Tokens are runs of word characters, lowercased; messages without a
    /// body are skipped.
    pub fn extend(&mut self, stream: &str, messages: &[Message]) {
        for message in messages {
            let Some(body) = message.body_text() else {
                continue;
            };
            for token in tokenize(body) {
                self.entries.entry(token).or_default().push(MessageRef {
                    stream: stream.to_string(),
                    key: message.key.clone(),
                });
            }
        }
    }

    /// References whose indexed bodies contain `token` (case-insensitive).
    #[must_use]
    pub fn lookup(&self, token: &str) -> &[MessageRef] {
        self.entries
            .get(&token.to_lowercase())
            .map_or(&[], Vec::as_slice)
    }

    /// Number of distinct tokens indexed.
    #[must_use]
    pub fn token_count(&self) -> usize {
        self.entries.len()
    }

    /// Drops every indexed token.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn tokenize(body: &str) -> impl Iterator<Item = String> + '_ {
    body.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}
