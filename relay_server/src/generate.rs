//! Generated chat.
//!
//! A client sends an empty `Message` to ask for a line "in the voice of" its
//! linked identity. Where the line comes from is pluggable; the relay only
//! relays what a [`TextGenerator`] returns and drops empty results.

use std::collections::HashMap;

use async_trait::async_trait;
use rand::seq::SliceRandom;

use crate::registry::IdentityId;

/// Produces a chat line for an external identity.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Returns the generated line, or an empty string when there is nothing
    /// to say.
    async fn generate(&self, identity: &IdentityId) -> String;
}

/// Generator that never says anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Silent;

#[async_trait]
impl TextGenerator for Silent {
    async fn generate(&self, _identity: &IdentityId) -> String {
        String::new()
    }
}

/// Picks a random canned line per identity.
#[derive(Debug, Default, Clone)]
pub struct PhraseBook {
    phrases: HashMap<IdentityId, Vec<String>>,
}

impl PhraseBook {
    pub fn new(phrases: HashMap<String, Vec<String>>) -> Self {
        Self {
            phrases: phrases
                .into_iter()
                .map(|(identity, lines)| (IdentityId(identity), lines))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.phrases.values().all(Vec::is_empty)
    }
}

#[async_trait]
impl TextGenerator for PhraseBook {
    async fn generate(&self, identity: &IdentityId) -> String {
        let Some(lines) = self.phrases.get(identity) else {
            return String::new();
        };
        let mut rng = rand::thread_rng();
        lines.choose(&mut rng).cloned().unwrap_or_default()
    }
}
