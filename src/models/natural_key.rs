//! Identity of an intake row that the spreadsheet never assigns itself.
//!
//! The source has no durable row id, so a response is identified by its
//! submission timestamp plus the patient's name. Two responses submitted
//! at the same instant for the same name are the same response.

use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Separator between key components; cannot appear in typed form input.
const COMPONENT_SEPARATOR: char = '\u{1f}';

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(String);

impl NaturalKey {
    /// Derive the key for a response.
    ///
    /// The timestamp is trimmed; the name is lowercased with runs of
    /// whitespace collapsed, so cosmetic edits to spacing or case in the
    /// sheet do not produce a second patient.
    pub fn derive(submitted_at: &str, full_name: &str) -> Self {
        let mut material = String::with_capacity(submitted_at.len() + full_name.len() + 1);
        material.push_str(submitted_at.trim());
        material.push(COMPONENT_SEPARATOR);
        material.push_str(&normalize_name(full_name));

        let digest = Sha256::digest(material.as_bytes());
        Self(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest))
    }

    /// Wrap an already-derived key (e.g. read back from the store).
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(|part| part.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}
