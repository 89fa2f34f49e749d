//! Canonical exercise catalog and the matcher that maps free-form classifier text onto it.
//!
//! [`Catalog::normalize`] tries, in order, and returns the first hit:
//!
//! 1. exact match of the folded input against a label or synonym
//! 2. word-bounded containment: the input contains a term (longest term wins), or a term contains
//!    the input (shortest term wins; inputs under four characters are not tried)
//! 3. bounded edit distance against every term, accepted when the distance is at most a fifth of
//!    the term's length
//!
//! and otherwise [`Exercise::Unknown`]. "Folding" lowercases the text, turns every run of
//! non-alphanumeric characters into a single space and trims, so `"Push-Up"`, `"push up"` and
//! `" PUSH_UP "` are the same term. Ties are broken by catalog order.
//!
//! The matcher holds no state beyond the immutable catalog, so it is deterministic and safe to
//! share across requests.

mod builtin;

use figment::{
    Figment,
    providers::{Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path};
use thiserror::Error;
use tracing::info;
use utoipa::ToSchema;

/// What callers see when nothing in the catalog matched
pub const UNKNOWN_EXERCISE: &str = "unknown exercise";

/// Shortest input tried against longer terms in the reverse containment step
const MIN_REVERSE_CONTAINMENT_CHARS: usize = 4;

/// Maximum edit distance is `term length / FUZZY_LENGTH_RATIO`
const FUZZY_LENGTH_RATIO: usize = 5;

/// One canonical exercise
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct CatalogEntry {
    /// Canonical label, e.g. `bench press`
    pub label: String,
    /// Alternative spellings that map to this label
    #[serde(default)]
    pub synonyms: Vec<String>,
    /// Primary muscle groups, for display
    #[serde(default)]
    pub muscles: Vec<String>,
}

/// Result of matching classifier text against the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exercise {
    Canonical(String),
    Unknown,
}

impl Exercise {
    /// The label to show the user; [`UNKNOWN_EXERCISE`] for no match
    pub fn label(&self) -> &str {
        match self {
            Exercise::Canonical(label) => label,
            Exercise::Unknown => UNKNOWN_EXERCISE,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Exercise::Unknown)
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog has no exercises")]
    Empty,

    #[error("catalog entry {index} has an empty label")]
    EmptyLabel { index: usize },

    #[error("'{0}' is reserved and cannot be used as a catalog term")]
    Reserved(String),

    #[error("term '{term}' maps to both '{first}' and '{second}'")]
    Conflict { term: String, first: String, second: String },

    #[error("failed to load catalog file: {0}")]
    Load(#[from] figment::Error),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    exercises: Vec<CatalogEntry>,
}

/// A searchable term: a folded label or synonym, padded with spaces for word-bounded search
#[derive(Debug, Clone)]
struct Term {
    folded: String,
    padded: String,
    chars: usize,
    entry: usize,
}

/// The canonical exercise catalog. Immutable once built.
#[derive(Debug, Clone)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
    /// Labels then synonyms of each entry, in catalog order
    terms: Vec<Term>,
    exact: HashMap<String, usize>,
}

impl Catalog {
    /// The catalog compiled into the binary
    pub fn builtin() -> Self {
        let entries = builtin::BUILTIN_EXERCISES
            .iter()
            .map(|(label, synonyms, muscles)| CatalogEntry {
                label: label.to_string(),
                synonyms: synonyms.iter().map(|s| s.to_string()).collect(),
                muscles: muscles.iter().map(|m| m.to_string()).collect(),
            })
            .collect();
        // Covered by test_builtin_catalog_is_valid
        Self::new(entries).expect("built-in catalog is valid")
    }

    /// Load a catalog from a YAML file of the form `exercises: [{label, synonyms, muscles}]`
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let file: CatalogFile = Figment::from(Yaml::file(path)).extract()?;
        let catalog = Self::new(file.exercises)?;
        info!(path = %path.display(), exercises = catalog.len(), "Loaded exercise catalog");
        Ok(catalog)
    }

    /// Build and validate a catalog. Labels must be unique and non-empty, and no term (label or
    /// synonym, after folding) may belong to two different entries.
    pub fn new(entries: Vec<CatalogEntry>) -> Result<Self, CatalogError> {
        if entries.is_empty() {
            return Err(CatalogError::Empty);
        }

        let reserved = [fold(UNKNOWN_EXERCISE), "unknown".to_string()];
        let mut terms = Vec::new();
        let mut exact: HashMap<String, usize> = HashMap::new();

        for (index, entry) in entries.iter().enumerate() {
            if fold(&entry.label).is_empty() {
                return Err(CatalogError::EmptyLabel { index });
            }

            for raw in std::iter::once(&entry.label).chain(&entry.synonyms) {
                let folded = fold(raw);
                if folded.is_empty() {
                    continue;
                }
                if reserved.contains(&folded) {
                    return Err(CatalogError::Reserved(raw.clone()));
                }
                match exact.get(&folded) {
                    Some(&existing) if existing != index => {
                        return Err(CatalogError::Conflict {
                            term: raw.clone(),
                            first: entries[existing].label.clone(),
                            second: entry.label.clone(),
                        });
                    }
                    Some(_) => continue,
                    None => {}
                }

                exact.insert(folded.clone(), index);
                terms.push(Term {
                    padded: format!(" {folded} "),
                    chars: folded.chars().count(),
                    folded,
                    entry: index,
                });
            }
        }

        Ok(Self { entries, terms, exact })
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.label.as_str())
    }

    /// Find the entry whose label or synonym matches `name` after folding. Unlike
    /// [`Catalog::normalize`] there is no containment or fuzzy step: this resolves names a user
    /// picked or typed, not model output.
    pub fn lookup(&self, name: &str) -> Option<&CatalogEntry> {
        self.exact.get(&fold(name)).map(|&index| &self.entries[index])
    }

    /// Map free-form text onto a canonical label. Never fails: text that matches nothing is
    /// [`Exercise::Unknown`].
    pub fn normalize(&self, raw_text: &str) -> Exercise {
        let folded = fold(raw_text);
        if folded.is_empty() {
            return Exercise::Unknown;
        }

        let found = self
            .exact
            .get(&folded)
            .copied()
            .or_else(|| self.containing(&folded))
            .or_else(|| self.nearest(&folded));

        match found {
            Some(index) => Exercise::Canonical(self.entries[index].label.clone()),
            None => Exercise::Unknown,
        }
    }

    fn containing(&self, folded: &str) -> Option<usize> {
        let padded = format!(" {folded} ");

        // Input mentions a term: "a person doing a bench press" -> "bench press"
        let mut best: Option<&Term> = None;
        for term in &self.terms {
            if padded.contains(&term.padded) && best.is_none_or(|b| term.chars > b.chars) {
                best = Some(term);
            }
        }
        if let Some(term) = best {
            return Some(term.entry);
        }

        // A term mentions the input: "skull" -> "skull crusher"
        if folded.chars().count() < MIN_REVERSE_CONTAINMENT_CHARS {
            return None;
        }
        for term in &self.terms {
            if term.padded.contains(&padded) && best.is_none_or(|b| term.chars < b.chars) {
                best = Some(term);
            }
        }
        best.map(|term| term.entry)
    }

    fn nearest(&self, folded: &str) -> Option<usize> {
        let input_chars = folded.chars().count();

        let mut best: Option<(usize, usize)> = None;
        for term in &self.terms {
            let max_distance = term.chars / FUZZY_LENGTH_RATIO;
            // Edit distance is at least the length difference
            if input_chars.abs_diff(term.chars) > max_distance {
                continue;
            }
            let distance = strsim::levenshtein(folded, &term.folded);
            if distance <= max_distance && best.is_none_or(|(d, _)| distance < d) {
                best = Some((distance, term.entry));
            }
        }
        best.map(|(_, entry)| entry)
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Lowercase, collapse every run of non-alphanumerics to one space, trim
fn fold(text: &str) -> String {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
