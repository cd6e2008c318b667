//! Pattern-based entity recognition for graph linking.
//!
//! Lightweight recognizers only: capitalized name runs, company suffixes,
//! dates, e-mail addresses and URLs. Good enough to connect documents that
//! mention the same things; not a substitute for an NER model.

use std::collections::HashSet;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static PERSON_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z][a-z]+(?:\s+[A-Z][a-z]+)+\b").expect("valid person regex"));

static ORGANIZATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Z][a-z]+(?:\s+[A-Z][a-z]+)*\s+(?:Inc|Corp|Ltd|LLC|Company|Corporation)\b")
        .expect("valid organization regex")
});

static DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b\d{1,2}[/-]\d{1,2}[/-]\d{2,4}\b|\b(?:January|February|March|April|May|June|July|August|September|October|November|December)\s+\d{1,2},?\s+\d{4}\b",
    )
    .expect("valid date regex")
});

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("valid email regex")
});

static URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"https?://(?:www\.)?[-a-zA-Z0-9@:%._+~#=]{1,256}\.[a-zA-Z0-9()]{1,6}\b[-a-zA-Z0-9()@:%_+.~#?&/=]*",
    )
    .expect("valid url regex")
});

/// Kind of a recognized entity; becomes the `type` property of graph nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Person,
    Organization,
    Date,
    Email,
    #[serde(rename = "URL")]
    Url,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Person => "Person",
            EntityKind::Organization => "Organization",
            EntityKind::Date => "Date",
            EntityKind::Email => "Email",
            EntityKind::Url => "URL",
        }
    }

    fn pattern(&self) -> &'static Regex {
        match self {
            EntityKind::Person => &PERSON_RE,
            EntityKind::Organization => &ORGANIZATION_RE,
            EntityKind::Date => &DATE_RE,
            EntityKind::Email => &EMAIL_RE,
            EntityKind::Url => &URL_RE,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entity mention found in text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntityKind,
}

const KINDS: [EntityKind; 5] = [
    EntityKind::Person,
    EntityKind::Organization,
    EntityKind::Date,
    EntityKind::Email,
    EntityKind::Url,
];

/// Extract entities from `text`, grouped by kind, each `(name, kind)` once.
pub fn extract_entities(text: &str) -> Vec<Entity> {
    let mut seen = HashSet::new();
    let mut entities = Vec::new();

    for kind in KINDS {
        for m in kind.pattern().find_iter(text) {
            let entity = Entity {
                name: m.as_str().to_string(),
                kind,
            };
            if seen.insert(entity.clone()) {
                entities.push(entity);
            }
        }
    }

    entities
}
