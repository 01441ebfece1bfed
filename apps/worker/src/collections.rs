//! The standard collection set and its replication modes.

use crate::config::LanguageProfile;
use crate::store::{CollectionSpec, ReplicationMode};

pub const DEFINITIONS: &str = "definitions";
pub const CHARACTERS: &str = "characters";
pub const WORD_MODEL_STATS: &str = "word_model_stats";
pub const CONTENTS: &str = "contents";
pub const CARDS: &str = "cards";
pub const EVENT_QUEUE: &str = "event_queue";

/// Current schema versions. Bumping one requires a registered migration or
/// the collection is dropped on next open (critical ones abort instead).
pub const SCHEMA_VERSIONS: &[(&str, i64)] = &[
    (DEFINITIONS, 1),
    (CHARACTERS, 1),
    (WORD_MODEL_STATS, 1),
    (CONTENTS, 1),
    (CARDS, 1),
    (EVENT_QUEUE, 1),
];

fn version(name: &str) -> i64 {
    SCHEMA_VERSIONS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, v)| *v)
        .unwrap_or(1)
}

/// Collection specs for a user's language profile.
///
/// The definitions dictionary can be gigabytes; its initial sync never
/// blocks startup. Word stats and characters are low priority and poll
/// instead of holding a live subscription slot.
pub fn standard_collections(lang: &LanguageProfile) -> Vec<CollectionSpec> {
    let mut specs = vec![
        CollectionSpec::new(DEFINITIONS, version(DEFINITIONS), ReplicationMode::PullOnly)
            .with_indexes(&["graph"])
            .critical()
            .background_initial(),
        CollectionSpec::new(
            WORD_MODEL_STATS,
            version(WORD_MODEL_STATS),
            ReplicationMode::PullOnly,
        )
        .critical()
        .polled(),
        CollectionSpec::new(CONTENTS, version(CONTENTS), ReplicationMode::PullOnly),
        CollectionSpec::new(CARDS, version(CARDS), ReplicationMode::PushPull)
            .with_indexes(&["dueDate", "known", "firstSuccessDate"])
            .critical(),
        CollectionSpec::new(EVENT_QUEUE, version(EVENT_QUEUE), ReplicationMode::None),
    ];
    if lang.has_characters {
        specs.push(
            CollectionSpec::new(CHARACTERS, version(CHARACTERS), ReplicationMode::PullOnly)
                .polled(),
        );
    }
    specs
}
