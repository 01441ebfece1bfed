//! Core types for the language-learning domain.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// One spaced-repetition aspect of a word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardType {
    Graph,
    Sound,
    Meaning,
    Phrase,
}

impl CardType {
    /// Convert to the numeric value used in card ids (1-4).
    pub fn to_value(self) -> u8 {
        match self {
            Self::Graph => 1,
            Self::Sound => 2,
            Self::Meaning => 3,
            Self::Phrase => 4,
        }
    }

    /// Create from numeric value.
    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Graph),
            2 => Some(Self::Sound),
            3 => Some(Self::Meaning),
            4 => Some(Self::Phrase),
            _ => None,
        }
    }

    /// All card types a word can have.
    pub fn all() -> [Self; 4] {
        [Self::Graph, Self::Sound, Self::Meaning, Self::Phrase]
    }
}

/// Grade given to a card after a revision.
///
/// Values mirror the SM-2 quality scale; anything at or above `Hard`
/// counts as a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grade {
    Unknown,
    Hard,
    Good,
    Known,
}

impl Grade {
    /// Convert to the numeric SM-2 quality value (2-5).
    pub fn to_value(self) -> i64 {
        match self {
            Self::Unknown => 2,
            Self::Hard => 3,
            Self::Good => 4,
            Self::Known => 5,
        }
    }

    /// Create from numeric value.
    pub fn from_value(value: i64) -> Result<Self> {
        match value {
            2 => Ok(Self::Unknown),
            3 => Ok(Self::Hard),
            4 => Ok(Self::Good),
            5 => Ok(Self::Known),
            _ => Err(CoreError::InvalidGrade(value)),
        }
    }

    /// Whether this grade counts as a successful revision.
    pub fn is_success(self) -> bool {
        self >= Self::Hard
    }
}

/// One spaced-repetition unit: a word id plus an aspect.
///
/// The id is `"{word_id}-{card_type}"` with the numeric card type, so the
/// meaning card of word 670 is `"670-3"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub id: String,
    /// Current inter-repetition interval in whole days.
    pub interval: i64,
    /// Consecutive-success counter.
    pub repetition: i64,
    /// SM-2 easiness factor, never below 1.3.
    pub efactor: f64,
    /// Next revision due date, unix seconds.
    pub due_date: i64,
    /// Terminal flag: the learner declared the word known.
    pub known: bool,
    /// Suspended cards keep state but are never queued for review.
    pub suspended: bool,
    /// Unix seconds of the first revision, 0 if never revised.
    pub first_revision_date: i64,
    /// Unix seconds of the most recent revision, 0 if never revised.
    pub last_revision_date: i64,
    /// Unix seconds of the first passing grade, 0 until then. Set once.
    pub first_success_date: i64,
    /// Replication cursor timestamp, unix milliseconds.
    pub updated_at: i64,
    pub deleted: bool,
}

impl Card {
    /// Compose a card id from word id and card type.
    pub fn compose_id(word_id: &str, card_type: CardType) -> String {
        format!("{}-{}", word_id, card_type.to_value())
    }

    /// Split a card id back into word id and card type.
    pub fn split_id(id: &str) -> Result<(String, CardType)> {
        let (word_id, type_str) = id
            .rsplit_once('-')
            .ok_or_else(|| CoreError::MalformedCardId(id.to_string()))?;
        let value: u8 = type_str
            .parse()
            .map_err(|_| CoreError::MalformedCardId(id.to_string()))?;
        let card_type =
            CardType::from_value(value).ok_or(CoreError::InvalidCardType(value as i64))?;
        Ok((word_id.to_string(), card_type))
    }

    /// Fresh card for a word aspect, created lazily on first grading.
    pub fn new(word_id: &str, card_type: CardType, now_ms: i64) -> Self {
        Self {
            id: Self::compose_id(word_id, card_type),
            interval: 0,
            repetition: 0,
            efactor: 2.5,
            due_date: 0,
            known: false,
            suspended: false,
            first_revision_date: 0,
            last_revision_date: 0,
            first_success_date: 0,
            updated_at: now_ms,
            deleted: false,
        }
    }

    /// The word id portion of this card's id.
    pub fn word_id(&self) -> &str {
        self.id.rsplit_once('-').map(|(w, _)| w).unwrap_or(&self.id)
    }
}

/// Meanings from one translation provider, grouped by part of speech.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderTranslations {
    pub provider: String,
    pub pos_translations: Vec<PosTranslations>,
}

/// Meaning strings for one part of speech.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosTranslations {
    pub pos: String,
    pub values: Vec<String>,
}

/// Corpus frequency statistics for a word.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrequencyStats {
    /// Word count per million tokens.
    #[serde(default)]
    pub wcpm: Option<f64>,
    /// Percentage of documents containing the word.
    #[serde(default)]
    pub wcdp: Option<f64>,
}

/// Dictionary entry for a word. Immutable on the client except via
/// replication pulls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Definition {
    /// Stable server-assigned word id.
    pub id: String,
    /// Surface form.
    pub graph: String,
    /// Phonetic transcription, one element per syllable.
    #[serde(default)]
    pub sound: Vec<String>,
    #[serde(default)]
    pub provider_translations: Vec<ProviderTranslations>,
    #[serde(default)]
    pub synonyms: Vec<PosTranslations>,
    #[serde(default)]
    pub frequency: FrequencyStats,
    /// Level-membership tags (graded word lists the word belongs to).
    #[serde(default)]
    pub levels: Vec<String>,
    pub updated_at: i64,
    #[serde(default)]
    pub deleted: bool,
}

/// Character-level data for languages with a character system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterGlyph {
    /// The character itself.
    pub id: String,
    /// Structural decomposition string.
    #[serde(default)]
    pub structure: String,
    #[serde(default)]
    pub radical: String,
    #[serde(default)]
    pub stroke_count: u32,
    pub updated_at: i64,
    #[serde(default)]
    pub deleted: bool,
}

/// Per-word exposure statistics computed server-side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordModelStats {
    /// Word id, same key space as `Definition::id`.
    pub id: String,
    #[serde(default)]
    pub nb_seen: i64,
    #[serde(default)]
    pub nb_checked: i64,
    #[serde(default)]
    pub last_seen: i64,
    #[serde(default)]
    pub last_checked: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub deleted: bool,
}
