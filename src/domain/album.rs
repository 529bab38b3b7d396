use crate::utils::config::AlbumTypesConfig;

/// Classification of an album title for the year pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlbumType {
    Special,
    Compilation,
    Reissue,
    Normal,
}

/// What the year pipeline is allowed to do for a given album type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YearHandlingStrategy {
    /// Write nothing, queue the album for verification.
    MarkAndSkip,
    /// Write the found year but queue the album for re-verification.
    MarkAndUpdate,
    Normal,
}

#[derive(Debug, Clone)]
pub struct AlbumTypeInfo {
    pub album_type: AlbumType,
    pub detected_pattern: Option<String>,
    pub strategy: YearHandlingStrategy,
}

const DEFAULT_SPECIAL: [&str; 19] = [
    "b-sides",
    "b-side",
    "d-sides",
    "demo",
    "demos",
    "vault",
    "rarities",
    "rare tracks",
    "outtakes",
    "unreleased",
    "sessions",
    "remix",
    "remixes",
    "instrumentals",
    "acoustic",
    "live",
    "bootleg",
    "mixtape",
    "ep",
];

const DEFAULT_COMPILATION: [&str; 11] = [
    "greatest hits",
    "best of",
    "hits",
    "collection",
    "anthology",
    "essential",
    "ultimate",
    "compilation",
    "singles",
    "хіти",
    "хіт",
];

const DEFAULT_REISSUE: [&str; 14] = [
    "remaster",
    "remastered",
    "anniversary",
    "deluxe",
    "expanded",
    "redux",
    "re-issue",
    "reissue",
    "rerelease",
    "re-release",
    "remanufacture",
    "special edition",
    "collector's edition",
    "bonus track",
];

/// The configured pattern sets used for album-type detection.
///
/// Loaded once at startup and passed to whoever needs detection; there is no
/// process-wide mutable pattern state.
#[derive(Debug, Clone)]
pub struct AlbumTypePatterns {
    pub special: Vec<String>,
    pub compilation: Vec<String>,
    pub reissue: Vec<String>,
}

impl AlbumTypePatterns {
    pub fn from_defaults() -> Self {
        Self {
            special: DEFAULT_SPECIAL.iter().map(|p| p.to_string()).collect(),
            compilation: DEFAULT_COMPILATION.iter().map(|p| p.to_string()).collect(),
            reissue: DEFAULT_REISSUE.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// A configured list fully replaces the defaults for that class only;
    /// classes left out of the config keep their defaults.
    pub fn from_config(config: &AlbumTypesConfig) -> Self {
        let defaults = Self::from_defaults();
        Self {
            special: config.special_patterns.clone().unwrap_or(defaults.special),
            compilation: config.compilation_patterns.clone().unwrap_or(defaults.compilation),
            reissue: config.reissue_patterns.clone().unwrap_or(defaults.reissue),
        }
    }

    /// Classifies an album title. Detection order is SPECIAL, COMPILATION,
    /// REISSUE; the first matching pattern wins.
    pub fn detect(&self, album_name: &str) -> AlbumTypeInfo {
        let folded = fold_words(album_name);

        let classes: [(&[String], AlbumType, YearHandlingStrategy); 3] = [
            (&self.special, AlbumType::Special, YearHandlingStrategy::MarkAndSkip),
            (&self.compilation, AlbumType::Compilation, YearHandlingStrategy::MarkAndSkip),
            (&self.reissue, AlbumType::Reissue, YearHandlingStrategy::MarkAndUpdate),
        ];

        for (patterns, album_type, strategy) in classes {
            if let Some(pattern) = patterns.iter().find(|p| contains_phrase(&folded, p)) {
                return AlbumTypeInfo {
                    album_type,
                    detected_pattern: Some(pattern.clone()),
                    strategy,
                };
            }
        }

        AlbumTypeInfo {
            album_type: AlbumType::Normal,
            detected_pattern: None,
            strategy: YearHandlingStrategy::Normal,
        }
    }

    pub fn is_special(&self, album_name: &str) -> (bool, Option<String>) {
        let info = self.detect(album_name);
        (info.album_type != AlbumType::Normal, info.detected_pattern)
    }

    pub fn strategy_for(&self, album_name: &str) -> YearHandlingStrategy {
        self.detect(album_name).strategy
    }
}

/// Lowercases and splits on every non-alphanumeric character, so hyphens,
/// brackets, and punctuation all act as word boundaries. The result is
/// wrapped in single spaces so phrase containment is a plain substring test.
fn fold_words(text: &str) -> String {
    let lowered = text.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    format!(" {} ", words.join(" "))
}

fn contains_phrase(folded_text: &str, pattern: &str) -> bool {
    let folded_pattern = fold_words(pattern);
    if folded_pattern.trim().is_empty() {
        return false;
    }
    folded_text.contains(&folded_pattern)
}
