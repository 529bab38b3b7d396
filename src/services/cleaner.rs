use unicode_normalization::UnicodeNormalization;

use super::agent::LibraryAgentClient;
use crate::domain::changelog::{ChangeLogEntry, ChangeType};
use crate::domain::track::Track;
use crate::utils::config::CleaningConfig;

/// Strips edition noise from track and album names: bracketed groups whose
/// content carries a configured keyword ("(Remastered 2011)", "[Deluxe
/// Edition]") and trailing "- Remastered"-style suffixes. Everything else,
/// including meaningful parentheses, is preserved.
pub struct NameCleaningService<'a> {
    config: &'a CleaningConfig,
    agent: &'a LibraryAgentClient,
    dry_run: bool,
}

impl<'a> NameCleaningService<'a> {
    pub fn new(config: &'a CleaningConfig, agent: &'a LibraryAgentClient, dry_run: bool) -> Self {
        Self { config, agent, dry_run }
    }

    pub fn clean_name(&self, raw: &str) -> String {
        clean_name(raw, &self.config.remaster_keywords)
    }

    /// Cleans names in place and writes the changes through the agent.
    pub async fn process_tracks(&self, tracks: &mut [Track]) -> Vec<ChangeLogEntry> {
        if !self.config.enabled {
            return Vec::new();
        }

        let mut changes = Vec::new();
        for track in tracks.iter_mut() {
            let cleaned_name = self.clean_name(&track.name);
            let cleaned_album = self.clean_name(&track.album);

            if cleaned_name != track.name {
                if self.write_field(&track.id, "name", &cleaned_name).await {
                    changes.push(
                        ChangeLogEntry::new(ChangeType::MetadataCleaning, track.id.clone())
                            .with_context(track.artist.clone(), track.album.clone(), track.name.clone())
                            .with_values(track.name.clone(), cleaned_name.clone())
                            .with_field("name"),
                    );
                    track.name = cleaned_name;
                }
            }

            if cleaned_album != track.album {
                if self.write_field(&track.id, "album", &cleaned_album).await {
                    changes.push(
                        ChangeLogEntry::new(ChangeType::MetadataCleaning, track.id.clone())
                            .with_context(track.artist.clone(), track.album.clone(), track.name.clone())
                            .with_values(track.album.clone(), cleaned_album.clone())
                            .with_field("album"),
                    );
                    track.album = cleaned_album;
                }
            }
        }

        if !changes.is_empty() {
            log::info!("Name cleaning produced {} changes", changes.len());
        }
        changes
    }

    async fn write_field(&self, track_id: &str, field: &str, value: &str) -> bool {
        if self.dry_run {
            return true;
        }
        match self.agent.update_property(track_id, field, value).await {
            Ok(()) => true,
            Err(write_err) => {
                log::warn!("Failed to write cleaned {field} for track {track_id}: {write_err}");
                false
            }
        }
    }
}

/// The pure transform. NFKC-normalises, removes keyword-bearing bracket
/// groups and trailing dash suffixes, and collapses runs of whitespace.
pub fn clean_name(raw: &str, keywords: &[String]) -> String {
    let normalized: String = raw.nfkc().collect();
    let without_brackets = strip_keyword_brackets(&normalized, keywords);
    let without_suffix = strip_keyword_dash_suffix(&without_brackets, keywords);
    collapse_whitespace(&without_suffix)
}

fn contains_keyword(content: &str, keywords: &[String]) -> bool {
    let lowered = content.to_lowercase();
    keywords.iter().any(|keyword| lowered.contains(&keyword.to_lowercase()))
}

fn strip_keyword_brackets(input: &str, keywords: &[String]) -> String {
    let mut result = String::with_capacity(input.len());
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let open = chars[i];
        let close = match open {
            '(' => ')',
            '[' => ']',
            _ => {
                result.push(open);
                i += 1;
                continue;
            }
        };

        // Find the matching closer, honouring same-type nesting.
        let mut depth = 1;
        let mut j = i + 1;
        while j < chars.len() && depth > 0 {
            if chars[j] == open {
                depth += 1;
            } else if chars[j] == close {
                depth -= 1;
            }
            j += 1;
        }

        if depth != 0 {
            // Unbalanced bracket: keep the rest verbatim.
            result.extend(&chars[i..]);
            break;
        }

        let content: String = chars[i + 1..j - 1].iter().collect();
        if !contains_keyword(&content, keywords) {
            result.push(open);
            result.push_str(&content);
            result.push(close);
        }
        i = j;
    }

    result
}

fn strip_keyword_dash_suffix(input: &str, keywords: &[String]) -> String {
    if let Some(pos) = input.rfind(" - ") {
        let suffix = &input[pos + 3..];
        if contains_keyword(suffix, keywords) {
            return input[..pos].to_string();
        }
    }
    input.to_string()
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}
