//! Session end-phrase matching
//!
//! Transcripts and configured phrases go through the same canonical form
//! before an exact comparison, so "Thank you." matches "thank you" and
//! "Díky!" matches "diky".

use std::collections::HashSet;

use unicode_normalization::char::canonical_combining_class;
use unicode_normalization::UnicodeNormalization;

use crate::config::ConversationSettings;

/// Punctuation and whitespace removed before matching
const STRIPPED: &[char] = &['.', '!', '?', ',', '"', ' ', '\n', '\t', '\r', '\''];

/// Canonical form used for end-phrase comparison
pub fn canonicalize(text: &str, noise_marker: &str) -> String {
    let mut lowered = text.to_lowercase();
    if !noise_marker.is_empty() {
        lowered = lowered.replace(&noise_marker.to_lowercase(), "");
    }

    lowered
        .nfkd()
        .filter(|&c| canonical_combining_class(c) == 0)
        .filter(|c| !STRIPPED.contains(c))
        .collect()
}

#[derive(Debug, Clone)]
pub struct EndPhrases {
    noise_marker: String,
    phrases: HashSet<String>,
}

impl EndPhrases {
    pub fn new<S: AsRef<str>>(noise_marker: &str, phrases: &[S]) -> Self {
        let phrases = phrases
            .iter()
            .map(|phrase| canonicalize(phrase.as_ref(), noise_marker))
            .filter(|phrase| !phrase.is_empty())
            .collect();
        Self {
            noise_marker: noise_marker.to_string(),
            phrases,
        }
    }

    pub fn from_settings(settings: &ConversationSettings) -> Self {
        Self::new(&settings.noise_marker, &settings.end_phrases)
    }

    /// True when the whole transcript, canonicalized, is one of the phrases
    pub fn matches(&self, transcript: &str) -> bool {
        self.phrases
            .contains(&canonicalize(transcript, &self.noise_marker))
    }

    pub fn len(&self) -> usize {
        self.phrases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_strips_case_punctuation_and_noise() {
        assert_eq!(canonicalize("Thank you.", "<noise>"), "thankyou");
        assert_eq!(canonicalize("<noise> Thanks!", "<noise>"), "thanks");
        assert_eq!(canonicalize("That's all, \"Tars\"\n", "<noise>"), "thatsalltars");
    }

    #[test]
    fn test_canonicalize_drops_diacritics() {
        assert_eq!(canonicalize("Děkuji!", "<noise>"), "dekuji");
        assert_eq!(canonicalize("měj se", "<noise>"), "mejse");
    }

    #[test]
    fn test_matches_whole_transcript_only() {
        let phrases = EndPhrases::new("<noise>", &["thank you", "thanks", "díky"]);
        assert!(phrases.matches(" Thanks."));
        assert!(phrases.matches("thank   you!"));
        assert!(phrases.matches("DIKY"));
        assert!(!phrases.matches("thanks for the weather report"));
        assert!(!phrases.matches(""));
    }

    #[test]
    fn test_default_phrases_loaded() {
        let phrases = EndPhrases::from_settings(&ConversationSettings::default());
        assert!(!phrases.is_empty());
        assert!(phrases.matches("Okay, goodbye!"));
        assert!(phrases.matches("<noise>Na shledanou"));
    }
}
