//! Content filtering
//!
//! Drops candidates a viewer must not see. Checks run in a fixed order and
//! short-circuit on the first drop: muted author, muted keyword, global
//! policy, age appropriateness, spam heuristics. The filter never fails a
//! build; anything it cannot judge is kept.

use serde::{Serialize, Deserialize};

use crate::models::{EngagementProfile, Note};

/// Why a note was dropped, for metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropReason {
    MutedAuthor,
    MutedKeyword,
    GlobalPolicy,
    AgeRestricted,
    Spam,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::MutedAuthor => "muted_author",
            DropReason::MutedKeyword => "muted_keyword",
            DropReason::GlobalPolicy => "global_policy",
            DropReason::AgeRestricted => "age_restricted",
            DropReason::Spam => "spam",
        }
    }
}

/// Service-wide content policy applied to every viewer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalPolicy {
    /// Notes containing any of these are dropped for everyone
    pub banned_keywords: Vec<String>,
    /// Notes containing any of these fail the age-appropriateness check
    pub restricted_keywords: Vec<String>,
    /// Hashtag count above which a note is treated as spam
    pub max_hashtags: usize,
    /// A single token repeated this many times is treated as spam
    pub max_token_repeats: usize,
}

impl Default for GlobalPolicy {
    fn default() -> Self {
        Self {
            banned_keywords: Vec::new(),
            restricted_keywords: Vec::new(),
            max_hashtags: 15,
            max_token_repeats: 8,
        }
    }
}

/// Per-viewer filter over slate candidates
#[derive(Debug, Clone, Default)]
pub struct ContentFilter {
    policy: GlobalPolicy,
}

impl ContentFilter {
    pub fn new(policy: GlobalPolicy) -> Self {
        Self { policy }
    }

    /// First matching drop reason, or None when the note is kept
    pub fn evaluate(&self, note: &Note, profile: &EngagementProfile) -> Option<DropReason> {
        if profile.muted_authors.contains(&note.author_id) {
            return Some(DropReason::MutedAuthor);
        }
        if self.matches_muted_keyword(note, profile) {
            return Some(DropReason::MutedKeyword);
        }
        if self.violates_global_policy(note) {
            return Some(DropReason::GlobalPolicy);
        }
        if self.is_age_restricted(note) {
            return Some(DropReason::AgeRestricted);
        }
        if self.looks_like_spam(note) {
            return Some(DropReason::Spam);
        }
        None
    }

    pub fn should_show(&self, note: &Note, profile: &EngagementProfile) -> bool {
        self.evaluate(note, profile).is_none()
    }

    /// Keeps accepted notes in order, returning drop reasons alongside
    pub fn filter_notes(
        &self,
        notes: Vec<Note>,
        profile: &EngagementProfile,
    ) -> (Vec<Note>, Vec<DropReason>) {
        let mut kept = Vec::with_capacity(notes.len());
        let mut dropped = Vec::new();
        for note in notes {
            match self.evaluate(&note, profile) {
                None => kept.push(note),
                Some(reason) => dropped.push(reason),
            }
        }
        (kept, dropped)
    }

    /// Case-insensitive whitespace-delimited match against muted keywords
    fn matches_muted_keyword(&self, note: &Note, profile: &EngagementProfile) -> bool {
        if profile.muted_keywords.is_empty() {
            return false;
        }
        let content = note.content.to_lowercase();
        content.split_whitespace().any(|token| {
            let token = token.trim_matches(|c: char| !c.is_alphanumeric());
            !token.is_empty() && profile.muted_keywords.contains(token)
        })
    }

    fn violates_global_policy(&self, note: &Note) -> bool {
        if self.policy.banned_keywords.is_empty() {
            return false;
        }
        let content = note.content.to_lowercase();
        self.policy
            .banned_keywords
            .iter()
            .any(|banned| content.contains(&banned.to_lowercase()))
    }

    fn is_age_restricted(&self, note: &Note) -> bool {
        if self.policy.restricted_keywords.is_empty() {
            return false;
        }
        let content = note.content.to_lowercase();
        self.policy
            .restricted_keywords
            .iter()
            .any(|restricted| content.contains(&restricted.to_lowercase()))
    }

    fn looks_like_spam(&self, note: &Note) -> bool {
        if note.hashtags.len() > self.policy.max_hashtags {
            return true;
        }

        // One token flooding the note is the classic repost-bot pattern.
        let mut counts: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
        for token in note.content.split_whitespace() {
            if token.len() < 3 {
                continue;
            }
            let count = counts.entry(token).or_insert(0);
            *count += 1;
            if *count > self.policy.max_token_repeats {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NoteMetrics, NoteVisibility};
    use chrono::Utc;

    fn note_with_content(content: &str) -> Note {
        Note {
            id: "n1".to_string(),
            author_id: "a1".to_string(),
            created_at: Utc::now(),
            visibility: NoteVisibility::Public,
            content: content.to_string(),
            metrics: NoteMetrics::default(),
            media: vec![],
            hashtags: vec![],
            is_reply: false,
            is_repost: false,
        }
    }

    fn profile() -> EngagementProfile {
        EngagementProfile::new("v1", Utc::now())
    }

    #[test]
    fn test_muted_author_dropped_first() {
        let filter = ContentFilter::default();
        let mut profile = profile();
        profile.muted_authors.insert("a1".to_string());
        // the content would also match a muted keyword, but author wins
        profile.muted_keywords.insert("crypto".to_string());

        let note = note_with_content("crypto giveaway");
        assert_eq!(filter.evaluate(&note, &profile), Some(DropReason::MutedAuthor));
    }

    #[test]
    fn test_muted_keyword_matches_whole_tokens_case_insensitive() {
        let filter = ContentFilter::default();
        let mut profile = profile();
        profile.muted_keywords.insert("spoilers".to_string());

        assert_eq!(
            filter.evaluate(&note_with_content("major SPOILERS ahead!"), &profile),
            Some(DropReason::MutedKeyword)
        );
        // substring inside another word does not match
        assert_eq!(
            filter.evaluate(&note_with_content("unspoilersome text"), &profile),
            None
        );
    }

    #[test]
    fn test_banned_keyword_applies_to_all_viewers() {
        let filter = ContentFilter::new(GlobalPolicy {
            banned_keywords: vec!["forbidden".to_string()],
            ..Default::default()
        });
        assert_eq!(
            filter.evaluate(&note_with_content("this is Forbidden content"), &profile()),
            Some(DropReason::GlobalPolicy)
        );
    }

    #[test]
    fn test_restricted_keyword_fails_age_check() {
        let filter = ContentFilter::new(GlobalPolicy {
            restricted_keywords: vec!["nsfw".to_string()],
            ..Default::default()
        });
        assert_eq!(
            filter.evaluate(&note_with_content("nsfw artwork"), &profile()),
            Some(DropReason::AgeRestricted)
        );
    }

    #[test]
    fn test_hashtag_flood_is_spam() {
        let filter = ContentFilter::default();
        let mut note = note_with_content("look at this");
        note.hashtags = (0..20).map(|i| format!("tag{}", i)).collect();
        assert_eq!(filter.evaluate(&note, &profile()), Some(DropReason::Spam));
    }

    #[test]
    fn test_repeated_token_is_spam() {
        let filter = ContentFilter::default();
        let flood = std::iter::repeat("winner").take(12).collect::<Vec<_>>().join(" ");
        assert_eq!(
            filter.evaluate(&note_with_content(&flood), &profile()),
            Some(DropReason::Spam)
        );
    }

    #[test]
    fn test_clean_note_is_kept() {
        let filter = ContentFilter::default();
        assert!(filter.should_show(&note_with_content("a perfectly fine note"), &profile()));
    }

    #[test]
    fn test_filter_notes_keeps_order() {
        let filter = ContentFilter::default();
        let mut profile = profile();
        profile.muted_keywords.insert("skip".to_string());

        let notes = vec![
            note_with_content("first"),
            note_with_content("please skip this"),
            note_with_content("third"),
        ];
        let (kept, dropped) = filter.filter_notes(notes, &profile);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].content, "first");
        assert_eq!(kept[1].content, "third");
        assert_eq!(dropped, vec![DropReason::MutedKeyword]);
    }
}
