//! Keyword relevance filter, applied at intake before aggregation.
//!
//! Filtered events are dropped silently: no ledger record, no offset advance,
//! so a replayed filtered event is just re-dropped cheaply.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterMode {
    /// Only events whose text contains at least one keyword pass.
    Whitelist,
    /// Events whose text contains any keyword are dropped.
    Blacklist,
}

#[derive(Clone, Debug)]
pub struct KeywordFilter {
    keywords: Vec<String>,
    mode: FilterMode,
    case_sensitive: bool,
}

impl KeywordFilter {
    pub fn new(keywords: Vec<String>, mode: FilterMode, case_sensitive: bool) -> Self {
        let keywords = keywords
            .into_iter()
            .map(|k| {
                if case_sensitive {
                    k
                } else {
                    k.to_lowercase()
                }
            })
            .filter(|k| !k.is_empty())
            .collect();

        Self {
            keywords,
            mode,
            case_sensitive,
        }
    }

    /// An empty keyword list disables filtering entirely.
    pub fn is_enabled(&self) -> bool {
        !self.keywords.is_empty()
    }

    pub fn allows(&self, text: Option<&str>) -> bool {
        if !self.is_enabled() {
            return true;
        }

        let Some(text) = text else {
            // No text to match: passes in blacklist mode, fails in whitelist mode.
            return self.mode == FilterMode::Blacklist;
        };

        let haystack = if self.case_sensitive {
            text.to_string()
        } else {
            text.to_lowercase()
        };
        let hit = self.keywords.iter().any(|k| haystack.contains(k));

        match self.mode {
            FilterMode::Whitelist => hit,
            FilterMode::Blacklist => !hit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(keywords: &[&str], mode: FilterMode, case_sensitive: bool) -> KeywordFilter {
        KeywordFilter::new(
            keywords.iter().map(|s| s.to_string()).collect(),
            mode,
            case_sensitive,
        )
    }

    #[test]
    fn empty_keywords_pass_everything() {
        let f = filter(&[], FilterMode::Whitelist, false);
        assert!(f.allows(Some("anything")));
        assert!(f.allows(None));
    }

    #[test]
    fn whitelist_requires_a_hit() {
        let f = filter(&["rust"], FilterMode::Whitelist, false);
        assert!(f.allows(Some("big Rust release")));
        assert!(!f.allows(Some("nothing relevant")));
        assert!(!f.allows(None));
    }

    #[test]
    fn blacklist_drops_hits() {
        let f = filter(&["spam"], FilterMode::Blacklist, false);
        assert!(!f.allows(Some("SPAM offer")));
        assert!(f.allows(Some("regular post")));
        assert!(f.allows(None));
    }

    #[test]
    fn case_sensitive_matching() {
        let f = filter(&["Rust"], FilterMode::Whitelist, true);
        assert!(f.allows(Some("Rust news")));
        assert!(!f.allows(Some("rust news")));
    }
}
