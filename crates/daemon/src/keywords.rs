//! Keyword rules deciding which shows are recorded.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Errors loading the keyword rules file.
#[derive(Debug, Error)]
pub enum KeywordsError {
    #[error("Failed to read keywords file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse keywords file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// One operator-defined rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PreferenceRule {
    /// Any of these appearing in the show name is a match
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Any of these appearing in the show name vetoes the rule
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub pre_minutes: i64,
    #[serde(default)]
    pub post_minutes: i64,
    #[serde(default)]
    pub quality_pref: Vec<String>,
    #[serde(default)]
    pub lang_pref: Vec<String>,
    #[serde(default)]
    pub channel_pref: Vec<String>,
    #[serde(default)]
    pub category_pref: Vec<String>,
}

/// Result of matching a show name.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordMatch {
    pub rule: PreferenceRule,
    /// The keyword that matched
    pub keyword: String,
    /// Rule position, lower is more important
    pub priority: usize,
}

/// Decides whether a show should be recorded.
pub trait KeywordMatcher: Send + Sync {
    fn find_match(&self, name: &str) -> Option<KeywordMatch>;
}

#[derive(Debug, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<PreferenceRule>,
}

/// Ordered rule list loaded from a TOML file of `[[rules]]` tables.
#[derive(Debug, Clone, Default)]
pub struct KeywordRules {
    rules: Vec<PreferenceRule>,
}

impl KeywordRules {
    pub fn new(rules: Vec<PreferenceRule>) -> Self {
        Self { rules }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, KeywordsError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    pub fn parse_toml(content: &str) -> Result<Self, KeywordsError> {
        let file: RulesFile = toml::from_str(content)?;
        Ok(Self::new(file.rules))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl KeywordMatcher for KeywordRules {
    /// The longest matching keyword wins; ties go to the earlier rule.
    fn find_match(&self, name: &str) -> Option<KeywordMatch> {
        let lower = name.to_lowercase();
        let mut best: Option<(usize, usize, &str)> = None;

        for (position, rule) in self.rules.iter().enumerate() {
            let excluded = rule
                .exclude
                .iter()
                .filter(|e| !e.trim().is_empty())
                .any(|e| lower.contains(&e.trim().to_lowercase()));
            if excluded {
                continue;
            }

            let longest = rule
                .keywords
                .iter()
                .map(|k| k.trim())
                .filter(|k| !k.is_empty() && lower.contains(&k.to_lowercase()))
                .max_by_key(|k| k.len());

            if let Some(keyword) = longest {
                let better = match best {
                    Some((len, _, _)) => keyword.len() > len,
                    None => true,
                };
                if better {
                    best = Some((keyword.len(), position, keyword));
                }
            }
        }

        best.map(|(_, position, keyword)| KeywordMatch {
            rule: self.rules[position].clone(),
            keyword: keyword.to_string(),
            priority: position,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_rules() -> KeywordRules {
        KeywordRules::parse_toml(
            r#"
[[rules]]
keywords = ["Premier League"]
exclude = ["Highlights"]
pre_minutes = 5
post_minutes = 30
quality_pref = ["720p++"]

[[rules]]
keywords = ["Premier League: Arsenal"]

[[rules]]
keywords = ["F1", "Formula 1"]
lang_pref = ["English"]
"#,
        )
        .expect("rules parse")
    }

    #[test]
    fn test_parse_rules() {
        let rules = create_test_rules();
        assert_eq!(rules.len(), 3);
        assert!(!rules.is_empty());
    }

    #[test]
    fn test_match_is_case_insensitive() {
        let rules = create_test_rules();
        let m = rules.find_match("formula 1: monaco grand prix").expect("match");
        assert_eq!(m.priority, 2);
        assert_eq!(m.keyword, "Formula 1");
    }

    #[test]
    fn test_longest_keyword_wins() {
        let rules = create_test_rules();
        let m = rules
            .find_match("Premier League: Arsenal v Chelsea")
            .expect("match");
        assert_eq!(m.priority, 1);
    }

    #[test]
    fn test_earlier_rule_wins_ties() {
        let rules = KeywordRules::new(vec![
            PreferenceRule {
                keywords: vec!["golf".into()],
                ..PreferenceRule::default()
            },
            PreferenceRule {
                keywords: vec!["golf".into()],
                pre_minutes: 9,
                ..PreferenceRule::default()
            },
        ]);
        let m = rules.find_match("PGA Golf").expect("match");
        assert_eq!(m.priority, 0);
        assert_eq!(m.rule.pre_minutes, 0);
    }

    #[test]
    fn test_exclude_vetoes_rule() {
        let rules = create_test_rules();
        assert!(rules.find_match("Premier League Highlights").is_none());
        // The second rule has no exclude list and still matches
        assert_eq!(
            rules
                .find_match("Premier League: Arsenal Highlights")
                .map(|m| m.priority),
            Some(1)
        );
    }

    #[test]
    fn test_no_match() {
        let rules = create_test_rules();
        assert!(rules.find_match("Cooking with Gas").is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keywords.toml");
        fs::write(&path, "[[rules]]\nkeywords = [\"NBA\"]\n").unwrap();
        let rules = KeywordRules::load(&path).unwrap();
        assert_eq!(rules.len(), 1);
        assert!(KeywordRules::load(dir.path().join("missing.toml")).is_err());
    }
}
