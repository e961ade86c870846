//! Keyword/pattern classification with evasion normalization.
//!
//! Rules are grouped by category, optionally tagged with a language, and
//! compiled once into a [`RuleIndex`]. Reload builds a complete new index and
//! swaps it in atomically, so readers never observe a half-updated rule set.

use crate::error::{Result, WatchdogError};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

fn default_severity() -> u32 {
    2
}

/// One entry in a rule file: either a bare keyword or a full spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleEntry {
    Word(String),
    Spec(RuleSpec),
}

/// Explicit rule spec with severity, language tag, and raw-regex flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub pattern: String,
    #[serde(default = "default_severity")]
    pub severity: u32,
    /// When set, `pattern` is compiled verbatim instead of as an escaped
    /// whole-word keyword.
    #[serde(default)]
    pub regex: bool,
    #[serde(default)]
    pub language: Option<String>,
}

/// On-disk rule set: category name to entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleFile(pub BTreeMap<String, Vec<RuleEntry>>);

impl RuleFile {
    /// Read a rule file from disk. A missing file yields the built-in
    /// defaults (first run); a malformed file is a configuration error.
    pub fn load(path: impl AsRef<Path>) -> Result<RuleFile> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                WatchdogError::Config(format!("rule file {}: {}", path.display(), e))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::info!(
                    "rule file {} not found, using built-in defaults",
                    path.display()
                );
                Ok(RuleFile::defaults())
            }
            Err(err) => Err(WatchdogError::Config(format!(
                "rule file {}: {}",
                path.display(),
                err
            ))),
        }
    }

    /// Built-in rule set used when no rule file exists yet.
    pub fn defaults() -> RuleFile {
        let mut categories = BTreeMap::new();
        categories.insert(
            "scam".to_string(),
            vec![
                word("free money", 4),
                word("crypto giveaway", 4),
                word("claim your prize", 3),
                word("investment opportunity", 2),
                word("double your bitcoin", 4),
            ],
        );
        categories.insert(
            "adult_content".to_string(),
            vec![word("porn", 3), word("nsfw", 2), word("xxx", 3)],
        );
        categories.insert(
            "violence".to_string(),
            vec![word("kill you", 4), word("weapon", 2), word("execute", 2)],
        );
        categories.insert(
            "raid".to_string(),
            vec![RuleEntry::Spec(RuleSpec {
                pattern: r"(raid|flood|attack)\s+(this|the)\s+(chat|group)".to_string(),
                severity: 5,
                regex: true,
                language: None,
            })],
        );
        RuleFile(categories)
    }
}

fn word(keyword: &str, severity: u32) -> RuleEntry {
    RuleEntry::Spec(RuleSpec {
        pattern: keyword.to_string(),
        severity,
        regex: false,
        language: None,
    })
}

/// Report of a (re)load: how many rules compiled, which were skipped and why.
#[derive(Debug, Clone, Default)]
pub struct ReloadReport {
    pub loaded: usize,
    /// `(category/pattern, error)` pairs for rules that failed to compile.
    pub skipped: Vec<(String, String)>,
}

enum Matcher {
    /// Escaped whole-word regex over the raw text, plus a condensed form
    /// matched against the separator-stripped text. Keywords whose condensed
    /// form is too short to be distinctive match through the regex only.
    Keyword {
        whole_word: regex::Regex,
        condensed: Option<String>,
    },
    Pattern(regex::Regex),
}

struct CompiledRule {
    category: String,
    severity: u32,
    language: Option<String>,
    matcher: Matcher,
}

/// Immutable compiled rule set. Built wholesale, never mutated in place.
pub struct RuleIndex {
    rules: Vec<CompiledRule>,
}

impl RuleIndex {
    fn build(file: &RuleFile) -> (RuleIndex, ReloadReport) {
        let mut rules = Vec::new();
        let mut report = ReloadReport::default();

        for (category, entries) in &file.0 {
            for entry in entries {
                let spec = match entry {
                    RuleEntry::Word(w) => RuleSpec {
                        pattern: w.clone(),
                        severity: default_severity(),
                        regex: false,
                        language: None,
                    },
                    RuleEntry::Spec(s) => s.clone(),
                };
                match compile_rule(category, &spec) {
                    Ok(rule) => rules.push(rule),
                    Err(err) => {
                        report
                            .skipped
                            .push((format!("{}/{}", category, spec.pattern), err));
                    }
                }
            }
        }
        report.loaded = rules.len();
        (RuleIndex { rules }, report)
    }

    /// Match `text` against every applicable rule, returning matched
    /// categories with the highest severity seen per category.
    pub fn classify(&self, text: &str, language_hint: Option<&str>) -> Classification {
        let condensed = condense(text);
        let mut categories: BTreeMap<String, u32> = BTreeMap::new();

        for rule in &self.rules {
            if let (Some(lang), Some(hint)) = (&rule.language, language_hint) {
                if lang != hint {
                    continue;
                }
            }
            let hit = match &rule.matcher {
                Matcher::Keyword {
                    whole_word,
                    condensed: needle,
                } => {
                    whole_word.is_match(text)
                        || needle
                            .as_deref()
                            .is_some_and(|needle| condensed.contains(needle))
                }
                Matcher::Pattern(re) => re.is_match(text),
            };
            if hit {
                let slot = categories.entry(rule.category.clone()).or_insert(0);
                *slot = (*slot).max(rule.severity);
            }
        }
        Classification { categories }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn compile_rule(category: &str, spec: &RuleSpec) -> std::result::Result<CompiledRule, String> {
    let matcher = if spec.regex {
        let re = RegexBuilder::new(&spec.pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| e.to_string())?;
        Matcher::Pattern(re)
    } else {
        let escaped = regex::escape(spec.pattern.trim());
        let whole_word = RegexBuilder::new(&format!(r"\b{}\b", escaped))
            .case_insensitive(true)
            .build()
            .map_err(|e| e.to_string())?;
        let condensed = condense(&spec.pattern);
        if condensed.is_empty() {
            return Err(format!("keyword '{}' normalizes to nothing", spec.pattern));
        }
        Matcher::Keyword {
            whole_word,
            // A one- or two-character needle would match almost anything.
            condensed: (condensed.chars().count() >= 3).then_some(condensed),
        }
    };
    Ok(CompiledRule {
        category: category.to_string(),
        severity: spec.severity,
        language: spec.language.clone(),
        matcher,
    })
}

/// Aggressive evasion normalization: lowercase, strip every non-alphanumeric
/// character, and collapse repeat runs to a single character. Keywords are
/// condensed the same way at compile time, so "b-a-d-w-o-r-d", "baaadword",
/// and "freeeee moneyyyy" all collapse onto their plain forms.
pub fn condense(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev: Option<char> = None;
    for ch in text.chars().flat_map(|c| c.to_lowercase()) {
        if !ch.is_alphanumeric() {
            continue;
        }
        if Some(ch) == prev {
            continue;
        }
        out.push(ch);
        prev = Some(ch);
    }
    out
}

/// Result of classifying one text: category name to severity contribution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub categories: BTreeMap<String, u32>,
}

impl Classification {
    pub fn severity_total(&self) -> u32 {
        self.categories.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

/// Shared matcher handle. `classify` reads the current index snapshot;
/// `reload` swaps in a fully built replacement.
pub struct PatternMatcher {
    index: RwLock<Arc<RuleIndex>>,
}

impl PatternMatcher {
    /// Compile `file` into a fresh matcher. Individual bad rules are skipped
    /// and logged; compiling zero usable rules is fatal.
    pub fn load(file: &RuleFile) -> Result<PatternMatcher> {
        let (index, report) = RuleIndex::build(file);
        for (pattern, err) in &report.skipped {
            log::warn!("skipping rule {}: {}", pattern, err);
        }
        if index.is_empty() {
            return Err(WatchdogError::Config(
                "no usable rules compiled from the rule set".into(),
            ));
        }
        log::info!("compiled {} content rules", report.loaded);
        Ok(PatternMatcher {
            index: RwLock::new(Arc::new(index)),
        })
    }

    /// Build a replacement index from `file` and swap it in. The old index
    /// keeps serving classifications until the swap; a reload that compiles
    /// zero rules is rejected and leaves the current index untouched.
    pub fn reload(&self, file: &RuleFile) -> Result<ReloadReport> {
        let (index, report) = RuleIndex::build(file);
        for (pattern, err) in &report.skipped {
            log::warn!("skipping rule {}: {}", pattern, err);
        }
        if index.is_empty() {
            return Err(WatchdogError::Config(
                "reload produced no usable rules, keeping previous set".into(),
            ));
        }
        *self.index.write().expect("rule index lock poisoned") = Arc::new(index);
        Ok(report)
    }

    pub fn classify(&self, text: &str, language_hint: Option<&str>) -> Classification {
        let index = self
            .index
            .read()
            .expect("rule index lock poisoned")
            .clone();
        index.classify(text, language_hint)
    }

    pub fn rule_count(&self) -> usize {
        self.index.read().expect("rule index lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher_with(category: &str, entries: Vec<RuleEntry>) -> PatternMatcher {
        let mut map = BTreeMap::new();
        map.insert(category.to_string(), entries);
        PatternMatcher::load(&RuleFile(map)).unwrap()
    }

    #[test]
    fn matches_keyword_case_insensitively() {
        let matcher = matcher_with("scam", vec![word("free money", 4)]);
        let result = matcher.classify("FREE MONEY here", None);
        assert_eq!(result.categories.get("scam"), Some(&4));
    }

    #[test]
    fn separator_evasion_still_matches() {
        let matcher = matcher_with("profanity", vec![word("badword", 3)]);
        assert!(matcher.classify("a perfectly fine message", None).is_empty());
        let result = matcher.classify("b-a-d-w-o-r-d", None);
        assert_eq!(result.categories.get("profanity"), Some(&3));
    }

    #[test]
    fn repeated_character_evasion_still_matches() {
        let matcher = matcher_with("profanity", vec![word("badword", 3)]);
        let result = matcher.classify("baaaadword", None);
        assert_eq!(result.categories.get("profanity"), Some(&3));
    }

    #[test]
    fn language_tagged_rule_skipped_on_other_hint() {
        let spec = RuleEntry::Spec(RuleSpec {
            pattern: "verboten".to_string(),
            severity: 2,
            regex: false,
            language: Some("de".to_string()),
        });
        let matcher = matcher_with("profanity", vec![spec]);
        assert!(matcher.classify("verboten", Some("en")).is_empty());
        assert!(!matcher.classify("verboten", Some("de")).is_empty());
        assert!(!matcher.classify("verboten", None).is_empty());
    }

    #[test]
    fn bad_rule_is_skipped_not_fatal() {
        let mut map = BTreeMap::new();
        map.insert(
            "broken".to_string(),
            vec![
                RuleEntry::Spec(RuleSpec {
                    pattern: "([unclosed".to_string(),
                    severity: 1,
                    regex: true,
                    language: None,
                }),
                word("stillworks", 2),
            ],
        );
        let matcher = PatternMatcher::load(&RuleFile(map)).unwrap();
        assert_eq!(matcher.rule_count(), 1);
        assert!(!matcher.classify("stillworks", None).is_empty());
    }

    #[test]
    fn reload_swaps_atomically() {
        let matcher = matcher_with("old", vec![word("oldword", 2)]);
        let mut map = BTreeMap::new();
        map.insert("new".to_string(), vec![word("newword", 2)]);
        matcher.reload(&RuleFile(map)).unwrap();
        assert!(matcher.classify("oldword", None).is_empty());
        assert!(!matcher.classify("newword", None).is_empty());
    }

    #[test]
    fn reload_with_no_usable_rules_keeps_previous_index() {
        let matcher = matcher_with("scam", vec![word("free money", 4)]);
        let mut map = BTreeMap::new();
        map.insert(
            "broken".to_string(),
            vec![RuleEntry::Spec(RuleSpec {
                pattern: "([unclosed".to_string(),
                severity: 1,
                regex: true,
                language: None,
            })],
        );
        assert!(matcher.reload(&RuleFile(map)).is_err());
        assert!(!matcher.classify("free money", None).is_empty());
    }
}
