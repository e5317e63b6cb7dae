//! Lightweight analysis of natural-language queries.
//!
//! Pulls out the code-shaped entities a question mentions (identifiers,
//! environment variables, a file path, a quoted term) and tags it with the
//! intents it expresses. The retriever uses the identifiers for its symbol
//! boost; the response generator uses intents to shape the prompt.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    /// How to call something: functions, endpoints, signatures.
    Api,
    /// Installation, dependencies, configuration, environment.
    Setup,
    /// The implementation itself.
    Code,
    /// Explanations and guides.
    Documentation,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Api => "api",
            Intent::Setup => "setup",
            Intent::Code => "code",
            Intent::Documentation => "documentation",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static INTENT_PATTERNS: Lazy<Vec<(Intent, Regex)>> = Lazy::new(|| {
    [
        (
            Intent::Api,
            r"(?i)\b(api|endpoints?|functions?|methods?|signatures?|interfaces?|usage|call(s|ed|ing)?|parameters?|returns?)\b",
        ),
        (
            Intent::Setup,
            r"(?i)\b(set ?up|install\w*|requirements?|dependenc(y|ies)|packages?|configur\w*|config|environment|env|deploy\w*)\b",
        ),
        (
            Intent::Code,
            r"(?i)\b(implementation|implemented|implements?|code|source|internals?|show|examples?|files?)\b",
        ),
        (
            Intent::Documentation,
            r"(?i)\b(documentation|docs?|explain\w*|what is|purpose|guides?|tutorials?|how to|readme|overview)\b",
        ),
    ]
    .into_iter()
    .map(|(intent, pattern)| (intent, Regex::new(pattern).expect("Invalid regex")))
    .collect()
});

static QUESTION_WORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(what|how|why|when|where|which|can|does|is)\b").expect("Invalid regex")
});

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("Invalid regex"));

static ENV_VAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{?([A-Z_][A-Z0-9_]*)\}?|\b([A-Z][A-Z0-9]*(?:_[A-Z0-9]+)+)\b").expect("Invalid regex")
});

static FILE_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:^|[\s`'(])((?:[\w.-]+/)*[\w-]+\.(?:rs|py|js|jsx|ts|tsx|go|java|kt|rb|c|h|cpp|hpp|cs|swift|php|sh|md|rst|txt|toml|ya?ml|json|ini|cfg|env))\b",
    )
    .expect("Invalid regex")
});

static QUOTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([^"]+)"|'([^']+)'|`([^`]+)`"#).expect("Invalid regex"));

/// Words too common to count as identifiers.
const COMMON_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from", "how",
    "i", "in", "is", "it", "me", "of", "on", "or", "show", "that", "the", "this", "to", "use",
    "what", "when", "where", "which", "why", "with", "work", "works", "you",
];

/// Entities and intents found in one query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryAnalysis {
    /// Sorted, never empty; questions with no recognized intent are
    /// treated as documentation questions.
    pub intents: Vec<Intent>,
    /// Candidate symbol names in order of appearance, de-duplicated.
    pub identifiers: Vec<String>,
    pub env_vars: Vec<String>,
    pub file_path: Option<String>,
    pub quoted: Option<String>,
}

impl QueryAnalysis {
    pub fn has_intent(&self, intent: Intent) -> bool {
        self.intents.contains(&intent)
    }

    /// True when the query mentions `symbol` (case-insensitive). For
    /// qualified names like `Config::load` the last segment also counts.
    pub fn names_symbol(&self, symbol: &str) -> bool {
        let last = symbol.rsplit("::").next().unwrap_or(symbol);
        self.identifiers
            .iter()
            .any(|ident| ident.eq_ignore_ascii_case(symbol) || ident.eq_ignore_ascii_case(last))
    }
}

pub fn analyze_query(query: &str) -> QueryAnalysis {
    QueryAnalysis {
        intents: classify(query),
        identifiers: identifiers(query),
        env_vars: env_vars(query),
        file_path: FILE_PATH
            .captures(query)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string()),
        quoted: QUOTED.captures(query).and_then(|c| {
            (1..=3)
                .find_map(|i| c.get(i))
                .map(|m| m.as_str().trim().to_string())
        }),
    }
}

fn classify(query: &str) -> Vec<Intent> {
    let mut intents: Vec<Intent> = INTENT_PATTERNS
        .iter()
        .filter(|(_, re)| re.is_match(query))
        .map(|(intent, _)| *intent)
        .collect();
    if QUESTION_WORD.is_match(query) && !intents.contains(&Intent::Documentation) {
        intents.push(Intent::Documentation);
    }
    if intents.is_empty() {
        intents.push(Intent::Documentation);
    }
    intents.sort();
    intents
}

fn identifiers(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    IDENTIFIER
        .find_iter(query)
        .map(|m| m.as_str())
        .filter(|word| word.len() >= 2)
        .filter(|word| !COMMON_WORDS.contains(&word.to_ascii_lowercase().as_str()))
        .filter(|word| seen.insert(word.to_string()))
        .map(str::to_string)
        .collect()
}

fn env_vars(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    ENV_VAR
        .captures_iter(query)
        .filter_map(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str().to_string())
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers_skip_common_words() {
        let a = analyze_query("How does parse_manifest() work with ConfigLoader?");
        assert_eq!(a.identifiers, vec!["parse_manifest", "ConfigLoader"]);
    }

    #[test]
    fn test_names_symbol_case_insensitive_and_qualified() {
        let a = analyze_query("where is configloader::load defined");
        assert!(a.names_symbol("ConfigLoader"));
        assert!(a.names_symbol("Settings::load"));
        assert!(!a.names_symbol("unload"));
    }

    #[test]
    fn test_env_vars_and_file_path() {
        let a = analyze_query("Which code in src/db/pool.rs reads DATABASE_URL or ${REDIS_HOST}?");
        assert_eq!(a.env_vars, vec!["DATABASE_URL", "REDIS_HOST"]);
        assert_eq!(a.file_path.as_deref(), Some("src/db/pool.rs"));
        assert!(a.has_intent(Intent::Code));
    }

    #[test]
    fn test_intents() {
        let setup = analyze_query("install dependencies");
        assert_eq!(setup.intents, vec![Intent::Setup]);

        let api = analyze_query("what parameters does connect take");
        assert!(api.has_intent(Intent::Api));
        assert!(api.has_intent(Intent::Documentation));

        let bare = analyze_query("tokenizer");
        assert_eq!(bare.intents, vec![Intent::Documentation]);
    }

    #[test]
    fn test_quoted_term() {
        let a = analyze_query("find `retry_budget` usage");
        assert_eq!(a.quoted.as_deref(), Some("retry_budget"));
    }
}
