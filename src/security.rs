//! First-pass screening of user text before it is sent to the model.
//!
//! The denylist only catches the most blatant markers. It is advisory and must
//! not be treated as a security boundary.

use log::warn;
use once_cell::sync::Lazy;
use regex::{ Regex, RegexBuilder };

pub const MAX_MESSAGE_CHARS: usize = 2000;

pub const REASON_TOO_LONG: &str = "message too long";
pub const REASON_MALICIOUS: &str = "potentially malicious request detected";
pub const REASON_DANGEROUS_PATTERN: &str = "potentially dangerous code pattern detected";

const INTENT_KEYWORDS: &[&str] = &["hack", "crack", "exploit", "vulnerability"];

const BLOCKED_PATTERNS: &[&str] = &[
    // SQL statements
    r"(SELECT|INSERT|UPDATE|DELETE).*FROM",
    // scraping / network fetch
    r"requests\.get\(|urllib\.request|selenium",
    // code injection
    r"exec\(|eval\(|os\.(system|popen)",
    // executables
    r"\.exe|\.dll|\.bat|\.sh",
    // destructive commands
    r"(rm|rmdir|del|format).*-rf",
];

static COMPILED_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    BLOCKED_PATTERNS.iter()
        .filter_map(|p| RegexBuilder::new(p).case_insensitive(true).build().ok())
        .collect()
});

static CODE_REQUEST_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\b(código|programar|script|función|analizar datos)\b",
        r"\b(pandas|numpy|matplotlib|seaborn|python|ml|machine learning)\b",
        r"\b(gráfico|gráfica|visualización|plot|predict|entrenar)\b",
    ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub accepted: bool,
    pub reason: String,
}

impl ValidationResult {
    fn accept() -> Self {
        Self { accepted: true, reason: String::new() }
    }

    fn reject(reason: &str) -> Self {
        Self { accepted: false, reason: reason.to_string() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SecurityValidator;

impl SecurityValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, message: &str) -> ValidationResult {
        let length = message.chars().count();
        if length > MAX_MESSAGE_CHARS {
            warn!("Rejected message of {} chars (limit {})", length, MAX_MESSAGE_CHARS);
            return ValidationResult::reject(REASON_TOO_LONG);
        }

        let lower = message.to_lowercase();
        if let Some(keyword) = INTENT_KEYWORDS.iter().find(|k| lower.contains(*k)) {
            warn!("Rejected message containing intent keyword '{}'", keyword);
            return ValidationResult::reject(REASON_MALICIOUS);
        }

        if let Some(pattern) = COMPILED_PATTERNS.iter().find(|re| re.is_match(message)) {
            warn!("Rejected message matching blocked pattern '{}'", pattern.as_str());
            return ValidationResult::reject(REASON_DANGEROUS_PATTERN);
        }

        ValidationResult::accept()
    }
}

/// Whether the text asks for code, plotting or model training.
pub fn is_code_request(message: &str) -> bool {
    let lower = message.to_lowercase();
    CODE_REQUEST_PATTERNS.iter().any(|re| re.is_match(&lower))
}
