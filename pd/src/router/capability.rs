//! Capability inference from prompt text

use std::collections::BTreeSet;

/// Tags the router knows how to infer
pub const CAPABILITY_TAGS: [&str; 9] = [
    "code-review",
    "testing",
    "documentation",
    "refactoring",
    "debugging",
    "security",
    "performance",
    "design",
    "architecture",
];

const KEYWORDS: &[(&str, &[&str])] = &[
    ("code-review", &["review", "code review", "pull request", "critique"]),
    ("testing", &["test", "unit test", "coverage", "assert", "regression"]),
    ("documentation", &["document", "docs", "readme", "docstring", "comment"]),
    ("refactoring", &["refactor", "clean up", "cleanup", "restructure", "rename"]),
    ("debugging", &["debug", "bug", "fix", "error", "crash", "stack trace"]),
    ("security", &["security", "vulnerab", "auth", "injection", "xss", "secret"]),
    ("performance", &["performance", "optimiz", "slow", "latency", "profil", "benchmark"]),
    ("design", &["design", "ui", "ux", "layout", "mockup"]),
    ("architecture", &["architect", "system design", "scalab", "microservice", "module boundaries"]),
];

/// Capability tags whose keywords appear in `content`
pub fn infer_capabilities(content: &str) -> BTreeSet<String> {
    let words: Vec<String> = content
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect();
    let text = words.join(" ");

    KEYWORDS
        .iter()
        .filter(|(_, keywords)| {
            keywords.iter().any(|kw| {
                if kw.contains(' ') {
                    text.contains(kw)
                } else {
                    words.iter().any(|w| w.starts_with(kw))
                }
            })
        })
        .map(|(tag, _)| tag.to_string())
        .collect()
}
