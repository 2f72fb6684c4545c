//! Entry ID generation and resolution
//!
//! All IDs use the format: `{6-digit-seq}-{slug}`
//! Example: `000042-fix-the-login-bug`
//!
//! The zero-padded sequence prefix makes IDs sort in submission order.

use std::collections::HashMap;

/// Maximum number of words kept in the slug
const SLUG_WORDS: usize = 5;

/// Generate an entry ID from its store sequence number and content
pub fn generate_id(seq: u64, content: &str) -> String {
    let slug = slugify(content);
    if slug.is_empty() {
        format!("{:06}-prompt", seq)
    } else {
        format!("{:06}-{}", seq, slug)
    }
}

/// Slugify content for use in IDs
fn slugify(content: &str) -> String {
    content
        .to_lowercase()
        .chars()
        // Strip apostrophes entirely, replace other non-alphanumeric with hyphens
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() {
                Some(c)
            } else if c == '\'' || c == '\u{2019}' || c == '\u{2018}' {
                None
            } else {
                Some('-')
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .take(SLUG_WORDS)
        .collect::<Vec<_>>()
        .join("-")
}

/// ID resolution for partial matches
pub struct IdResolver<'a> {
    ids: &'a HashMap<String, String>, // id -> display name
}

impl<'a> IdResolver<'a> {
    pub fn new(ids: &'a HashMap<String, String>) -> Self {
        Self { ids }
    }

    /// Resolve a partial reference to a full ID
    ///
    /// Returns:
    /// - Ok(Some(id)) if exactly one match
    /// - Ok(None) if no matches
    /// - Err with candidates if ambiguous
    pub fn resolve(&self, reference: &str) -> Result<Option<String>, Vec<String>> {
        if self.ids.contains_key(reference) {
            return Ok(Some(reference.to_string()));
        }

        let mut matches: Vec<String> = self
            .ids
            .keys()
            .filter(|id| Self::matches(id, reference))
            .cloned()
            .collect();
        matches.sort();

        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            _ => Err(matches),
        }
    }

    /// Check if an ID matches a reference
    fn matches(id: &str, reference: &str) -> bool {
        // Sequence prefix match
        if id.starts_with(reference) {
            return true;
        }

        // Slug contains match
        if let Some(slug_start) = id.find('-') {
            let slug_part = &id[slug_start + 1..];
            if slug_part.contains(reference) {
                return true;
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id() {
        let id = generate_id(42, "Fix the login bug in auth.rs please now");
        assert_eq!(id, "000042-fix-the-login-bug-in");
    }

    #[test]
    fn test_generate_id_without_words() {
        assert_eq!(generate_id(7, "???"), "000007-prompt");
    }

    #[test]
    fn test_ids_sort_by_sequence() {
        let a = generate_id(9, "zzz");
        let b = generate_id(10, "aaa");
        assert!(a < b);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Hello World"), "hello-world");
        assert_eq!(slugify("Add OAuth!"), "add-oauth");
        assert_eq!(slugify("Multiple   Spaces"), "multiple-spaces");
        assert_eq!(slugify("here's a test"), "heres-a-test");
    }

    #[test]
    fn test_id_resolver_prefix_and_slug() {
        let mut ids = HashMap::new();
        ids.insert("000001-add-oauth".to_string(), "Add OAuth".to_string());
        ids.insert("000002-oauth-db".to_string(), "OAuth DB".to_string());

        let resolver = IdResolver::new(&ids);
        assert_eq!(resolver.resolve("000001").unwrap(), Some("000001-add-oauth".to_string()));
        assert_eq!(resolver.resolve("oauth-db").unwrap(), Some("000002-oauth-db".to_string()));
        assert_eq!(resolver.resolve("nothing").unwrap(), None);
    }

    #[test]
    fn test_id_resolver_ambiguous() {
        let mut ids = HashMap::new();
        ids.insert("000001-add-oauth".to_string(), "Add OAuth".to_string());
        ids.insert("000002-oauth-db".to_string(), "OAuth DB".to_string());

        let resolver = IdResolver::new(&ids);
        let candidates = resolver.resolve("oauth").unwrap_err();
        assert_eq!(candidates.len(), 2);
    }
}
