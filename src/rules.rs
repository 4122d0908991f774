//! Rule engine: a pure predicate deciding whether a parsed message matches
//! a forwarding rule. No I/O, no mutable state — the scheduler evaluates
//! this once per active rule per fetched message.

use crate::codec::ParsedMessage;
use crate::config::Rule;

/// True if `message` satisfies `rule`.
///
/// An empty filter list matches everything for that dimension: a rule with
/// no `senders` matches any From address, a rule with no `subject_keywords`
/// matches any subject. Both dimensions must match (AND, not OR). Matching
/// is substring, case-insensitive.
pub fn matches(message: &ParsedMessage, rule: &Rule) -> bool {
    if !rule.active {
        return false;
    }

    let from_ok = rule.senders.is_empty()
        || rule
            .senders
            .iter()
            .any(|s| contains_ignore_case(&message.from, s));

    let subject_ok = rule.subject_keywords.is_empty()
        || rule
            .subject_keywords
            .iter()
            .any(|k| contains_ignore_case(&message.subject, k));

    from_ok && subject_ok
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.to_lowercase().contains(&needle.to_lowercase())
}
