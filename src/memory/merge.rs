//! Deterministic content merge strategies
//!
//! `smart_merge` uses a length heuristic: longer content is assumed to be a
//! superset of shorter content. It has no semantic understanding; callers
//! select behaviour through [`MergeStrategy`].

use crate::types::{Memory, MergeStrategy};
use chrono::{DateTime, Utc};

/// Title, content and tags produced by a merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedContent {
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
}

/// Merge an incoming title/content/tags into an existing memory
pub fn merge_content(
    existing: &Memory,
    incoming_title: &str,
    incoming_content: &str,
    incoming_tags: &[String],
    strategy: MergeStrategy,
) -> MergedContent {
    let tags = merge_tags(&existing.tags, incoming_tags);
    let (title, content) = match strategy {
        MergeStrategy::LatestWins => (incoming_title.to_string(), incoming_content.to_string()),
        MergeStrategy::Append => {
            let separator = format!(
                "\n\n---\n[Updated {}]\n\n",
                Utc::now().format("%Y-%m-%d")
            );
            (
                longer(&existing.title, incoming_title),
                format!("{}{}{}", existing.content, separator, incoming_content),
            )
        }
        MergeStrategy::SmartMerge => {
            if incoming_content.len() >= existing.content.len() {
                (incoming_title.to_string(), incoming_content.to_string())
            } else {
                (
                    longer(&existing.title, incoming_title),
                    format!("{}\n\n{}", existing.content, incoming_content),
                )
            }
        }
    };
    MergedContent {
        title,
        content,
        tags,
    }
}

/// Fold `sources` into `target` in order
///
/// Replacement decisions compare against a running timestamp that starts at
/// the target's `updated_at` and advances whenever a source replaces the
/// accumulated content.
pub fn merge_multiple(target: &Memory, sources: &[&Memory], strategy: MergeStrategy) -> MergedContent {
    let mut title = target.title.clone();
    let mut content = target.content.clone();
    let mut tags = target.tags.clone();
    let mut latest: DateTime<Utc> = target.updated_at;

    for source in sources {
        match strategy {
            MergeStrategy::LatestWins => {
                if source.updated_at > latest {
                    title = source.title.clone();
                    content = source.content.clone();
                    latest = source.updated_at;
                }
            }
            MergeStrategy::Append => {
                content.push_str(&format!("\n\n---\n[Merged from {}]\n\n", source.id));
                content.push_str(&source.content);
            }
            MergeStrategy::SmartMerge => {
                if source.content.len() > content.len() && source.updated_at > latest {
                    title = source.title.clone();
                    content = source.content.clone();
                    latest = source.updated_at;
                } else if source.content != content {
                    content.push_str("\n\n");
                    content.push_str(&source.content);
                }
            }
        }
        tags = merge_tags(&tags, &source.tags);
    }

    MergedContent {
        title,
        content,
        tags,
    }
}

/// Ordered union: first-seen order, exact case-sensitive match
pub fn merge_tags(a: &[String], b: &[String]) -> Vec<String> {
    let mut result: Vec<String> = Vec::with_capacity(a.len() + b.len());
    for tag in a.iter().chain(b.iter()) {
        if !result.contains(tag) {
            result.push(tag.clone());
        }
    }
    result
}

pub fn max_importance(target: f32, sources: &[&Memory]) -> f32 {
    sources
        .iter()
        .map(|s| s.importance)
        .fold(target, f32::max)
}

fn longer(existing: &str, incoming: &str) -> String {
    if incoming.len() > existing.len() {
        incoming.to_string()
    } else {
        existing.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MemoryId, MemoryScope, MemoryState, MemoryType};
    use chrono::Duration;

    fn mem(title: &str, content: &str, tags: &[&str], updated_at: DateTime<Utc>) -> Memory {
        Memory {
            id: MemoryId::new(),
            title: title.to_string(),
            content: content.to_string(),
            summary: None,
            embedding: None,
            memory_type: MemoryType::General,
            scope: MemoryScope::Project,
            project_id: None,
            agent_source: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            importance: 0.5,
            ttl_seconds: None,
            access_count: 0,
            created_at: updated_at,
            updated_at,
            expires_at: None,
            version: 1,
            merged_from: vec![],
            state: MemoryState::Active,
        }
    }

    #[test]
    fn test_append_keeps_both_with_separator() {
        let now = Utc::now();
        let target = mem("A", "A.", &[], now);
        let source = mem("B", "B.", &[], now);
        let merged = merge_multiple(&target, &[&source], MergeStrategy::Append);
        assert!(merged.content.starts_with("A."));
        assert!(merged.content.ends_with("B."));
        assert!(merged.content.contains(&format!("[Merged from {}]", source.id)));
    }

    #[test]
    fn test_latest_wins_takes_newer_source() {
        let now = Utc::now();
        let target = mem("A", "A", &[], now - Duration::hours(1));
        let source = mem("B", "B", &[], now);
        let merged = merge_multiple(&target, &[&source], MergeStrategy::LatestWins);
        assert_eq!(merged.content, "B");
        assert_eq!(merged.title, "B");
    }

    #[test]
    fn test_latest_wins_uses_running_timestamp() {
        let now = Utc::now();
        let target = mem("T", "T", &[], now - Duration::hours(3));
        let newest = mem("N", "N", &[], now);
        let middle = mem("M", "M", &[], now - Duration::hours(1));
        let merged = merge_multiple(&target, &[&newest, &middle], MergeStrategy::LatestWins);
        assert_eq!(merged.content, "N");
    }

    #[test]
    fn test_smart_merge_multiple() {
        let now = Utc::now();
        let target = mem("T", "short", &[], now - Duration::hours(1));
        let longer_newer = mem("L", "a much longer body of text", &[], now);
        let merged = merge_multiple(&target, &[&longer_newer], MergeStrategy::SmartMerge);
        assert_eq!(merged.content, "a much longer body of text");

        // Identical content is not appended twice
        let same = mem("S", "short", &[], now - Duration::hours(2));
        let merged = merge_multiple(&target, &[&same], MergeStrategy::SmartMerge);
        assert_eq!(merged.content, "short");

        // Older, different content is appended
        let older = mem("O", "other", &[], now - Duration::hours(2));
        let merged = merge_multiple(&target, &[&older], MergeStrategy::SmartMerge);
        assert_eq!(merged.content, "short\n\nother");
    }

    #[test]
    fn test_merge_content_strategies() {
        let existing = mem("Existing title", "existing content here", &["a"], Utc::now());
        let tags = vec!["b".to_string(), "a".to_string()];

        let merged = merge_content(&existing, "New", "new", &tags, MergeStrategy::LatestWins);
        assert_eq!((merged.title.as_str(), merged.content.as_str()), ("New", "new"));
        assert_eq!(merged.tags, vec!["a", "b"]);

        let merged = merge_content(&existing, "New", "new", &tags, MergeStrategy::Append);
        assert_eq!(merged.title, "Existing title");
        assert!(merged.content.starts_with("existing content here\n\n---\n[Updated "));
        assert!(merged.content.ends_with("]\n\nnew"));

        let merged = merge_content(&existing, "New", "new", &tags, MergeStrategy::SmartMerge);
        assert_eq!(merged.content, "existing content here\n\nnew");

        let long = "incoming content that is clearly longer";
        let merged = merge_content(&existing, "New", long, &tags, MergeStrategy::SmartMerge);
        assert_eq!(merged.content, long);
        assert_eq!(merged.title, "New");
    }

    #[test]
    fn test_merge_tags_case_sensitive_union() {
        let a = vec!["Rust".to_string(), "db".to_string()];
        let b = vec!["rust".to_string(), "db".to_string(), "Rust".to_string()];
        assert_eq!(merge_tags(&a, &b), vec!["Rust", "db", "rust"]);
    }

    #[test]
    fn test_max_importance() {
        let now = Utc::now();
        let mut high = mem("h", "h", &[], now);
        high.importance = 0.9;
        let low = mem("l", "l", &[], now);
        assert_eq!(max_importance(0.3, &[&high, &low]), 0.9);
        assert_eq!(max_importance(0.95, &[&high]), 0.95);
    }
}
