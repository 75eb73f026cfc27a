//! Artifact extraction from finalized assistant messages.

use std::collections::VecDeque;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use siteline_models::{Artifact, ArtifactKind};
use uuid::Uuid;

use crate::config::DEFAULT_MAX_ARTIFACTS;

const DEFAULT_LANGUAGE: &str = "plaintext";

static FENCED_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"```([A-Za-z0-9_+#.-]*)[ \t]*\r?\n?([\s\S]*?)```").expect("valid fence regex")
});

/// Extract fenced code regions from `text`.
///
/// Empty regions are skipped, and a region whose `(content, language)`
/// matches one already extracted in this call is dropped.
pub fn extract_artifacts(text: &str, message_id: &str, model: Option<&str>) -> Vec<Artifact> {
    let mut artifacts: Vec<Artifact> = Vec::new();

    for caps in FENCED_BLOCK.captures_iter(text) {
        let content = caps.get(2).map_or("", |m| m.as_str()).trim();
        if content.is_empty() {
            continue;
        }

        let language = caps
            .get(1)
            .map(|m| m.as_str().to_ascii_lowercase())
            .filter(|lang| !lang.is_empty())
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());

        let artifact = Artifact {
            id: Uuid::new_v4().to_string(),
            kind: kind_for(&language),
            title: title_for(&language),
            language: Some(language),
            content: content.to_string(),
            message_id: Some(message_id.to_string()),
            created_at: Utc::now(),
            model_used: model.map(str::to_string),
        };

        if artifacts.iter().any(|existing| existing.same_body(&artifact)) {
            continue;
        }
        artifacts.push(artifact);
    }

    artifacts
}

fn kind_for(language: &str) -> ArtifactKind {
    match language {
        "markdown" | "md" => ArtifactKind::Document,
        _ => ArtifactKind::Code,
    }
}

fn title_for(language: &str) -> String {
    let mut chars = language.chars();
    let capitalized = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
        None => String::new(),
    };
    format!("{capitalized} code")
}

/// FIFO-bounded artifact list.
#[derive(Debug, Clone)]
pub struct ArtifactLog {
    artifacts: VecDeque<Artifact>,
    max_artifacts: usize,
}

impl Default for ArtifactLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ARTIFACTS)
    }
}

impl ArtifactLog {
    pub fn new(max_artifacts: usize) -> Self {
        Self {
            artifacts: VecDeque::new(),
            max_artifacts,
        }
    }

    /// Insert new artifacts, skipping bodies already in the log.
    ///
    /// Returns how many were inserted.
    pub fn extend(&mut self, artifacts: Vec<Artifact>) -> usize {
        let mut inserted = 0;
        for artifact in artifacts {
            if self.artifacts.iter().any(|a| a.same_body(&artifact)) {
                continue;
            }
            self.artifacts.push_back(artifact);
            inserted += 1;
        }
        self.truncate(self.max_artifacts);
        inserted
    }

    /// Drop the oldest artifacts until at most `max` remain.
    pub fn truncate(&mut self, max: usize) -> usize {
        let excess = self.artifacts.len().saturating_sub(max);
        self.artifacts.drain(..excess);
        excess
    }

    pub fn artifacts(&self) -> Vec<Artifact> {
        self.artifacts.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn max_artifacts(&self) -> usize {
        self.max_artifacts
    }

    pub fn clear(&mut self) {
        self.artifacts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_language_and_title() {
        let text = "Here is the query:\n```sql\nSELECT * FROM sites WHERE zoning = 'R2';\n```\nDone.";
        let artifacts = extract_artifacts(text, "msg-1", Some("gpt-4o"));

        assert_eq!(artifacts.len(), 1);
        let artifact = &artifacts[0];
        assert_eq!(artifact.language.as_deref(), Some("sql"));
        assert_eq!(artifact.title, "Sql code");
        assert_eq!(artifact.kind, ArtifactKind::Code);
        assert_eq!(
            artifact.content,
            "SELECT * FROM sites WHERE zoning = 'R2';"
        );
        assert_eq!(artifact.message_id.as_deref(), Some("msg-1"));
        assert_eq!(artifact.model_used.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn test_untagged_block_defaults_to_plaintext() {
        let artifacts = extract_artifacts("```\nnoi = rent - opex\n```", "m", None);
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].language.as_deref(), Some("plaintext"));
        assert_eq!(artifacts[0].title, "Plaintext code");
    }

    #[test]
    fn test_identical_blocks_deduplicated() {
        let text = "```python\nprint(cap_rate)\n```\nagain:\n```python\nprint(cap_rate)\n```";
        assert_eq!(extract_artifacts(text, "m", None).len(), 1);
    }

    #[test]
    fn test_same_content_different_language_kept() {
        let text = "```js\nx = 1\n```\n```python\nx = 1\n```";
        assert_eq!(extract_artifacts(text, "m", None).len(), 2);
    }

    #[test]
    fn test_empty_blocks_skipped() {
        let text = "```rust\n   \n```\nand ```\n```";
        assert!(extract_artifacts(text, "m", None).is_empty());
    }

    #[test]
    fn test_markdown_is_document() {
        let artifacts = extract_artifacts("```markdown\n# Site report\n```", "m", None);
        assert_eq!(artifacts[0].kind, ArtifactKind::Document);
    }

    #[test]
    fn test_no_fences_no_artifacts() {
        assert!(extract_artifacts("Cap rates rose 25bps.", "m", None).is_empty());
    }

    #[test]
    fn test_log_evicts_oldest_first() {
        let mut log = ArtifactLog::new(2);
        for n in 0..3 {
            let text = format!("```python\nprint({n})\n```");
            log.extend(extract_artifacts(&text, "m", None));
        }

        let contents: Vec<String> = log.artifacts().into_iter().map(|a| a.content).collect();
        assert_eq!(contents, vec!["print(1)", "print(2)"]);
    }

    #[test]
    fn test_log_skips_bodies_already_present() {
        let mut log = ArtifactLog::new(10);
        let text = "```python\nprint(1)\n```";
        assert_eq!(log.extend(extract_artifacts(text, "m1", None)), 1);
        assert_eq!(log.extend(extract_artifacts(text, "m2", None)), 0);
        assert_eq!(log.len(), 1);
    }
}
