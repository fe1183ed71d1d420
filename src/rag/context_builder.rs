//! RAG Context Builder.
//!
//! Formats reranked passages into the context block handed to the answer
//! generator and records which passages made it in.

use serde::{Deserialize, Serialize};

use super::types::{ScoredPassage, SourceExcerpt};
use crate::core::config::settings::ContextSettings;

const PASSAGE_SEPARATOR: &str = "\n\n";

/// Configuration for context building.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBuilderConfig {
    /// Maximum total context length in characters
    pub max_chars: usize,
    /// Whether to prefix each passage with a citation header
    pub include_citations: bool,
}

impl Default for ContextBuilderConfig {
    fn default() -> Self {
        Self {
            max_chars: 8000,
            include_citations: false,
        }
    }
}

impl From<&ContextSettings> for ContextBuilderConfig {
    fn from(settings: &ContextSettings) -> Self {
        Self {
            max_chars: settings.max_chars,
            include_citations: settings.include_citations,
        }
    }
}

/// Rank-ordered context plus the passages that contributed to it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankedContext {
    pub text: String,
    pub passage_ids: Vec<String>,
    pub sources: Vec<SourceExcerpt>,
}

impl RankedContext {
    pub fn is_empty(&self) -> bool {
        self.passage_ids.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    config: ContextBuilderConfig,
}

impl ContextBuilder {
    pub fn new(config: ContextBuilderConfig) -> Self {
        Self { config }
    }

    /// Joins passages in rank order. The first passage is always kept; later
    /// ones only while the result stays within `max_chars`.
    pub fn build(&self, ranked: &[ScoredPassage]) -> RankedContext {
        let mut context = RankedContext::default();
        let mut length = 0;

        for (i, scored) in ranked.iter().enumerate() {
            let block = self.format_passage(i, scored);
            let block_len = block.chars().count();
            let separator_len = if i == 0 { 0 } else { PASSAGE_SEPARATOR.len() };

            if i > 0 && length + separator_len + block_len > self.config.max_chars {
                break;
            }

            if i > 0 {
                context.text.push_str(PASSAGE_SEPARATOR);
            }
            context.text.push_str(&block);
            length += separator_len + block_len;

            context.passage_ids.push(scored.passage.id.clone());
            context.sources.push(SourceExcerpt::from_scored(scored));
        }

        context
    }

    fn format_passage(&self, index: usize, scored: &ScoredPassage) -> String {
        if self.config.include_citations {
            format!(
                "[{}] (passage: {}, relevance: {:.2})\n{}",
                index + 1,
                scored.passage.id,
                scored.score,
                scored.passage.text
            )
        } else {
            scored.passage.text.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::types::{Metadata, Passage};

    fn scored(id: &str, text: &str, score: f32) -> ScoredPassage {
        ScoredPassage {
            passage: Passage {
                id: id.to_string(),
                text: text.to_string(),
                metadata: Metadata::new(),
            },
            score,
        }
    }

    #[test]
    fn joins_passages_in_rank_order() {
        let builder = ContextBuilder::default();
        let context = builder.build(&[
            scored("a", "The sky is blue.", 0.9),
            scored("b", "Grass is green.", 0.5),
        ]);

        assert_eq!(context.text, "The sky is blue.\n\nGrass is green.");
        assert_eq!(context.passage_ids, vec!["a", "b"]);
        assert_eq!(context.sources.len(), 2);
        assert_eq!(context.sources[0].excerpt, "The sky is blue.");
    }

    #[test]
    fn respects_max_chars_but_keeps_first_passage() {
        let builder = ContextBuilder::new(ContextBuilderConfig {
            max_chars: 10,
            include_citations: false,
        });
        let context = builder.build(&[
            scored("a", "a passage longer than the bound", 0.9),
            scored("b", "tiny", 0.5),
        ]);

        assert_eq!(context.text, "a passage longer than the bound");
        assert_eq!(context.passage_ids, vec!["a"]);
        assert_eq!(context.sources.len(), 1);
    }

    #[test]
    fn stops_adding_at_the_bound() {
        let builder = ContextBuilder::new(ContextBuilderConfig {
            max_chars: 12,
            include_citations: false,
        });
        // "aaaa" + "\n\n" + "bbbb" = 10, adding "\n\ncccc" would be 16.
        let context = builder.build(&[
            scored("a", "aaaa", 0.9),
            scored("b", "bbbb", 0.8),
            scored("c", "cccc", 0.7),
        ]);
        assert_eq!(context.passage_ids, vec!["a", "b"]);
        assert!(context.text.chars().count() <= 12);
    }

    #[test]
    fn citations_carry_rank_id_and_score() {
        let builder = ContextBuilder::new(ContextBuilderConfig {
            max_chars: 1000,
            include_citations: true,
        });
        let context = builder.build(&[scored("p-1", "The sky is blue.", 0.87)]);
        assert_eq!(context.text, "[1] (passage: p-1, relevance: 0.87)\nThe sky is blue.");
    }

    #[test]
    fn empty_input_builds_empty_context() {
        let context = ContextBuilder::default().build(&[]);
        assert!(context.is_empty());
        assert!(context.text.is_empty());
    }
}
