//! Business schemas for summarizer and judge outputs.
//!
//! These are the shapes the LLM collaborators are prompted to produce. Merge
//! semantics live here, next to the schema they belong to, and are passed to
//! the envelope explicitly at the call site.

use serde::{Deserialize, Serialize};

/// One substantiveness rating with its justification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Substantive {
    pub rating: bool,
    pub explanation: String,
}

/// Free-text summary, the original pilot output shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SummaryV0 {
    pub summary: String,
}

/// Structured impact summary of one ToS diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Summary {
    pub legally_substantive: Substantive,
    pub practically_substantive: Substantive,
    pub change_keywords: Vec<String>,
    pub subject_keywords: Vec<String>,
}

impl Summary {
    /// Field-wise merge of two summary chunks: ratings OR together,
    /// explanations concatenate, keyword lists append without duplicates.
    pub fn merge(a: Summary, b: Summary) -> Summary {
        Summary {
            legally_substantive: merge_substantive(a.legally_substantive, b.legally_substantive),
            practically_substantive: merge_substantive(
                a.practically_substantive,
                b.practically_substantive,
            ),
            change_keywords: merge_keywords(a.change_keywords, b.change_keywords),
            subject_keywords: merge_keywords(a.subject_keywords, b.subject_keywords),
        }
    }
}

fn merge_substantive(a: Substantive, b: Substantive) -> Substantive {
    let explanation = if a.rating == b.rating || b.rating {
        // Keep the explanation that justifies the winning rating last.
        format!("{} {}", a.explanation, b.explanation)
    } else {
        a.explanation
    };
    Substantive { rating: a.rating || b.rating, explanation: explanation.trim().to_string() }
}

fn merge_keywords(mut a: Vec<String>, b: Vec<String>) -> Vec<String> {
    for word in b {
        if !a.contains(&word) {
            a.push(word);
        }
    }
    a
}

/// Verdict on whether a summary faithfully reflects the underlying diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Judgement {
    pub practically_substantive: JudgeRating,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JudgeRating {
    pub rating: bool,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn substantive(rating: bool, explanation: &str) -> Substantive {
        Substantive { rating, explanation: explanation.into() }
    }

    #[test]
    fn merge_ors_ratings() {
        let a = Summary {
            legally_substantive: substantive(false, "nothing legal"),
            practically_substantive: substantive(true, "pricing changed"),
            change_keywords: vec!["pricing".into()],
            subject_keywords: vec!["billing".into()],
        };
        let b = Summary {
            legally_substantive: substantive(true, "arbitration added"),
            practically_substantive: substantive(false, "cosmetic"),
            change_keywords: vec!["arbitration".into(), "pricing".into()],
            subject_keywords: vec!["disputes".into()],
        };

        let merged = Summary::merge(a, b);
        assert!(merged.legally_substantive.rating);
        assert!(merged.practically_substantive.rating);
        assert!(merged.legally_substantive.explanation.contains("arbitration added"));
        // Deduplicated, order preserved.
        assert_eq!(merged.change_keywords, vec!["pricing", "arbitration"]);
        assert_eq!(merged.subject_keywords, vec!["billing", "disputes"]);
    }

    #[test]
    fn summary_rejects_unknown_fields() {
        let raw = r#"{
            "legally_substantive": {"rating": true, "explanation": "x"},
            "practically_substantive": {"rating": false, "explanation": "y"},
            "change_keywords": [],
            "subject_keywords": [],
            "chunk_index": 2
        }"#;
        // Chunking fields never leak into the business schema.
        assert!(serde_json::from_str::<Summary>(raw).is_err());
    }

    #[test]
    fn judgement_deserializes() {
        let raw = r#"{"practically_substantive": {"rating": true, "reason": "matches diff"}}"#;
        let j: Judgement = serde_json::from_str(raw).unwrap();
        assert!(j.practically_substantive.rating);
    }
}
