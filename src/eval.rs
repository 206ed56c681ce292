//! Retrieval evaluation: precision@k over labelled queries.
//!
//! The input is a JSON array:
//!
//! ```json
//! [{ "query": "Apa itu transaksi afiliasi?", "expected_source_ids": ["pojk/pojk-42-2020"] }]
//! ```
//!
//! For each case, precision is the share of distinct retrieved source ids
//! that are expected. Cases with no expected ids are reported but do not
//! count toward the mean. A case whose query is rejected scores zero.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

use crate::error::{RagError, Result};
use crate::pipeline::RagPipeline;

#[derive(Debug, Clone, Deserialize)]
pub struct EvalCase {
    pub query: String,
    #[serde(default)]
    pub expected_source_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseResult {
    pub query: String,
    pub retrieved_source_ids: Vec<String>,
    pub precision: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalReport {
    pub k: usize,
    pub num_queries: usize,
    pub precision_at_k_mean: f64,
    pub cases: Vec<CaseResult>,
}

pub fn load_cases(path: &Path) -> Result<Vec<EvalCase>> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| {
        RagError::InvalidConfiguration(format!("invalid eval file {}: {}", path.display(), e))
    })
}

/// Precision of `retrieved` against `expected`, or `None` when there is
/// nothing expected.
pub fn precision(retrieved: &BTreeSet<String>, expected: &BTreeSet<String>) -> Option<f64> {
    if expected.is_empty() {
        return None;
    }
    if retrieved.is_empty() {
        return Some(0.0);
    }
    Some(retrieved.intersection(expected).count() as f64 / retrieved.len() as f64)
}

pub async fn evaluate(pipeline: &RagPipeline, cases: &[EvalCase]) -> Result<EvalReport> {
    let mut results = Vec::with_capacity(cases.len());
    let mut scores = Vec::new();

    for case in cases {
        let expected: BTreeSet<String> = case.expected_source_ids.iter().cloned().collect();
        let (retrieved, error) = match pipeline.retrieve(&case.query).await {
            Ok(result) => (
                result
                    .hits
                    .iter()
                    .map(|h| h.source_id.clone())
                    .collect::<BTreeSet<_>>(),
                None,
            ),
            Err(e @ (RagError::EmptyIndex | RagError::EmbeddingBackend(_))) => return Err(e),
            Err(e) => (BTreeSet::new(), Some(e.code().to_string())),
        };

        let p = precision(&retrieved, &expected);
        if let Some(p) = p {
            scores.push(p);
        }
        results.push(CaseResult {
            query: case.query.clone(),
            retrieved_source_ids: retrieved.into_iter().collect(),
            precision: p,
            error,
        });
    }

    let mean = if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    };
    tracing::info!(k = pipeline.top_k(), mean, queries = cases.len(), "retrieval evaluation");

    Ok(EvalReport {
        k: pipeline.top_k(),
        num_queries: cases.len(),
        precision_at_k_mean: mean,
        cases: results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::pipeline::IngestMetadata;

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_precision() {
        assert_eq!(precision(&set(&["a", "b"]), &set(&["a"])), Some(0.5));
        assert_eq!(precision(&set(&[]), &set(&["a"])), Some(0.0));
        assert_eq!(precision(&set(&["a"]), &set(&[])), None);
    }

    #[test]
    fn test_load_cases_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cases.json");
        std::fs::write(&path, r#"[{"query": "a", "expected_source_ids": ["x"]}]"#).unwrap();
        assert_eq!(load_cases(&path).unwrap().len(), 1);

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_cases(&path), Err(RagError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_evaluate_scores_and_rejections() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::minimal(dir.path());
        config.retrieval.top_k = 1;
        let pipeline = RagPipeline::from_config(&config).await.unwrap();
        for (id, text) in [
            ("afiliasi", "transaksi afiliasi dengan pihak terafiliasi"),
            ("bencana", "rencana pemulihan bencana teknologi informasi"),
        ] {
            pipeline
                .ingest(
                    text.as_bytes(),
                    &format!("{}.txt", id),
                    IngestMetadata::trusted(),
                )
                .await
                .unwrap();
        }

        let cases = vec![
            EvalCase {
                query: "transaksi afiliasi".into(),
                expected_source_ids: vec!["afiliasi".into()],
            },
            EvalCase {
                query: "eval(1)".into(),
                expected_source_ids: vec!["afiliasi".into()],
            },
            EvalCase {
                query: "pemulihan bencana".into(),
                expected_source_ids: vec![],
            },
        ];
        let report = evaluate(&pipeline, &cases).await.unwrap();
        assert_eq!(report.num_queries, 3);
        assert_eq!(report.cases[0].precision, Some(1.0));
        assert_eq!(report.cases[1].error.as_deref(), Some("injection_detected"));
        assert_eq!(report.cases[2].precision, None);
        assert!((report.precision_at_k_mean - 0.5).abs() < 1e-9);
    }
}
