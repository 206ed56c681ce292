//! In-process embedding with fastembed (ONNX Runtime bundled).
//!
//! The model is downloaded from Hugging Face on first use and cached; after
//! that no network access is needed. The loaded model is kept for the
//! lifetime of the backend.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use super::EmbeddingBackend;
use crate::config::EmbeddingConfig;
use crate::error::{RagError, Result};

const DEFAULT_LOCAL_MODEL: &str = "multilingual-e5-small";

pub struct FastEmbedBackend {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: fastembed::EmbeddingModel,
    loaded: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
}

impl FastEmbedBackend {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_LOCAL_MODEL.to_string());
        let (model, native_dims) = resolve_model(&model_name)?;
        if config.dims != native_dims {
            return Err(RagError::InvalidConfiguration(format!(
                "embedding.dims is {} but model '{}' produces {}",
                config.dims, model_name, native_dims
            )));
        }
        Ok(Self {
            model_name,
            dims: native_dims,
            batch_size: config.batch_size,
            model,
            loaded: Arc::new(Mutex::new(None)),
        })
    }
}

fn resolve_model(name: &str) -> Result<(fastembed::EmbeddingModel, usize)> {
    use fastembed::EmbeddingModel as M;
    match name {
        "all-minilm-l6-v2" => Ok((M::AllMiniLML6V2, 384)),
        "bge-small-en-v1.5" => Ok((M::BGESmallENV15, 384)),
        "bge-base-en-v1.5" => Ok((M::BGEBaseENV15, 768)),
        "multilingual-e5-small" => Ok((M::MultilingualE5Small, 384)),
        "multilingual-e5-base" => Ok((M::MultilingualE5Base, 768)),
        "multilingual-e5-large" => Ok((M::MultilingualE5Large, 1024)),
        other => Err(RagError::InvalidConfiguration(format!(
            "unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
            other
        ))),
    }
}

#[async_trait]
impl EmbeddingBackend for FastEmbedBackend {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let texts = texts.to_vec();
        let loaded = self.loaded.clone();
        let model = self.model.clone();
        let batch_size = self.batch_size;

        tokio::task::spawn_blocking(move || {
            let mut guard = loaded
                .lock()
                .map_err(|_| RagError::EmbeddingBackend("local model lock poisoned".into()))?;
            if guard.is_none() {
                let init = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(model).with_show_download_progress(false),
                )
                .map_err(|e| {
                    RagError::EmbeddingBackend(format!("failed to initialize local model: {}", e))
                })?;
                *guard = Some(init);
            }
            let embedder = guard
                .as_mut()
                .ok_or_else(|| RagError::EmbeddingBackend("local model not loaded".into()))?;
            embedder
                .embed(texts, Some(batch_size))
                .map_err(|e| RagError::EmbeddingBackend(format!("local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| RagError::EmbeddingBackend(format!("embedding task failed: {}", e)))?
    }
}
