//! Embedding provider boundary.
//!
//! Vector computation is an external collaborator: the pipeline hands text
//! out and gets vectors back, and whether those vectors come from a local
//! model, a GPU service, or fallback hardware is invisible to control flow.
//! Embeddings move through the system as `f16` to halve storage, matching
//! how the chunk store persists them.

use anyhow::Result;
use async_trait::async_trait;
use half::f16;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts. Implementations may batch further or split
    /// internally; the result must be one vector per input, in order.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f16>>>;

    /// Dimension of the vectors this provider produces.
    fn embedding_dimension(&self) -> usize;

    /// Name of this provider, for logs and status output.
    fn provider_name(&self) -> &str;
}

/// Stand-in used when no embedding service is wired up (for example in the
/// operator CLI). Every call fails, which the pipeline and retriever treat
/// as "no vectors available": chunks are stored without embeddings and
/// queries degrade to lexical-only ranking.
#[derive(Debug, Default, Clone)]
pub struct NoEmbeddingProvider;

#[async_trait]
impl EmbeddingProvider for NoEmbeddingProvider {
    async fn embed_texts(&self, _texts: &[String]) -> Result<Vec<Vec<f16>>> {
        anyhow::bail!("no embedding provider configured")
    }

    fn embedding_dimension(&self) -> usize {
        0
    }

    fn provider_name(&self) -> &str {
        "none"
    }
}
