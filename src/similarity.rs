/// Nearest-neighbour lookup over log embeddings
///
/// `SimilarityIndex` is a flat inner-product index: every search scans all
/// vectors. `OpenAiEmbeddings` produces the vectors.
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::traits::EmbeddingProvider;

pub const EMBEDDING_BATCH_SIZE: usize = 100;
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

#[derive(Debug, Clone, Default)]
pub struct SimilarityIndex {
    dimension: Option<usize>,
    ids: Vec<String>,
    vectors: Vec<Vec<f32>>,
}

impl SimilarityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension: Some(dimension),
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Add one vector. The first vector fixes the dimension if none was given.
    pub fn add(&mut self, id: &str, vector: Vec<f32>) -> Result<()> {
        let dimension = *self.dimension.get_or_insert(vector.len());
        if vector.len() != dimension {
            anyhow::bail!(
                "Dimension mismatch for {}: expected {}, got {}",
                id,
                dimension,
                vector.len()
            );
        }
        self.ids.push(id.to_string());
        self.vectors.push(vector);
        Ok(())
    }

    pub fn add_all(&mut self, ids: &[String], vectors: Vec<Vec<f32>>) -> Result<()> {
        if ids.len() != vectors.len() {
            anyhow::bail!("{} ids for {} vectors", ids.len(), vectors.len());
        }
        for (id, vector) in ids.iter().zip(vectors) {
            self.add(id, vector)?;
        }
        Ok(())
    }

    /// Top `k` ids by inner product, best first; ties keep insertion order
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        if let Some(dimension) = self.dimension {
            if query.len() != dimension {
                anyhow::bail!(
                    "Dimension mismatch for query: expected {}, got {}",
                    dimension,
                    query.len()
                );
            }
        }

        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, dot(v, query)))
            .collect();
        // Stable sort keeps insertion order among equal scores
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(i, score)| (self.ids[i].clone(), score))
            .collect())
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Embeds texts and answers "which logs look like this" queries
pub struct SimilaritySearch {
    provider: Arc<dyn EmbeddingProvider>,
    index: tokio::sync::RwLock<SimilarityIndex>,
}

impl SimilaritySearch {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            provider,
            index: tokio::sync::RwLock::new(SimilarityIndex::new()),
        }
    }

    /// Embed and index `(id, text)` pairs
    pub async fn index(&self, items: &[(String, String)]) -> Result<usize> {
        let texts: Vec<String> = items.iter().map(|(_, text)| text.clone()).collect();
        let ids: Vec<String> = items.iter().map(|(id, _)| id.clone()).collect();
        let vectors = self.provider.embed(&texts).await?;

        self.index.write().await.add_all(&ids, vectors)?;
        tracing::debug!("Indexed {} embeddings via {}", ids.len(), self.provider.name());
        Ok(ids.len())
    }

    /// Ids of the `k` entries closest to `query`.
    ///
    /// The index lock is only taken after the query is embedded, so indexing
    /// is never stalled behind a provider round-trip.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<String>> {
        if self.index.read().await.is_empty() {
            return Ok(Vec::new());
        }

        let embedded = self.provider.embed(&[query.to_string()]).await?;
        let vector = embedded
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Embedding provider returned no vector"))?;

        Ok(self
            .index
            .read()
            .await
            .search(&vector, k)?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }
}

/// OpenAI embeddings endpoint, called in batches of `EMBEDDING_BATCH_SIZE`
pub struct OpenAiEmbeddings {
    api_key: String,
    model: String,
    http_client: reqwest::Client,
}

impl OpenAiEmbeddings {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            http_client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let request_body = serde_json::json!({
            "model": self.model,
            "input": batch,
        });

        let response = self
            .http_client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        let response_json: serde_json::Value = response.json().await?;
        if !status.is_success() {
            anyhow::bail!("OpenAI embeddings error: {}", response_json);
        }

        parse_embeddings(&response_json, batch.len())
    }
}

/// Extract `data[*].embedding`, ordered by `data[*].index`
fn parse_embeddings(response: &serde_json::Value, expected: usize) -> Result<Vec<Vec<f32>>> {
    let data = response
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("No data in embeddings response"))?;

    let mut rows: Vec<(u64, Vec<f32>)> = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .unwrap_or(position as u64);
        let vector = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Missing embedding at {}", position))?
            .iter()
            .map(|x| x.as_f64().map(|f| f as f32))
            .collect::<Option<Vec<f32>>>()
            .ok_or_else(|| anyhow::anyhow!("Non-numeric embedding at {}", position))?;
        rows.push((index, vector));
    }

    if rows.len() != expected {
        anyhow::bail!("Expected {} embeddings, got {}", expected, rows.len());
    }
    rows.sort_by_key(|(index, _)| *index);
    Ok(rows.into_iter().map(|(_, v)| v).collect())
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let batches = texts.len().div_ceil(EMBEDDING_BATCH_SIZE);
        let mut embeddings = Vec::with_capacity(texts.len());

        for (i, batch) in texts.chunks(EMBEDDING_BATCH_SIZE).enumerate() {
            embeddings.extend(self.embed_batch(batch).await?);
            tracing::debug!("Embedded batch {}/{}", i + 1, batches);
        }
        Ok(embeddings)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_orders_by_inner_product() {
        let mut index = SimilarityIndex::new();
        index.add("a", vec![1.0, 0.0]).unwrap();
        index.add("b", vec![0.0, 1.0]).unwrap();
        index.add("c", vec![0.7, 0.7]).unwrap();

        let hits = index.search(&[1.0, 0.2], 2).unwrap();
        let ids: Vec<&str> = hits.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let mut index = SimilarityIndex::new();
        for id in ["x", "y", "z"] {
            index.add(id, vec![0.5, 0.5]).unwrap();
        }
        let hits = index.search(&[1.0, 1.0], 3).unwrap();
        let ids: Vec<&str> = hits.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["x", "y", "z"]);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut index = SimilarityIndex::with_dimension(3);
        assert!(index.add("a", vec![1.0, 2.0]).is_err());
        index.add("a", vec![1.0, 2.0, 3.0]).unwrap();
        assert!(index.search(&[1.0], 1).is_err());
    }

    #[test]
    fn test_parse_embeddings_reorders_by_index() {
        let response = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let vectors = parse_embeddings(&response, 2).unwrap();
        assert_eq!(vectors[0], vec![1.0, 0.0]);
        assert!(parse_embeddings(&response, 3).is_err());
    }

    struct Axis;

    #[async_trait]
    impl EmbeddingProvider for Axis {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| if t.contains("timeout") { vec![1.0, 0.0] } else { vec![0.0, 1.0] })
                .collect())
        }

        fn name(&self) -> &str {
            "axis"
        }
    }

    #[tokio::test]
    async fn test_similarity_search() {
        let search = SimilaritySearch::new(Arc::new(Axis));
        assert!(search.search("anything", 3).await.unwrap().is_empty());

        let items = vec![
            ("J:0".to_string(), "db timeout".to_string()),
            ("J:1".to_string(), "user login".to_string()),
            ("J:2".to_string(), "upstream timeout".to_string()),
        ];
        assert_eq!(search.index(&items).await.unwrap(), 3);

        let hits = search.search("request timeout", 2).await.unwrap();
        assert_eq!(hits, vec!["J:0".to_string(), "J:2".to_string()]);
    }
    /// Holds back any batch containing "slow" until released
    struct Gated {
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl EmbeddingProvider for Gated {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if texts.iter().any(|t| t.contains("slow")) {
                self.release.notified().await;
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }

        fn name(&self) -> &str {
            "gated"
        }
    }

    #[tokio::test]
    async fn test_indexing_not_blocked_by_pending_search() {
        let provider = Arc::new(Gated {
            release: tokio::sync::Notify::new(),
        });
        let search = Arc::new(SimilaritySearch::new(provider.clone()));
        search
            .index(&[("J:0".to_string(), "first".to_string())])
            .await
            .unwrap();

        let pending = {
            let search = search.clone();
            tokio::spawn(async move { search.search("slow query", 5).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let indexed = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            search.index(&[("J:1".to_string(), "second".to_string())]),
        )
        .await
        .expect("index() waited on an in-flight search");
        assert_eq!(indexed.unwrap(), 1);

        provider.release.notify_one();
        let hits = pending.await.unwrap().unwrap();
        assert_eq!(hits, vec!["J:0".to_string(), "J:1".to_string()]);
    }
}
