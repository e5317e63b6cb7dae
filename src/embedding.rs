//! Embedding services and vector utilities.
//!
//! Defines the [`Embedder`] trait and three implementations:
//! - **[`HashEmbedder`]**: deterministic, offline feature hashing over code-aware tokens.
//! - **[`OpenAIEmbedder`]**: calls the OpenAI embeddings API.
//! - **[`OllamaEmbedder`]**: calls a local Ollama instance's `/api/embed` endpoint.
//!
//! Remote providers batch requests and apply the configured client timeout,
//! nothing more: a failed call surfaces as an [`EmbeddingServiceError`] and
//! the caller decides whether to try again.
//!
//! Also provides [`vec_to_blob`] / [`blob_to_vec`] (little-endian `f32`
//! encoding used by the vector index file) and [`cosine_similarity`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::EmbeddingConfig;
use crate::error::EmbeddingServiceError;

/// Turns text into fixed-size vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier, part of every embedding cache key.
    fn model_name(&self) -> &str;

    fn dims(&self) -> usize;

    /// Embed a batch, returning one vector per input in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single text.
pub async fn embed_one(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    let results = embedder.embed(&[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| EmbeddingServiceError::InvalidResponse("empty embedding response".into()).into())
}

/// Reject responses with the wrong number of vectors or wrong dimensionality.
fn check_embeddings(expected_len: usize, dims: usize, vectors: &[Vec<f32>]) -> Result<()> {
    if vectors.len() != expected_len {
        return Err(EmbeddingServiceError::InvalidResponse(format!(
            "expected {} embeddings, got {}",
            expected_len,
            vectors.len()
        ))
        .into());
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(EmbeddingServiceError::Dimension {
            expected: dims,
            actual: bad.len(),
        }
        .into());
    }
    Ok(())
}

// ============ Hash Embedder ============

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "do", "does", "for", "from", "how", "i", "if",
    "in", "is", "it", "of", "on", "or", "the", "this", "to", "was", "what", "when", "where",
    "which", "who", "why", "with",
];

/// Offline embedder based on signed feature hashing.
///
/// Text is tokenized on non-identifier characters; identifiers are also
/// split into their snake_case and camelCase parts so `load_config`,
/// `loadConfig` and "load config" share features. The vector is
/// L2-normalized.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dims];

        for token in text.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
            let lower = token.to_lowercase();
            if lower.len() < 2 || STOPWORDS.contains(&lower.as_str()) {
                continue;
            }
            self.add_feature(&mut vec, &lower, 1.0);

            let parts = split_identifier(token);
            if parts.len() > 1 {
                for part in parts {
                    if part.len() >= 2 && !STOPWORDS.contains(&part.as_str()) {
                        self.add_feature(&mut vec, &part, 0.5);
                    }
                }
            }
        }

        let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut vec {
                *x /= norm;
            }
        }
        vec
    }

    fn add_feature(&self, vec: &mut [f32], feature: &str, weight: f32) {
        let h = fnv1a(feature.as_bytes());
        let index = (h % self.dims as u64) as usize;
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        vec[index] += sign * weight;
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Split `load_config`, `loadConfig` or `HTTPServer` into lowercase words.
pub fn split_identifier(ident: &str) -> Vec<String> {
    let mut parts = Vec::new();
    for piece in ident.split('_').filter(|p| !p.is_empty()) {
        let chars: Vec<char> = piece.chars().collect();
        let mut current = String::new();
        for (i, &c) in chars.iter().enumerate() {
            let boundary = i > 0
                && c.is_uppercase()
                && (chars[i - 1].is_lowercase()
                    || chars[i - 1].is_ascii_digit()
                    || chars.get(i + 1).is_some_and(|n| n.is_lowercase()));
            if boundary && !current.is_empty() {
                parts.push(std::mem::take(&mut current).to_lowercase());
            }
            current.push(c);
        }
        if !current.is_empty() {
            parts.push(current.to_lowercase());
        }
    }
    parts
}

// ============ OpenAI Embedder ============

/// Embedder using `POST /v1/embeddings` on the OpenAI API.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dims: usize,
    batch_size: usize,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;

        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model,
            dims: config.dims,
            batch_size: config.batch_size,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| EmbeddingServiceError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingServiceError::Status {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EmbeddingServiceError::InvalidResponse(e.to_string()))?;
        Ok(parse_openai_response(&json)?)
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size.max(1)) {
            let vectors = self.embed_batch(batch).await?;
            check_embeddings(batch.len(), self.dims, &vectors)?;
            out.extend(vectors);
        }
        Ok(out)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(
    json: &serde_json::Value,
) -> std::result::Result<Vec<Vec<f32>>, EmbeddingServiceError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbeddingServiceError::InvalidResponse("missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EmbeddingServiceError::InvalidResponse("missing embedding".into()))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .unwrap_or(position as u64);
        indexed.push((index, parse_vector(embedding)?));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_vector(values: &[serde_json::Value]) -> std::result::Result<Vec<f32>, EmbeddingServiceError> {
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| EmbeddingServiceError::InvalidResponse("non-numeric embedding value".into()))
        })
        .collect()
}

// ============ Ollama Embedder ============

/// Embedder using a local Ollama instance (default `http://localhost:11434`).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    batch_size: usize,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            client,
            url,
            model,
            dims: config.dims,
            batch_size: config.batch_size,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url.trim_end_matches('/')))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                EmbeddingServiceError::Request(format!(
                    "is Ollama running at {}? {}",
                    self.url, e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingServiceError::Status {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EmbeddingServiceError::InvalidResponse(e.to_string()))?;
        Ok(parse_ollama_response(&json)?)
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size.max(1)) {
            let vectors = self.embed_batch(batch).await?;
            check_embeddings(batch.len(), self.dims, &vectors)?;
            out.extend(vectors);
        }
        Ok(out)
    }
}

fn parse_ollama_response(
    json: &serde_json::Value,
) -> std::result::Result<Vec<Vec<f32>>, EmbeddingServiceError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| EmbeddingServiceError::InvalidResponse("missing embeddings array".into()))?;

    embeddings
        .iter()
        .map(|e| {
            e.as_array()
                .ok_or_else(|| EmbeddingServiceError::InvalidResponse("embedding is not an array".into()))
                .and_then(|values| parse_vector(values))
        })
        .collect()
}

/// Create the [`Embedder`] selected by `embedding.provider`.
///
/// | Config Value | Embedder |
/// |-------------|----------|
/// | `"hash"` | [`HashEmbedder`] |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(config.dims))),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Encode a float vector as little-endian `f32` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian `f32` bytes. Reverses [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or a
/// zero vector.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), 20);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn test_cosine_identical_and_orthogonal() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_split_identifier() {
        assert_eq!(split_identifier("load_config"), vec!["load", "config"]);
        assert_eq!(split_identifier("loadConfig"), vec!["load", "config"]);
        assert_eq!(split_identifier("HTTPServer"), vec!["http", "server"]);
        assert_eq!(split_identifier("parse"), vec!["parse"]);
    }

    #[tokio::test]
    async fn test_hash_embedder_is_deterministic_and_normalized() {
        let e = HashEmbedder::new(64);
        let out = e
            .embed(&["fn load_config()".to_string(), "fn load_config()".to_string()])
            .await
            .unwrap();
        assert_eq!(out[0], out[1]);
        assert_eq!(out[0].len(), 64);
        let norm: f32 = out[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hash_embedder_relates_identifier_forms() {
        let e = HashEmbedder::new(384);
        let code = e.embed_text("pub fn parse_manifest(path: &Path) -> Manifest");
        let query = e.embed_text("how does parse_manifest work?");
        let unrelated = e.embed_text("render the navigation sidebar widget");
        assert!(cosine_similarity(&code, &query) > cosine_similarity(&code, &unrelated));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let v = HashEmbedder::new(8).embed_text("   ");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_check_embeddings_rejects_wrong_dims() {
        let err = check_embeddings(1, 4, &[vec![0.0; 3]]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EmbeddingServiceError>(),
            Some(EmbeddingServiceError::Dimension { expected: 4, actual: 3 })
        ));
        assert!(check_embeddings(2, 4, &[vec![0.0; 4]]).is_err());
    }

    #[test]
    fn test_parse_openai_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.5, 0.5]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let parsed = parse_openai_response(&json).unwrap();
        assert_eq!(parsed, vec![vec![1.0, 0.0], vec![0.5, 0.5]]);
        assert!(parse_openai_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_parse_ollama_response() {
        let json = serde_json::json!({"embeddings": [[0.1, 0.2], [0.3, 0.4]]});
        assert_eq!(parse_ollama_response(&json).unwrap().len(), 2);
        let bad = serde_json::json!({"embeddings": [["x"]]});
        assert!(parse_ollama_response(&bad).is_err());
    }

    #[test]
    fn test_create_embedder_hash() {
        let e = create_embedder(&EmbeddingConfig::default()).unwrap();
        assert_eq!(e.model_name(), "hash");
        assert_eq!(e.dims(), 384);
    }
}
