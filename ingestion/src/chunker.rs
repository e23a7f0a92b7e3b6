use fisiorag_core::model::{
    chunk_id_for_sequence, chunk_meta, now_ms, ChunkingStrategy, Classification, Document,
    DocumentChunk, DocumentStructure, FALLBACK_DOMAIN,
};
use models::embedder::{EmbeddingError, EmbeddingGateway};
use std::collections::HashMap;
use std::sync::Arc;
use text_splitter::{ChunkConfig, TextSplitter};
use thiserror::Error;

/// Semantic segmentation breaks where consecutive sentence similarity drops
/// below this value.
const SEMANTIC_BREAKPOINT: f32 = 0.35;
const SEMANTIC_MAX_CHARS: usize = 1200;
const TABULAR_MAX_CHARS: usize = 1500;

#[derive(Error, Debug)]
pub enum ChunkingError {
    #[error("chunking produced no non-empty chunks")]
    Empty,
    #[error("invalid chunking configuration: {0}")]
    Config(String),
    #[error("semantic segmentation embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),
}

#[async_trait::async_trait]
pub trait Chunker: Send + Sync {
    async fn split(&self, content: &str) -> Result<Vec<String>, ChunkingError>;
}

/// Character-window splitter with overlap; the default strategy.
pub struct RecursiveChunker {
    max_chars: usize,
    overlap: usize,
}

impl RecursiveChunker {
    pub fn new(max_chars: usize, overlap: usize) -> Self {
        Self { max_chars, overlap }
    }
}

#[async_trait::async_trait]
impl Chunker for RecursiveChunker {
    async fn split(&self, content: &str) -> Result<Vec<String>, ChunkingError> {
        let config = ChunkConfig::new(self.max_chars)
            .with_overlap(self.overlap)
            .map_err(|err| ChunkingError::Config(err.to_string()))?;
        let splitter = TextSplitter::new(config);

        Ok(splitter
            .chunks(content)
            .map(|piece| piece.to_string())
            .filter(|piece| !piece.trim().is_empty())
            .collect())
    }
}

/// Embedding-based segmentation: sentences are embedded in one batch and a
/// new chunk starts where adjacent-sentence similarity falls under the
/// breakpoint or the segment outgrows its budget.
pub struct SemanticChunker {
    gateway: Arc<EmbeddingGateway>,
    breakpoint: f32,
    max_chars: usize,
}

impl SemanticChunker {
    pub fn new(gateway: Arc<EmbeddingGateway>, breakpoint: f32) -> Self {
        Self {
            gateway,
            breakpoint,
            max_chars: SEMANTIC_MAX_CHARS,
        }
    }
}

#[async_trait::async_trait]
impl Chunker for SemanticChunker {
    async fn split(&self, content: &str) -> Result<Vec<String>, ChunkingError> {
        let sentences = split_sentences(content);
        if sentences.len() <= 1 {
            let trimmed = content.trim();
            return Ok(if trimmed.is_empty() {
                Vec::new()
            } else {
                vec![trimmed.to_string()]
            });
        }

        let embeddings = self.gateway.embed_batch(&sentences).await?;

        let mut chunks = Vec::new();
        let mut current = sentences[0].clone();
        for i in 1..sentences.len() {
            let similarity = cosine(&embeddings[i - 1], &embeddings[i]);
            let would_overflow = current.len() + sentences[i].len() + 1 > self.max_chars;
            if similarity < self.breakpoint || would_overflow {
                chunks.push(std::mem::take(&mut current));
                current = sentences[i].clone();
            } else {
                current.push(' ');
                current.push_str(&sentences[i]);
            }
        }
        if !current.trim().is_empty() {
            chunks.push(current);
        }

        Ok(chunks
            .into_iter()
            .filter(|chunk| !chunk.trim().is_empty())
            .collect())
    }
}

/// Structure-aware splitter: blank-line blocks are the unit, and blocks that
/// look like table rows are never cut apart.
pub struct TabularChunker {
    max_chars: usize,
}

impl TabularChunker {
    pub fn new() -> Self {
        Self {
            max_chars: TABULAR_MAX_CHARS,
        }
    }
}

impl Default for TabularChunker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Chunker for TabularChunker {
    async fn split(&self, content: &str) -> Result<Vec<String>, ChunkingError> {
        let blocks = split_blocks(content);

        let mut chunks: Vec<String> = Vec::new();
        let mut current = String::new();
        for block in blocks {
            if current.is_empty() {
                current = block;
                continue;
            }
            if current.len() + block.len() + 2 > self.max_chars {
                chunks.push(std::mem::take(&mut current));
                current = block;
            } else {
                current.push_str("\n\n");
                current.push_str(&block);
            }
        }
        if !current.trim().is_empty() {
            chunks.push(current);
        }

        Ok(chunks)
    }
}

/// Maps a classification onto a chunking strategy and runs the chosen
/// chunker, producing the ordered, metadata-tagged chunk sequence.
pub struct ChunkRouter {
    gateway: Arc<EmbeddingGateway>,
}

impl ChunkRouter {
    pub fn new(gateway: Arc<EmbeddingGateway>) -> Self {
        Self { gateway }
    }

    pub fn route(classification: &Classification) -> ChunkingStrategy {
        match classification.structure {
            DocumentStructure::Tabular => ChunkingStrategy::Tabular,
            DocumentStructure::Mixed => ChunkingStrategy::recursive_default(),
            DocumentStructure::Narrative => {
                if classification.domain == FALLBACK_DOMAIN {
                    ChunkingStrategy::recursive_default()
                } else {
                    ChunkingStrategy::Semantic {
                        breakpoint: SEMANTIC_BREAKPOINT,
                    }
                }
            }
        }
    }

    /// Chunk `text` with the strategy recorded on `document`. Sequence
    /// numbers are dense from zero; chunk ids derive from the document's
    /// file hash so re-ingestion reproduces them.
    pub async fn chunk_document(
        &self,
        text: &str,
        document: &Document,
    ) -> Result<Vec<DocumentChunk>, ChunkingError> {
        let chunker: Box<dyn Chunker> = match &document.chunking_strategy {
            ChunkingStrategy::Recursive { max_chars, overlap } => {
                Box::new(RecursiveChunker::new(*max_chars, *overlap))
            }
            ChunkingStrategy::Semantic { breakpoint } => {
                Box::new(SemanticChunker::new(self.gateway.clone(), *breakpoint))
            }
            ChunkingStrategy::Tabular => Box::new(TabularChunker::new()),
        };

        let pieces = chunker.split(text).await?;
        if pieces.is_empty() {
            return Err(ChunkingError::Empty);
        }

        let strategy_tag = document.chunking_strategy.tag();
        let created_at_ms = now_ms();

        Ok(pieces
            .into_iter()
            .enumerate()
            .map(|(i, content)| {
                let sequence = i as u32;
                let mut metadata = HashMap::new();
                metadata.insert(
                    chunk_meta::DOCUMENT_ID.to_string(),
                    document.id.to_string(),
                );
                metadata.insert(
                    chunk_meta::DOCUMENT_NAME.to_string(),
                    document.file_name.clone(),
                );
                metadata.insert(
                    chunk_meta::SEQUENCE_NUMBER.to_string(),
                    sequence.to_string(),
                );
                metadata.insert(
                    chunk_meta::CHUNKING_STRATEGY.to_string(),
                    strategy_tag.clone(),
                );

                DocumentChunk {
                    id: chunk_id_for_sequence(&document.file_hash, sequence),
                    document_id: document.id,
                    content,
                    embedding: None,
                    metadata,
                    created_at_ms,
                }
            })
            .collect())
    }
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut buffer = String::new();

    for ch in text.chars() {
        buffer.push(ch);
        if matches!(ch, '.' | '!' | '?' | '\n') {
            let trimmed = buffer.trim();
            if !trimmed.is_empty() {
                out.push(trimmed.to_string());
            }
            buffer.clear();
        }
    }

    let trimmed = buffer.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
    out
}

fn split_blocks(text: &str) -> Vec<String> {
    text.split("\n\n")
        .map(|block| block.trim())
        .filter(|block| !block.is_empty())
        .map(|block| block.to_string())
        .collect()
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
