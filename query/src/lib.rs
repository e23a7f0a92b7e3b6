pub mod answer;
pub mod heuristic;
pub mod memory;
pub mod rerank;
pub mod retrieval;

pub use answer::{AnswerEngine, AnswerError, AnswerResponse, Citation};
pub use heuristic::{classify_query, dynamic_match_count, QueryKind};
pub use memory::SessionMemory;
pub use rerank::{CircuitBreaker, Reranker, RerankBypass};
pub use retrieval::{diversify, RetrievalEngine, RetrievalError, RetrievedChunk};
