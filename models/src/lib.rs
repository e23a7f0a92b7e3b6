pub mod chat;
pub mod classifier;
pub mod cross_encoder;
pub mod embedder;

pub use chat::{ChatError, ChatModel, ChatOptions, HttpChatModel, MockChatModel};
pub use classifier::{
    ClassifierError, DocumentClassifier, KeywordClassifier, LlmClassifier, StructuralHints,
    CLASSIFIER_VERSION,
};
pub use cross_encoder::{
    CrossEncoder, CrossEncoderError, CrossEncoderProvider, FailingCrossEncoder,
    FailingCrossEncoderProvider, LexicalCrossEncoder, StaticCrossEncoderProvider,
};
pub use embedder::{
    DeterministicEmbedder, EmbeddingError, EmbeddingGateway, EmbeddingTransport,
    HttpEmbeddingTransport, DEFAULT_EMBEDDING_DIMS,
};
