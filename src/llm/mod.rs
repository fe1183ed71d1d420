pub mod hashing;
pub mod openai;
pub mod provider;
pub mod stub;
pub mod types;

pub use hashing::HashingEmbedder;
pub use openai::OpenAiCompatProvider;
pub use provider::{bounded, EmbeddingEngine, FragmentReceiver, GenerativeEngine, RerankEngine};
pub use types::{ChatMessage, ChatRequest};
