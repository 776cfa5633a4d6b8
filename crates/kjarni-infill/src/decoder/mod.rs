//! Template-conditioned transformer decoder.

pub mod config;
pub mod layer;
pub mod model;
pub mod stack;

pub use config::{DecoderConfig, EmbeddingScale, FeedForwardConfig};
pub use layer::DecoderLayer;
pub use model::{DecodeInputs, Predictions, TemplateTransformerDecoder};
pub use stack::DecoderStack;
