pub mod summarizer;

pub use summarizer::{AnthropicSummarizer, SummarizerConfig};
