pub mod anthropic;
pub mod google;
pub mod openai;

pub use anthropic::AnthropicCompatible;
pub use google::GoogleCompatible;
pub use openai::OpenAiCompatible;
