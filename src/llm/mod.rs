pub mod openai;
pub mod provider;
pub mod types;

pub use openai::OpenAiCompatibleGenerator;
pub use provider::Generator;
pub use types::{ChatMessage, GenerationParameters, GenerationRequest};
