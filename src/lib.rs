// src/lib.rs

pub mod conclave;

pub use conclave::agent::{Agent, AgentRegistry, PubKey};
pub use conclave::config::ConfigService;
pub use conclave::conversation::{Conversation, ConversationStore};
pub use conclave::error::{EngineError, EngineResult};
pub use conclave::event::{Event, EventBus, EventKind};
pub use conclave::llm::LlmClient;
pub use conclave::phase_machine::Phase;
pub use conclave::runtime::Runtime;
