//! Question answering over the knowledge base with a tool-calling chat model.

pub mod model;
pub mod runner;

pub use runner::{
    Agent, AgentError, AgentResponse, DEFAULT_AGENT_NAME, DEFAULT_INSTRUCTIONS, KnowledgeReferences,
    SEARCH_KNOWLEDGE_TOOL,
};
pub use model::{
    AssistantMessage, ChatMessage, ChatModel, FunctionCall, ModelError, OpenAIChat, ToolCall,
    ToolDefinition,
};
