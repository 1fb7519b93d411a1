//! Agent that answers questions with a chat model and a knowledge search tool.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::knowledge::{KnowledgeApi, KnowledgeFilters};

use super::model::{AssistantMessage, ChatMessage, ChatModel, ModelError, ToolCall, ToolDefinition};

/// Name of the function tool that searches the knowledge base.
pub const SEARCH_KNOWLEDGE_TOOL: &str = "search_knowledge_base";

/// Name of the demo agent.
pub const DEFAULT_AGENT_NAME: &str = "Social Media Agent";

/// Instructions of the demo agent.
pub const DEFAULT_INSTRUCTIONS: &str = "
    You are a helpful assistant that can answer questions about the social media posts.
    You can also use the knowledge base to answer questions.
";

const DEFAULT_MAX_TOOL_ROUNDS: usize = 5;
const MARKDOWN_INSTRUCTION: &str = "Use markdown to format your answers.";
const KNOWLEDGE_INSTRUCTION: &str = "You have access to a knowledge base of social media posts. \
     Call `search_knowledge_base` to look up relevant posts before answering questions about them.";
const NO_DOCUMENTS: &str = "No documents found";

/// Errors produced while running an agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The chat model failed.
    #[error(transparent)]
    Model(#[from] ModelError),
    /// The model kept calling tools past the allowed number of rounds.
    #[error("Model requested tools for more than {0} rounds without answering")]
    ToolLoopExceeded(usize),
}

/// Documents returned by one knowledge search during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeReferences {
    /// Query the model searched for.
    pub query: String,
    /// Compact document views handed to the model.
    pub references: Vec<Value>,
    /// Search latency in milliseconds.
    pub time_ms: u64,
}

/// Outcome of [`Agent::run`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentResponse {
    /// Unique id of this run.
    pub run_id: Uuid,
    /// Agent that produced the answer.
    pub agent_name: String,
    /// Final answer text.
    pub content: String,
    /// Knowledge searched while answering, in order.
    pub references: Vec<KnowledgeReferences>,
    /// Tool calls the model made, in order.
    pub tool_calls: Vec<ToolCall>,
    /// RFC 3339 timestamp of the run start.
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
struct SearchArguments {
    query: String,
}

/// An agent bound to a chat model and, optionally, a knowledge base.
pub struct Agent {
    name: String,
    model: Arc<dyn ChatModel>,
    knowledge: Option<Arc<dyn KnowledgeApi>>,
    instructions: String,
    search_knowledge: bool,
    markdown: bool,
    max_tool_rounds: usize,
}

impl Agent {
    /// Agent with no instructions and no knowledge.
    pub fn new(name: impl Into<String>, model: Arc<dyn ChatModel>) -> Self {
        Self {
            name: name.into(),
            model,
            knowledge: None,
            instructions: String::new(),
            search_knowledge: false,
            markdown: false,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }

    /// The social media demo agent: knowledge search and markdown answers enabled.
    pub fn social_media(model: Arc<dyn ChatModel>, knowledge: Arc<dyn KnowledgeApi>) -> Self {
        Self::new(DEFAULT_AGENT_NAME, model)
            .with_knowledge(knowledge)
            .with_instructions(DEFAULT_INSTRUCTIONS)
            .search_knowledge(true)
            .markdown(true)
    }

    /// Attach a knowledge base.
    pub fn with_knowledge(mut self, knowledge: Arc<dyn KnowledgeApi>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    /// Set the instructions; common indentation is stripped.
    pub fn with_instructions(mut self, instructions: &str) -> Self {
        self.instructions = dedent(instructions);
        self
    }

    /// Offer the knowledge search tool to the model.
    pub fn search_knowledge(mut self, enabled: bool) -> Self {
        self.search_knowledge = enabled;
        self
    }

    /// Ask the model to answer in markdown.
    pub fn markdown(mut self, enabled: bool) -> Self {
        self.markdown = enabled;
        self
    }

    /// Upper bound on tool-calling rounds per run.
    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    /// Agent name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// System prompt sent at the start of every run.
    pub fn system_prompt(&self) -> String {
        let mut parts = Vec::new();
        if !self.instructions.is_empty() {
            parts.push(self.instructions.clone());
        }
        if self.markdown {
            parts.push(MARKDOWN_INSTRUCTION.to_string());
        }
        if self.searches_knowledge() {
            parts.push(KNOWLEDGE_INSTRUCTION.to_string());
        }
        parts.join("\n\n")
    }

    fn searches_knowledge(&self) -> bool {
        self.search_knowledge && self.knowledge.is_some()
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        if !self.searches_knowledge() {
            return Vec::new();
        }
        vec![ToolDefinition {
            name: SEARCH_KNOWLEDGE_TOOL.to_string(),
            description: "Search the knowledge base for information relevant to a query.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The query to search for."
                    }
                },
                "required": ["query"],
                "additionalProperties": false
            }),
        }]
    }

    /// Answer `message`, letting the model search knowledge restricted by `filters`.
    pub async fn run(
        &self,
        message: &str,
        filters: Option<&KnowledgeFilters>,
    ) -> Result<AgentResponse, AgentError> {
        let run_id = Uuid::new_v4();
        let created_at = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
        let tools = self.tools();

        let mut messages = Vec::with_capacity(4);
        let system = self.system_prompt();
        if !system.is_empty() {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(message));

        let mut references = Vec::new();
        let mut tool_calls = Vec::new();

        tracing::info!(run_id = %run_id, agent = %self.name, model = self.model.id(), "Agent run started");

        for round in 0..=self.max_tool_rounds {
            let reply: AssistantMessage = self.model.complete(&messages, &tools).await?;
            if reply.tool_calls.is_empty() {
                tracing::info!(
                    run_id = %run_id,
                    rounds = round,
                    searches = references.len(),
                    "Agent run completed"
                );
                return Ok(AgentResponse {
                    run_id,
                    agent_name: self.name.clone(),
                    content: reply.content.unwrap_or_default(),
                    references,
                    tool_calls,
                    created_at,
                });
            }
            if round == self.max_tool_rounds {
                break;
            }

            let calls = reply.tool_calls.clone();
            messages.push(reply.into());
            for call in calls {
                let output = self.execute_tool(&call, filters, &mut references).await;
                messages.push(ChatMessage::tool(call.id.clone(), output));
                tool_calls.push(call);
            }
        }

        tracing::warn!(run_id = %run_id, rounds = self.max_tool_rounds, "Tool loop exceeded");
        Err(AgentError::ToolLoopExceeded(self.max_tool_rounds))
    }

    async fn execute_tool(
        &self,
        call: &ToolCall,
        filters: Option<&KnowledgeFilters>,
        references: &mut Vec<KnowledgeReferences>,
    ) -> String {
        let knowledge = match (&self.knowledge, call.function.name.as_str()) {
            (Some(knowledge), SEARCH_KNOWLEDGE_TOOL) if self.search_knowledge => knowledge,
            _ => {
                tracing::warn!(tool = %call.function.name, "Model called an unknown tool");
                return format!("Error: unknown tool `{}`", call.function.name);
            }
        };

        let arguments: SearchArguments = match serde_json::from_str(&call.function.arguments) {
            Ok(arguments) => arguments,
            Err(error) => {
                tracing::warn!(arguments = %call.function.arguments, error = %error, "Invalid tool arguments");
                return format!("Error: invalid arguments for `{SEARCH_KNOWLEDGE_TOOL}`: {error}");
            }
        };

        let started = Instant::now();
        match knowledge.search(&arguments.query, None, filters).await {
            Ok(documents) => {
                let docs: Vec<Value> = documents.iter().map(|doc| doc.to_reference()).collect();
                references.push(KnowledgeReferences {
                    query: arguments.query,
                    references: docs.clone(),
                    time_ms: started.elapsed().as_millis() as u64,
                });
                if docs.is_empty() {
                    NO_DOCUMENTS.to_string()
                } else {
                    serde_json::to_string_pretty(&docs).unwrap_or_else(|_| NO_DOCUMENTS.to_string())
                }
            }
            Err(error) => {
                tracing::error!(query = %arguments.query, error = %error, "Knowledge search failed");
                format!("Error searching knowledge base: {error}")
            }
        }
    }

    /// Run the agent and print the message and answer to stdout.
    pub async fn print_response(
        &self,
        message: &str,
        filters: Option<&KnowledgeFilters>,
    ) -> Result<AgentResponse, AgentError> {
        let started = Instant::now();
        let response = self.run(message, filters).await?;
        println!("Message\n{message}\n");
        println!(
            "Response ({:.1}s)\n{}",
            started.elapsed().as_secs_f64(),
            response.content
        );
        Ok(response)
    }
}

/// Strip the indentation shared by every non-blank line, then trim surrounding blank lines.
fn dedent(text: &str) -> String {
    let indent = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);
    text.lines()
        .map(|line| line.get(indent..).unwrap_or_else(|| line.trim_start()))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{Document, KnowledgeError};
    use async_trait::async_trait;
    use serde_json::Map;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned replies and records every request.
    struct ScriptedModel {
        replies: Mutex<VecDeque<AssistantMessage>>,
        requests: Mutex<Vec<(Vec<ChatMessage>, usize)>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<AssistantMessage>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            messages: &[ChatMessage],
            tools: &[ToolDefinition],
        ) -> Result<AssistantMessage, ModelError> {
            self.requests
                .lock()
                .unwrap()
                .push((messages.to_vec(), tools.len()));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| ModelError::InvalidResponse("script exhausted".into()))
        }
    }

    /// Knowledge that returns fixed documents and records the filters it saw.
    #[derive(Default)]
    struct FixedKnowledge {
        documents: Vec<Document>,
        seen: Mutex<Vec<(String, Option<KnowledgeFilters>)>>,
    }

    #[async_trait]
    impl KnowledgeApi for FixedKnowledge {
        async fn search(
            &self,
            query: &str,
            _num_documents: Option<usize>,
            filters: Option<&KnowledgeFilters>,
        ) -> Result<Vec<Document>, KnowledgeError> {
            self.seen
                .lock()
                .unwrap()
                .push((query.to_string(), filters.cloned()));
            Ok(self.documents.clone())
        }

        fn validate_filters(&self, filters: &KnowledgeFilters) -> (KnowledgeFilters, Vec<String>) {
            (filters.clone(), Vec::new())
        }
    }

    fn answer(text: &str) -> AssistantMessage {
        AssistantMessage {
            content: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }

    fn search_call(id: &str, query: &str) -> AssistantMessage {
        AssistantMessage {
            content: None,
            tool_calls: vec![ToolCall::function(id, SEARCH_KNOWLEDGE_TOOL, &json!({ "query": query }))],
        }
    }

    fn user_filter() -> KnowledgeFilters {
        json!({ "user_id": 97 }).as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn dedent_strips_common_indentation() {
        assert_eq!(
            dedent(DEFAULT_INSTRUCTIONS),
            "You are a helpful assistant that can answer questions about the social media posts.\n\
             You can also use the knowledge base to answer questions."
        );
        assert_eq!(dedent("  a\n    b\n"), "a\n  b");
    }

    #[test]
    fn system_prompt_reflects_flags() {
        let knowledge = Arc::new(FixedKnowledge::default());
        let agent = Agent::social_media(ScriptedModel::new(Vec::new()), knowledge);
        let prompt = agent.system_prompt();
        assert!(prompt.starts_with("You are a helpful assistant"));
        assert!(prompt.contains(MARKDOWN_INSTRUCTION));
        assert!(prompt.contains(SEARCH_KNOWLEDGE_TOOL));

        let bare = Agent::new("bare", ScriptedModel::new(Vec::new())).search_knowledge(true);
        assert!(bare.system_prompt().is_empty());
        assert!(bare.tools().is_empty());
    }

    #[tokio::test]
    async fn run_searches_knowledge_with_filters_then_answers() {
        let mut meta = Map::new();
        meta.insert("user_id".into(), json!(97));
        let knowledge = Arc::new(FixedKnowledge {
            documents: vec![Document::new(
                "She could never stop biting her nails.",
                Some("Bad habits".into()),
                meta,
            )],
            ..FixedKnowledge::default()
        });
        let model = ScriptedModel::new(vec![
            search_call("call_1", "terrible habit"),
            answer("Biting her nails."),
        ]);
        let agent = Agent::social_media(model.clone(), knowledge.clone());

        let response = agent
            .run("What was her terrible habit?", Some(&user_filter()))
            .await
            .expect("response");

        assert_eq!(response.content, "Biting her nails.");
        assert_eq!(response.agent_name, DEFAULT_AGENT_NAME);
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.references.len(), 1);
        assert_eq!(response.references[0].query, "terrible habit");
        assert_eq!(response.references[0].references[0]["name"], json!("Bad habits"));
        assert!(OffsetDateTime::parse(&response.created_at, &Rfc3339).is_ok());

        let seen = knowledge.seen.lock().unwrap();
        assert_eq!(seen[0], ("terrible habit".to_string(), Some(user_filter())));

        let requests = model.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].1, 1);
        match requests[1].0.last() {
            Some(ChatMessage::Tool { tool_call_id, content }) => {
                assert_eq!(tool_call_id, "call_1");
                assert!(content.contains("biting her nails"));
            }
            other => panic!("expected tool message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_search_reports_no_documents() {
        let knowledge = Arc::new(FixedKnowledge::default());
        let model = ScriptedModel::new(vec![search_call("c", "anything"), answer("Nothing found.")]);
        let agent = Agent::social_media(model.clone(), knowledge);

        agent.run("question", None).await.expect("response");
        let requests = model.requests.lock().unwrap();
        assert_eq!(
            requests[1].0.last(),
            Some(&ChatMessage::tool("c", NO_DOCUMENTS))
        );
    }

    #[tokio::test]
    async fn unknown_tools_get_error_messages() {
        let knowledge = Arc::new(FixedKnowledge::default());
        let model = ScriptedModel::new(vec![
            AssistantMessage {
                content: None,
                tool_calls: vec![ToolCall::function("x", "delete_everything", &json!({}))],
            },
            answer("Sorry."),
        ]);
        let agent = Agent::social_media(model.clone(), knowledge.clone());

        let response = agent.run("question", None).await.expect("response");
        assert_eq!(response.content, "Sorry.");
        assert!(response.references.is_empty());
        assert!(knowledge.seen.lock().unwrap().is_empty());

        let requests = model.requests.lock().unwrap();
        match requests[1].0.last() {
            Some(ChatMessage::Tool { content, .. }) => assert!(content.contains("unknown tool")),
            other => panic!("expected tool message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn endless_tool_calls_fail() {
        let knowledge = Arc::new(FixedKnowledge::default());
        let model = ScriptedModel::new(vec![
            search_call("a", "one"),
            search_call("b", "two"),
            search_call("c", "three"),
        ]);
        let agent = Agent::social_media(model, knowledge).with_max_tool_rounds(2);

        let error = agent.run("question", None).await.unwrap_err();
        assert!(matches!(error, AgentError::ToolLoopExceeded(2)));
    }
}
