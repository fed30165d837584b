use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use unpod::client_wrapper::{ClientWrapper, Message, Role, TokenUsage, ToolDefinition};
use unpod::LLMSession;

struct MockClient {
    usage: Mutex<Option<TokenUsage>>,
    response_content: String,
    last_message_count: Mutex<usize>,
}

impl MockClient {
    fn new(response_content: String) -> Self {
        Self {
            usage: Mutex::new(None),
            response_content,
            last_message_count: Mutex::new(0),
        }
    }

    async fn get_last_message_count(&self) -> usize {
        *self.last_message_count.lock().await
    }
}

#[async_trait]
impl ClientWrapper for MockClient {
    async fn send_message(
        &self,
        messages: &[Message],
        _tools: Option<Vec<ToolDefinition>>,
    ) -> Result<Message, Box<dyn std::error::Error>> {
        *self.last_message_count.lock().await = messages.len();
        Ok(Message {
            role: Role::Assistant,
            content: Arc::from(self.response_content.as_str()),
            tool_calls: vec![],
        })
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }

    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        Some(&self.usage)
    }
}

#[tokio::test]
async fn history_grows_by_two_per_turn() {
    let client = MockClient::new("Response".to_string());
    let mut session = LLMSession::new(client, "System prompt".to_string(), 10_000);

    session
        .send_message(Role::User, "Hello, this is a test message".to_string())
        .await
        .unwrap();

    assert_eq!(session.history().len(), 2); // user turn + assistant reply
}

#[tokio::test]
async fn small_token_budget_trims_history_before_transmission() {
    let client = MockClient::new("Response".to_string());
    // System prompt "System" ~= 3 tokens; budget of 20 forces old turns out.
    let mut session = LLMSession::new(client, "System".to_string(), 20);

    for i in 0..6 {
        session
            .send_message(Role::User, format!("message number {i}"))
            .await
            .unwrap();
    }

    assert!(session.history().len() < 12);
}

#[tokio::test]
async fn large_token_budget_sends_full_history() {
    let mut session = LLMSession::new(MockClient::new("OK".to_string()), "System".to_string(), 10_000);

    session.send_message(Role::User, "Hi".to_string()).await.unwrap();
    session.send_message(Role::User, "Hello".to_string()).await.unwrap();

    // (user, assistant) * 2 turns = 4 history entries, none trimmed.
    assert_eq!(session.history().len(), 4);
}

#[tokio::test]
async fn set_system_prompt_replaces_context_for_next_turn() {
    let client = MockClient::new("ack".to_string());
    let mut session = LLMSession::new(client, "short".to_string(), 10_000);
    session.set_system_prompt("a considerably longer system prompt than before".to_string());
    let reply = session.send_message(Role::User, "hi".to_string()).await.unwrap();
    assert_eq!(&*reply.content, "ack");
}
