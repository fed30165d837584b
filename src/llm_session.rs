//! Bounded-history conversational session wrapping a [`ClientWrapper`].
//!
//! `LLMSession` keeps a running dialogue history alongside a system prompt and trims the
//! oldest turns whenever the estimated token count would exceed `max_tokens`. The voice
//! session runtime (`crate::voice::pipeline`) drives one `LLMSession` per call, feeding it
//! each finalized STT transcript and reading back the assistant turn to hand to TTS.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use unpod::client_wrapper::{ClientWrapper, Message, MessageStreamFuture, Role, TokenUsage, ToolDefinition};
//! use unpod::LLMSession;
//! use async_trait::async_trait;
//! use tokio::sync::Mutex;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl ClientWrapper for Echo {
//!     async fn send_message(&self, messages: &[Message], _tools: Option<Vec<ToolDefinition>>) -> Result<Message, Box<dyn std::error::Error>> {
//!         Ok(Message { role: Role::Assistant, content: messages.last().unwrap().content.clone(), tool_calls: vec![] })
//!     }
//!     fn model_name(&self) -> &str { "echo" }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut session = LLMSession::new(Echo, "You are a helpful agent.".to_string(), 4000);
//! let reply = session.send_message(Role::User, "Hello".to_string()).await.unwrap();
//! assert_eq!(&*reply.content, "Hello");
//! # }
//! ```

use std::sync::Arc;

use crate::client_wrapper::{ClientWrapper, Message, Role};

/// A bounded-history conversation bound to one [`ClientWrapper`] implementation.
pub struct LLMSession<T: ClientWrapper> {
    client: Arc<T>,
    system_prompt: Message,
    conversation_history: Vec<Message>,
    max_tokens: usize,
    token_count: usize,
}

impl<T: ClientWrapper> LLMSession<T> {
    /// Creates a new session. `max_tokens` bounds the system prompt plus history together.
    pub fn new(client: T, system_prompt: String, max_tokens: usize) -> Self {
        let system_prompt_message = Message {
            role: Role::System,
            content: Arc::from(system_prompt.as_str()),
            tool_calls: vec![],
        };
        let system_prompt_tokens = count_message_tokens(&system_prompt_message);
        LLMSession {
            client: Arc::new(client),
            system_prompt: system_prompt_message,
            conversation_history: Vec::new(),
            max_tokens,
            token_count: system_prompt_tokens,
        }
    }

    /// Appends `content` under `role`, sends the full bounded history, and returns the
    /// assistant's reply while also appending it to history.
    pub async fn send_message(
        &mut self,
        role: Role,
        content: String,
    ) -> Result<Message, Box<dyn std::error::Error>> {
        let message = Message {
            role,
            content: Arc::from(content.as_str()),
            tool_calls: vec![],
        };

        self.token_count += count_message_tokens(&message);
        self.conversation_history.push(message);
        self.trim_conversation_history();

        let mut request: Vec<Message> = Vec::with_capacity(self.conversation_history.len() + 1);
        request.push(self.system_prompt.clone());
        request.extend(self.conversation_history.iter().cloned());

        let response = self.client.send_message(&request, None).await?;

        self.token_count += count_message_tokens(&response);
        self.conversation_history.push(response.clone());
        self.trim_conversation_history();

        Ok(response)
    }

    /// Replaces the system prompt, adjusting the running token estimate.
    pub fn set_system_prompt(&mut self, prompt: String) {
        let old_prompt_tokens = count_message_tokens(&self.system_prompt);
        self.system_prompt = Message {
            role: Role::System,
            content: Arc::from(prompt.as_str()),
            tool_calls: vec![],
        };
        let new_prompt_tokens = count_message_tokens(&self.system_prompt);
        self.token_count = self.token_count - old_prompt_tokens + new_prompt_tokens;
    }

    /// Read-only view of the conversation history (excluding the system prompt).
    pub fn history(&self) -> &[Message] {
        &self.conversation_history
    }

    fn trim_conversation_history(&mut self) {
        while self.token_count > self.max_tokens && !self.conversation_history.is_empty() {
            let removed_message = self.conversation_history.remove(0);
            self.token_count -= count_message_tokens(&removed_message);
        }
    }
}

/// Coarse token estimate: one token per four characters, minimum one.
fn count_tokens(text: &str) -> usize {
    (text.len() / 4).max(1)
}

fn count_message_tokens(message: &Message) -> usize {
    let role_token_count = 1;
    role_token_count + count_tokens(message.content.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_wrapper::ToolDefinition;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl ClientWrapper for Echo {
        async fn send_message(
            &self,
            messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> Result<Message, Box<dyn std::error::Error>> {
            Ok(Message {
                role: Role::Assistant,
                content: messages.last().unwrap().content.clone(),
                tool_calls: vec![],
            })
        }

        fn model_name(&self) -> &str {
            "echo"
        }
    }

    #[tokio::test]
    async fn history_trims_to_max_tokens() {
        let mut session = LLMSession::new(Echo, "sys".to_string(), 20);
        for i in 0..20 {
            session
                .send_message(Role::User, format!("message number {i}"))
                .await
                .unwrap();
        }
        // Each send appends a user turn + an echoed assistant turn; trimming must have
        // kept the history well short of 20 raw turns given the 20-token budget.
        assert!(session.history().len() < 40);
    }

    #[tokio::test]
    async fn set_system_prompt_updates_token_count() {
        let mut session = LLMSession::new(Echo, "short".to_string(), 1000);
        session.set_system_prompt("a much longer system prompt than before".to_string());
        let reply = session.send_message(Role::User, "hi".to_string()).await.unwrap();
        assert_eq!(&*reply.content, "hi");
    }
}
