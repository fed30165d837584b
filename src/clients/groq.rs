//! Groq client wrapper routed through the OpenAI-compatible surface.
//!
//! `GroqClient` connects to Groq's LPU-hosted inference endpoint using the same transport as the
//! OpenAI client. It is therefore straightforward to reuse existing session or prompt-composition
//! code while targeting Groq's low-latency hosted models.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use unpod::client_wrapper::{ClientWrapper, Message, Role};
//! use unpod::clients::groq::{GroqClient, Model};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = std::env::var("GROQ_API_KEY")?;
//!     let client = GroqClient::new_with_model_enum(&key, Model::Llama3_3_70bVersatile);
//!     let reply = client
//!         .send_message(
//!             &[Message {
//!                 role: Role::User,
//!                 content: Arc::from("Give me a witty coding tip."),
//!                 tool_calls: vec![],
//!             }],
//!             None,
//!         )
//!         .await?;
//!     println!("{}", reply.content);
//!     Ok(())
//! }
//! ```

use crate::client_wrapper::TokenUsage;
use crate::client_wrapper::{ClientWrapper, Message, ToolDefinition};
use crate::clients::openai::OpenAIClient;
use async_trait::async_trait;
use std::error::Error;
use tokio::sync::Mutex;

/// Client wrapper for Groq's hosted models accessed via the OpenAI-style API surface.
pub struct GroqClient {
    delegate_client: OpenAIClient,
    model: String,
}

/// Groq model identifiers.
#[allow(non_camel_case_types)]
pub enum Model {
    /// `llama-3.3-70b-versatile` – the default dialogue model for the Groq tier.
    Llama3_3_70bVersatile,
    /// `llama-3.1-8b-instant` – low-latency, low-cost Groq tier.
    Llama3_1_8bInstant,
    /// `mixtral-8x7b-32768` – long-context mixture-of-experts model.
    Mixtral8x7b32768,
}

/// Convert a [`Model`] variant into its public string identifier.
fn model_to_string(model: Model) -> String {
    match model {
        Model::Llama3_3_70bVersatile => "llama-3.3-70b-versatile".to_string(),
        Model::Llama3_1_8bInstant => "llama-3.1-8b-instant".to_string(),
        Model::Mixtral8x7b32768 => "mixtral-8x7b-32768".to_string(),
    }
}

impl GroqClient {
    /// Create a client from an API key and strongly typed model variant.
    pub fn new_with_model_enum(secret_key: &str, model: Model) -> Self {
        Self::new_with_model_str(secret_key, &model_to_string(model))
    }

    /// Create a client from an API key and explicit model string.
    pub fn new_with_model_str(secret_key: &str, model_name: &str) -> Self {
        GroqClient {
            delegate_client: OpenAIClient::new_with_base_url(
                secret_key,
                model_name,
                "https://api.groq.com/openai/v1",
            ),
            model: model_name.to_string(),
        }
    }

    /// Create a client pointing at a custom Groq-compatible base URL.
    pub fn new_with_base_url(secret_key: &str, model_name: &str, base_url: &str) -> Self {
        GroqClient {
            delegate_client: OpenAIClient::new_with_base_url(secret_key, model_name, base_url),
            model: model_name.to_string(),
        }
    }
}

#[async_trait]
impl ClientWrapper for GroqClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn send_message(
        &self,
        messages: &[Message],
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<Message, Box<dyn Error>> {
        self.delegate_client.send_message(messages, tools).await
    }

    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        self.delegate_client.usage_slot()
    }
}
