//! Google Gemini client wrapper routed through its OpenAI-compatible surface.
//!
//! Google publishes an OpenAI-compatible Chat Completions endpoint alongside its native
//! Generative Language API; `GoogleClient` targets that endpoint so it can share the same
//! [`crate::clients::common::send_with_native_tools`] transport as every other provider adapter.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use unpod::client_wrapper::{ClientWrapper, Message, Role};
//! use unpod::clients::google::{GoogleClient, Model};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = std::env::var("GOOGLE_API_KEY")?;
//!     let client = GoogleClient::new_with_model_enum(&key, Model::Gemini25Flash);
//!     let reply = client
//!         .send_message(
//!             &[Message {
//!                 role: Role::User,
//!                 content: Arc::from("What industries benefit most from Gemini?"),
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

/// Client wrapper for Google's Gemini models accessed via the OpenAI-style API surface.
pub struct GoogleClient {
    delegate_client: OpenAIClient,
    model: String,
}

/// Gemini model identifiers.
pub enum Model {
    /// `gemini-2.5-flash` – the default dialogue model for the Google tier.
    Gemini25Flash,
    /// `gemini-2.5-pro` – higher quality, higher latency tier.
    Gemini25Pro,
    /// `gemini-2.0-flash` – previous-generation low-latency tier.
    Gemini20Flash,
}

/// Convert a [`Model`] variant into its public string identifier.
fn model_to_string(model: Model) -> String {
    match model {
        Model::Gemini25Flash => "gemini-2.5-flash".to_string(),
        Model::Gemini25Pro => "gemini-2.5-pro".to_string(),
        Model::Gemini20Flash => "gemini-2.0-flash".to_string(),
    }
}

impl GoogleClient {
    /// Create a client from an API key and strongly typed model variant.
    pub fn new_with_model_enum(secret_key: &str, model: Model) -> Self {
        Self::new_with_model_str(secret_key, &model_to_string(model))
    }

    /// Create a client from an API key and explicit model string.
    pub fn new_with_model_str(secret_key: &str, model_name: &str) -> Self {
        GoogleClient {
            delegate_client: OpenAIClient::new_with_base_url(
                secret_key,
                model_name,
                "https://generativelanguage.googleapis.com/v1beta/openai",
            ),
            model: model_name.to_string(),
        }
    }

    /// Create a client pointing at a custom Gemini-compatible base URL.
    pub fn new_with_base_url(secret_key: &str, model_name: &str, base_url: &str) -> Self {
        GoogleClient {
            delegate_client: OpenAIClient::new_with_base_url(secret_key, model_name, base_url),
            model: model_name.to_string(),
        }
    }
}

#[async_trait]
impl ClientWrapper for GoogleClient {
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
