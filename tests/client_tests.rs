use unpod::client_wrapper::{ClientWrapper, Role};
use unpod::clients::anthropic::{AnthropicClient, Model as AnthropicModel};
use unpod::clients::google::{GoogleClient, Model as GoogleModel};
use unpod::clients::groq::{GroqClient, Model as GroqModel};
use unpod::clients::openai::{Model as OpenAIModel, OpenAIClient};
use unpod::LLMSession;

#[test]
fn openai_client_reports_its_model_name() {
    let client = OpenAIClient::new_with_model_enum("fake_key", OpenAIModel::GPT41Nano);
    assert_eq!(client.model_name(), "gpt-4.1-nano");
}

#[test]
fn anthropic_client_delegates_model_name() {
    let client = AnthropicClient::new_with_model_enum("fake_key", AnthropicModel::ClaudeSonnet4);
    assert_eq!(client.model_name(), "claude-sonnet-4-0");
}

#[test]
fn google_client_delegates_model_name() {
    let client = GoogleClient::new_with_model_enum("fake_key", GoogleModel::Gemini25Flash);
    assert_eq!(client.model_name(), "gemini-2.5-flash");
}

#[test]
fn groq_client_delegates_model_name() {
    let client = GroqClient::new_with_model_enum("fake_key", GroqModel::Llama3_3_70bVersatile);
    assert_eq!(client.model_name(), "llama-3.3-70b-versatile");
}

#[test]
fn custom_base_url_is_trimmed_of_trailing_slash() {
    let client = OpenAIClient::new_with_base_url("fake_key", "gpt-4.1-nano", "https://example.com/v1/");
    assert_eq!(client.model_name(), "gpt-4.1-nano");
}

#[tokio::test]
async fn llm_session_wraps_any_client_wrapper_impl() {
    let client = OpenAIClient::new_with_model_enum("fake_key", OpenAIModel::GPT41Nano);
    let mut session = LLMSession::new(client, "You are a helpful assistant.".to_string(), 2048);
    // No live credentials in this environment: we only assert the call path doesn't panic.
    let _ = session.send_message(Role::User, "What is the capital of France?".to_string()).await;
}
