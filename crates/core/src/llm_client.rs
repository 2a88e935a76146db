use crate::gateway::LessonGateway;
use crate::models::{DocumentPayload, HistoryEntry, MessageRole};
use anyhow::{Context, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestMessageContentPartImageArgs,
        ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContentPart,
        CreateChatCompletionRequestArgs, ImageUrlArgs,
    },
};
use async_trait::async_trait;
use tracing::debug;

/// Gemini's OpenAI-compatible endpoint.
pub const GEMINI_OPENAI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/openai";

/// Builds the client configuration for Gemini's OpenAI-compatible API.
pub fn gemini_config(api_key: &str) -> OpenAIConfig {
    OpenAIConfig::new()
        .with_api_key(api_key)
        .with_api_base(GEMINI_OPENAI_BASE)
}

/// An implementation of `LessonGateway` for any OpenAI-compatible API.
pub struct OpenAICompatibleGateway {
    client: Client<OpenAIConfig>,
    model: String,
    system_prompt: String,
    analyze_prompt: String,
}

impl OpenAICompatibleGateway {
    /// Creates a new gateway.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the OpenAI client, including API key and base URL.
    /// * `model` - The model identifier to use for chat completions.
    /// * `system_prompt` - The tutor persona sent as the system message.
    /// * `analyze_prompt` - The instruction that accompanies a freshly uploaded page.
    pub fn new(
        config: OpenAIConfig,
        model: String,
        system_prompt: String,
        analyze_prompt: String,
    ) -> Self {
        Self {
            client: Client::with_config(config),
            model,
            system_prompt,
            analyze_prompt,
        }
    }

    /// Builds the full message list: persona, prior turns, then the new user
    /// turn carrying the page image followed by the text.
    fn build_messages(
        &self,
        text: &str,
        document: &DocumentPayload,
        history: &[HistoryEntry],
    ) -> Result<Vec<ChatCompletionRequestMessage>> {
        let mut messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(self.system_prompt.clone())
                .build()?
                .into(),
        ];

        for entry in history {
            match entry.role {
                MessageRole::User => messages.push(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(entry.text.clone())
                        .build()?
                        .into(),
                ),
                MessageRole::Model => messages.push(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(entry.text.clone())
                        .build()?
                        .into(),
                ),
            }
        }

        let mut parts = Vec::new();
        if !document.data.is_empty() {
            let image = ChatCompletionRequestMessageContentPartImageArgs::default()
                .image_url(
                    ImageUrlArgs::default()
                        .url(data_url(document))
                        .build()?,
                )
                .build()?;
            parts.push(ChatCompletionRequestUserMessageContentPart::ImageUrl(image));
        }
        let text_part = ChatCompletionRequestMessageContentPartTextArgs::default()
            .text(text)
            .build()?;
        parts.push(ChatCompletionRequestUserMessageContentPart::Text(text_part));

        messages.push(
            ChatCompletionRequestUserMessageArgs::default()
                .content(parts)
                .build()?
                .into(),
        );
        Ok(messages)
    }

    async fn complete(&self, messages: Vec<ChatCompletionRequestMessage>) -> Result<String> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .temperature(0.0)
            .build()?;

        let response = self.client.chat().create(request).await?;
        let answer = response
            .choices
            .first()
            .context("No response choice from LLM")?
            .message
            .content
            .clone()
            .context("No content in LLM response")?;
        debug!(chars = answer.len(), "Received completion");
        Ok(answer)
    }
}

#[async_trait]
impl LessonGateway for OpenAICompatibleGateway {
    async fn analyze_document(&self, document: &DocumentPayload) -> Result<String> {
        let messages = self.build_messages(&self.analyze_prompt, document, &[])?;
        self.complete(messages).await
    }

    async fn chat_turn(
        &self,
        message: &str,
        document: &DocumentPayload,
        history: &[HistoryEntry],
    ) -> Result<String> {
        let messages = self.build_messages(message, document, history)?;
        self.complete(messages).await
    }
}

/// Inline `data:` URL for the page image.
fn data_url(document: &DocumentPayload) -> String {
    format!("data:{};base64,{}", document.media_type, document.data)
}
