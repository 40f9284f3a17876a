//! OpenAI-compatible chat-completions client (Grok by default).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{parse_analysis_content, AiAnalysis, AnalysisError, ClassificationService, TicketSnapshot};

/// Default API root.
pub const DEFAULT_BASE_URL: &str = "https://api.x.ai/v1";

/// Default model name.
pub const DEFAULT_MODEL: &str = "grok-4";

/// Connect timeout for API requests (10 seconds).
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest error body echoed into `AnalysisError::Api`.
const MAX_ERROR_BODY_CHARS: usize = 500;

/// Sampling and limit settings for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout: Duration,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 3000,
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Classification service that asks a chat model for a JSON analysis.
pub struct ChatAnalysisClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: SecretString,
    options: ChatOptions,
}

impl ChatAnalysisClient {
    /// Creates a client for `{base_url}/chat/completions`.
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: SecretString,
        options: ChatOptions,
    ) -> Result<Self, AnalysisError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(options.request_timeout)
            .build()
            .map_err(|e| AnalysisError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            options,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl ClassificationService for ChatAnalysisClient {
    async fn analyze(&self, ticket: &TicketSnapshot) -> Result<AiAnalysis, AnalysisError> {
        let prompt = build_analysis_prompt(ticket);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &prompt,
            }],
            temperature: self.options.temperature,
            max_tokens: self.options.max_tokens,
            stream: false,
        };

        log::debug!(
            "Requesting analysis for {} from {} ({})",
            ticket.ticket_id,
            self.base_url,
            self.model
        );

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AnalysisError::Timeout(self.options.request_timeout.as_secs())
                } else {
                    AnalysisError::Http(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AnalysisError::Api {
                status,
                body: truncate(&body, MAX_ERROR_BODY_CHARS),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError::Decode(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(AnalysisError::EmptyResponse)?;

        Ok(parse_analysis_content(&content))
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}

/// Builds the analysis instruction sent as the single user message.
pub fn build_analysis_prompt(ticket: &TicketSnapshot) -> String {
    let body = if ticket.body.trim().is_empty() {
        "No body content available"
    } else {
        ticket.body.as_str()
    };

    format!(
        r#"You are an expert cybersecurity and abuse complaint analyst for a hosting provider's Ticket Management System (TMS). Analyze this abuse ticket and provide a comprehensive analysis.

TICKET DATA:
- Ticket ID: {ticket_id}
- Subject: {subject}
- Priority: {priority}
- Status: {status}
- Received: {received}
- Sender: {sender}
- Recipient: {recipient}

FULL TICKET BODY:
{body}

Please provide a detailed analysis in the following JSON format:
{{
    "key_issues": ["List of main issues identified from the body content"],
    "urgency_level": "high/medium/low",
    "threat_assessment": "Detailed threat analysis based on body content",
    "recommended_actions": ["List of specific actions to take"],
    "response_template": "Professional response template for the customer",
    "compliance_notes": "Compliance considerations",
    "technical_details": "Technical analysis if applicable",
    "body_analysis": "Analysis of the specific content in the ticket body"
}}

Focus on:
1. Analyzing the full body content for specific abuse details
2. Identifying the type of abuse (spam, copyright, resource abuse, etc.)
3. Assessing urgency and potential impact based on body content
4. Providing specific, actionable recommendations
5. Creating a professional response template
6. Highlighting compliance requirements
7. Technical details if relevant

Be thorough but concise. Reply with the JSON object only."#,
        ticket_id = ticket.ticket_id,
        subject = ticket.subject,
        priority = ticket.priority,
        status = ticket.status,
        received = ticket.received_at.to_rfc3339(),
        sender = ticket.sender,
        recipient = ticket.recipient,
        body = body,
    )
}
