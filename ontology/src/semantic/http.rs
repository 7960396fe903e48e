use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;

use super::{
    CandidateUnit, ColumnAnnotation, ColumnContext, RelationshipVerdict, SemanticClient,
    SemanticError, TableContext, TableDescription,
};
use crate::config::LlmConfig;

const BASE_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 30_000;

const RELATIONSHIP_SYSTEM_PROMPT: &str = "You review candidate foreign-key relationships in a relational database. \
You are given two columns with their types, statistics and sample values, plus join statistics computed over the live data. \
Decide whether the source column references the target column. Judge from the data and types, not from column names alone. \
Answer with a single JSON object: \
{\"is_valid_fk\": bool, \"confidence\": number between 0 and 1, \"cardinality\": one of \"1:1\", \"N:1\", \"1:N\", \"N:M\", \
\"reasoning\": short justification, \"source_role\": optional short semantic role of the source column such as \"customer\" or \"billing_address\"}.";

const TABLE_SYSTEM_PROMPT: &str = "You name and describe tables of a relational database for a business glossary. \
You are given a table's columns with types, statistics and sample values. \
Answer with a single JSON object: \
{\"entity_name\": singular business entity name in PascalCase, \"description\": one or two sentences, \"synonyms\": array of strings}.";

const COLUMN_SYSTEM_PROMPT: &str = "You annotate a single column of a relational database table. \
You are given the column's type, statistics, sample values and its deterministic role. \
Answer with a single JSON object: \
{\"purpose\": short phrase, \"semantic_type\": e.g. \"email\", \"currency_amount\", \"country_code\" or null, \
\"description\": one sentence, \"synonyms\": array of strings}.";

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*\})\s*```").expect("fenced JSON pattern")
});

/// OpenAI-compatible chat-completions client.
pub struct HttpSemanticClient {
    client: Client,
    config: LlmConfig,
}

impl HttpSemanticClient {
    pub fn new(config: LlmConfig) -> Result<Self, SemanticError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SemanticError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    async fn complete<T: DeserializeOwned>(
        &self,
        system: &str,
        user: String,
    ) -> Result<T, SemanticError> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let body = serde_json::json!({
            "model": self.config.model,
            "temperature": 0,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });

        let mut attempt: u32 = 0;
        loop {
            match self.send_once(&url, &body).await {
                Ok(content) => return parse_json_content(&content),
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Retry { error, retry_after }) => {
                    if attempt >= self.config.max_retries {
                        return Err(error);
                    }
                    let delay = retry_after.unwrap_or_else(|| backoff(attempt));
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "Retrying semantic call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn send_once(&self, url: &str, body: &serde_json::Value) -> Result<String, Attempt> {
        let mut request = self.client.post(url).json(body);
        if let Some(ref key) = self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_connect() {
                Attempt::retry(SemanticError::Configuration(format!(
                    "endpoint unreachable at {url}: {e}"
                )))
            } else if e.is_timeout() {
                Attempt::retry(SemanticError::Transport(format!("timeout: {e}")))
            } else {
                Attempt::retry(SemanticError::Transport(e.to_string()))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(|secs| Duration::from_millis((secs * 1000).min(MAX_BACKOFF_MS)));
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text, retry_after));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Attempt::Fatal(SemanticError::InvalidResponse(e.to_string())))?;

        data["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                Attempt::Fatal(SemanticError::InvalidResponse(
                    "missing choices[0].message.content".to_string(),
                ))
            })
    }
}

enum Attempt {
    Retry {
        error: SemanticError,
        retry_after: Option<Duration>,
    },
    Fatal(SemanticError),
}

impl Attempt {
    fn retry(error: SemanticError) -> Self {
        Attempt::Retry {
            error,
            retry_after: None,
        }
    }
}

fn classify_status(status: StatusCode, body: &str, retry_after: Option<Duration>) -> Attempt {
    let snippet: String = body.chars().take(200).collect();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => Attempt::Fatal(
            SemanticError::Configuration(format!("HTTP {status}: {snippet}")),
        ),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => Attempt::Retry {
            error: SemanticError::Transport(format!("HTTP {status}")),
            retry_after,
        },
        s if s.is_server_error() => Attempt::Retry {
            error: SemanticError::Transport(format!("HTTP {status}: {snippet}")),
            retry_after,
        },
        _ => Attempt::Fatal(SemanticError::Transport(format!("HTTP {status}: {snippet}"))),
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis((BASE_BACKOFF_MS << attempt.min(6)).min(MAX_BACKOFF_MS))
}

/// Parse model output that should be a JSON object, tolerating code fences
/// and surrounding prose.
fn parse_json_content<T: DeserializeOwned>(content: &str) -> Result<T, SemanticError> {
    let trimmed = content.trim();
    let candidate = if let Some(caps) = FENCED_JSON.captures(trimmed) {
        caps.get(1).map(|m| m.as_str()).unwrap_or(trimmed)
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end { &trimmed[start..=end] } else { trimmed }
    } else {
        trimmed
    };
    serde_json::from_str(candidate).map_err(|e| {
        let snippet: String = trimmed.chars().take(120).collect();
        SemanticError::InvalidResponse(format!("{e} in {snippet:?}"))
    })
}

fn to_prompt<T: serde::Serialize>(value: &T) -> Result<String, SemanticError> {
    serde_json::to_string_pretty(value).map_err(|e| SemanticError::InvalidResponse(e.to_string()))
}

#[async_trait::async_trait]
impl SemanticClient for HttpSemanticClient {
    async fn validate_relationship(
        &self,
        unit: &CandidateUnit,
    ) -> Result<RelationshipVerdict, SemanticError> {
        let user = format!(
            "Candidate relationship {} -> {}:\n{}",
            unit.source.qualified_name,
            unit.target.qualified_name,
            to_prompt(unit)?
        );
        self.complete(RELATIONSHIP_SYSTEM_PROMPT, user).await
    }

    async fn describe_table(&self, table: &TableContext) -> Result<TableDescription, SemanticError> {
        let user = format!("Table {}:\n{}", table.qualified_name, to_prompt(table)?);
        self.complete(TABLE_SYSTEM_PROMPT, user).await
    }

    async fn enrich_column(
        &self,
        column: &ColumnContext,
    ) -> Result<ColumnAnnotation, SemanticError> {
        let user = format!(
            "Column {} of table {}:\n{}",
            column.column.qualified_name,
            column.table,
            to_prompt(column)?
        );
        self.complete(COLUMN_SYSTEM_PROMPT, user).await
    }
}
