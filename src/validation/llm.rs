//! LLM-based validation: the second, optional stage run
//! over listings that already passed mechanical validation. Talks to an
//! OpenAI-compatible `chat/completions` endpoint over `reqwest`; the
//! concrete provider integration is out of scope, only this request/
//! response shape is part of the contract.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::store::models::CatalogListing;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai/";
const GEMINI_MODEL: &str = "gemini-2.5-flash";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const SYSTEM_PROMPT: &str = "\
You are an expert at detecting non-original items from listing text.\n\n\
TASK: analyze the listings and decide which ones offer ORIGINAL items.\n\n\
REJECTION CRITERIA:\n\
1. Hidden signs of non-originality in the text (veiled phrases like \"like original\", \
\"quality copy\", \"analog of original\", \"compatible with\", \"fits\")\n\
2. Suspiciously low price (cheaper than 70% of the top-20% average)\n\n\
IMPORTANT:\n\
- Ignore explicit stop-words (used, analog) — mechanical validation already filtered those\n\
- Look for HIDDEN signs and price anomalies\n\
- Be strict but fair\n\
- If there is no sign of a fake, include the id in passed_ids\n\n\
RESPONSE FORMAT (strict JSON):\n\
{\"passed_ids\": [123, 456], \"rejected\": [{\"avito_item_id\": 789, \"reason\": \"short reason\"}]}";

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM request timed out after {REQUEST_TIMEOUT:?}")]
    Timeout,
    #[error("LLM request failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AiResult {
    pub passed: bool,
    pub rejection_reason: Option<String>,
    pub validation_details: serde_json::Value,
}

pub struct LlmValidator {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl LlmValidator {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: GEMINI_BASE_URL.to_string(),
            model: GEMINI_MODEL.to_string(),
        }
    }

    /// Returns a result per listing id present in the response. Empty input
    /// yields an empty map without a network call.
    pub async fn validate(
        &self,
        listings: &[CatalogListing],
        article: &str,
    ) -> Result<HashMap<i64, AiResult>, LlmError> {
        if listings.is_empty() {
            return Ok(HashMap::new());
        }

        let prompt = format_listings_for_prompt(listings, article);
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
            "response_format": {"type": "json_object"},
            "temperature": 0.3,
        });

        let response = self
            .client
            .post(format!("{}chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|err| if err.is_timeout() { LlmError::Timeout } else { LlmError::Request(err) })?
            .error_for_status()?;

        let completion: ChatCompletion = response.json().await?;
        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or_default();

        match serde_json::from_str::<LlmDecision>(content) {
            Ok(decision) => Ok(compose_results(decision)),
            Err(_) => Ok(fallback_all_passed(listings)),
        }
    }
}

fn compose_results(decision: LlmDecision) -> HashMap<i64, AiResult> {
    let mut results = HashMap::new();
    for id in decision.passed_ids {
        results.insert(
            id,
            AiResult {
                passed: true,
                rejection_reason: None,
                validation_details: json!({"stage": "ai", "decision": "passed"}),
            },
        );
    }
    for rejected in decision.rejected {
        results.insert(
            rejected.avito_item_id,
            AiResult {
                passed: false,
                rejection_reason: Some(rejected.reason.clone()),
                validation_details: json!({
                    "stage": "ai",
                    "decision": "rejected",
                    "model_reason": rejected.reason,
                }),
            },
        );
    }
    results
}

/// On JSON-decode failure, every listing that reached the LLM stage is
/// treated as passed, tagged so the failure is still visible downstream.
fn fallback_all_passed(listings: &[CatalogListing]) -> HashMap<i64, AiResult> {
    listings
        .iter()
        .map(|l| {
            (
                l.avito_item_id,
                AiResult {
                    passed: true,
                    rejection_reason: None,
                    validation_details: json!({
                        "stage": "ai",
                        "decision": "passed",
                        "fallback": "json_decode_error",
                    }),
                },
            )
        })
        .collect()
}

fn format_listings_for_prompt(listings: &[CatalogListing], article: &str) -> String {
    let mut lines = vec![format!("Article: {article}"), String::new()];

    let prices: Vec<i64> = listings.iter().map(|l| l.price).filter(|&p| p > 0).collect();
    if !prices.is_empty() {
        let mut sorted_desc = prices.clone();
        sorted_desc.sort_unstable_by(|a, b| b.cmp(a));
        let top20_count = std::cmp::max(1, (sorted_desc.len() as f64 * 0.2) as usize);
        let top20_avg =
            sorted_desc[..top20_count].iter().sum::<i64>() as f64 / top20_count as f64;
        let price70 = top20_avg * 0.7;
        lines.push(format!(
            "PRICE REFERENCE: top-20% average = {top20_avg:.2}, 70% threshold = {price70:.2}"
        ));
        lines.push(String::new());
    }

    for item in listings {
        lines.push(format!("ID: {}", item.avito_item_id));
        lines.push(format!("Title: {}", item.title));
        lines.push(format!("Description: {}", item.description));
        lines.push(format!("Price: {}", item.price));
        lines.push(String::new());
    }

    lines.join("\n")
}

#[derive(Debug, Deserialize)]
struct LlmDecision {
    #[serde(default)]
    passed_ids: Vec<i64>,
    #[serde(default)]
    rejected: Vec<LlmRejection>,
}

#[derive(Debug, Deserialize)]
struct LlmRejection {
    avito_item_id: i64,
    #[serde(default = "default_rejection_reason")]
    reason: String,
}

fn default_rejection_reason() -> String {
    "AI rejection".to_string()
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_json_falls_back_to_all_passed() {
        let listings = vec![CatalogListing {
            avito_item_id: 1,
            title: "widget".into(),
            description: "new".into(),
            price: 500,
            seller: "s".into(),
        }];
        let results = fallback_all_passed(&listings);
        let result = results.get(&1).unwrap();
        assert!(result.passed);
        assert_eq!(
            result.validation_details.get("fallback").and_then(|v| v.as_str()),
            Some("json_decode_error")
        );
    }

    #[test]
    fn composes_passed_and_rejected() {
        let decision = LlmDecision {
            passed_ids: vec![1],
            rejected: vec![LlmRejection { avito_item_id: 2, reason: "looks fake".into() }],
        };
        let results = compose_results(decision);
        assert!(results[&1].passed);
        assert!(!results[&2].passed);
        assert_eq!(results[&2].rejection_reason.as_deref(), Some("looks fake"));
    }

    fn listing(id: i64, price: i64) -> CatalogListing {
        CatalogListing {
            avito_item_id: id,
            title: "widget".into(),
            description: "brand new".into(),
            price,
            seller: "s".into(),
        }
    }

    #[tokio::test]
    async fn empty_listings_skip_the_network_call() {
        let validator = LlmValidator::new("test-key".to_string());
        let results = validator.validate(&[], "widget").await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn validate_parses_a_real_response_body() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "choices": [{
                "message": {
                    "content": "{\"passed_ids\":[1],\"rejected\":[{\"avito_item_id\":2,\"reason\":\"too cheap\"}]}"
                }
            }]
        });
        let mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let validator = LlmValidator {
            client: reqwest::Client::new(),
            api_key: "test-key".to_string(),
            base_url: format!("{}/", server.url()),
            model: GEMINI_MODEL.to_string(),
        };

        let results = validator.validate(&[listing(1, 1000), listing(2, 100)], "widget").await.unwrap();
        mock.assert_async().await;
        assert!(results[&1].passed);
        assert!(!results[&2].passed);
        assert_eq!(results[&2].rejection_reason.as_deref(), Some("too cheap"));
    }

    #[tokio::test]
    async fn validate_falls_back_to_all_passed_on_non_json_content() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "choices": [{"message": {"content": "not valid json"}}]
        });
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let validator = LlmValidator {
            client: reqwest::Client::new(),
            api_key: "test-key".to_string(),
            base_url: format!("{}/", server.url()),
            model: GEMINI_MODEL.to_string(),
        };

        let results = validator.validate(&[listing(1, 1000)], "widget").await.unwrap();
        assert!(results[&1].passed);
        assert_eq!(
            results[&1].validation_details.get("fallback").and_then(|v| v.as_str()),
            Some("json_decode_error")
        );
    }
}
