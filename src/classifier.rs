//! Relevance classification of harvested addresses.
//!
//! The classifier itself is an external service. This module defines the
//! interface the pipeline consumes, an HTTP client for it, and the fail-open
//! policy applied when it is missing, slow or broken.

use crate::config::{ClassifierConfig, Config};
use crate::error::{AppError, Result};
use crate::models::{ClassificationResult, ClassificationStats, ClassifiedEmail};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Picks the addresses worth contacting out of a raw harvest.
#[async_trait]
pub(crate) trait RelevanceClassifier: Send + Sync {
    async fn classify(
        &self,
        raw_emails: &[String],
        url: &str,
        store_name: &str,
    ) -> Result<ClassificationResult>;
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    emails: &'a [String],
    url: &'a str,
    store_name: &'a str,
}

#[derive(Deserialize)]
struct ClassifyResponse {
    #[serde(default)]
    emails: Vec<ClassifiedEmail>,
}

/// [`RelevanceClassifier`] speaking JSON over HTTP.
#[derive(Debug, Clone)]
pub(crate) struct HttpClassifier {
    client: Client,
    endpoint: url::Url,
    api_key: Option<String>,
    min_confidence: f32,
}

impl HttpClassifier {
    pub(crate) fn new(config: &ClassifierConfig, user_agent: &str) -> Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| AppError::Config("classifier endpoint is not set".to_string()))?;
        let client = Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| AppError::Generic(anyhow::anyhow!("Failed to build classifier client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: url::Url::parse(endpoint)?,
            api_key: config.api_key.clone(),
            min_confidence: config.min_confidence,
        })
    }
}

#[async_trait]
impl RelevanceClassifier for HttpClassifier {
    async fn classify(
        &self,
        raw_emails: &[String],
        url: &str,
        store_name: &str,
    ) -> Result<ClassificationResult> {
        tracing::debug!(
            target: "classifier",
            "Classifying {} emails for '{}' via {}",
            raw_emails.len(),
            store_name,
            self.endpoint
        );

        let mut request = self.client.post(self.endpoint.clone()).json(&ClassifyRequest {
            emails: raw_emails,
            url,
            store_name,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Classifier(format!("classifier answered {}", status)));
        }
        let body: ClassifyResponse = response
            .json()
            .await
            .map_err(|e| AppError::Classifier(format!("unreadable classifier response: {}", e)))?;

        Ok(accept_relevant(raw_emails, body.emails, self.min_confidence))
    }
}

/// Keeps classifier verdicts that meet `min_confidence` and name an address
/// from `raw_emails`, in raw order and raw spelling.
fn accept_relevant(raw_emails: &[String], verdicts: Vec<ClassifiedEmail>, min_confidence: f32) -> ClassificationResult {
    let mut accepted: HashMap<String, ClassifiedEmail> = HashMap::new();
    for verdict in verdicts {
        if verdict.confidence < min_confidence {
            continue;
        }
        accepted.entry(verdict.email.trim().to_lowercase()).or_insert(verdict);
    }

    let relevant: Vec<ClassifiedEmail> = raw_emails
        .iter()
        .filter_map(|raw| {
            accepted.remove(&raw.to_lowercase()).map(|verdict| ClassifiedEmail {
                email: raw.clone(),
                ..verdict
            })
        })
        .collect();

    ClassificationResult {
        stats: ClassificationStats {
            input: raw_emails.len(),
            relevant: relevant.len(),
            rejected: raw_emails.len() - relevant.len(),
        },
        relevant,
    }
}

/// Builds the configured classifier, or `None` when classification is disabled.
pub(crate) fn build_classifier(config: &Config) -> Result<Option<Arc<dyn RelevanceClassifier>>> {
    if !config.classifier.enabled {
        return Ok(None);
    }
    let classifier = HttpClassifier::new(&config.classifier, &config.user_agent)?;
    Ok(Some(Arc::new(classifier)))
}

/// Relevant addresses after the fail-open policy has been applied.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Relevance {
    pub emails: Vec<String>,
    /// Why the raw list was kept unchanged, when it was.
    pub fallback: Option<String>,
}

/// Classifies `raw_emails`, falling back to all of them when the classifier
/// is absent, errors, or exceeds `timeout`.
pub(crate) async fn classify_or_fail_open(
    classifier: Option<&dyn RelevanceClassifier>,
    timeout: Option<Duration>,
    raw_emails: &[String],
    url: &str,
    store_name: &str,
) -> Relevance {
    if raw_emails.is_empty() {
        return Relevance {
            emails: Vec::new(),
            fallback: None,
        };
    }

    let Some(classifier) = classifier else {
        return Relevance {
            emails: raw_emails.to_vec(),
            fallback: Some("classifier disabled".to_string()),
        };
    };

    let call = classifier.classify(raw_emails, url, store_name);
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(AppError::ClassifierTimeout(limit)),
        },
        None => call.await,
    };

    match outcome {
        Ok(result) => {
            tracing::info!(
                target: "classifier",
                "'{}': {} of {} emails relevant",
                store_name,
                result.stats.relevant,
                result.stats.input
            );
            Relevance {
                emails: result.emails(),
                fallback: None,
            }
        }
        Err(e) => {
            tracing::warn!(
                target: "classifier",
                "Classifier failed for '{}', keeping all {} raw emails: {}",
                store_name,
                raw_emails.len(),
                e
            );
            Relevance {
                emails: raw_emails.to_vec(),
                fallback: Some(e.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn raw(emails: &[&str]) -> Vec<String> {
        emails.iter().map(|e| e.to_string()).collect()
    }

    fn http_classifier(server: &MockServer, api_key: Option<&str>) -> HttpClassifier {
        let config = ClassifierConfig {
            enabled: true,
            endpoint: Some(format!("{}/classify", server.uri())),
            api_key: api_key.map(str::to_string),
            ..ClassifierConfig::default()
        };
        HttpClassifier::new(&config, "test-agent").unwrap()
    }

    #[tokio::test]
    async fn test_http_classifier_filters_by_confidence_and_input() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/classify"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(serde_json::json!({
                "url": "https://shop.example",
                "store_name": "Shop"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "emails": [
                    {"email": "HELLO@shop.example", "confidence": 0.95, "reasoning": "owner inbox"},
                    {"email": "press@shop.example", "confidence": 0.4},
                    {"email": "invented@elsewhere.example", "confidence": 0.99}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let result = http_classifier(&server, Some("secret"))
            .classify(
                &raw(&["hello@shop.example", "press@shop.example", "orders@shop.example"]),
                "https://shop.example",
                "Shop",
            )
            .await
            .unwrap();

        assert_eq!(result.emails(), vec!["hello@shop.example"]);
        assert_eq!(result.relevant[0].reasoning.as_deref(), Some("owner inbox"));
        assert_eq!(
            result.stats,
            ClassificationStats {
                input: 3,
                relevant: 1,
                rejected: 2
            }
        );
    }

    #[tokio::test]
    async fn test_http_classifier_error_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let result = http_classifier(&server, None)
            .classify(&raw(&["a@x.com"]), "https://x.com", "X")
            .await;
        assert!(matches!(result, Err(AppError::Classifier(_))));
    }

    #[test]
    fn test_build_classifier_respects_feature_flag() {
        let config = Config::default();
        assert!(build_classifier(&config).unwrap().is_none());

        let enabled_without_endpoint = Config {
            classifier: ClassifierConfig {
                enabled: true,
                ..ClassifierConfig::default()
            },
            ..Config::default()
        };
        assert!(build_classifier(&enabled_without_endpoint).is_err());
    }

    struct FailingClassifier;

    #[async_trait]
    impl RelevanceClassifier for FailingClassifier {
        async fn classify(&self, _: &[String], _: &str, _: &str) -> Result<ClassificationResult> {
            Err(AppError::Classifier("model offline".to_string()))
        }
    }

    struct HangingClassifier;

    #[async_trait]
    impl RelevanceClassifier for HangingClassifier {
        async fn classify(&self, _: &[String], _: &str, _: &str) -> Result<ClassificationResult> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ClassificationResult::default())
        }
    }

    #[tokio::test]
    async fn test_missing_classifier_keeps_all_raw_emails() {
        let emails = raw(&["a@x.com", "b@x.com"]);
        let relevance = classify_or_fail_open(None, None, &emails, "https://x.com", "X").await;

        assert_eq!(relevance.emails, vec!["a@x.com", "b@x.com"]);
        assert!(relevance.fallback.is_some());
    }

    #[tokio::test]
    async fn test_erroring_classifier_fails_open() {
        let emails = raw(&["a@x.com", "b@x.com"]);
        let relevance =
            classify_or_fail_open(Some(&FailingClassifier), None, &emails, "https://x.com", "X").await;

        assert_eq!(relevance.emails, emails);
        assert!(relevance.fallback.unwrap().contains("model offline"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_classifier_fails_open_after_timeout() {
        let emails = raw(&["a@x.com"]);
        let relevance = classify_or_fail_open(
            Some(&HangingClassifier),
            Some(Duration::from_secs(5)),
            &emails,
            "https://x.com",
            "X",
        )
        .await;

        assert_eq!(relevance.emails, emails);
        assert!(relevance.fallback.is_some());
    }

    #[tokio::test]
    async fn test_empty_harvest_skips_classifier() {
        let relevance = classify_or_fail_open(Some(&FailingClassifier), None, &[], "https://x.com", "X").await;
        assert!(relevance.emails.is_empty());
        assert_eq!(relevance.fallback, None);
    }
}
