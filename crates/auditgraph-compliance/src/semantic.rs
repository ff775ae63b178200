use auditgraph_ai::{backoff_delay, GenerationRequest, TextGenerator};
use auditgraph_core::{AuditGraphError, PipelineSettings, Result, RuleId};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const JUDGE_SYSTEM_PROMPT: &str = "You are a compliance reviewer for regulated assurance reports. \
Answer only with a JSON object of the form \
{\"satisfied\": bool, \"confidence\": number between 0 and 1, \"rationale\": string}.";

/// Parsed reply of the collaborator to a semantic rule.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SemanticVerdict {
    pub satisfied: bool,
    pub confidence: f32,
    #[serde(default)]
    pub rationale: String,
}

/// Asks the generation collaborator whether text satisfies a named principle.
#[derive(Clone)]
pub struct SemanticJudge {
    generator: Arc<dyn TextGenerator>,
    max_retries: u32,
    backoff_base: Duration,
}

impl std::fmt::Debug for SemanticJudge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticJudge")
            .field("provider", &self.generator.provider_name())
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl SemanticJudge {
    pub fn new(generator: Arc<dyn TextGenerator>, settings: &PipelineSettings) -> Self {
        Self {
            generator,
            max_retries: settings.max_retries,
            backoff_base: Duration::from_millis(settings.backoff_base_ms),
        }
    }

    /// Collaborator errors are retried with backoff until `deadline`; a reply
    /// that never parses, a call that never succeeds or an expired deadline is
    /// a `ValidationFailure` for the rule.
    pub async fn judge(
        &self,
        rule_id: &RuleId,
        principle: &str,
        text: &str,
        deadline: Instant,
    ) -> Result<SemanticVerdict> {
        let prompt = format!(
            "Principle: {}\n\nSection text:\n{}\n\nDoes the section text satisfy the principle?",
            principle, text
        );
        let request = GenerationRequest::new(prompt, 0.0, 256).with_system(JUDGE_SYSTEM_PROMPT);
        let expired = |what: &str| AuditGraphError::ValidationFailure {
            rule_id: rule_id.clone(),
            message: format!("semantic judgement deadline exceeded during {}", what),
        };

        let mut last_error = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = backoff_delay(self.backoff_base, attempt);
                if Instant::now() + delay >= deadline {
                    return Err(expired("backoff"));
                }
                tokio::time::sleep(delay).await;
            }
            match tokio::time::timeout_at(deadline, self.generator.generate(&request)).await {
                Err(_) => {
                    warn!(rule = %rule_id, attempt = attempt + 1, "semantic judgement timed out");
                    return Err(expired("the collaborator call"));
                }
                Ok(Ok(response)) => {
                    let verdict = parse_verdict(&response.content).map_err(|message| {
                        AuditGraphError::ValidationFailure {
                            rule_id: rule_id.clone(),
                            message,
                        }
                    })?;
                    debug!(
                        rule = %rule_id,
                        satisfied = verdict.satisfied,
                        confidence = verdict.confidence,
                        "semantic verdict"
                    );
                    return Ok(verdict);
                }
                Ok(Err(e)) => {
                    warn!(
                        rule = %rule_id,
                        attempt = attempt + 1,
                        "semantic judgement failed: {}",
                        e
                    );
                    last_error = e.to_string();
                }
            }
        }

        Err(AuditGraphError::ValidationFailure {
            rule_id: rule_id.clone(),
            message: format!("semantic judgement unavailable: {}", last_error),
        })
    }
}

/// Accepts the bare JSON object or one wrapped in prose or a code fence.
pub fn parse_verdict(reply: &str) -> std::result::Result<SemanticVerdict, String> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &reply[s..=e],
        _ => return Err(format!("unparsable semantic reply: {}", truncate(reply))),
    };
    let verdict: SemanticVerdict = serde_json::from_str(json)
        .map_err(|e| format!("unparsable semantic reply ({}): {}", e, truncate(reply)))?;
    if !(0.0..=1.0).contains(&verdict.confidence) {
        return Err(format!("confidence {} outside [0, 1]", verdict.confidence));
    }
    Ok(verdict)
}

fn truncate(s: &str) -> String {
    s.chars().take(120).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_fenced_replies() {
        let plain = parse_verdict(r#"{"satisfied": true, "confidence": 0.9}"#).unwrap();
        assert!(plain.satisfied);

        let fenced = parse_verdict(
            "Here you go:\n```json\n{\"satisfied\": false, \"confidence\": 0.4, \"rationale\": \"vague\"}\n```",
        )
        .unwrap();
        assert!(!fenced.satisfied);
        assert_eq!(fenced.rationale, "vague");
    }

    #[test]
    fn rejects_garbage_and_out_of_range_confidence() {
        assert!(parse_verdict("yes, looks fine").is_err());
        assert!(parse_verdict(r#"{"satisfied": true}"#).is_err());
        assert!(parse_verdict(r#"{"satisfied": true, "confidence": 7}"#).is_err());
    }

    /// Never answers.
    struct Silent;

    #[async_trait::async_trait]
    impl TextGenerator for Silent {
        async fn generate(
            &self,
            _request: &GenerationRequest,
        ) -> auditgraph_ai::GenerationResult<auditgraph_ai::GenerationResponse> {
            std::future::pending().await
        }

        fn provider_name(&self) -> &str {
            "silent"
        }

        fn model_name(&self) -> &str {
            "silent"
        }
    }

    #[tokio::test]
    async fn hanging_collaborator_fails_at_the_deadline() {
        let judge = SemanticJudge::new(Arc::new(Silent), &PipelineSettings::default());
        let rule_id: RuleId = "SKEPTICISM".into();
        let started = Instant::now();

        let err = judge
            .judge(&rule_id, "professional skepticism", "text", started + Duration::from_millis(50))
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(5));
        match err {
            AuditGraphError::ValidationFailure { rule_id, message } => {
                assert_eq!(rule_id, "SKEPTICISM");
                assert!(message.contains("deadline"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
