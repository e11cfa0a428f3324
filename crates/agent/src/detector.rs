use std::collections::BTreeSet;

use parley_core::config::{DetectionConfig, ToolsConfig};
use serde::Serialize;

use crate::conversation::{normalize_text, tokenize};
use crate::tools::{RegisteredTool, ToolArguments, ToolRegistry};

const KEYWORD_WEIGHT: f64 = 0.15;
const KEYWORD_CAP: f64 = 0.45;
const TRIGGER_WEIGHT: f64 = 0.25;
const SLOT_WEIGHT: f64 = 0.4;
const MIN_KEYWORD_LEN: usize = 4;

const STOP_WORDS: &[&str] = &[
    "about", "after", "also", "been", "does", "from", "have", "into", "just", "like", "make",
    "more", "only", "other", "over", "some", "such", "than", "that", "their", "them", "then",
    "there", "these", "they", "this", "what", "when", "where", "which", "while", "will", "with",
    "would", "your",
];

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionResult {
    pub matched: bool,
    pub tool_name: Option<String>,
    pub extracted_arguments: ToolArguments,
    /// Required parameters the message did not supply.
    pub missing_parameters: Vec<String>,
    pub confidence: f64,
    pub reasoning: String,
}

impl DetectionResult {
    pub fn no_match(confidence: f64, reasoning: impl Into<String>) -> Self {
        Self {
            matched: false,
            tool_name: None,
            extracted_arguments: ToolArguments::new(),
            missing_parameters: Vec::new(),
            confidence,
            reasoning: reasoning.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolScore {
    pub tool_name: String,
    pub confidence: f64,
    pub keyword_hits: usize,
    pub trigger_hits: usize,
    pub extracted_arguments: ToolArguments,
    pub missing_parameters: Vec<String>,
}

/// Scores every registered tool against a message and picks the best one
/// above the threshold. Equal scores resolve to the earliest registration.
#[derive(Clone, Debug)]
pub struct ToolDetector {
    threshold: f64,
    enabled: bool,
}

impl Default for ToolDetector {
    fn default() -> Self {
        Self::new(0.3)
    }
}

impl ToolDetector {
    pub fn new(threshold: f64) -> Self {
        Self { threshold: threshold.clamp(0.0, 1.0), enabled: true }
    }

    pub fn from_config(tools: &ToolsConfig, detection: &DetectionConfig) -> Self {
        Self { enabled: tools.enabled, ..Self::new(detection.threshold) }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn detect(&self, message: &str, registry: &ToolRegistry) -> DetectionResult {
        if !self.enabled {
            return DetectionResult::no_match(0.0, "tool detection is disabled");
        }
        if registry.is_empty() {
            return DetectionResult::no_match(0.0, "no tools are registered");
        }

        let normalized = normalize_text(message);
        let tokens: BTreeSet<String> = tokenize(&normalized).into_iter().collect();

        let mut best: Option<ToolScore> = None;
        for entry in registry.entries() {
            let score = score_tool(entry, message, &normalized, &tokens);
            let better = best.as_ref().map_or(true, |current| score.confidence > current.confidence);
            if better {
                best = Some(score);
            }
        }

        let Some(best) = best else {
            return DetectionResult::no_match(0.0, "no tools are registered");
        };

        let reasoning = format!(
            "{}: {} keyword hit(s), {} trigger hit(s), {} missing parameter(s), score {:.2} vs threshold {:.2}",
            best.tool_name,
            best.keyword_hits,
            best.trigger_hits,
            best.missing_parameters.len(),
            best.confidence,
            self.threshold
        );

        if best.confidence < self.threshold {
            return DetectionResult::no_match(best.confidence, reasoning);
        }

        DetectionResult {
            matched: true,
            tool_name: Some(best.tool_name),
            extracted_arguments: best.extracted_arguments,
            missing_parameters: best.missing_parameters,
            confidence: best.confidence,
            reasoning,
        }
    }

    /// Scores of every tool in registration order.
    pub fn score_all(&self, message: &str, registry: &ToolRegistry) -> Vec<ToolScore> {
        let normalized = normalize_text(message);
        let tokens: BTreeSet<String> = tokenize(&normalized).into_iter().collect();
        registry
            .entries()
            .iter()
            .map(|entry| score_tool(entry, message, &normalized, &tokens))
            .collect()
    }
}

fn description_keywords(description: &str) -> BTreeSet<String> {
    tokenize(&normalize_text(description))
        .into_iter()
        .filter(|token| token.chars().count() >= MIN_KEYWORD_LEN)
        .filter(|token| !STOP_WORDS.contains(&token.as_str()))
        .collect()
}

fn score_tool(
    entry: &RegisteredTool,
    message: &str,
    normalized: &str,
    tokens: &BTreeSet<String>,
) -> ToolScore {
    let spec = entry.spec();

    let keyword_hits = description_keywords(&spec.description).intersection(tokens).count();
    let keyword_score = (keyword_hits as f64 * KEYWORD_WEIGHT).min(KEYWORD_CAP);

    let trigger_hits = entry.triggers().iter().filter(|trigger| trigger.is_match(normalized)).count();
    let trigger_score = trigger_hits as f64 * TRIGGER_WEIGHT;

    let mut extracted_arguments = ToolArguments::new();
    let mut missing_parameters = Vec::new();
    let mut required_total = 0_usize;
    let mut required_found = 0_usize;

    for (name, param) in &spec.parameters {
        let value = entry.slot_value(name, message).and_then(|raw| param.param_type.coerce(raw));

        if param.required {
            required_total += 1;
        }
        match value {
            Some(value) => {
                if param.required {
                    required_found += 1;
                }
                extracted_arguments.insert(name.clone(), value);
            }
            None if param.required => missing_parameters.push(name.clone()),
            None => {}
        }
    }

    let slot_score = if required_total == 0 {
        0.0
    } else {
        SLOT_WEIGHT * required_found as f64 / required_total as f64
    };

    ToolScore {
        tool_name: spec.name.clone(),
        confidence: (keyword_score + trigger_score + slot_score).clamp(0.0, 1.0),
        keyword_hits,
        trigger_hits,
        extracted_arguments,
        missing_parameters,
    }
}

#[cfg(test)]
mod tests {
    use parley_core::config::{DetectionConfig, ToolsConfig};
    use serde_json::json;

    use super::ToolDetector;
    use crate::tools::testing::StaticTool;
    use crate::tools::{DeliveryTracker, ParamSpec, ParamType, ToolRegistry, ToolSpec};

    fn tracker_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(DeliveryTracker::default()).expect("register tracker");
        registry
    }

    #[test]
    fn order_tracking_request_matches_with_order_id() {
        let result = ToolDetector::default().detect("track my order 12345", &tracker_registry());

        assert!(result.matched);
        assert_eq!(result.tool_name.as_deref(), Some("delivery_tracker"));
        assert_eq!(result.extracted_arguments.get("order_id"), Some(&json!("12345")));
        assert!(result.missing_parameters.is_empty());
        assert!(result.confidence > 0.9 && result.confidence <= 1.0);
    }

    #[test]
    fn unrelated_message_does_not_match() {
        let result = ToolDetector::default().detect("tell me a joke", &tracker_registry());

        assert!(!result.matched);
        assert!(result.tool_name.is_none());
        assert!(result.extracted_arguments.is_empty());
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn intent_without_identifier_reports_missing_parameter() {
        let result = ToolDetector::default().detect("where is my delivery?", &tracker_registry());

        assert!(result.matched);
        assert_eq!(result.missing_parameters, vec!["order_id".to_string()]);
        assert!(result.extracted_arguments.is_empty());
    }

    #[test]
    fn package_question_and_bare_reference_both_match() {
        let registry = tracker_registry();
        let detector = ToolDetector::default();

        let question = detector.detect("where is my package?", &registry);
        assert!(question.matched, "{}", question.reasoning);
        assert_eq!(question.missing_parameters, vec!["order_id".to_string()]);

        let reply = detector.detect("1Z999AA1012", &registry);
        assert!(reply.matched, "{}", reply.reasoning);
        assert_eq!(reply.extracted_arguments.get("order_id"), Some(&json!("1Z999AA1012")));
        assert!(reply.missing_parameters.is_empty());
    }

    #[test]
    fn detection_is_deterministic() {
        let registry = tracker_registry();
        let detector = ToolDetector::default();
        let first = detector.detect("Has my parcel shipped? tracking number 1Z999AA1012", &registry);
        let second = detector.detect("Has my parcel shipped? tracking number 1Z999AA1012", &registry);
        assert_eq!(first, second);
    }

    #[test]
    fn equal_scores_go_to_first_registered_tool() {
        let twin = |name: &str| {
            ToolSpec::new(name, "Check the weather forecast")
                .with_trigger(r"\bforecast\b")
                .with_parameter(
                    "city",
                    ParamSpec::required(ParamType::String, "City").with_pattern(r"\bin\s+(\w+)"),
                )
        };

        let mut registry = ToolRegistry::new();
        registry.register(StaticTool(twin("forecast_primary"))).expect("register");
        registry.register(StaticTool(twin("forecast_backup"))).expect("register");

        let detector = ToolDetector::default();
        let scores = detector.score_all("weather forecast in Oslo", &registry);
        assert_eq!(scores[0].confidence, scores[1].confidence);

        for _ in 0..5 {
            let result = detector.detect("weather forecast in Oslo", &registry);
            assert_eq!(result.tool_name.as_deref(), Some("forecast_primary"));
            assert_eq!(result.extracted_arguments.get("city"), Some(&json!("Oslo")));
        }
    }

    #[test]
    fn threshold_is_configurable() {
        let registry = tracker_registry();
        let strict = ToolDetector::new(0.99);
        let result = strict.detect("where is my delivery?", &registry);
        assert!(!result.matched);
        assert!(result.confidence > 0.0);
        assert!(result.reasoning.contains("delivery_tracker"));
    }

    #[test]
    fn disabled_tools_never_match() {
        let detector = ToolDetector::from_config(
            &ToolsConfig { enabled: false, timeout_secs: 30, result_only: false },
            &DetectionConfig { threshold: 0.3 },
        );
        let result = detector.detect("track my order 12345", &tracker_registry());
        assert!(!result.matched);
        assert_eq!(result.reasoning, "tool detection is disabled");
    }

    #[test]
    fn handles_common_tracking_phrases() {
        struct Case {
            text: &'static str,
            matched: bool,
            order_id: Option<&'static str>,
        }

        let cases = vec![
            Case { text: "track my order 12345", matched: true, order_id: Some("12345") },
            Case { text: "Where is my package 88812?", matched: true, order_id: Some("88812") },
            Case {
                text: "can you trace shipment 1Z999AA1012",
                matched: true,
                order_id: Some("1Z999AA1012"),
            },
            Case { text: "delivery status for order #A-77812", matched: true, order_id: Some("A-77812") },
            Case { text: "has my order arrived yet", matched: true, order_id: None },
            Case { text: "what's the capital of France", matched: false, order_id: None },
            Case { text: "tell me a joke", matched: false, order_id: None },
            Case { text: "hello there", matched: false, order_id: None },
        ];

        let registry = tracker_registry();
        let detector = ToolDetector::default();
        for case in cases {
            let result = detector.detect(case.text, &registry);
            assert_eq!(result.matched, case.matched, "matched mismatch for `{}`", case.text);
            let order_id = result.extracted_arguments.get("order_id").and_then(|v| v.as_str());
            assert_eq!(order_id, case.order_id, "order id mismatch for `{}`", case.text);
        }
    }
}
