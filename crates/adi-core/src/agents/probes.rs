//! Prompts and text scoring for provider-backed agents.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Map, Value};

use super::AgentKind;
use crate::domain::scoring::{calculate_confidence, create_result, normalize_score};
use crate::domain::{AgentInput, AgentResult, EvaluationContext};

const POSITIVE: &[&str] = &[
    "trusted", "reliable", "leading", "innovative", "quality", "popular", "recommended", "excellent",
    "loved", "premium",
];
const NEGATIVE: &[&str] = &[
    "scandal", "lawsuit", "recall", "complaint", "poor", "unreliable", "controversy", "boycott",
    "fraud", "decline",
];
const CITATION_DOMAINS: &[&str] = &[
    "wikipedia.org",
    "reuters.com",
    "forbes.com",
    "bloomberg.com",
    "wsj.com",
    "techcrunch.com",
    "businessinsider.com",
    "crunchbase.com",
    "linkedin.com",
];
const GEO_TERMS: &[&str] = &[
    "store", "stores", "location", "locations", "country", "countries", "city", "available in",
    "ships to", "global", "worldwide", "region",
];
const COMMERCE_TERMS: &[&str] = &[
    "buy", "price", "shop", "checkout", "cart", "discount", "retail", "order", "sale", "product",
];

static POSITIVE_TERMS: LazyLock<Regex> = LazyLock::new(|| term_regex(POSITIVE));
static NEGATIVE_TERMS: LazyLock<Regex> = LazyLock::new(|| term_regex(NEGATIVE));
static GEO: LazyLock<Regex> = LazyLock::new(|| term_regex(GEO_TERMS));
static COMMERCE: LazyLock<Regex> = LazyLock::new(|| term_regex(COMMERCE_TERMS));

/// One case-insensitive whole-word alternation over a fixed term list.
fn term_regex(terms: &[&str]) -> Regex {
    let alternatives: Vec<String> = terms.iter().map(|t| regex::escape(t)).collect();
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|"))).expect("Invalid term list regex")
}

/// Case-insensitive whole-word occurrences of `needle` in `haystack`.
///
/// The needle is only known at run time (a brand name), so this compiles
/// once per call. Fixed patterns go through [`count_matches`].
pub fn count_word(haystack: &str, needle: &str) -> usize {
    let pattern = format!(r"(?i)\b{}\b", regex::escape(needle));
    match Regex::new(&pattern) {
        Ok(re) => re.find_iter(haystack).count(),
        Err(_) => 0,
    }
}

pub fn count_matches(haystack: &str, re: &Regex) -> usize {
    re.find_iter(haystack).count()
}

fn evidence(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn excerpt(text: &str) -> String {
    text.chars().take(200).collect()
}

/// Prompt sent to every provider for `kind`.
pub fn prompt_for(kind: AgentKind, ctx: &EvaluationContext) -> String {
    let brand = &ctx.brand_name;
    let base = match kind {
        AgentKind::LlmTest => format!(
            "What do you know about the brand {brand} ({})? Describe what it offers.",
            ctx.website_url
        ),
        AgentKind::Sentiment => format!("Summarize current public sentiment about {brand}."),
        AgentKind::Citation => {
            format!("List recent media coverage and reference sources that mention {brand}.")
        }
        AgentKind::GeoVisibility => {
            format!("In which countries and regions is {brand} available or well known?")
        }
        AgentKind::Commerce => format!("What products does {brand} sell and where can they be bought?"),
        _ => format!("Describe {brand}."),
    };
    if ctx.queries.is_empty() {
        base
    } else {
        format!("{base}\nAlso answer: {}", ctx.queries.join("; "))
    }
}

/// Score one provider reply.
pub fn score_response(
    kind: AgentKind,
    ctx: &EvaluationContext,
    provider: &str,
    text: &str,
) -> Vec<AgentResult> {
    let mentions = count_word(text, &ctx.brand_name);
    let words = text.split_whitespace().count();
    let recognized = mentions > 0;
    let completeness = (words as f64 / 150.0).min(1.0);

    let (result_type, raw, score) = match kind {
        AgentKind::LlmTest => {
            let raw = (mentions.min(5) as f64) * 15.0 + completeness * 25.0;
            ("brand_recognition", raw, normalize_score(raw, 0.0, 100.0, 0.0, 100.0))
        }
        AgentKind::Sentiment => {
            let pos = count_matches(text, &POSITIVE_TERMS) as f64;
            let neg = count_matches(text, &NEGATIVE_TERMS) as f64;
            // Balance in [-1, 1] mapped onto 0..100, neutral at 50
            let balance = if pos + neg == 0.0 { 0.0 } else { (pos - neg) / (pos + neg) };
            let raw = 50.0 + balance * 50.0;
            ("sentiment_balance", raw, normalize_score(raw, 0.0, 100.0, 0.0, 100.0))
        }
        AgentKind::Citation => {
            let sources = CITATION_DOMAINS
                .iter()
                .filter(|d| text.to_lowercase().contains(*d))
                .count() as f64;
            let raw = sources * 20.0 + if recognized { 10.0 } else { 0.0 };
            ("citation_coverage", raw, normalize_score(raw, 0.0, 100.0, 0.0, 100.0))
        }
        AgentKind::GeoVisibility => {
            let raw = count_matches(text, &GEO) as f64 * 12.0;
            ("geo_presence", raw, normalize_score(raw, 0.0, 100.0, 5.0, 95.0))
        }
        AgentKind::Commerce => {
            let raw = count_matches(text, &COMMERCE) as f64 * 10.0;
            ("commerce_readiness", raw, normalize_score(raw, 0.0, 100.0, 5.0, 95.0))
        }
        _ => ("generic_probe", completeness * 100.0, completeness * 100.0),
    };

    let consistency = if recognized { 0.8 } else { 0.4 };
    let confidence = calculate_confidence(words / 15, consistency, completeness);
    vec![create_result(
        result_type,
        raw,
        score,
        confidence,
        evidence(&[
            ("provider", json!(provider)),
            ("brandMentions", json!(mentions)),
            ("excerpt", json!(excerpt(text))),
        ]),
    )]
}

/// Estimate from crawled content and earlier agent outputs, without calling
/// any provider. `None` when there is nothing to estimate from.
pub fn static_estimate(kind: AgentKind, input: &AgentInput) -> Option<Vec<AgentResult>> {
    let ctx = &input.context;
    let content = ctx.crawl_content.as_deref().unwrap_or("");
    let prior: Vec<f64> = input
        .previous_results
        .values()
        .flat_map(|o| o.results.iter().map(|r| r.normalized_score))
        .collect();

    if content.trim().is_empty() && prior.is_empty() {
        return None;
    }

    let prior_mean = if prior.is_empty() {
        None
    } else {
        Some(prior.iter().sum::<f64>() / prior.len() as f64)
    };
    let mentions = count_word(content, &ctx.brand_name) as f64;
    let signal = match kind {
        AgentKind::Sentiment => 50.0 + (count_matches(content, &POSITIVE_TERMS) as f64 - count_matches(content, &NEGATIVE_TERMS) as f64) * 5.0,
        AgentKind::Citation => CITATION_DOMAINS.iter().filter(|d| content.contains(*d)).count() as f64 * 15.0,
        AgentKind::GeoVisibility => count_matches(content, &GEO) as f64 * 8.0,
        AgentKind::Commerce => count_matches(content, &COMMERCE) as f64 * 6.0,
        _ => mentions.min(10.0) * 6.0,
    };
    let raw = match prior_mean {
        Some(mean) => (signal + mean) / 2.0,
        None => signal,
    };

    Some(vec![create_result(
        format!("{}_estimate", kind.name()),
        raw,
        normalize_score(raw, 0.0, 100.0, 5.0, 90.0),
        0.4,
        evidence(&[
            ("method", json!("static_analysis")),
            ("priorResults", json!(prior.len())),
            ("contentChars", json!(content.len())),
        ]),
    )])
}

/// Placeholder synthesized when every other tier failed.
pub fn emergency_estimate(kind: AgentKind) -> Vec<AgentResult> {
    vec![create_result(
        format!("{}_emergency", kind.name()),
        0.0,
        25.0,
        0.1,
        evidence(&[("method", json!("emergency_fallback"))]),
    )]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> EvaluationContext {
        EvaluationContext::new("eval-1", "https://acme.test", "Acme")
    }

    #[test]
    fn test_count_word_is_whole_word_and_case_insensitive() {
        assert_eq!(count_word("ACME acme Acmeville acme.", "Acme"), 3);
        assert_eq!(count_word("a+b a+b", "a+b"), 2);
    }

    #[test]
    fn test_term_lists_count_whole_words_once_each() {
        assert_eq!(count_matches("Trusted, RELIABLE and untrusted", &POSITIVE_TERMS), 2);
        assert_eq!(count_matches("ships to 40 countries, stores in every city", &GEO), 4);
        assert_eq!(count_matches("reshop shopping", &COMMERCE), 0);
    }

    #[test]
    fn test_sentiment_scoring_direction() {
        let good = score_response(AgentKind::Sentiment, &ctx(), "openai", "Acme is trusted, reliable and loved.");
        let bad = score_response(AgentKind::Sentiment, &ctx(), "openai", "Acme faces a lawsuit and a recall.");
        assert!(good[0].normalized_score > 50.0);
        assert!(bad[0].normalized_score < 50.0);
        assert_eq!(good[0].evidence["provider"], "openai");
    }

    #[test]
    fn test_scores_stay_in_range() {
        let long = "Acme buy price shop cart sale ".repeat(200);
        for kind in AgentKind::slow() {
            for r in score_response(kind, &ctx(), "p", &long) {
                assert!((0.0..=100.0).contains(&r.normalized_score));
                assert!((0.0..=1.0).contains(&r.confidence_level));
            }
        }
    }

    #[test]
    fn test_static_estimate_needs_some_signal() {
        let input = AgentInput::new(ctx());
        assert!(static_estimate(AgentKind::Citation, &input).is_none());

        let input = AgentInput::new(ctx().with_content("Acme on wikipedia.org and forbes.com"));
        let est = static_estimate(AgentKind::Citation, &input).unwrap();
        assert_eq!(est[0].result_type, "citation_agent_estimate");
    }
}
