//! Fast agents: pattern matching over crawled page text.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};

use super::probes::{count_matches, count_word};
use super::AgentKind;
use crate::contract::Agent;
use crate::domain::scoring::{aggregate_scores, calculate_confidence, create_result, normalize_score};
use crate::domain::{AgentConfig, AgentError, AgentInput, AgentOutput, AgentResult};

static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("Invalid tag regex"));
static TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title>.+?</title>").expect("Invalid title regex"));
static META_DESCRIPTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)<meta\s+name=["']description["']"#).expect("Invalid meta description regex"));
static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<h[1-3][\s>]").expect("Invalid heading regex"));
static JSON_LD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)application/ld\+json"#).expect("Invalid JSON-LD regex"));
static MICRODATA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)itemtype=").expect("Invalid microdata regex"));
static SCHEMA_TYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""@type"\s*:\s*"([A-Za-z]+)""#).expect("Invalid schema type regex"));
static SAME_AS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)"sameAs""#).expect("Invalid same as regex"));
static WIKI_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)wikipedia\.org|wikidata\.org").expect("Invalid wiki link regex"));
static ORGANIZATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)"@type"\s*:\s*"Organization""#).expect("Invalid organization regex"));
static FOUNDING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:founded|established|since|est\.)\s+(?:in\s+)?(1[6-9]\d\d|20\d\d)\b").expect("Invalid founding regex"));
static STORY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:heritage|history|legacy|tradition|story|founder)\b").expect("Invalid story regex"));

pub struct HeuristicAgent {
    kind: AgentKind,
}

impl HeuristicAgent {
    pub fn new(kind: AgentKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }
}

fn ev(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn words(content: &str) -> Vec<String> {
    let cleaned = TAG.replace_all(content, " ");
    cleaned
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn crawl(content: &str) -> Vec<AgentResult> {
    let word_count = words(content).len();
    let has_title = TITLE.is_match(content);
    let has_meta = META_DESCRIPTION.is_match(content);
    let headings = count_matches(content, &HEADING);

    let volume = normalize_score(word_count as f64 / 10.0, 0.0, 100.0, 0.0, 100.0);
    let structure = (has_title as u8 as f64) * 40.0 + (has_meta as u8 as f64) * 30.0 + (headings.min(6) as f64) * 5.0;
    vec![
        create_result(
            "content_volume",
            word_count as f64,
            volume,
            calculate_confidence(word_count / 50, 0.8, 1.0),
            ev(&[("words", json!(word_count))]),
        ),
        create_result(
            "page_structure",
            structure,
            structure,
            0.8,
            ev(&[
                ("title", json!(has_title)),
                ("metaDescription", json!(has_meta)),
                ("headings", json!(headings)),
            ]),
        ),
    ]
}

fn schema(content: &str) -> Vec<AgentResult> {
    let json_ld = count_matches(content, &JSON_LD);
    let microdata = count_matches(content, &MICRODATA);
    let types: std::collections::BTreeSet<String> =
        SCHEMA_TYPE.captures_iter(content).map(|c| c[1].to_string()).collect();
    let key_types = ["Organization", "Product", "Review", "FAQPage", "BreadcrumbList"]
        .iter()
        .filter(|t| types.contains(**t))
        .count();

    let coverage = (json_ld.min(3) * 15 + microdata.min(3) * 5) as f64 + key_types as f64 * 8.0;
    vec![create_result(
        "schema_structured_data_coverage",
        coverage,
        normalize_score(coverage, 0.0, 100.0, 10.0, 95.0),
        calculate_confidence(json_ld + microdata, 0.7, ratio(key_types, 5)),
        ev(&[
            ("jsonLdBlocks", json!(json_ld)),
            ("microdataItems", json!(microdata)),
            ("types", json!(types)),
        ]),
    )]
}

fn semantic(content: &str) -> Vec<AgentResult> {
    let all = words(content);
    let unique: std::collections::HashSet<&String> = all.iter().collect();
    let diversity = ratio(unique.len(), all.len()) * 100.0;
    // Very repetitive and very scattered copy both read poorly
    let consistency = 100.0 - (diversity - 45.0).abs() * 1.5;
    vec![create_result(
        "vocabulary_consistency",
        diversity,
        normalize_score(consistency, 0.0, 100.0, 20.0, 95.0),
        calculate_confidence(all.len() / 30, 0.6, (all.len() as f64 / 300.0).min(1.0)),
        ev(&[("terms", json!(all.len())), ("uniqueTerms", json!(unique.len()))]),
    )]
}

fn conversational(content: &str) -> Vec<AgentResult> {
    let all = words(content);
    let questions = content.matches('?').count();
    let second_person = all.iter().filter(|w| matches!(w.as_str(), "you" | "your" | "yours")).count();
    let raw = (questions.min(10) as f64) * 4.0 + ratio(second_person, all.len()) * 600.0;
    vec![create_result(
        "conversational_tone",
        raw,
        normalize_score(raw, 0.0, 100.0, 5.0, 95.0),
        calculate_confidence(all.len() / 40, 0.6, 0.7),
        ev(&[("questions", json!(questions)), ("secondPerson", json!(second_person))]),
    )]
}

fn knowledge_graph(content: &str, brand: &str) -> Vec<AgentResult> {
    let same_as = count_matches(content, &SAME_AS);
    let wiki = count_matches(content, &WIKI_LINK);
    let org = count_matches(content, &ORGANIZATION);
    let mentions = count_word(content, brand);
    let raw = (same_as.min(3) * 15 + wiki.min(2) * 15 + org.min(1) * 15) as f64 + (mentions.min(5) as f64) * 2.0;
    vec![create_result(
        "entity_linkage",
        raw,
        normalize_score(raw, 0.0, 100.0, 0.0, 100.0),
        calculate_confidence(same_as + wiki + org + mentions, 0.7, 0.6),
        ev(&[
            ("sameAs", json!(same_as)),
            ("wikiLinks", json!(wiki)),
            ("organizationSchema", json!(org > 0)),
            ("brandMentions", json!(mentions)),
        ]),
    )]
}

fn brand_heritage(content: &str) -> Vec<AgentResult> {
    let founding = FOUNDING.captures(content).map(|c| c[1].to_string());
    let story = count_matches(content, &STORY);
    let raw = if founding.is_some() { 40.0 } else { 0.0 } + (story.min(12) as f64) * 5.0;
    vec![create_result(
        "brand_heritage",
        raw,
        normalize_score(raw, 0.0, 100.0, 0.0, 100.0),
        calculate_confidence(story, 0.6, if founding.is_some() { 1.0 } else { 0.4 }),
        ev(&[("foundingYear", json!(founding)), ("storyMarkers", json!(story))]),
    )]
}

#[async_trait]
impl Agent for HeuristicAgent {
    fn config(&self) -> &AgentConfig {
        self.kind.config()
    }

    async fn execute(&self, input: &AgentInput) -> Result<AgentOutput, AgentError> {
        let name = self.kind.name();

        if self.kind == AgentKind::ScoreAggregator {
            let Some(agg) = aggregate_scores(input.previous_results.values()) else {
                return Ok(AgentOutput::skipped(name, "no completed agent results to aggregate"));
            };
            let result = create_result(
                "overall_score",
                agg.score,
                agg.score,
                agg.confidence,
                ev(&[
                    ("contributingAgents", json!(agg.contributing_agents)),
                    ("degradedAgents", json!(agg.degraded_agents)),
                ]),
            );
            return Ok(AgentOutput::completed(name, vec![result]));
        }

        let Some(content) = input.context.crawl_content.as_deref().filter(|c| !c.trim().is_empty()) else {
            return Ok(AgentOutput::skipped(name, "no crawl content available"));
        };

        let results = match self.kind {
            AgentKind::Crawl => crawl(content),
            AgentKind::Schema => schema(content),
            AgentKind::Semantic => semantic(content),
            AgentKind::ConversationalCopy => conversational(content),
            AgentKind::KnowledgeGraph => knowledge_graph(content, &input.context.brand_name),
            AgentKind::BrandHeritage => brand_heritage(content),
            other => {
                return Err(AgentError::Unknown(format!(
                    "{other} has no local heuristic"
                )))
            }
        };
        Ok(AgentOutput::completed(name, results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{validate_output, AgentStatus, EvaluationContext};

    const PAGE: &str = r#"<html><head><title>Acme Outdoor</title>
        <meta name="description" content="Gear since 1952">
        <script type="application/ld+json">{"@type": "Organization", "sameAs": ["https://en.wikipedia.org/wiki/Acme"]}</script>
        </head><body><h1>Acme</h1><h2>Our history</h2>
        <p>Founded in 1952, Acme carries a heritage of craft. Are you ready for your next trip?</p>
        </body></html>"#;

    fn input(content: Option<&str>) -> AgentInput {
        let mut ctx = EvaluationContext::new("eval-1", "https://acme.test", "Acme");
        ctx.crawl_content = content.map(str::to_string);
        AgentInput::new(ctx)
    }

    #[test]
    fn test_page_patterns_compile() {
        LazyLock::force(&TAG);
        LazyLock::force(&TITLE);
        LazyLock::force(&META_DESCRIPTION);
        LazyLock::force(&HEADING);
        LazyLock::force(&JSON_LD);
        LazyLock::force(&MICRODATA);
        LazyLock::force(&SCHEMA_TYPE);
        LazyLock::force(&SAME_AS);
        LazyLock::force(&WIKI_LINK);
        LazyLock::force(&ORGANIZATION);
        LazyLock::force(&FOUNDING);
        LazyLock::force(&STORY);
    }

    #[tokio::test]
    async fn test_every_fast_agent_produces_valid_output() {
        for kind in AgentKind::fast().filter(|k| *k != AgentKind::ScoreAggregator) {
            let agent = HeuristicAgent::new(kind);
            let out = agent.execute(&input(Some(PAGE))).await.unwrap();
            assert_eq!(out.status, AgentStatus::Completed, "{kind}");
            validate_output(agent.config(), &out).unwrap();
        }
    }

    #[tokio::test]
    async fn test_heritage_finds_founding_year() {
        let out = HeuristicAgent::new(AgentKind::BrandHeritage)
            .execute(&input(Some(PAGE)))
            .await
            .unwrap();
        assert_eq!(out.results[0].evidence["foundingYear"], "1952");
    }

    #[tokio::test]
    async fn test_missing_content_is_skipped() {
        let out = HeuristicAgent::new(AgentKind::Schema)
            .execute(&input(None))
            .await
            .unwrap();
        assert_eq!(out.status, AgentStatus::Skipped);
    }

    #[tokio::test]
    async fn test_aggregator_rolls_up_previous_results() {
        let schema = HeuristicAgent::new(AgentKind::Schema)
            .execute(&input(Some(PAGE)))
            .await
            .unwrap();
        let mut inp = input(Some(PAGE));
        inp.previous_results.insert("schema_agent".into(), schema);

        let out = HeuristicAgent::new(AgentKind::ScoreAggregator)
            .execute(&inp)
            .await
            .unwrap();
        assert_eq!(out.status, AgentStatus::Completed);
        assert_eq!(out.results[0].result_type, "overall_score");
        assert_eq!(out.results[0].evidence["contributingAgents"], json!(["schema_agent"]));
    }

    #[tokio::test]
    async fn test_slow_kind_has_no_heuristic() {
        let err = HeuristicAgent::new(AgentKind::Citation)
            .execute(&input(Some(PAGE)))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Unknown(_)));
    }
}
