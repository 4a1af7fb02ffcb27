//! End-to-end pipeline scenarios over the full analyzer, using stub
//! catalog and LLM clients.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rust_decimal::Decimal;

use super::*;
use crate::config::AnalyzerConfig;
use crate::error::LlmError;
use crate::keywords::{KeywordConfig, KeywordMapping, KeywordMatcher};
use crate::llm::matcher::{LlmMatcher, LlmMatcherConfig};
use crate::llm::{AuditedChatClient, CallContext, ChatRequest, ChatResponse};
use crate::parts::{PartCatalog, PartLookupResult};
use crate::rules::RuleEngine;
use crate::types::{CoverageStatus, CoverageTier, LineItem, MatchMethod, TraceAction, Trilean};

// --- Test doubles ---

/// Scripted LLM client; the responder sees the full request so scenarios
/// can key on prompt contents. Requests are recorded for assertions.
struct ScriptClient {
    responder: Box<dyn Fn(&ChatRequest) -> Result<ChatResponse, LlmError> + Send + Sync>,
    requests: Mutex<Vec<ChatRequest>>,
    last_id: Mutex<Option<String>>,
    seq: AtomicUsize,
}

impl ScriptClient {
    fn new(
        responder: impl Fn(&ChatRequest) -> Result<ChatResponse, LlmError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
            last_id: Mutex::new(None),
            seq: AtomicUsize::new(0),
        })
    }

    fn user_content(request: &ChatRequest) -> &str {
        request
            .messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or_default()
    }

    fn recorded_user_contents(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| Self::user_content(r).to_string())
            .collect()
    }
}

#[async_trait::async_trait]
impl AuditedChatClient for ScriptClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        *self.last_id.lock().unwrap() = Some(format!("call_{n}"));
        self.requests.lock().unwrap().push(request.clone());
        (self.responder)(&request)
    }

    fn set_context(&self, _context: CallContext) {}

    fn mark_retry(&self, _prev_call_id: &str) {}

    fn last_call_id(&self) -> Option<String> {
        self.last_id.lock().unwrap().clone()
    }
}

fn coverage_json(
    is_covered: bool,
    category: &str,
    component: Option<&str>,
    reasoning: &str,
) -> String {
    serde_json::json!({
        "is_covered": is_covered,
        "category": category,
        "matched_component": component,
        "confidence": 0.8,
        "reasoning": reasoning,
    })
    .to_string()
}

struct MapCatalog {
    entries: BTreeMap<String, PartLookupResult>,
}

impl PartCatalog for MapCatalog {
    fn lookup(&self, item_code: &str) -> Option<PartLookupResult> {
        self.entries.get(item_code).cloned()
    }
}

// --- Builders ---

fn keywords(entries: &[(&str, &str, f64, Option<&str>)]) -> KeywordConfig {
    KeywordConfig {
        mappings: entries
            .iter()
            .map(|(term, category, confidence, component)| {
                (
                    (*term).to_string(),
                    KeywordMapping {
                        category: (*category).to_string(),
                        confidence: *confidence,
                        component: component.map(str::to_string),
                    },
                )
            })
            .collect(),
    }
}

fn component_config(yaml: &str) -> crate::config::ComponentConfig {
    serde_yaml::from_str::<crate::config::ComponentConfig>(yaml)
        .unwrap()
        .normalized()
}

fn fast_llm(client: Arc<dyn AuditedChatClient>) -> LlmMatcher {
    LlmMatcher::new(
        LlmMatcherConfig {
            retry_base_delay: 0.0,
            max_concurrent: 1,
            ..LlmMatcherConfig::default()
        },
        Some(client),
    )
}

fn analyzer(
    keyword_config: KeywordConfig,
    component_yaml: &str,
    llm: Option<LlmMatcher>,
    catalog: Option<Arc<dyn PartCatalog>>,
) -> CoverageAnalyzer {
    CoverageAnalyzer::new(
        AnalyzerConfig::default(),
        component_config(component_yaml),
        RuleEngine::default(),
        KeywordMatcher::new(keyword_config),
        llm,
        catalog,
    )
}

fn line(code: Option<&str>, description: &str, item_type: &str, price: i64) -> LineItem {
    LineItem {
        item_code: code.map(str::to_string),
        description: description.to_string(),
        item_type: item_type.to_string(),
        total_price: Decimal::from(price),
        repair_description: None,
    }
}

fn tier(km: u64, percent: i64, age_percent: Option<i64>) -> CoverageTier {
    CoverageTier {
        km_threshold: km,
        coverage_percent: Decimal::from(percent),
        age_coverage_percent: age_percent.map(Decimal::from),
    }
}

fn engine_covered(parts: &[&str]) -> BTreeMap<String, Vec<String>> {
    BTreeMap::from([(
        "engine".to_string(),
        parts.iter().map(|p| (*p).to_string()).collect(),
    )])
}

// --- Scenarios ---

#[tokio::test]
async fn simple_covered_repair() {
    let analyzer = analyzer(
        keywords(&[("turbolader", "engine", 0.90, Some("Turbolader"))]),
        "{}",
        None,
        None,
    );
    let mut request = AnalyzeRequest::new(
        "CLAIM-1",
        vec![
            line(Some("T001"), "Turbolader", "parts", 1200),
            line(None, "Main d'œuvre", "labor", 400),
        ],
    );
    request.covered_components = engine_covered(&["Turbolader"]);
    request.vehicle_km = Some(50_000);
    request.coverage_scale = Some(CoverageScale::Tiers(vec![tier(50_000, 60, None)]));

    let result = analyzer.analyze(request).await;

    let part = &result.line_items[0];
    assert_eq!(part.coverage_status, CoverageStatus::Covered);
    assert_eq!(part.match_method, MatchMethod::Keyword);
    assert_eq!(part.policy_list_confirmed, Trilean::Yes);
    assert_eq!(part.covered_amount, Decimal::from(720));

    let labor = &result.line_items[1];
    assert_eq!(labor.coverage_status, CoverageStatus::Covered);
    assert_eq!(labor.covered_amount, Decimal::from(240));
    assert!(labor
        .decision_trace
        .iter()
        .any(|s| s.stage == "labor_follows_parts" && s.action == TraceAction::Promoted));

    assert_eq!(result.primary_repair.component.as_deref(), Some("Turbolader"));
    assert_eq!(result.primary_repair.is_covered, Some(true));
    assert_eq!(result.summary.items_covered, 2);
    assert_eq!(
        result.summary.total_covered_before_excess,
        Decimal::from(960)
    );
    assert_eq!(result.inputs.coverage_percent, Some(Decimal::from(60)));
}

#[tokio::test]
async fn short_string_guard_prevents_false_approval() {
    let analyzer = analyzer(
        keywords(&[("abgasrueckfuehrung", "engine", 0.90, Some("egr_valve"))]),
        r#"
component_synonyms:
  egr_valve: ["agr-ventil"]
"#,
        None,
        None,
    );
    let mut request = AnalyzeRequest::new(
        "CLAIM-2",
        vec![line(None, "ABGASRUECKFUEHRUNG", "parts", 300)],
    );
    request.covered_components = engine_covered(&["ASR"]);

    let result = analyzer.analyze(request).await;

    let item = &result.line_items[0];
    // "asr" must not substring-match "abgasrueckfuehrung"
    assert_ne!(item.coverage_status, CoverageStatus::Covered);
    assert!(item
        .decision_trace
        .iter()
        .any(|s| s.stage == "policy_list_check" && s.action == TraceAction::Deferred));
}

#[tokio::test]
async fn gasket_deferral_routes_to_llm_with_hint() {
    let client = ScriptClient::new(|request| {
        let user = ScriptClient::user_content(request);
        assert!(user.contains("JOINT DE CULASSE"));
        Ok(ChatResponse {
            content: coverage_json(
                true,
                "engine",
                Some("cylinder_head_gasket"),
                "Sealing part for covered cylinder head repair",
            ),
        })
    });
    let catalog = MapCatalog {
        entries: BTreeMap::from([(
            "J001".to_string(),
            PartLookupResult {
                part_number: "J001".into(),
                system: Some("engine".into()),
                component: Some("cylinder_head".into()),
                component_description: None,
                covered: Trilean::Unknown,
                lookup_source: "keyword_description".into(),
                note: None,
            },
        )]),
    };
    let analyzer = analyzer(
        KeywordConfig::default(),
        r#"
gasket_seal_indicators: ["JOINT", "DICHTUNG"]
"#,
        Some(fast_llm(Arc::clone(&client) as _)),
        Some(Arc::new(catalog)),
    );
    let mut request = AnalyzeRequest::new(
        "CLAIM-3",
        vec![line(Some("J001"), "JOINT DE CULASSE", "parts", 350)],
    );
    request.covered_components = engine_covered(&["Culasse"]);

    let result = analyzer.analyze(request).await;

    let item = &result.line_items[0];
    assert_eq!(item.coverage_status, CoverageStatus::Covered);
    assert_eq!(item.match_method, MatchMethod::Llm);
    let deferral = item
        .decision_trace
        .iter()
        .find(|s| s.stage == "part_number" && s.action == TraceAction::Deferred)
        .expect("gasket deferral step");
    assert_eq!(
        deferral.detail.as_ref().unwrap()["reason"],
        "gasket_seal_deferral"
    );
    assert!(item.decision_trace.iter().any(|s| s.stage == "llm"));

    // The LLM saw the part-lookup hint
    let contents = client.recorded_user_contents();
    assert!(contents[0].contains("Pre-identified as 'cylinder_head' in category 'engine'"));

    assert_eq!(result.metadata.llm_calls, 1);
}

#[tokio::test]
async fn orphan_labor_is_demoted_without_covered_parts() {
    // The LLM optimistically covers both items; validation kills the
    // excluded part, demotion kills the now-orphaned labor.
    let client = ScriptClient::new(|request| {
        let user = ScriptClient::user_content(request);
        let component = if user.contains("Pose") { "labor" } else { "trim" };
        Ok(ChatResponse {
            content: coverage_json(true, "engine", Some(component), "plausible"),
        })
    });
    let analyzer = analyzer(
        KeywordConfig::default(),
        "{}",
        Some(fast_llm(client as _)),
        None,
    );
    let mut request = AnalyzeRequest::new(
        "CLAIM-4",
        vec![
            line(None, "Accessoire décoratif", "parts", 200),
            line(None, "Pose", "labor", 150),
        ],
    );
    request.covered_components = engine_covered(&["Turbolader"]);
    request.excluded_components = BTreeMap::from([(
        "body".to_string(),
        vec!["Accessoire décoratif".to_string()],
    )]);

    let result = analyzer.analyze(request).await;

    let part = &result.line_items[0];
    assert_eq!(part.coverage_status, CoverageStatus::NotCovered);
    assert_eq!(part.exclusion_reason.as_deref(), Some("component_excluded"));

    let labor = &result.line_items[1];
    assert_eq!(labor.coverage_status, CoverageStatus::NotCovered);
    assert_eq!(labor.exclusion_reason.as_deref(), Some("demoted_no_anchor"));
    assert!(labor
        .decision_trace
        .iter()
        .any(|s| s.stage == "labor_demotion" && s.action == TraceAction::Demoted));

    assert_eq!(result.summary.items_covered, 0);
}

#[tokio::test]
async fn age_adjusted_coverage_rate() {
    let analyzer = analyzer(
        keywords(&[("turbolader", "engine", 0.90, Some("Turbolader"))]),
        "{}",
        None,
        None,
    );
    let mut request = AnalyzeRequest::new(
        "CLAIM-5",
        vec![line(None, "Turbolader", "parts", 1000)],
    );
    request.covered_components = engine_covered(&["Turbolader"]);
    request.vehicle_km = Some(80_000);
    request.vehicle_age_years = Some(Decimal::from(9));
    request.age_threshold_years = Some(8);
    request.coverage_scale = Some(CoverageScale::Tiers(vec![
        tier(50_000, 60, Some(40)),
        tier(100_000, 40, Some(20)),
    ]));

    let result = analyzer.analyze(request).await;

    assert_eq!(result.line_items[0].covered_amount, Decimal::from(400));
    assert_eq!(result.summary.coverage_percent, Some(Decimal::from(40)));
    assert_eq!(result.inputs.coverage_percent, Some(Decimal::from(60)));
    assert_eq!(
        result.inputs.coverage_percent_effective,
        Some(Decimal::from(40))
    );
}

#[tokio::test]
async fn zero_payout_rescue_promotes_primary_repair_items() {
    // A zero-priced covered anchor part, two LLM-denied items. The
    // per-item LLM didn't know the primary repair; the boost stage does.
    let client = ScriptClient::new(|request| {
        let user = ScriptClient::user_content(request);
        let category = if user.contains("Kleinmaterial") {
            ""
        } else {
            "engine"
        };
        Ok(ChatResponse {
            content: coverage_json(false, category, None, "not in explicit policy list"),
        })
    });
    let analyzer = analyzer(
        keywords(&[("ölkühler", "engine", 0.90, Some("oil_cooler"))]),
        r#"
component_synonyms:
  oil_cooler: ["ölkühler"]
"#,
        Some(fast_llm(client as _)),
        None,
    );
    let mut request = AnalyzeRequest::new(
        "CLAIM-6",
        vec![
            line(None, "Ölkühler", "parts", 0),
            line(None, "Gehäuse, Ölfilter", "parts", 250),
            line(None, "Kleinmaterial montieren", "labor", 100),
        ],
    );
    request.covered_components = engine_covered(&["Ölkühler"]);
    request.vehicle_km = Some(50_000);
    request.coverage_scale = Some(CoverageScale::Tiers(vec![tier(50_000, 60, None)]));

    let result = analyzer.analyze(request).await;

    assert_eq!(result.primary_repair.is_covered, Some(true));
    assert_eq!(result.primary_repair.component.as_deref(), Some("oil_cooler"));

    let housing = &result.line_items[1];
    assert_eq!(housing.coverage_status, CoverageStatus::Covered);
    assert!(housing
        .decision_trace
        .iter()
        .any(|s| s.stage == "primary_repair_boost" && s.action == TraceAction::Promoted));
    assert_eq!(housing.covered_amount, Decimal::from(150));

    // Category-less labor gets the benefit of the doubt
    let labor = &result.line_items[2];
    assert_eq!(labor.coverage_status, CoverageStatus::Covered);

    assert!(result.summary.items_covered >= 1);
}

#[tokio::test]
async fn llm_labor_relevance_promotes_confirmed_labor() {
    let client = ScriptClient::new(|request| {
        let system = &request.messages[0].content;
        if system.contains("mechanically necessary") {
            return Ok(ChatResponse {
                content: serde_json::json!({
                    "labor_items": [
                        {"index": 1, "is_relevant": true, "confidence": 0.9,
                         "reasoning": "Removal and installation for the turbocharger"},
                    ],
                })
                .to_string(),
            });
        }
        Ok(ChatResponse {
            content: coverage_json(false, "engine", None, "labor not in policy list"),
        })
    });
    let analyzer = analyzer(
        keywords(&[("turbolader", "engine", 0.90, Some("Turbolader"))]),
        "{}",
        Some(fast_llm(client as _)),
        None,
    );
    let mut request = AnalyzeRequest::new(
        "CLAIM-7",
        vec![
            line(Some("T001"), "Turbolader", "parts", 1200),
            line(None, "Spezialwerkzeug Einsatz", "labor", 300),
        ],
    );
    request.covered_components = engine_covered(&["Turbolader"]);
    request.vehicle_km = Some(40_000);
    request.coverage_scale = Some(CoverageScale::Tiers(vec![tier(50_000, 60, None)]));

    let result = analyzer.analyze(request).await;

    // Below the first tier threshold: full coverage
    assert_eq!(result.summary.coverage_percent, Some(Decimal::ONE_HUNDRED));

    let labor = &result.line_items[1];
    assert_eq!(labor.coverage_status, CoverageStatus::Covered);
    assert!(labor
        .decision_trace
        .iter()
        .any(|s| s.stage == "primary_repair_boost_llm" && s.action == TraceAction::Promoted));
    assert_eq!(labor.covered_amount, Decimal::from(300));
}

// --- Invariants ---

#[tokio::test]
async fn amounts_always_sum_to_total_price() {
    let client = ScriptClient::new(|request| {
        let user = ScriptClient::user_content(request);
        Ok(ChatResponse {
            content: coverage_json(user.contains("Turbolader"), "engine", None, "stub"),
        })
    });
    let analyzer = analyzer(
        KeywordConfig::default(),
        "{}",
        Some(fast_llm(client as _)),
        None,
    );
    let mut request = AnalyzeRequest::new(
        "CLAIM-8",
        vec![
            line(None, "Turbolader", "parts", 999),
            line(None, "Zierleiste", "parts", 45),
            line(None, "", "labor", 0),
        ],
    );
    request.covered_components = engine_covered(&["Turbolader"]);
    request.vehicle_km = Some(60_000);
    request.coverage_scale = Some(CoverageScale::Tiers(vec![tier(50_000, 70, None)]));

    let result = analyzer.analyze(request).await;

    let mut covered_sum = Decimal::ZERO;
    let mut claimed_sum = Decimal::ZERO;
    for item in &result.line_items {
        assert_eq!(
            item.covered_amount + item.not_covered_amount,
            item.total_price
        );
        covered_sum += item.covered_amount;
        claimed_sum += item.total_price;
    }
    assert_eq!(covered_sum, result.summary.total_covered_before_excess);
    assert_eq!(claimed_sum, result.summary.total_claimed);
}

#[tokio::test]
async fn output_preserves_input_order() {
    // Items route through different stages (keyword, LLM) but come back in
    // input order.
    let client = ScriptClient::new(|_| {
        Ok(ChatResponse {
            content: coverage_json(false, "", None, "stub"),
        })
    });
    let analyzer = analyzer(
        keywords(&[("turbolader", "engine", 0.90, Some("Turbolader"))]),
        "{}",
        Some(fast_llm(client as _)),
        None,
    );
    let descriptions = ["Zierleiste", "Turbolader", "Pose", "Wischwasser", "Turbolader links"];
    let mut request = AnalyzeRequest::new(
        "CLAIM-9",
        descriptions
            .iter()
            .map(|d| line(None, d, "parts", 100))
            .collect(),
    );
    request.covered_components = engine_covered(&["Turbolader"]);

    let result = analyzer.analyze(request).await;

    let output: Vec<&str> = result
        .line_items
        .iter()
        .map(|i| i.description.as_str())
        .collect();
    assert_eq!(output, descriptions);
}

#[tokio::test]
async fn deterministic_without_llm() {
    let build = || {
        analyzer(
            keywords(&[("turbolader", "engine", 0.90, Some("Turbolader"))]),
            "{}",
            None,
            None,
        )
    };
    let build_request = || {
        let mut request = AnalyzeRequest::new(
            "CLAIM-10",
            vec![
                line(Some("T001"), "Turbolader", "parts", 1200),
                line(None, "Main d'œuvre", "labor", 400),
                line(None, "Unbekanntes Teil", "parts", 77),
            ],
        );
        request.covered_components = engine_covered(&["Turbolader"]);
        request.vehicle_km = Some(50_000);
        request.coverage_scale = Some(CoverageScale::Tiers(vec![tier(50_000, 60, None)]));
        request
    };

    let first = build().analyze(build_request()).await;
    let second = build().analyze(build_request()).await;

    assert_eq!(
        serde_json::to_value(&first.line_items).unwrap(),
        serde_json::to_value(&second.line_items).unwrap()
    );
    assert_eq!(
        serde_json::to_value(&first.summary).unwrap(),
        serde_json::to_value(&second.summary).unwrap()
    );
    assert_eq!(
        serde_json::to_value(&first.primary_repair).unwrap(),
        serde_json::to_value(&second.primary_repair).unwrap()
    );
}

#[tokio::test]
async fn output_identical_for_any_concurrency() {
    let make_analyzer = |max_concurrent: usize| {
        let client = ScriptClient::new(|request| {
            let user = ScriptClient::user_content(request);
            Ok(ChatResponse {
                content: coverage_json(user.contains("Part 2"), "engine", Some("part"), "stub"),
            })
        });
        analyzer(
            KeywordConfig::default(),
            "{}",
            Some(LlmMatcher::new(
                LlmMatcherConfig {
                    max_concurrent,
                    retry_base_delay: 0.0,
                    ..LlmMatcherConfig::default()
                },
                Some(client as _),
            )),
            None,
        )
    };
    let build_request = || {
        let mut request = AnalyzeRequest::new(
            "CLAIM-11",
            (0..6)
                .map(|i| line(None, &format!("Part {i}"), "parts", 100 + i))
                .collect(),
        );
        request.covered_components = engine_covered(&["Turbolader"]);
        request
    };

    let sequential = make_analyzer(1).analyze(build_request()).await;
    let parallel = make_analyzer(4).analyze(build_request()).await;

    assert_eq!(
        serde_json::to_value(&sequential.line_items).unwrap(),
        serde_json::to_value(&parallel.line_items).unwrap()
    );
}

#[tokio::test]
async fn llm_item_limit_marks_overflow_for_review() {
    let client = ScriptClient::new(|_| {
        Ok(ChatResponse {
            content: coverage_json(false, "", None, "stub"),
        })
    });
    let config = AnalyzerConfig {
        llm_max_items: 2,
        ..AnalyzerConfig::default()
    };
    let analyzer = CoverageAnalyzer::new(
        config,
        component_config("{}"),
        RuleEngine::default(),
        KeywordMatcher::new(KeywordConfig::default()),
        Some(fast_llm(client as _)),
        None,
    );
    let request = AnalyzeRequest::new(
        "CLAIM-12",
        (0..4)
            .map(|i| line(None, &format!("Teil {i}"), "parts", 50))
            .collect(),
    );

    let result = analyzer.analyze(request).await;

    assert_eq!(result.metadata.llm_calls, 2);
    let skipped: Vec<_> = result
        .line_items
        .iter()
        .filter(|i| i.match_reasoning.contains("item limit"))
        .collect();
    assert_eq!(skipped.len(), 2);
    for item in skipped {
        assert_eq!(item.coverage_status, CoverageStatus::ReviewNeeded);
    }
}

#[tokio::test]
async fn llm_calls_metadata_matches_non_skipped_llm_steps() {
    let client = ScriptClient::new(|_| {
        Ok(ChatResponse {
            content: coverage_json(false, "", None, "stub"),
        })
    });
    let analyzer = analyzer(
        keywords(&[("turbolader", "engine", 0.90, Some("Turbolader"))]),
        "{}",
        Some(fast_llm(client as _)),
        None,
    );
    let mut request = AnalyzeRequest::new(
        "CLAIM-13",
        vec![
            line(None, "Turbolader", "parts", 1200),
            line(None, "Fremdteil", "parts", 80),
            line(None, "Anderes Fremdteil", "parts", 90),
        ],
    );
    request.covered_components = engine_covered(&["Turbolader"]);

    let result = analyzer.analyze(request).await;

    let llm_steps = result
        .line_items
        .iter()
        .flat_map(|i| &i.decision_trace)
        .filter(|s| s.stage == "llm" && s.action != TraceAction::Skipped)
        .count();
    assert_eq!(result.metadata.llm_calls, llm_steps);
    assert_eq!(result.metadata.llm_calls, 2);
    assert_eq!(result.metadata.keywords_applied, 1);
}

#[tokio::test]
async fn progress_hooks_fire_once_per_llm_item() {
    let client = ScriptClient::new(|_| {
        Ok(ChatResponse {
            content: coverage_json(false, "", None, "stub"),
        })
    });
    let analyzer = analyzer(
        KeywordConfig::default(),
        "{}",
        Some(fast_llm(client as _)),
        None,
    );
    let request = AnalyzeRequest::new(
        "CLAIM-14",
        (0..3)
            .map(|i| line(None, &format!("Teil {i}"), "parts", 50))
            .collect(),
    );

    let started = Arc::new(Mutex::new(Vec::new()));
    let progressed = Arc::new(Mutex::new(Vec::new()));
    let started_ref = Arc::clone(&started);
    let progressed_ref = Arc::clone(&progressed);
    let hooks = AnalyzeHooks {
        on_llm_start: Some(Arc::new(move |n| started_ref.lock().unwrap().push(n))),
        on_llm_progress: Some(Arc::new(move |n| progressed_ref.lock().unwrap().push(n))),
        cancel: None,
    };

    analyzer
        .analyze_with_hooks(request, hooks)
        .await;

    assert_eq!(started.lock().unwrap().as_slice(), &[3]);
    let progress = progressed.lock().unwrap();
    assert_eq!(progress.len(), 3);
    assert!(progress.iter().all(|&n| n == 1));
}

#[tokio::test]
async fn nominal_price_labor_never_covered() {
    let analyzer = analyzer(
        keywords(&[
            ("turbolader", "engine", 0.90, Some("Turbolader")),
            ("einbau turbolader", "engine", 0.90, Some("Turbolader")),
        ]),
        "{}",
        None,
        None,
    );
    let mut request = AnalyzeRequest::new(
        "CLAIM-15",
        vec![
            line(Some("T001"), "Turbolader", "parts", 1200),
            line(Some("OP77"), "Einbau Turbolader", "labor", 1),
        ],
    );
    request.covered_components = engine_covered(&["Turbolader"]);
    request.vehicle_km = Some(50_000);
    request.coverage_scale = Some(CoverageScale::Tiers(vec![tier(50_000, 60, None)]));

    let result = analyzer.analyze(request).await;

    let labor = &result.line_items[1];
    assert_eq!(labor.coverage_status, CoverageStatus::ReviewNeeded);
    assert_eq!(
        labor.exclusion_reason.as_deref(),
        Some("nominal_price_labor")
    );
    assert_eq!(labor.covered_amount, Decimal::ZERO);
}
