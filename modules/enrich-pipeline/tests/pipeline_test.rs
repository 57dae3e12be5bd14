//! End-to-end pipeline runs against the in-memory store, with counting
//! mock adapters standing in for search, scraping, reasoning, and vision.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::Notify;

use claude_client::TokenUsage;
use enrich_common::attributes::AttributeSpec;
use enrich_common::{
    BrandConfidence, Classification, ClassifiedUrl, ConfidenceTier, DimensionType, EnrichError,
    FieldValue, GuardrailLimits, NewProduct, Phase, ProductStatus, ProductType, QualityRating,
    SourceTier,
};
use enrich_pipeline::capabilities::{
    ColorVision, ExtractedField, PageScraper, Reasoner, SanityVerdict, ScrapedContent, SearchHit,
    SearchResults, WebSearcher,
};
use enrich_pipeline::events::{EventBus, PipelineEvent};
use enrich_pipeline::limiter::RateLimiters;
use enrich_pipeline::merge::MergePolicy;
use enrich_pipeline::page_cache::PageCache;
use enrich_pipeline::phases::PhaseContext;
use enrich_pipeline::store::{MemoryStore, ProductStore};
use enrich_pipeline::EnrichmentService;

const MANUFACTURER_URL: &str = "https://makita.example/xdt13";
const DISTRIBUTOR_URL: &str = "https://toolshop.example/xdt13";
const THIRD_PARTY_URL: &str = "https://blog.example/xdt13-review";

fn usage() -> TokenUsage {
    TokenUsage {
        input_tokens: 1_000,
        output_tokens: 200,
    }
}

// --- Mock adapters ---

struct MockSearcher {
    hits: Vec<SearchHit>,
    fail: bool,
    calls: AtomicU32,
}

impl MockSearcher {
    fn returning(urls: &[&str]) -> Self {
        Self {
            hits: urls
                .iter()
                .map(|u| SearchHit {
                    url: u.to_string(),
                    title: format!("Listing at {u}"),
                    snippet: String::new(),
                })
                .collect(),
            fail: false,
            calls: AtomicU32::new(0),
        }
    }

    fn failing() -> Self {
        Self {
            hits: Vec::new(),
            fail: true,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl WebSearcher for MockSearcher {
    async fn search(&self, _query: &str) -> Result<SearchResults, EnrichError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(EnrichError::Search("provider rejected the query".into()));
        }
        Ok(SearchResults {
            hits: self.hits.clone(),
            credits_used: 1,
        })
    }

    fn name(&self) -> &str {
        "tavily"
    }
}

struct MockScraper {
    fail: bool,
    calls: AtomicU32,
}

impl MockScraper {
    fn ok() -> Self {
        Self {
            fail: false,
            calls: AtomicU32::new(0),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl PageScraper for MockScraper {
    async fn scrape(&self, url: &str) -> Result<ScrapedContent, EnrichError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(EnrichError::Scrape("origin returned an error page".into()));
        }
        Ok(ScrapedContent {
            markdown: format!("# Page at {url}"),
            credits_used: 1,
        })
    }

    fn name(&self) -> &str {
        "firecrawl"
    }
}

struct Gate {
    entered: Notify,
    release: Notify,
}

struct MockReasoner {
    classification: Classification,
    url_tiers: HashMap<String, SourceTier>,
    page_fields: HashMap<String, Vec<ExtractedField>>,
    brand_country: Option<String>,
    verdict: SanityVerdict,
    gate: Option<Arc<Gate>>,
    classify_calls: AtomicU32,
    extract_calls: AtomicU32,
    sanity_calls: AtomicU32,
}

impl MockReasoner {
    fn new(classification: Classification) -> Self {
        Self {
            classification,
            url_tiers: HashMap::new(),
            page_fields: HashMap::new(),
            brand_country: None,
            verdict: SanityVerdict {
                quality: QualityRating::Good,
                issues: Vec::new(),
                review_reason: None,
            },
            gate: None,
            classify_calls: AtomicU32::new(0),
            extract_calls: AtomicU32::new(0),
            sanity_calls: AtomicU32::new(0),
        }
    }

    fn tier(mut self, url: &str, tier: SourceTier) -> Self {
        self.url_tiers.insert(url.to_string(), tier);
        self
    }

    fn page(mut self, url: &str, fields: Vec<ExtractedField>) -> Self {
        self.page_fields.insert(url.to_string(), fields);
        self
    }
}

#[async_trait]
impl Reasoner for MockReasoner {
    async fn classify_product(
        &self,
        _name: &str,
        _ean: &str,
        _brand: Option<&str>,
        _weight: Option<&str>,
    ) -> Result<(Classification, TokenUsage), EnrichError> {
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        self.classify_calls.fetch_add(1, Ordering::SeqCst);
        Ok((self.classification.clone(), usage()))
    }

    async fn classify_urls(
        &self,
        _identity: &str,
        hits: &[SearchHit],
    ) -> Result<(Vec<ClassifiedUrl>, TokenUsage), EnrichError> {
        let classified = hits
            .iter()
            .map(|h| ClassifiedUrl {
                url: h.url.clone(),
                title: h.title.clone(),
                source_tier: self
                    .url_tiers
                    .get(&h.url)
                    .copied()
                    .unwrap_or(SourceTier::Irrelevant),
                reasoning: String::new(),
            })
            .collect();
        Ok((classified, usage()))
    }

    async fn extract_fields(
        &self,
        _identity: &str,
        attributes: &[AttributeSpec],
        page_url: &str,
        _page_markdown: &str,
    ) -> Result<(Vec<ExtractedField>, TokenUsage), EnrichError> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        let requested: Vec<&str> = attributes.iter().map(|a| a.name).collect();
        let fields = self
            .page_fields
            .get(page_url)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|f| requested.contains(&f.name.as_str()))
            .collect();
        Ok((fields, usage()))
    }

    async fn sanity_check(
        &self,
        _identity: &str,
        _fields: &BTreeMap<String, enrich_common::EnrichedField>,
    ) -> Result<(SanityVerdict, TokenUsage), EnrichError> {
        self.sanity_calls.fetch_add(1, Ordering::SeqCst);
        Ok((self.verdict.clone(), usage()))
    }

    async fn brand_origin(
        &self,
        _brand: &str,
    ) -> Result<(Option<String>, TokenUsage), EnrichError> {
        Ok((self.brand_country.clone(), usage()))
    }
}

struct MockVision {
    color: Option<String>,
    calls: AtomicU32,
}

#[async_trait]
impl ColorVision for MockVision {
    async fn detect_color(
        &self,
        _image_url: &str,
    ) -> Result<(Option<String>, TokenUsage), EnrichError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((self.color.clone(), usage()))
    }
}

// --- Harness ---

struct Harness {
    service: Arc<EnrichmentService>,
    store: Arc<MemoryStore>,
    searcher: Arc<MockSearcher>,
    scraper: Arc<MockScraper>,
    reasoner: Arc<MockReasoner>,
    vision: Arc<MockVision>,
}

fn harness(searcher: MockSearcher, reasoner: MockReasoner, limits: GuardrailLimits) -> Harness {
    harness_with(searcher, MockScraper::ok(), reasoner, limits)
}

fn harness_with(
    searcher: MockSearcher,
    scraper: MockScraper,
    reasoner: MockReasoner,
    limits: GuardrailLimits,
) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let store_dyn: Arc<dyn ProductStore> = store.clone();
    let searcher = Arc::new(searcher);
    let scraper = Arc::new(scraper);
    let reasoner = Arc::new(reasoner);
    let vision = Arc::new(MockVision {
        color: None,
        calls: AtomicU32::new(0),
    });
    let limiters = Arc::new(RateLimiters::new(4));
    let bus = Arc::new(EventBus::default());

    let ctx = Arc::new(PhaseContext {
        store: store_dyn.clone(),
        searcher: searcher.clone(),
        reasoner: reasoner.clone(),
        vision: vision.clone(),
        page_cache: Arc::new(PageCache::new(
            store_dyn.clone(),
            scraper.clone(),
            limiters.clone(),
        )),
        limiters,
        bus: bus.clone(),
        merge_policy: MergePolicy::default(),
        model_fast: "claude-haiku-4-5".to_string(),
        model_review: "claude-haiku-4-5".to_string(),
    });

    let service = Arc::new(EnrichmentService::from_context(
        ctx,
        store_dyn,
        bus,
        Arc::new(RwLock::new(limits)),
    ));

    Harness {
        service,
        store,
        searcher,
        scraper,
        reasoner,
        vision,
    }
}

async fn ingest(h: &Harness, name: &str) -> i64 {
    h.service
        .ingest(NewProduct {
            ean: "4002395123456".to_string(),
            name: name.to_string(),
            brand: Some("Makita".to_string()),
            weight: None,
            original_data: serde_json::json!({"name": name}),
        })
        .await
        .unwrap()
        .id
}

fn makita() -> Classification {
    Classification {
        product_type: ProductType::StandardProduct,
        brand: Some("Makita".to_string()),
        brand_confidence: BrandConfidence::Certain,
        model_number: Some("XDT13".to_string()),
        parsed_color: None,
        parsed_size: None,
        manufacturer_domain: Some("makita.example".to_string()),
        reasoning: "brand and model in name".to_string(),
    }
}

fn number(name: &str, value: f64, unit: &str) -> ExtractedField {
    ExtractedField {
        name: name.to_string(),
        value: Some(FieldValue::Number(value)),
        unit: Some(unit.to_string()),
        dimension_type: DimensionType::Product,
        notes: None,
    }
}

fn text(name: &str, value: &str) -> ExtractedField {
    ExtractedField {
        name: name.to_string(),
        value: Some(FieldValue::Text(value.to_string())),
        unit: None,
        dimension_type: DimensionType::Na,
        notes: None,
    }
}

/// All critical attributes for a standard product, answered by one page.
fn full_page() -> Vec<ExtractedField> {
    vec![
        number("weight", 2.5, "kg"),
        number("packaged_weight", 3.0, "kg"),
        number("height", 23.8, "cm"),
        text("color", "black"),
        text("country_of_origin", "Japan"),
    ]
}

fn happy_reasoner() -> MockReasoner {
    MockReasoner::new(makita())
        .tier(MANUFACTURER_URL, SourceTier::Manufacturer)
        .tier(DISTRIBUTOR_URL, SourceTier::AuthorizedDistributor)
        .tier(THIRD_PARTY_URL, SourceTier::ThirdParty)
        .page(MANUFACTURER_URL, full_page())
        .page(DISTRIBUTOR_URL, vec![number("weight", 2.5, "kg")])
}

fn all_urls() -> MockSearcher {
    MockSearcher::returning(&[MANUFACTURER_URL, DISTRIBUTOR_URL, THIRD_PARTY_URL])
}

// --- Tests ---

#[tokio::test]
async fn pipeline_runs_to_done_without_gap_fill() {
    let h = harness(all_urls(), happy_reasoner(), GuardrailLimits::default());
    let mut events = h.service.subscribe();
    let id = ingest(&h, "Makita XDT13 Impact Driver").await;

    let record = h.service.enrich(id).await.unwrap();

    assert_eq!(record.status, ProductStatus::Done);
    assert!(record.classification.is_some());
    assert_eq!(record.search_result.as_ref().unwrap().results.len(), 3);
    assert!(record.gap_fill_result.is_none());

    let extraction = record.extraction_result.as_ref().unwrap();
    assert!(extraction.unresolved.is_empty());
    let weight = &extraction.fields["weight"];
    assert_eq!(weight.value, Some(FieldValue::Number(2.5)));
    assert_eq!(weight.confidence, ConfidenceTier::Official);
    assert_eq!(weight.source_url.as_deref(), Some(MANUFACTURER_URL));

    let validation = record.validation_result.as_ref().unwrap();
    assert_eq!(validation.quality, QualityRating::Good);
    assert!(validation.review_reason.is_none());

    // classify + classify_urls + 2 trusted pages + sanity check
    let costs = record.cost_summary.as_ref().unwrap();
    assert_eq!(costs.llm_calls, 5);
    // 1 search + 3 scrapes
    assert_eq!(costs.api_calls, 4);
    assert!(costs.total_cost_usd > 0.0);
    assert_eq!(h.scraper.calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.vision.calls.load(Ordering::SeqCst), 0);
    assert!(!record.enrichment_log.is_empty());

    let mut saw_done = false;
    while let Ok(event) = events.try_recv() {
        if let PipelineEvent::StatusChanged { status, .. } = event {
            saw_done |= status == ProductStatus::Done;
        }
    }
    assert!(saw_done);
}

#[tokio::test]
async fn gap_fill_drains_the_third_party_reserve() {
    // Trusted pages answer the weights only; color comes from the cached
    // third-party page and country from brand knowledge.
    let reasoner = MockReasoner {
        brand_country: Some("Japan".to_string()),
        ..MockReasoner::new(makita())
    }
    .tier(MANUFACTURER_URL, SourceTier::Manufacturer)
    .tier(THIRD_PARTY_URL, SourceTier::ThirdParty)
    .page(
        MANUFACTURER_URL,
        vec![number("weight", 2.5, "kg"), number("packaged_weight", 3.0, "kg")],
    )
    .page(THIRD_PARTY_URL, vec![text("color", "black")]);

    let h = harness(
        MockSearcher::returning(&[MANUFACTURER_URL, THIRD_PARTY_URL]),
        reasoner,
        GuardrailLimits::default(),
    );
    let id = ingest(&h, "Makita XDT13 Impact Driver").await;

    let record = h.service.enrich(id).await.unwrap();

    assert_eq!(record.status, ProductStatus::Done);
    let gap_fill = record.gap_fill_result.as_ref().unwrap();
    assert_eq!(gap_fill.pages_analyzed, 1);
    assert!(gap_fill.still_unresolved.is_empty());
    assert_eq!(
        gap_fill.fields["color"].value,
        Some(FieldValue::Text("black".to_string()))
    );
    assert_eq!(gap_fill.fields["color"].confidence, ConfidenceTier::ThirdParty);
    assert_eq!(
        gap_fill.fields["country_of_origin"].value,
        Some(FieldValue::Text("Japan".to_string()))
    );
    assert_eq!(
        gap_fill.fields["country_of_origin"].notes.as_deref(),
        Some("brand knowledge")
    );

    // The answer is cached for every later Makita product.
    let cached = h.store.get_brand_origin("makita").await.unwrap().unwrap();
    assert_eq!(cached.country, "Japan");

    // Validation sees the overlaid gap-fill values.
    let validation = record.validation_result.as_ref().unwrap();
    assert!(validation.normalized["color"].is_resolved());
    assert!(validation.normalized["country_of_origin"].is_resolved());
}

#[tokio::test]
async fn retry_reuses_cached_pages_without_rescraping() {
    let h = harness(all_urls(), happy_reasoner(), GuardrailLimits::default());
    let id = ingest(&h, "Makita XDT13 Impact Driver").await;

    h.service.enrich(id).await.unwrap();
    let scrapes_after_first_run = h.scraper.calls.load(Ordering::SeqCst);
    assert_eq!(scrapes_after_first_run, 3);

    let record = h.service.retry_phase(id, Phase::Extract).await.unwrap();

    assert_eq!(record.status, ProductStatus::Done);
    assert_eq!(h.scraper.calls.load(Ordering::SeqCst), scrapes_after_first_run);
}

#[tokio::test]
async fn retry_keeps_upstream_outputs_and_skips_upstream_work() {
    let h = harness(all_urls(), happy_reasoner(), GuardrailLimits::default());
    let id = ingest(&h, "Makita XDT13 Impact Driver").await;

    h.service.enrich(id).await.unwrap();
    let classify_before = h.reasoner.classify_calls.load(Ordering::SeqCst);
    let search_before = h.searcher.calls.load(Ordering::SeqCst);

    let record = h.service.retry_phase(id, Phase::Validate).await.unwrap();

    assert_eq!(record.status, ProductStatus::Done);
    assert!(record.classification.is_some());
    assert!(record.search_result.is_some());
    assert!(record.extraction_result.is_some());
    assert_eq!(h.reasoner.classify_calls.load(Ordering::SeqCst), classify_before);
    assert_eq!(h.searcher.calls.load(Ordering::SeqCst), search_before);
    assert_eq!(h.reasoner.sanity_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn retry_without_upstream_outputs_is_rejected() {
    let h = harness(all_urls(), happy_reasoner(), GuardrailLimits::default());
    let id = ingest(&h, "Makita XDT13 Impact Driver").await;

    let err = h.service.retry_phase(id, Phase::Extract).await.unwrap_err();
    assert!(matches!(err, EnrichError::Validation(_)));
    assert_eq!(
        h.service.snapshot(id).await.unwrap().status,
        ProductStatus::Pending
    );
}

#[tokio::test]
async fn second_run_of_a_product_in_flight_is_rejected() {
    let gate = Arc::new(Gate {
        entered: Notify::new(),
        release: Notify::new(),
    });
    let reasoner = MockReasoner {
        gate: Some(gate.clone()),
        ..happy_reasoner()
    };
    let h = harness(all_urls(), reasoner, GuardrailLimits::default());
    let id = ingest(&h, "Makita XDT13 Impact Driver").await;

    let service = h.service.clone();
    let run = tokio::spawn(async move { service.enrich(id).await });
    gate.entered.notified().await;

    let err = h.service.enrich(id).await.unwrap_err();
    assert!(matches!(err, EnrichError::AlreadyRunning(_)));
    let err = h.service.reset(id).await.unwrap_err();
    assert!(matches!(err, EnrichError::InFlight(_)));

    gate.release.notify_one();
    let record = run.await.unwrap().unwrap();
    assert_eq!(record.status, ProductStatus::Done);
}

#[tokio::test]
async fn oversize_batch_is_rejected_before_any_work() {
    let limits = GuardrailLimits {
        max_batch_size: 2,
        ..GuardrailLimits::default()
    };
    let h = harness(all_urls(), happy_reasoner(), limits);
    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(ingest(&h, &format!("Makita XDT13 unit {i}")).await);
    }

    let err = h.service.enrich_batch(ids.clone()).await.unwrap_err();
    assert!(matches!(err, EnrichError::BudgetExceeded(_)));

    for id in ids {
        let record = h.service.snapshot(id).await.unwrap();
        assert_eq!(record.status, ProductStatus::Pending);
        assert!(record.enrichment_log.is_empty());
    }
    assert_eq!(h.reasoner.classify_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn daily_product_limit_blocks_the_next_run() {
    let limits = GuardrailLimits {
        daily_product_limit: 1,
        ..GuardrailLimits::default()
    };
    let h = harness(all_urls(), happy_reasoner(), limits);
    let first = ingest(&h, "Makita XDT13 Impact Driver").await;
    let second = ingest(&h, "Makita XDT13 Impact Driver v2").await;

    assert_eq!(
        h.service.enrich(first).await.unwrap().status,
        ProductStatus::Done
    );

    let err = h.service.enrich(second).await.unwrap_err();
    assert!(matches!(err, EnrichError::BudgetExceeded(_)));
    assert_eq!(
        h.service.snapshot(second).await.unwrap().status,
        ProductStatus::Pending
    );
}

#[tokio::test]
async fn exhausted_budget_blocks_new_runs() {
    let limits = GuardrailLimits {
        daily_budget_usd: 0.0,
        ..GuardrailLimits::default()
    };
    let h = harness(all_urls(), happy_reasoner(), limits);
    let id = ingest(&h, "Makita XDT13 Impact Driver").await;

    let err = h.service.enrich(id).await.unwrap_err();
    assert!(matches!(err, EnrichError::BudgetExceeded(_)));
    assert!(err.to_string().contains("budget"));
    assert_eq!(
        h.service.snapshot(id).await.unwrap().status,
        ProductStatus::Pending
    );
    assert_eq!(h.searcher.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn exhausted_search_fails_the_run_hard() {
    let h = harness(
        MockSearcher::failing(),
        happy_reasoner(),
        GuardrailLimits::default(),
    );
    let id = ingest(&h, "Makita XDT13 Impact Driver").await;

    assert!(h.service.enrich(id).await.is_err());

    let record = h.service.snapshot(id).await.unwrap();
    assert_eq!(record.status, ProductStatus::Error);
    assert!(record
        .enrichment_log
        .iter()
        .any(|e| e.status == enrich_common::LogStatus::Error));
    // Costs up to the failure point are still persisted.
    assert!(record.cost_summary.is_some());
}

#[tokio::test]
async fn unreachable_pages_fail_the_run_instead_of_finishing_empty() {
    let h = harness_with(
        all_urls(),
        MockScraper::failing(),
        happy_reasoner(),
        GuardrailLimits::default(),
    );
    let id = ingest(&h, "Makita XDT13 Impact Driver").await;

    assert!(h.service.enrich(id).await.is_err());

    let record = h.service.snapshot(id).await.unwrap();
    assert_eq!(record.status, ProductStatus::Error);
    // Upstream outputs stay committed; no empty extraction is recorded.
    assert!(record.classification.is_some());
    assert!(record.search_result.is_some());
    assert!(record.extraction_result.is_none());
    assert_eq!(h.reasoner.extract_calls.load(Ordering::SeqCst), 0);
    assert!(record
        .enrichment_log
        .iter()
        .any(|e| e.status == enrich_common::LogStatus::Error));
}

#[tokio::test]
async fn conflicting_sources_route_to_review() {
    let d2 = "https://other-shop.example/xdt13";
    let agreeing = vec![
        number("weight", 2.5, "kg"),
        number("packaged_weight", 3.0, "kg"),
        text("country_of_origin", "Japan"),
    ];
    let mut page_one = agreeing.clone();
    page_one.push(text("color", "black"));
    let mut page_two = agreeing;
    page_two.push(text("color", "silver"));

    let reasoner = MockReasoner::new(makita())
        .tier(DISTRIBUTOR_URL, SourceTier::AuthorizedDistributor)
        .tier(d2, SourceTier::AuthorizedDistributor)
        .page(DISTRIBUTOR_URL, page_one)
        .page(d2, page_two);

    let h = harness(
        MockSearcher::returning(&[DISTRIBUTOR_URL, d2]),
        reasoner,
        GuardrailLimits::default(),
    );
    let id = ingest(&h, "Makita XDT13 Impact Driver").await;

    let record = h.service.enrich(id).await.unwrap();

    assert_eq!(record.status, ProductStatus::NeedsReview);

    let extraction = record.extraction_result.as_ref().unwrap();
    assert!(extraction.review_flagged);
    let color = &extraction.fields["color"];
    assert!(color.value.is_none());
    assert!(color.notes.as_deref().unwrap().contains("sources disagree"));
    // Two agreeing distributors reach consensus without an official source.
    assert!(extraction.fields["weight"].is_resolved());

    let validation = record.validation_result.as_ref().unwrap();
    assert_eq!(
        validation.review_reason.as_deref(),
        Some("sources disagreed during merge")
    );
    assert_eq!(record.current_step_detail.as_deref(), Some("sources disagreed during merge"));
}

#[tokio::test]
async fn batch_runs_every_product_and_reports_per_id() {
    let h = harness(all_urls(), happy_reasoner(), GuardrailLimits::default());
    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(ingest(&h, &format!("Makita XDT13 unit {i}")).await);
    }

    let results = h.service.enrich_batch(ids.clone()).await.unwrap();
    assert_eq!(results.len(), 3);
    for (_, result) in &results {
        assert_eq!(result.as_ref().unwrap(), &ProductStatus::Done);
    }
    for id in ids {
        assert_eq!(
            h.service.snapshot(id).await.unwrap().status,
            ProductStatus::Done
        );
    }
}
