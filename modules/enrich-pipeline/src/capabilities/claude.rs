//! Claude-backed reasoning and vision adapters.
//!
//! Prompt wording lives here and nowhere else; phases deal in typed
//! inputs and outputs only.

use std::collections::BTreeMap;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::debug;

use claude_client::{Claude, TokenUsage};
use enrich_common::attributes::AttributeSpec;
use enrich_common::{Classification, ClassifiedUrl, EnrichError, EnrichedField};

use super::{ColorVision, ExtractedField, Reasoner, SanityVerdict, SearchHit};

/// Pages are truncated before prompting; specs are near the top of
/// product pages so the tail is rarely useful.
const MAX_PAGE_CHARS: usize = 25_000;

/// Clip a prompt fragment to a byte budget without splitting a character.
fn clip_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut cut = max_bytes;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    &s[..cut]
}

pub struct ClaudeReasoner {
    claude: Claude,
}

impl ClaudeReasoner {
    pub fn new(claude: Claude) -> Self {
        Self { claude }
    }

    pub fn model(&self) -> &str {
        self.claude.model()
    }
}

pub struct ClaudeVision {
    claude: Claude,
}

impl ClaudeVision {
    pub fn new(claude: Claude) -> Self {
        Self { claude }
    }

    pub fn model(&self) -> &str {
        self.claude.model()
    }
}

// --- Wire shapes for structured output ---

#[derive(Deserialize, JsonSchema)]
struct UrlClassificationWire {
    results: Vec<ClassifiedUrl>,
}

#[derive(Deserialize, JsonSchema)]
struct ExtractionWire {
    fields: Vec<ExtractedField>,
}

#[derive(Deserialize, JsonSchema)]
struct BrandOriginWire {
    /// Country name in English, or null when not confidently known.
    country: Option<String>,
}

fn map_reasoning_err(e: anyhow::Error) -> EnrichError {
    let msg = e.to_string();
    let transient = ["(429", "(500", "(502", "(503", "(529", "overloaded", "timed out", "timeout"]
        .iter()
        .any(|marker| msg.contains(marker));
    if transient {
        EnrichError::transient("claude", msg)
    } else {
        EnrichError::Reasoning(msg)
    }
}

#[async_trait]
impl Reasoner for ClaudeReasoner {
    async fn classify_product(
        &self,
        name: &str,
        ean: &str,
        brand: Option<&str>,
        weight: Option<&str>,
    ) -> Result<(Classification, TokenUsage), EnrichError> {
        let system = "You classify raw e-commerce product rows. Determine the product type, \
            the brand (only if you are confident it is a real brand), a model number if one \
            is embedded in the name, any color or size mentioned, and the manufacturer's \
            own web domain if the brand is well known. Explain your reasoning briefly.";

        let user = format!(
            "Product name: {name}\nEAN: {ean}\nBrand field: {}\nWeight field: {}",
            brand.unwrap_or("(empty)"),
            weight.unwrap_or("(empty)"),
        );

        debug!(ean, "Classifying product");
        self.claude
            .extract::<Classification>(system, &user)
            .await
            .map_err(map_reasoning_err)
    }

    async fn classify_urls(
        &self,
        identity: &str,
        hits: &[SearchHit],
    ) -> Result<(Vec<ClassifiedUrl>, TokenUsage), EnrichError> {
        let system = "You sort search results for a product into source tiers: \
            'manufacturer' for the brand's own site, 'authorized_distributor' for \
            official resellers and large retailers with reliable spec data, \
            'third_party' for marketplaces, price aggregators and review sites, \
            'irrelevant' for anything not about this exact product. \
            Classify every result.";

        let mut user = format!("Product: {identity}\n\nSearch results:\n");
        for (i, hit) in hits.iter().enumerate() {
            user.push_str(&format!(
                "{}. {} — {}\n   {}\n",
                i + 1,
                hit.title,
                hit.url,
                clip_utf8(&hit.snippet, 300),
            ));
        }

        let (wire, usage) = self
            .claude
            .extract::<UrlClassificationWire>(system, &user)
            .await
            .map_err(map_reasoning_err)?;
        Ok((wire.results, usage))
    }

    async fn extract_fields(
        &self,
        identity: &str,
        attributes: &[AttributeSpec],
        page_url: &str,
        page_markdown: &str,
    ) -> Result<(Vec<ExtractedField>, TokenUsage), EnrichError> {
        let wanted: Vec<&str> = attributes.iter().map(|a| a.name).collect();
        let system = format!(
            "You extract product attributes from a scraped page. Report only values the \
             page actually states for this exact product; never guess. For measurements, \
             keep the unit exactly as written and say whether it describes the product \
             itself or its packaging (dimension_type 'product' or 'packaging'; 'na' if \
             the page does not say). Attributes to look for: {}.",
            wanted.join(", ")
        );

        let user = format!(
            "Product: {identity}\nPage: {page_url}\n\n{}",
            clip_utf8(page_markdown, MAX_PAGE_CHARS),
        );

        debug!(page_url, "Extracting fields from page");
        let (wire, usage) = self
            .claude
            .extract::<ExtractionWire>(&system, &user)
            .await
            .map_err(map_reasoning_err)?;
        Ok((wire.fields, usage))
    }

    async fn sanity_check(
        &self,
        identity: &str,
        fields: &BTreeMap<String, EnrichedField>,
    ) -> Result<(SanityVerdict, TokenUsage), EnrichError> {
        let system = "You review an enriched product record for plausibility: do the \
            dimensions, weight and volume make physical sense together and for this kind \
            of product? Rate overall quality 'good', 'acceptable', or 'needs_review', and \
            list concrete issues per field with severity.";

        let rendered = fields
            .iter()
            .map(|(name, f)| {
                format!(
                    "{name}: {}{} ({})",
                    f.value.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "—".to_string()),
                    f.unit.as_deref().map(|u| format!(" {u}")).unwrap_or_default(),
                    serde_json::to_string(&f.confidence).unwrap_or_default(),
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let user = format!("Product: {identity}\n\nEnriched fields:\n{rendered}");

        self.claude
            .extract::<SanityVerdict>(system, &user)
            .await
            .map_err(map_reasoning_err)
    }

    async fn brand_origin(
        &self,
        brand: &str,
    ) -> Result<(Option<String>, TokenUsage), EnrichError> {
        let system = "Name the country where this brand's products are primarily \
            manufactured or the brand is headquartered, if you know it with confidence. \
            Otherwise return null.";

        let (wire, usage) = self
            .claude
            .extract::<BrandOriginWire>(system, brand)
            .await
            .map_err(map_reasoning_err)?;
        Ok((wire.country, usage))
    }
}

#[async_trait]
impl ColorVision for ClaudeVision {
    async fn detect_color(
        &self,
        image_url: &str,
    ) -> Result<(Option<String>, TokenUsage), EnrichError> {
        let instruction = "State the dominant color of the product shown, as a single \
            lowercase English color word (e.g. 'black', 'red', 'silver'). If the color \
            is unclear or multiple products are shown, answer 'unknown'.";

        let (text, usage) = self
            .claude
            .describe_image(image_url, instruction)
            .await
            .map_err(|e| {
                let mapped = map_reasoning_err(e);
                match mapped {
                    EnrichError::Reasoning(msg) => EnrichError::Vision(msg),
                    other => other,
                }
            })?;

        let answer = text.trim().to_lowercase();
        let color = match answer.as_str() {
            "" | "unknown" => None,
            _ => Some(answer),
        };
        Ok((color, usage))
    }
}
