//! In-memory store used by tests and local experiments.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use enrich_common::{
    BrandOriginEntry, CostSummary, LogEntry, NewProduct, PageCacheEntry, Phase, ProductRecord,
    ProductStatus,
};

use super::{DailyStats, PhaseOutput, ProductStore};

#[derive(Default)]
struct Inner {
    next_id: i64,
    products: HashMap<i64, ProductRecord>,
    pages: HashMap<(i64, String), PageCacheEntry>,
    brand_origins: HashMap<String, BrandOriginEntry>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_product<R>(
        &self,
        id: i64,
        f: impl FnOnce(&mut ProductRecord) -> R,
    ) -> Result<R> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        match inner.products.get_mut(&id) {
            Some(record) => {
                let result = f(record);
                record.updated_at = Utc::now();
                Ok(result)
            }
            None => bail!("product {id} not found"),
        }
    }
}

#[async_trait]
impl ProductStore for MemoryStore {
    async fn insert_product(&self, new: NewProduct) -> Result<ProductRecord> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        inner.next_id += 1;
        let now = Utc::now();
        let record = ProductRecord {
            id: inner.next_id,
            ean: new.ean,
            name: new.name,
            brand: new.brand,
            weight: new.weight,
            original_data: new.original_data,
            status: ProductStatus::Pending,
            current_step_detail: None,
            classification: None,
            search_result: None,
            extraction_result: None,
            gap_fill_result: None,
            validation_result: None,
            enrichment_log: Vec::new(),
            cost_summary: None,
            created_at: now,
            updated_at: now,
        };
        inner.products.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_product(&self, id: i64) -> Result<Option<ProductRecord>> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        Ok(inner.products.get(&id).cloned())
    }

    async fn list_products(&self, status: Option<ProductStatus>) -> Result<Vec<ProductRecord>> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        let mut records: Vec<ProductRecord> = inner
            .products
            .values()
            .filter(|p| status.map_or(true, |s| p.status == s))
            .cloned()
            .collect();
        records.sort_by_key(|p| p.id);
        Ok(records)
    }

    async fn delete_product(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        inner.products.remove(&id);
        inner.pages.retain(|(pid, _), _| *pid != id);
        Ok(())
    }

    async fn update_status(
        &self,
        id: i64,
        status: ProductStatus,
        detail: Option<&str>,
    ) -> Result<()> {
        self.with_product(id, |record| {
            record.status = status;
            record.current_step_detail = detail.map(str::to_string);
        })
    }

    async fn save_phase_output(&self, id: i64, output: &PhaseOutput) -> Result<()> {
        self.with_product(id, |record| match output {
            PhaseOutput::Classification(c) => record.classification = Some(c.clone()),
            PhaseOutput::Search(s) => record.search_result = Some(s.clone()),
            PhaseOutput::Extraction(e) => record.extraction_result = Some(e.clone()),
            PhaseOutput::GapFill(g) => record.gap_fill_result = Some(g.clone()),
            PhaseOutput::Validation(v) => record.validation_result = Some(v.clone()),
        })
    }

    async fn clear_phase_outputs_from(&self, id: i64, from: Phase) -> Result<()> {
        self.with_product(id, |record| {
            for phase in Phase::ALL.into_iter().filter(|p| *p >= from) {
                match phase {
                    Phase::Classify => record.classification = None,
                    Phase::Search => record.search_result = None,
                    Phase::Extract => record.extraction_result = None,
                    Phase::GapFill => record.gap_fill_result = None,
                    Phase::Validate => record.validation_result = None,
                }
            }
        })
    }

    async fn append_log(&self, id: i64, entry: &LogEntry) -> Result<()> {
        self.with_product(id, |record| record.enrichment_log.push(entry.clone()))
    }

    async fn save_cost_summary(&self, id: i64, summary: &CostSummary) -> Result<()> {
        self.with_product(id, |record| record.cost_summary = Some(summary.clone()))
    }

    async fn find_stalled(&self, cutoff: DateTime<Utc>) -> Result<Vec<ProductRecord>> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        Ok(inner
            .products
            .values()
            .filter(|p| p.status.is_active() && p.updated_at < cutoff)
            .cloned()
            .collect())
    }

    async fn find_active(&self) -> Result<Vec<ProductRecord>> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        Ok(inner
            .products
            .values()
            .filter(|p| p.status.is_active())
            .cloned()
            .collect())
    }

    async fn daily_stats(&self) -> Result<DailyStats> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        let today = Utc::now().date_naive();
        let mut stats = DailyStats::default();
        for p in inner.products.values() {
            if p.updated_at.date_naive() == today && p.status != ProductStatus::Pending {
                stats.processed_today += 1;
                if let Some(summary) = &p.cost_summary {
                    stats.spend_today_usd += summary.total_cost_usd;
                }
            }
        }
        Ok(stats)
    }

    async fn get_page(&self, product_id: i64, url: &str) -> Result<Option<PageCacheEntry>> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        Ok(inner.pages.get(&(product_id, url.to_string())).cloned())
    }

    async fn put_page(&self, entry: &PageCacheEntry) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        inner
            .pages
            .insert((entry.product_id, entry.url.clone()), entry.clone());
        Ok(())
    }

    async fn list_pages(&self, product_id: i64) -> Result<Vec<PageCacheEntry>> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        let mut pages: Vec<PageCacheEntry> = inner
            .pages
            .values()
            .filter(|p| p.product_id == product_id)
            .cloned()
            .collect();
        pages.sort_by(|a, b| a.url.cmp(&b.url));
        Ok(pages)
    }

    async fn mark_page_analyzed(&self, product_id: i64, url: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        if let Some(page) = inner.pages.get_mut(&(product_id, url.to_string())) {
            page.analyzed = true;
        }
        Ok(())
    }

    async fn get_brand_origin(&self, brand: &str) -> Result<Option<BrandOriginEntry>> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        Ok(inner.brand_origins.get(&brand.to_lowercase()).cloned())
    }

    async fn put_brand_origin(&self, entry: &BrandOriginEntry) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        inner
            .brand_origins
            .insert(entry.brand.to_lowercase(), entry.clone());
        Ok(())
    }
}
