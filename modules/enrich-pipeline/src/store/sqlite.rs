//! SQLite-backed store. Single-file deployment; JSON columns hold the
//! structured phase outputs so the schema stays stable as they evolve.

use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::info;

use enrich_common::{
    BrandOriginEntry, ConfidenceTier, CostSummary, LogEntry, NewProduct, PageCacheEntry, Phase,
    ProductRecord, ProductStatus, SourceTier,
};

use super::{DailyStats, PhaseOutput, ProductStore};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS products (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ean TEXT NOT NULL,
        name TEXT NOT NULL,
        brand TEXT,
        weight TEXT,
        original_data TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        current_step_detail TEXT,
        classification TEXT,
        search_result TEXT,
        extraction_result TEXT,
        gap_fill_result TEXT,
        validation_result TEXT,
        enrichment_log TEXT NOT NULL DEFAULT '[]',
        cost_summary TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scraped_pages (
        product_id INTEGER NOT NULL,
        url TEXT NOT NULL,
        source_tier TEXT NOT NULL,
        content TEXT NOT NULL,
        fetched_at TEXT NOT NULL,
        analyzed INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (product_id, url)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS brand_origin_cache (
        brand TEXT PRIMARY KEY,
        country TEXT NOT NULL,
        confidence TEXT NOT NULL,
        cached_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_products_status ON products(status)",
    "CREATE INDEX IF NOT EXISTS idx_products_updated ON products(updated_at)",
];

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .context("invalid database url")?
            .create_if_missing(true);
        // An in-memory database exists per connection, so it must not be
        // spread across a pool.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("failed to open database")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Database schema ready");
        Ok(())
    }
}

const PRODUCT_COLUMNS: &str = "id, ean, name, brand, weight, original_data, status, \
     current_step_detail, classification, search_result, extraction_result, \
     gap_fill_result, validation_result, enrichment_log, cost_summary, \
     created_at, updated_at";

#[async_trait]
impl ProductStore for SqliteStore {
    async fn insert_product(&self, new: NewProduct) -> Result<ProductRecord> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO products (ean, name, brand, weight, original_data, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(&new.ean)
        .bind(&new.name)
        .bind(&new.brand)
        .bind(&new.weight)
        .bind(serde_json::to_string(&new.original_data)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.get_product(id)
            .await?
            .context("inserted product vanished")
    }

    async fn get_product(&self, id: i64) -> Result<Option<ProductRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_product).transpose()
    }

    async fn list_products(&self, status: Option<ProductStatus>) -> Result<Vec<ProductRecord>> {
        let rows = if let Some(status) = status {
            sqlx::query(&format!(
                "SELECT {PRODUCT_COLUMNS} FROM products WHERE status = ? ORDER BY id"
            ))
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {PRODUCT_COLUMNS} FROM products ORDER BY id"
            ))
            .fetch_all(&self.pool)
            .await?
        };

        rows.into_iter().map(row_to_product).collect()
    }

    async fn delete_product(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM scraped_pages WHERE product_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM products WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_status(
        &self,
        id: i64,
        status: ProductStatus,
        detail: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE products SET status = ?, current_step_detail = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(detail)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_phase_output(&self, id: i64, output: &PhaseOutput) -> Result<()> {
        let (column, json) = match output {
            PhaseOutput::Classification(c) => ("classification", serde_json::to_string(c)?),
            PhaseOutput::Search(s) => ("search_result", serde_json::to_string(s)?),
            PhaseOutput::Extraction(e) => ("extraction_result", serde_json::to_string(e)?),
            PhaseOutput::GapFill(g) => ("gap_fill_result", serde_json::to_string(g)?),
            PhaseOutput::Validation(v) => ("validation_result", serde_json::to_string(v)?),
        };
        sqlx::query(&format!(
            "UPDATE products SET {column} = ?, updated_at = ? WHERE id = ?"
        ))
        .bind(json)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_phase_outputs_from(&self, id: i64, from: Phase) -> Result<()> {
        let cleared: Vec<&str> = Phase::ALL
            .into_iter()
            .filter(|p| *p >= from)
            .map(phase_column)
            .collect();
        let sets: Vec<String> = cleared.iter().map(|c| format!("{c} = NULL")).collect();
        sqlx::query(&format!(
            "UPDATE products SET {}, updated_at = ? WHERE id = ?",
            sets.join(", ")
        ))
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_log(&self, id: i64, entry: &LogEntry) -> Result<()> {
        let row = sqlx::query("SELECT enrichment_log FROM products WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .with_context(|| format!("product {id} not found"))?;

        let mut log: Vec<LogEntry> = serde_json::from_str(row.get::<String, _>(0).as_str())?;
        log.push(entry.clone());

        sqlx::query("UPDATE products SET enrichment_log = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(&log)?)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_cost_summary(&self, id: i64, summary: &CostSummary) -> Result<()> {
        sqlx::query("UPDATE products SET cost_summary = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(summary)?)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_stalled(&self, cutoff: DateTime<Utc>) -> Result<Vec<ProductRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products \
             WHERE status IN ('classifying','searching','extracting','gap_filling','validating') \
             AND updated_at < ?"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_product).collect()
    }

    async fn find_active(&self) -> Result<Vec<ProductRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products \
             WHERE status IN ('classifying','searching','extracting','gap_filling','validating')"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_product).collect()
    }

    async fn daily_stats(&self) -> Result<DailyStats> {
        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc())
            .unwrap_or_else(Utc::now);

        let rows = sqlx::query(
            "SELECT cost_summary FROM products WHERE updated_at >= ? AND status != 'pending'",
        )
        .bind(midnight)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = DailyStats {
            processed_today: rows.len() as u32,
            spend_today_usd: 0.0,
        };
        for row in rows {
            if let Some(json) = row.get::<Option<String>, _>(0) {
                let summary: CostSummary = serde_json::from_str(&json)?;
                stats.spend_today_usd += summary.total_cost_usd;
            }
        }
        Ok(stats)
    }

    async fn get_page(&self, product_id: i64, url: &str) -> Result<Option<PageCacheEntry>> {
        let row = sqlx::query(
            "SELECT product_id, url, source_tier, content, fetched_at, analyzed \
             FROM scraped_pages WHERE product_id = ? AND url = ?",
        )
        .bind(product_id)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_page).transpose()
    }

    async fn put_page(&self, entry: &PageCacheEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scraped_pages (product_id, url, source_tier, content, fetched_at, analyzed)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (product_id, url) DO UPDATE
            SET source_tier = excluded.source_tier,
                content = excluded.content,
                fetched_at = excluded.fetched_at,
                analyzed = excluded.analyzed
            "#,
        )
        .bind(entry.product_id)
        .bind(&entry.url)
        .bind(entry.source_tier.as_str())
        .bind(&entry.content)
        .bind(entry.fetched_at)
        .bind(entry.analyzed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_pages(&self, product_id: i64) -> Result<Vec<PageCacheEntry>> {
        let rows = sqlx::query(
            "SELECT product_id, url, source_tier, content, fetched_at, analyzed \
             FROM scraped_pages WHERE product_id = ? ORDER BY url",
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_page).collect()
    }

    async fn mark_page_analyzed(&self, product_id: i64, url: &str) -> Result<()> {
        sqlx::query("UPDATE scraped_pages SET analyzed = 1 WHERE product_id = ? AND url = ?")
            .bind(product_id)
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_brand_origin(&self, brand: &str) -> Result<Option<BrandOriginEntry>> {
        let row = sqlx::query(
            "SELECT brand, country, confidence, cached_at FROM brand_origin_cache WHERE brand = ?",
        )
        .bind(brand.to_lowercase())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            let confidence: String = r.get("confidence");
            Ok(BrandOriginEntry {
                brand: r.get("brand"),
                country: r.get("country"),
                confidence: parse_confidence(&confidence)?,
                cached_at: r.get("cached_at"),
            })
        })
        .transpose()
    }

    async fn put_brand_origin(&self, entry: &BrandOriginEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO brand_origin_cache (brand, country, confidence, cached_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (brand) DO UPDATE
            SET country = excluded.country,
                confidence = excluded.confidence,
                cached_at = excluded.cached_at
            "#,
        )
        .bind(entry.brand.to_lowercase())
        .bind(&entry.country)
        .bind(confidence_str(entry.confidence))
        .bind(entry.cached_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn row_to_product(row: SqliteRow) -> Result<ProductRecord> {
    let status: String = row.get("status");

    Ok(ProductRecord {
        id: row.get("id"),
        ean: row.get("ean"),
        name: row.get("name"),
        brand: row.get("brand"),
        weight: row.get("weight"),
        original_data: serde_json::from_str(row.get::<String, _>("original_data").as_str())?,
        status: ProductStatus::parse(&status)
            .with_context(|| format!("unknown product status: {status}"))?,
        current_step_detail: row.get("current_step_detail"),
        classification: json_column(&row, "classification")?,
        search_result: json_column(&row, "search_result")?,
        extraction_result: json_column(&row, "extraction_result")?,
        gap_fill_result: json_column(&row, "gap_fill_result")?,
        validation_result: json_column(&row, "validation_result")?,
        enrichment_log: serde_json::from_str(row.get::<String, _>("enrichment_log").as_str())?,
        cost_summary: json_column(&row, "cost_summary")?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_page(row: SqliteRow) -> Result<PageCacheEntry> {
    let tier: String = row.get("source_tier");
    Ok(PageCacheEntry {
        product_id: row.get("product_id"),
        url: row.get("url"),
        source_tier: parse_tier(&tier)?,
        content: row.get("content"),
        fetched_at: row.get("fetched_at"),
        analyzed: row.get("analyzed"),
    })
}

fn json_column<T: serde::de::DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<Option<T>> {
    match row.get::<Option<String>, _>(column) {
        Some(json) => Ok(Some(serde_json::from_str(&json).with_context(|| {
            format!("corrupt JSON in column {column}")
        })?)),
        None => Ok(None),
    }
}

fn parse_tier(s: &str) -> Result<SourceTier> {
    Ok(match s {
        "manufacturer" => SourceTier::Manufacturer,
        "authorized_distributor" => SourceTier::AuthorizedDistributor,
        "third_party" => SourceTier::ThirdParty,
        "irrelevant" => SourceTier::Irrelevant,
        other => anyhow::bail!("unknown source tier: {other}"),
    })
}

fn confidence_str(tier: ConfidenceTier) -> &'static str {
    match tier {
        ConfidenceTier::Official => "official",
        ConfidenceTier::ThirdParty => "third_party",
        ConfidenceTier::Inferred => "inferred",
        ConfidenceTier::NotFound => "not_found",
    }
}

fn parse_confidence(s: &str) -> Result<ConfidenceTier> {
    Ok(match s {
        "official" => ConfidenceTier::Official,
        "third_party" => ConfidenceTier::ThirdParty,
        "inferred" => ConfidenceTier::Inferred,
        "not_found" => ConfidenceTier::NotFound,
        other => anyhow::bail!("unknown confidence tier: {other}"),
    })
}

fn phase_column(phase: Phase) -> &'static str {
    match phase {
        Phase::Classify => "classification",
        Phase::Search => "search_result",
        Phase::Extract => "extraction_result",
        Phase::GapFill => "gap_fill_result",
        Phase::Validate => "validation_result",
    }
}
