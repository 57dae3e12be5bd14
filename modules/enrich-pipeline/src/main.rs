use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use enrich_common::{Config, NewProduct, Phase, ProductStatus};
use enrich_pipeline::events::PipelineEvent;
use enrich_pipeline::store::{ProductStore, SqliteStore};
use enrich_pipeline::watchdog::{Watchdog, WatchdogConfig};
use enrich_pipeline::EnrichmentService;

#[derive(Parser)]
#[command(name = "enrich", about = "Product enrichment pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add a product to the store without running it.
    Ingest {
        #[arg(long)]
        ean: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        brand: Option<String>,
        #[arg(long)]
        weight: Option<String>,
    },
    /// Enrich one product end to end.
    Run {
        #[arg(long)]
        id: i64,
    },
    /// Enrich every pending product, or an explicit id list.
    Batch {
        #[arg(long, value_delimiter = ',')]
        ids: Option<Vec<i64>>,
    },
    /// Re-run one phase (and everything after it) for a product.
    Retry {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        phase: String,
    },
    /// Stream live pipeline events to stdout.
    Watch,
    /// List products, optionally filtered by status.
    List {
        #[arg(long)]
        status: Option<String>,
    },
    /// Today's processing and spend totals.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("enrich=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    let store: Arc<dyn ProductStore> = Arc::new(SqliteStore::connect(&config.database_url).await?);
    let service = Arc::new(EnrichmentService::new(&config, store.clone()));

    let watchdog = Arc::new(Watchdog::new(
        store.clone(),
        service.bus(),
        WatchdogConfig::default(),
    ));
    let recovered = watchdog.recover_on_start().await?;
    if recovered > 0 {
        info!(recovered, "Marked orphaned runs as errored");
    }
    tokio::spawn(watchdog.run());

    match cli.command {
        Command::Ingest {
            ean,
            name,
            brand,
            weight,
        } => {
            let record = service
                .ingest(NewProduct {
                    original_data: serde_json::json!({
                        "ean": ean, "name": name, "brand": brand, "weight": weight,
                    }),
                    ean,
                    name,
                    brand,
                    weight,
                })
                .await?;
            println!("ingested product {}", record.id);
        }
        Command::Run { id } => {
            let record = service.enrich(id).await?;
            println!("product {} finished as {}", record.id, record.status);
            if let Some(summary) = record.cost_summary {
                println!("cost: ${:.4}", summary.total_cost_usd);
            }
        }
        Command::Batch { ids } => {
            let ids = match ids {
                Some(ids) => ids,
                None => service
                    .list(Some(ProductStatus::Pending))
                    .await?
                    .into_iter()
                    .map(|p| p.id)
                    .collect(),
            };
            if ids.is_empty() {
                println!("nothing to do");
                return Ok(());
            }
            let results = service.enrich_batch(ids).await?;
            for (id, result) in results {
                match result {
                    Ok(status) => println!("product {id}: {status}"),
                    Err(e) => println!("product {id}: failed ({e})"),
                }
            }
        }
        Command::Retry { id, phase } => {
            let phase = parse_phase(&phase)?;
            let record = service.retry_phase(id, phase).await?;
            println!("product {} finished as {}", record.id, record.status);
        }
        Command::Watch => {
            let mut events = service.subscribe();
            println!("watching (ctrl-c to stop)");
            while let Ok(event) = events.recv().await {
                match event {
                    PipelineEvent::StatusChanged {
                        product_id,
                        status,
                        detail,
                    } => {
                        println!(
                            "product {product_id} -> {status}{}",
                            detail.map(|d| format!(" ({d})")).unwrap_or_default()
                        );
                    }
                    PipelineEvent::LogAppended { product_id, entry } => {
                        println!(
                            "product {product_id} [{}/{}] {}",
                            entry.phase, entry.step, entry.details
                        );
                    }
                }
            }
        }
        Command::List { status } => {
            let status = match status.as_deref() {
                Some(s) => Some(
                    ProductStatus::parse(s)
                        .ok_or_else(|| anyhow::anyhow!("unknown status: {s}"))?,
                ),
                None => None,
            };
            for product in service.list(status).await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    product.id, product.status, product.ean, product.name
                );
            }
        }
        Command::Stats => {
            let stats = service.daily_stats().await?;
            let limits = service.limits();
            println!(
                "processed today: {}/{}",
                stats.processed_today, limits.daily_product_limit
            );
            println!(
                "spend today: ${:.2}/${:.2}",
                stats.spend_today_usd, limits.daily_budget_usd
            );
        }
    }

    Ok(())
}

fn parse_phase(s: &str) -> Result<Phase> {
    Phase::ALL
        .into_iter()
        .find(|p| p.as_str() == s)
        .ok_or_else(|| anyhow::anyhow!("unknown phase: {s} (expected one of classify, search, extract, gap_fill, validate)"))
}
