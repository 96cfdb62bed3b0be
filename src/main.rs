use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

use related_papers::layers::DEFAULT_MAX_TOTAL_PAPERS;
use related_papers::{
    DiscoveryConfiguration, DiscoveryCoordinator, DiscoverySource, RelatedPaperDiscoveryResult, Settings,
    SourcePaper,
};

/// Find papers related to a source paper across OpenAlex, Semantic Scholar
/// and arXiv.
#[derive(Parser, Debug)]
#[command(name = "related-papers", version)]
struct Args {
    /// Title of the source paper.
    title: String,

    #[arg(long)]
    doi: Option<String>,

    /// Author names, repeat or comma-separate.
    #[arg(long = "author", value_delimiter = ',')]
    authors: Vec<String>,

    #[arg(long = "abstract")]
    abstract_text: Option<String>,

    #[arg(long)]
    venue: Option<String>,

    /// Sources to query (openalex, semantic-scholar, arxiv). Defaults to all.
    #[arg(long = "source", value_delimiter = ',')]
    sources: Vec<DiscoverySource>,

    #[arg(long, default_value_t = DEFAULT_MAX_TOTAL_PAPERS)]
    max_papers: usize,

    #[arg(long, default_value_t = 0.3)]
    min_relevance: f64,

    /// Overall discovery timeout in seconds.
    #[arg(long, default_value_t = 120)]
    timeout: u64,

    /// Fixed per-source timeout in seconds.
    #[arg(long)]
    source_timeout: Option<u64>,

    /// Skip dedup, AI scoring and ranking.
    #[arg(long)]
    no_ai: bool,

    /// Print the full result as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let settings = Settings::from_env().context("loading settings")?;
    let coordinator = DiscoveryCoordinator::from_settings(&settings).context("building coordinator")?;

    let mut paper = SourcePaper::new("cli", args.title.clone()).with_authors(args.authors.clone());
    paper.doi = args.doi.clone();
    paper.abstract_text = args.abstract_text.clone();
    paper.venue = args.venue.clone();

    let mut config = DiscoveryConfiguration::default()
        .with_max_total_papers(args.max_papers)
        .with_min_relevance(args.min_relevance)
        .with_overall_timeout(Duration::from_secs(args.timeout))
        .with_ai_synthesis(!args.no_ai);
    if !args.sources.is_empty() {
        config = config.with_sources(args.sources.iter().copied());
    }
    if let Some(secs) = args.source_timeout {
        config = config.with_source_timeout(Duration::from_secs(secs));
    }

    info!(title = %paper.title, sources = config.enabled_sources.len(), "Starting discovery");
    let result = coordinator.coordinate_discovery(&paper, &config).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }

    println!("\n--- Usage ---");
    for stats in coordinator.usage_report() {
        println!(
            "{:<32} total={:<4} ok={:<4} failed={:<4} rejected={:<4} circuit={:?} avg={:.0}ms cost=${:.4}{}",
            stats.service,
            stats.total_requests,
            stats.successful_requests,
            stats.failed_requests,
            stats.rejected_requests,
            stats.circuit_state,
            stats.average_response_ms,
            stats.estimated_cost,
            if stats.over_quota { " (over quota)" } else { "" },
        );
    }

    Ok(())
}

fn print_result(result: &RelatedPaperDiscoveryResult) {
    println!("--- Sources ---");
    for (source, stats) in &result.source_statistics {
        println!(
            "{:<20} raw={:<4} kept={:<4} {}ms {}",
            source,
            stats.raw_count,
            stats.final_count,
            stats.elapsed_ms,
            stats.status.describe(*source),
        );
    }

    println!("\n--- Related papers ({}) ---", result.discovered_papers.len());
    for (i, paper) in result.discovered_papers.iter().enumerate() {
        let year = paper.year.map(|y| y.to_string()).unwrap_or_else(|| "n.d.".to_string());
        println!(
            "{:>3}. [{:.2}] {} ({}) [{} via {}]",
            i + 1,
            paper.composite_score.unwrap_or_else(|| paper.relevance_score()),
            paper.title,
            year,
            paper.relationship,
            paper.source,
        );
        if let Some(doi) = &paper.doi {
            println!("      doi:{}", doi);
        }
    }

    println!(
        "\nConfidence {:.2}, {} AI-scored, {}ms{}",
        result.confidence_score,
        result.ai_enhanced_papers,
        result.processing_time_ms,
        if result.requires_user_review { ", needs review" } else { "" },
    );
    for warning in &result.warnings {
        println!("warning: {}", warning);
    }
    for error in &result.errors {
        println!("error: {}", error);
    }
}
