use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use metricwatch::config::Config;
use metricwatch::detect::{DetectorRegistry, Sensitivity};
use metricwatch::events::StreamKey;
use metricwatch::pipeline::{DetectionRequest, SeriesReport};

#[derive(Parser)]
#[command(
    name = "metricwatch",
    about = "Anomaly detection, event grouping and prioritization for infrastructure metrics",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (default: $METRICWATCH_CONFIG, then /etc/metricwatch/metricwatch.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Bind address (overrides server.bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run detection over a JSON request file and print the response
    Detect {
        /// Request file, or `-` for stdin
        #[arg(long)]
        input: PathBuf,

        /// Detection method (overrides the file's `method`)
        #[arg(long)]
        method: Option<String>,

        /// low, medium or high (overrides the file's `sensitivity`)
        #[arg(long)]
        sensitivity: Option<Sensitivity>,

        /// Pretty-print the JSON response
        #[arg(long)]
        pretty: bool,
    },

    /// List detection methods and their availability
    Methods {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show recently stored anomaly events
    Events {
        #[arg(long, requires = "metric")]
        resource: Option<String>,

        #[arg(long, requires = "resource")]
        metric: Option<String>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Validate the configuration and exit
    CheckConfig,
}

fn read_request(input: &Path) -> Result<DetectionRequest> {
    let raw = if input == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read request from stdin")?;
        buf
    } else {
        std::fs::read_to_string(input)
            .with_context(|| format!("failed to read request file: {}", input.display()))?
    };
    serde_json::from_str(&raw).with_context(|| format!("invalid request JSON in {}", input.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::resolve(cli.config.as_deref())?;
    metricwatch::logging::init(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            tracing::info!(?bind, "Starting metricwatch daemon");
            metricwatch::serve(config, bind.as_deref()).await?;
        }
        Commands::Detect {
            input,
            method,
            sensitivity,
            pretty,
        } => {
            let mut request = read_request(&input)?;
            if let Some(m) = method {
                request.method = m;
            }
            if let Some(s) = sensitivity {
                request.sensitivity = s;
            }

            let pipeline = metricwatch::build_pipeline(config)?;
            let response = pipeline.run(request).await?;
            let out = if pretty {
                serde_json::to_string_pretty(&response)?
            } else {
                serde_json::to_string(&response)?
            };
            println!("{out}");

            for report in &response.results {
                if let SeriesReport::Error { resource_id, metric_name, error } = report {
                    tracing::warn!(%resource_id, %metric_name, kind = error.kind, "{}", error.message);
                }
            }
        }
        Commands::Methods { json } => {
            let registry = DetectorRegistry::from_config(&config.detectors);
            let methods = registry.list();
            if json {
                println!("{}", serde_json::to_string_pretty(&methods)?);
            } else {
                println!("{:<18} | {:<12} | {:<10} | {:<6} | Description", "Method", "Category", "Available", "Min");
                println!("{:-<18}-|-{:-<12}-|-{:-<10}-|-{:-<6}-|-{:-<40}", "", "", "", "", "");
                for m in &methods {
                    let category = serde_json::to_value(m.meta.category)?;
                    println!(
                        "{:<18} | {:<12} | {:<10} | {:<6} | {}",
                        m.meta.id,
                        category.as_str().unwrap_or_default(),
                        if m.available { "yes" } else { "no" },
                        m.min_points,
                        m.meta.description
                    );
                }
            }
        }
        Commands::Events {
            resource,
            metric,
            limit,
        } => {
            let store = metricwatch::storage::open_store(&config.storage)?;
            let key = resource.zip(metric).map(|(r, m)| StreamKey::new(r, m));
            let events = store.recent(key.as_ref(), limit)?;
            if events.is_empty() {
                println!("No anomaly events stored.");
            } else {
                println!(
                    "{:<20} | {:<12} | {:<20} | {:<20} | {:<8} | {:>6} | Score",
                    "Resource", "Metric", "Start", "End", "Priority", "Points"
                );
                println!("{:-<20}-|-{:-<12}-|-{:-<20}-|-{:-<20}-|-{:-<8}-|-{:-<6}-|-{:-<5}", "", "", "", "", "", "", "");
                for ev in events {
                    println!(
                        "{:<20} | {:<12} | {:<20} | {:<20} | {:<8} | {:>6} | {:.3}",
                        ev.resource_id,
                        ev.metric_name,
                        ev.start_time.format("%Y-%m-%d %H:%M:%S"),
                        ev.end_time.format("%Y-%m-%d %H:%M:%S"),
                        ev.priority,
                        ev.point_count,
                        ev.priority_score
                    );
                }
            }
        }
        Commands::CheckConfig => {
            config.validate()?;
            let registry = DetectorRegistry::from_config(&config.detectors);
            println!("configuration OK");
            println!("  storage:   {:?} ({})", config.storage.backend, config.storage.path.display());
            println!("  workers:   {}", config.pipeline.workers);
            println!("  timeout:   {} ms", config.pipeline.request_timeout_ms);
            println!(
                "  methods:   {}",
                registry
                    .list()
                    .iter()
                    .map(|m| m.meta.id)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
    }

    Ok(())
}
