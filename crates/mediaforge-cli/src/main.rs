//! mediaforge command line
//!
//! Thin commands over the core: build the provider registry from settings,
//! inspect and select providers, run a generation, and inspect media files.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::future::join_all;
use serde_json::Value;
use tracing::info;

use mediaforge::core::discovery::DiscoveryRegistry;
use mediaforge::core::generative::mock::{MockModel, MockProvider};
use mediaforge::core::generative::{
    FindOptions, GenerationRequest, MediaProvider, Model, ParameterSpec, Pipeline, Pricing,
    ProviderCapability, ProviderRegistry, TieBreak,
};
use mediaforge::core::media::{MediaValue, Text};
use mediaforge::core::settings::{Settings, SettingsManager};
use mediaforge::core::{options_from, Options};

static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

#[derive(Debug, Parser)]
#[command(name = "mediaforge", version, about = "Provider-agnostic media generation")]
struct Cli {
    /// Directory holding settings.json
    #[arg(long, global = true)]
    settings_dir: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write daily rolling log files here
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List registered providers
    Providers {
        #[arg(long)]
        json: bool,
    },
    /// Pick the best provider for a capability
    Best(BestArgs),
    /// Probe every provider's health
    Health,
    /// Run one generation and write the output
    Generate(GenerateArgs),
    /// Load a media file and describe it
    Inspect { path: PathBuf },
    /// Show where settings live and what they resolve to
    Config,
    /// Run a two-step chain on mock providers and print its provenance
    Demo,
}

#[derive(Debug, Args)]
struct BestArgs {
    /// e.g. text-to-image
    capability: ProviderCapability,
    #[arg(long)]
    prefer_local: bool,
    #[arg(long)]
    max_cost: Option<f64>,
    /// Cheapest eligible provider instead of first registered
    #[arg(long)]
    cheapest: bool,
}

#[derive(Debug, Args)]
struct GenerateArgs {
    #[arg(long)]
    provider: String,
    #[arg(long)]
    model: String,
    /// Text prompt; mutually exclusive with --input
    #[arg(long, conflicts_with = "input")]
    prompt: Option<String>,
    /// Media file to use as input
    #[arg(long)]
    input: Option<PathBuf>,
    /// Model option as key=value; values are parsed as JSON when possible
    #[arg(long = "option", short = 'o')]
    options: Vec<String>,
    /// Output file; the extension defaults to the output format
    #[arg(long)]
    out: Option<PathBuf>,
}

fn init_logging(verbose: bool, log_dir: Option<&Path>) -> Result<()> {
    use tracing_subscriber::prelude::*;

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log dir {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "mediaforge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = LOG_GUARD.set(guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
    Ok(())
}

fn load_settings(dir: Option<&Path>) -> (SettingsManager, Settings) {
    let manager = match dir {
        Some(dir) => SettingsManager::new(dir),
        None => SettingsManager::default(),
    };
    let settings = manager.load().with_env_overrides();
    (manager, settings)
}

fn parse_options(pairs: &[String]) -> Result<Options> {
    let mut options = Options::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("option '{}' is not key=value", pair))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        options.insert(key.trim().to_string(), value);
    }
    Ok(options)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn list_providers(registry: &ProviderRegistry, json: bool) -> Result<()> {
    registry.refresh_availability().await;
    let providers = registry.list_providers().await;
    if json {
        return print_json(&providers);
    }
    if providers.is_empty() {
        println!(
            "No providers configured. Set FAL_KEY, HF_SERVICE_URL, FFMPEG_SERVICE_URL or CHATTERBOX_SERVICE_URL."
        );
    }
    for p in providers {
        let caps: Vec<&str> = p.capabilities.iter().map(|c| c.as_str()).collect();
        println!(
            "{:<12} {:<7} {:<11} {} models  [{}]",
            p.id,
            p.provider_type,
            match p.available {
                Some(true) => "available",
                Some(false) => "unavailable",
                None => "unknown",
            },
            p.model_count,
            caps.join(", ")
        );
    }
    Ok(())
}

async fn best(registry: &ProviderRegistry, args: BestArgs) -> Result<()> {
    let mut options = FindOptions::default();
    if args.prefer_local {
        options = options.prefer_local(true);
    }
    if let Some(max_cost) = args.max_cost {
        options = options.max_cost(max_cost);
    }
    if args.cheapest {
        options = options.tie_break(TieBreak::CheapestFirst);
    }

    match registry.find_best_provider(args.capability, options).await {
        Some(provider) => {
            println!("{} ({})", provider.id(), provider.provider_type());
            for model in provider.get_models_for_capability(args.capability) {
                let descriptor = model.descriptor();
                match model.cost(&descriptor.default_options()) {
                    Some(cost) => println!("  {} ~${:.4}", descriptor.id, cost),
                    None => println!("  {}", descriptor.id),
                }
            }
            Ok(())
        }
        None => bail!("no available provider for {}", args.capability),
    }
}

async fn health(registry: &ProviderRegistry) -> Result<()> {
    let providers = registry.providers().await;
    let reports = join_all(providers.iter().map(|p| p.get_health())).await;
    print_json(&reports)
}

async fn generate(registry: &ProviderRegistry, args: GenerateArgs) -> Result<()> {
    let provider = registry
        .get_provider(&args.provider)
        .await
        .ok_or_else(|| anyhow!("provider '{}' is not registered", args.provider))?;

    let input = match (&args.prompt, &args.input) {
        (Some(prompt), _) => MediaValue::from(Text::new(prompt.clone())),
        (None, Some(path)) => DiscoveryRegistry::with_defaults().await.load_media(path).await?,
        (None, None) => bail!("either --prompt or --input is required"),
    };

    let request =
        GenerationRequest::new(args.model.clone(), input).with_options(parse_options(&args.options)?);
    let result = provider.generate(request).await;
    print_json(&result.summary())?;

    let Some(output) = result.output() else {
        bail!(
            "generation failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
    };

    if let Some(text) = output.as_text() {
        println!("{}", text.content());
    }
    if let Some(out) = args.out {
        let out = if out.extension().is_none() {
            out.with_extension(output.extension())
        } else {
            out
        };
        tokio::fs::write(&out, output.payload())
            .await
            .with_context(|| format!("writing {}", out.display()))?;
        info!("Wrote {} to {}", output, out.display());
    }
    Ok(())
}

async fn inspect(path: &Path) -> Result<()> {
    let registry = DiscoveryRegistry::with_defaults().await;
    let matches: Vec<String> = registry
        .get_best_matching_discoveries(path)
        .await
        .iter()
        .map(|d| d.id().to_string())
        .collect();
    let value = registry.load_media(path).await?;

    println!("{}", value);
    println!("discoveries: {}", matches.join(", "));
    print_json(&value.summary())
}

async fn first_model(
    registry: &ProviderRegistry,
    capability: ProviderCapability,
) -> Result<Arc<dyn Model>> {
    let provider = registry
        .find_best_provider(capability, FindOptions::default())
        .await
        .ok_or_else(|| anyhow!("no provider for {}", capability))?;
    provider
        .get_models_for_capability(capability)
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("{} has no model for {}", provider.id(), capability))
}

async fn demo() -> Result<()> {
    let llm = MockProvider::new("mock-llm").with_model(
        MockModel::new("enhancer", ProviderCapability::TextToText)
            .with_parameter("system", ParameterSpec::string()),
    );
    let painter = MockProvider::new("mock-image").with_model(
        MockModel::new("painter", ProviderCapability::TextToImage)
            .with_parameter("width", ParameterSpec::integer().with_default(512))
            .with_parameter("height", ParameterSpec::integer().with_default(512))
            .with_parameter("seed", ParameterSpec::seed())
            .with_pricing(Pricing::flat(0.003)),
    );

    let registry = ProviderRegistry::new();
    registry.register(Arc::new(llm)).await;
    registry.register(Arc::new(painter)).await;
    registry.mark_ready().await;

    let pipeline = Pipeline::new()
        .then(
            first_model(&registry, ProviderCapability::TextToText).await?,
            options_from(serde_json::json!({"system": "enhance"})),
        )
        .then(
            first_model(&registry, ProviderCapability::TextToImage).await?,
            options_from(serde_json::json!({"width": 1024, "height": 1024})),
        );

    println!("estimated cost: ${:.4}", pipeline.estimated_cost());
    let image = pipeline.run("a dragon").await?;
    println!("{}", image);
    println!("{}", image.history().report().to_json()?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_dir.as_deref())?;

    let (manager, settings) = load_settings(cli.settings_dir.as_deref());

    match cli.command {
        Command::Providers { json } => {
            let registry = mediaforge::create_provider_registry(&settings).await;
            list_providers(&registry, json).await
        }
        Command::Best(args) => {
            let registry = mediaforge::create_provider_registry(&settings).await;
            best(&registry, args).await
        }
        Command::Health => {
            let registry = mediaforge::create_provider_registry(&settings).await;
            health(&registry).await
        }
        Command::Generate(args) => {
            let registry = mediaforge::create_provider_registry(&settings).await;
            generate(&registry, args).await
        }
        Command::Inspect { path } => inspect(&path).await,
        Command::Config => {
            println!("settings file: {}", manager.settings_path().display());
            println!("{:#?}", settings);
            Ok(())
        }
        Command::Demo => demo().await,
    }
}
