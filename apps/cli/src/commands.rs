//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use partgen_core::{GenerationOutcome, Pipeline, PipelineEvent, PipelineObserver, RunSummary};
use partgen_ollama::{ChatBackend, OllamaClient};
use partgen_shared::{AppConfig, init_config, load_config};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// PartGen: SEO titles and descriptions for product catalogs.
#[derive(Parser)]
#[command(
    name = "partgen",
    version,
    about = "Generate SEO product titles and descriptions from part numbers with a local LLM.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Flags that adjust the loaded configuration for one invocation.
#[derive(clap::Args, Debug, Default)]
pub(crate) struct Overrides {
    /// Specifications table to index (overrides `pipeline.specs_path`).
    #[arg(long)]
    pub specs: Option<PathBuf>,

    /// Run without a specifications table.
    #[arg(long, conflicts_with = "specs")]
    pub no_specs: bool,

    /// Model to generate with (overrides `ollama.model`).
    #[arg(long)]
    pub model: Option<String>,
}

impl Overrides {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(specs) = &self.specs {
            config.pipeline.specs_path = specs.display().to_string();
        }
        if self.no_specs {
            config.pipeline.specs_path.clear();
        }
        if let Some(model) = &self.model {
            config.ollama.model = model.clone();
        }
    }
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Generate titles and descriptions for every row of a table.
    Process {
        /// Input CSV file.
        input: PathBuf,

        /// Output CSV file (defaults to <output_dir>/processed_<timestamp>.csv).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Rows per batch.
        #[arg(long)]
        batch_size: Option<usize>,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Generate content for a single product.
    Test {
        /// Part number to generate for.
        part_number: String,

        /// Manufacturer of the part.
        manufacturer: String,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Check the Ollama connection and make sure the model is available.
    Setup {
        /// Model to check or pull (defaults to `ollama.model`).
        #[arg(long)]
        model: Option<String>,
    },

    /// Profile an input table and check that it can be processed.
    Inspect {
        /// Input CSV file.
        input: PathBuf,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "partgen=info",
        1 => "partgen=debug",
        _ => "partgen=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Process {
            input,
            output,
            batch_size,
            overrides,
        } => cmd_process(&input, output.as_deref(), batch_size, &overrides).await,
        Command::Test {
            part_number,
            manufacturer,
            overrides,
        } => cmd_test(&part_number, &manufacturer, &overrides).await,
        Command::Setup { model } => cmd_setup(model.as_deref()).await,
        Command::Inspect { input, overrides } => cmd_inspect(&input, &overrides).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

fn pipeline_with(overrides: &Overrides, batch_size: Option<usize>) -> Result<Pipeline> {
    let mut config = load_config()?;
    overrides.apply(&mut config);
    if let Some(batch_size) = batch_size {
        config.pipeline.batch_size = batch_size;
    }
    Ok(Pipeline::from_config(config)?)
}

// ---------------------------------------------------------------------------
// process
// ---------------------------------------------------------------------------

async fn cmd_process(
    input: &Path,
    output: Option<&Path>,
    batch_size: Option<usize>,
    overrides: &Overrides,
) -> Result<()> {
    if !input.is_file() {
        return Err(eyre!("input file '{}' does not exist", input.display()));
    }

    let pipeline = pipeline_with(overrides, batch_size)?;
    info!(
        input = %input.display(),
        model = %pipeline.config().ollama.model,
        "processing table"
    );

    let progress = Arc::new(CliProgress::new());
    let result = pipeline.process_csv(input, output, progress.clone()).await;
    progress.finish();

    print_summary(&result?);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let stats = &summary.stats;

    println!();
    println!("  Processing complete");
    println!("  Run:        {}", summary.run_id);
    println!("  Processed:  {}", stats.processed);
    println!("  Failed:     {}", stats.failed);
    println!("  Skipped:    {}", stats.skipped);
    println!("  Duration:   {:.1}s", stats.duration().as_secs_f64());
    if let Some(rate) = stats.items_per_second() {
        println!("  Rate:       {rate:.2} items/s");
    }
    println!("  Output:     {}", summary.output.display());
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress observer
// ---------------------------------------------------------------------------

/// Progress bar plus one-line notices for notable rows.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} rows {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
        bar.set_style(style);
        bar.enable_steady_tick(std::time::Duration::from_millis(120));
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl PipelineObserver for CliProgress {
    fn progress(&self, done: usize, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_position(done as u64);
    }

    fn event(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::ColumnsResolved {
                part_number,
                manufacturer,
                inferred,
            } => {
                let source = if *inferred { "inferred" } else { "default" };
                self.bar.println(format!(
                    "  Columns ({source}): part number = '{part_number}', manufacturer = '{}'",
                    manufacturer.as_deref().unwrap_or("-")
                ));
            }
            PipelineEvent::SpecIndexLoaded { entries } => {
                self.bar.println(format!("  Specifications indexed: {entries}"));
            }
            PipelineEvent::RunStarted { rows, batches } => {
                self.bar.set_message(format!("({batches} batches)"));
                self.bar.set_length(*rows as u64);
            }
            PipelineEvent::RowSkipped { .. } => {}
            PipelineEvent::RowFallback {
                row, part_number, ..
            } => {
                self.bar.println(format!("  Row {}: fallback content for {part_number}", row + 1));
            }
            PipelineEvent::RowFailed { row, message } => {
                self.bar.println(format!("  Row {}: failed: {message}", row + 1));
            }
            PipelineEvent::OutputAborted { message } => {
                self.bar.println(format!("  Output failed: {message}"));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// test
// ---------------------------------------------------------------------------

async fn cmd_test(part_number: &str, manufacturer: &str, overrides: &Overrides) -> Result<()> {
    let pipeline = pipeline_with(overrides, None)?;
    info!(part_number, manufacturer, "generating single item");

    let outcome = pipeline.test_single(part_number, manufacturer).await?;

    println!();
    if let GenerationOutcome::Fallback { reason, .. } = &outcome {
        println!("  Fallback content used: {reason}");
        println!();
    }
    let result = outcome.result();
    println!("  Title ({} chars):", result.title.chars().count());
    println!("  {}", result.title);
    println!();
    println!("  Description:");
    for line in result.description.lines() {
        println!("  {line}");
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// setup
// ---------------------------------------------------------------------------

async fn cmd_setup(model: Option<&str>) -> Result<()> {
    let mut config = load_config()?;
    if let Some(model) = model {
        config.ollama.model = model.to_string();
    }
    config.validate()?;
    let client = OllamaClient::new(&config.ollama)?;

    if !client.test_connection().await {
        return Err(eyre!(
            "cannot reach Ollama at {} with model '{}'; is `ollama serve` running?",
            config.ollama.base_url,
            config.ollama.model
        ));
    }
    println!("  Connected to {}", config.ollama.base_url);

    let models = client.list_models().await?;
    if models.is_empty() {
        println!("  No models installed");
    } else {
        println!("  Installed models:");
        for name in &models {
            println!("    - {name}");
        }
    }

    let wanted = &config.ollama.model;
    if models.iter().any(|m| m == wanted) {
        println!("  Model '{wanted}' is available");
        return Ok(());
    }

    println!("  Pulling '{wanted}', this can take a while...");
    if client.pull_model(wanted).await {
        println!("  Model '{wanted}' is ready");
        Ok(())
    } else {
        Err(eyre!("failed to pull model '{wanted}'"))
    }
}

// ---------------------------------------------------------------------------
// inspect
// ---------------------------------------------------------------------------

async fn cmd_inspect(input: &Path, overrides: &Overrides) -> Result<()> {
    if !input.is_file() {
        return Err(eyre!("input file '{}' does not exist", input.display()));
    }

    let pipeline = pipeline_with(overrides, None)?;
    let report = pipeline.inspect(input).await?;

    println!();
    println!("  File:     {}", report.input.display());
    println!("  Encoding: {}", report.encoding);
    println!();
    for line in report.profile.to_string().lines() {
        println!("  {line}");
    }
    println!();

    match &report.spec_check {
        Some(check) => {
            println!("  Spec lookup '{}': {} fields", check.key, check.fields);
            for (label, value) in &check.sample {
                println!("    {label}: {value}");
            }
        }
        None => println!("  Spec lookup: no specifications indexed"),
    }
    println!();

    let structure = report.structure?;
    println!(
        "  Ready: {} of {} rows have a part number in '{}'{}",
        structure.part_numbers,
        report.profile.rows,
        structure.mapping.part_number_column,
        if structure.inferred { " (inferred)" } else { "" }
    );
    if let Some(manufacturer) = &structure.mapping.manufacturer_column {
        println!("  Manufacturer column: '{manufacturer}'");
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
