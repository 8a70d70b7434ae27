//! CLI for streamsense: consume, score and persist sensor readings.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "streamsense")]
#[command(about = "streamsense: at-least-once anomaly scoring for sensor streams")]
#[command(version = streamsense_core::VERSION)]
struct Cli {
    /// JSON pipeline config. Flags override values from the file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume a JSONL file of readings through the full pipeline and write
    /// scored rows to a partitioned warehouse directory
    Run {
        /// JSONL readings, one per line ("-" for stdin)
        #[arg(long)]
        input: PathBuf,

        /// Directory holding temperature_model.json, vibration_model.json, VERSION
        #[arg(long, default_value = "models")]
        models: PathBuf,

        /// Warehouse root
        #[arg(long, default_value = "warehouse")]
        output: PathBuf,

        /// Write dead-lettered messages as JSONL
        #[arg(long)]
        dead_letters: Option<PathBuf>,

        #[command(flatten)]
        tuning: commands::Tuning,
    },

    /// Start the HTTP detection server, optionally consuming a JSONL file in
    /// the background
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value = "8080")]
        port: u16,

        #[arg(long, default_value = "models")]
        models: PathBuf,

        /// JSONL readings to consume while serving
        #[arg(long)]
        input: Option<PathBuf>,

        /// Warehouse root for the background consumer
        #[arg(long, default_value = "warehouse")]
        output: PathBuf,

        #[command(flatten)]
        tuning: commands::Tuning,
    },

    /// Generate synthetic device readings with injected anomalies
    Simulate {
        /// Number of devices
        #[arg(long, default_value = "10")]
        devices: usize,

        /// Readings per device
        #[arg(long, default_value = "100")]
        readings: usize,

        /// Seconds between readings of one device
        #[arg(long, default_value = "60")]
        interval_secs: i64,

        /// Probability that a reading is anomalous (0.0-1.0)
        #[arg(long, default_value = "0.05")]
        anomaly_rate: f64,

        /// Timestamp of the first reading (RFC 3339). By default the last
        /// reading lands at the current time
        #[arg(long)]
        start: Option<String>,

        /// RNG seed for reproducible output
        #[arg(long)]
        seed: Option<u64>,

        /// Output file (stdout if omitted)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Print metadata of the model artifacts in a directory
    InspectModel {
        #[arg(long, default_value = "models")]
        models: PathBuf,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    let result = match cli.command {
        Commands::Run {
            input,
            models,
            output,
            dead_letters,
            tuning,
        } => commands::load_config(config_path, &tuning).and_then(|config| {
            commands::run::run(commands::run::RunCommandConfig {
                input: &input,
                models: &models,
                output: &output,
                dead_letters: dead_letters.as_deref(),
                config,
            })
        }),
        Commands::Serve {
            host,
            port,
            models,
            input,
            output,
            tuning,
        } => commands::load_config(config_path, &tuning).and_then(|config| {
            commands::serve::run(commands::serve::ServeCommandConfig {
                host: &host,
                port,
                models: &models,
                input: input.as_deref(),
                output: &output,
                config,
            })
        }),
        Commands::Simulate {
            devices,
            readings,
            interval_secs,
            anomaly_rate,
            start,
            seed,
            output,
        } => commands::simulate::run(commands::simulate::SimulateCommandConfig {
            devices,
            readings,
            interval_secs,
            anomaly_rate,
            start: start.as_deref(),
            seed,
            output: output.as_deref(),
        }),
        Commands::InspectModel { models, json } => commands::inspect_model::run(&models, json),
    };

    if let Err(err) = result {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
