//! Command-line interface for nova-snapshot.
//!
//! One invocation selects a cadence and either runs a backup into the next
//! dataset of that cadence (or reloads the last one), removes a dataset, or
//! prints the last committed dataset index.

use crate::config::Config;
use crate::dataset::{Cadence, DatasetScheduler, Repository};
use crate::logging;
use crate::sync::{RunMode, RunReport, SyncOrchestrator};
use anyhow::Context;
use clap::{ArgGroup, Parser};
use std::path::PathBuf;
use tracing::{error, info};

/// nova-snapshot - generational hardlink snapshots
#[derive(Parser, Debug)]
#[command(name = "nova-snapshot")]
#[command(about = "Generational, hardlink-deduplicated filesystem snapshots")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(group(ArgGroup::new("cadence").args(["hour", "day", "week", "month"])))]
pub struct Cli {
    /// Configuration file
    #[arg(short = 'c', long = "cfg")]
    pub config: Option<PathBuf>,

    /// Hourly dataset
    #[arg(short = 'H', long)]
    pub hour: bool,

    /// Daily dataset
    #[arg(short = 'D', long)]
    pub day: bool,

    /// Weekly dataset
    #[arg(short = 'W', long)]
    pub week: bool,

    /// Monthly dataset
    #[arg(short = 'M', long)]
    pub month: bool,

    /// Rewrite the last committed dataset instead of advancing
    #[arg(short = 'r', long)]
    pub reload_dataset: bool,

    /// Remove dataset N of the selected cadence
    #[arg(long, value_name = "N", conflicts_with_all = ["reload_dataset", "get_last_dataset"])]
    pub del_dataset: Option<u32>,

    /// Print the last committed dataset of the selected cadence
    #[arg(long, conflicts_with = "reload_dataset")]
    pub get_last_dataset: bool,

    /// Print the run report as JSON
    #[arg(long)]
    pub report_json: bool,
}

impl Cli {
    /// Cadence selected by the mutually exclusive flags
    pub fn cadence(&self) -> Option<Cadence> {
        [
            (self.hour, Cadence::Hour),
            (self.day, Cadence::Day),
            (self.week, Cadence::Week),
            (self.month, Cadence::Month),
        ]
        .into_iter()
        .find_map(|(selected, cadence)| selected.then_some(cadence))
    }

    pub fn mode(&self) -> RunMode {
        if self.reload_dataset {
            RunMode::Reload
        } else {
            RunMode::Advance
        }
    }
}

/// Why an invocation failed; each kind has its own exit code
#[derive(Debug)]
pub enum Failure {
    /// Missing, unreadable or invalid configuration
    Config(anyhow::Error),
    /// No cadence flag given
    NoCadence,
    /// Repository directories or status catalog could not be prepared
    Bootstrap(anyhow::Error),
    /// The run failed or was not committed
    Run(anyhow::Error),
}

impl Failure {
    pub fn exit_code(&self) -> u8 {
        match self {
            Failure::Config(_) => 1,
            Failure::NoCadence => 2,
            Failure::Bootstrap(_) => 3,
            Failure::Run(_) => 4,
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Failure::Config(e) => write!(f, "configuration error: {:#}", e),
            Failure::NoCadence => write!(f, "no cadence selected (use -H, -D, -W or -M)"),
            Failure::Bootstrap(e) => write!(f, "repository bootstrap failed: {:#}", e),
            Failure::Run(e) => write!(f, "{:#}", e),
        }
    }
}

/// Load and validate the configuration named on the command line
pub fn load_config(cli: &Cli) -> Result<Config, Failure> {
    let path = cli
        .config
        .as_ref()
        .ok_or_else(|| Failure::Config(anyhow::anyhow!("no configuration file given (use -c)")))?;
    Config::load(path)
        .with_context(|| format!("Failed to load {}", path.display()))
        .map_err(Failure::Config)
}

/// Prepare the repository and open its status catalog
pub fn open_repository(config: &Config) -> Result<DatasetScheduler, Failure> {
    let repository = Repository::new(&config.general.repository);
    repository
        .bootstrap()
        .with_context(|| format!("Failed to create repository {}", repository.root().display()))
        .map_err(Failure::Bootstrap)?;
    DatasetScheduler::open(repository, config.dataset, config.database.backend)
        .context("Failed to open the status catalog")
        .map_err(Failure::Bootstrap)
}

/// Execute one invocation
pub async fn run(cli: Cli) -> Result<(), Failure> {
    let config = load_config(&cli)?;
    let cadence = cli.cadence().ok_or(Failure::NoCadence)?;

    let logging = match &config.general.log_file {
        Some(path) => logging::init_file_logging(path, &config.general.log_level),
        None => logging::init_logging(&config.general.log_level),
    };
    logging
        .context("Failed to initialise logging")
        .map_err(Failure::Config)?;

    let mut scheduler = open_repository(&config)?;

    if cli.get_last_dataset {
        let last = scheduler
            .last_dataset(cadence)
            .context("Failed to read the status catalog")
            .map_err(Failure::Run)?;
        println!("{}", last);
        return Ok(());
    }

    if let Some(index) = cli.del_dataset {
        let removed = scheduler
            .remove_dataset(cadence, index)
            .with_context(|| format!("Failed to remove dataset {} of {}", index, cadence))
            .map_err(Failure::Run)?;
        if !removed {
            info!("Dataset {} of {} does not exist", index, cadence);
        }
        return Ok(());
    }

    let orchestrator = SyncOrchestrator::new(config);
    let report = orchestrator
        .run(&mut scheduler, cadence, cli.mode())
        .await
        .context("Backup run failed")
        .map_err(Failure::Run)?;

    if cli.report_json {
        let json = serde_json::to_string_pretty(&report)
            .context("Failed to serialise the run report")
            .map_err(Failure::Run)?;
        println!("{}", json);
    } else {
        print_report(&report);
    }

    if !report.committed {
        error!("Dataset {} of {} was not committed", report.dataset, cadence);
        return Err(Failure::Run(anyhow::anyhow!(
            "dataset {} of {} not committed",
            report.dataset,
            cadence
        )));
    }

    info!("Finished backup: cadence {} dataset {}", cadence, report.dataset);
    Ok(())
}

fn print_report(report: &RunReport) {
    println!(
        "Dataset {} of {}: {}",
        report.dataset,
        report.cadence,
        if report.committed { "committed" } else { "NOT committed" }
    );
    for section in &report.sections {
        let stats = &section.stats;
        match &section.error {
            Some(e) => println!("  {}: failed: {}", section.section, e),
            None => println!(
                "  {}: {} copied ({} bytes), {} linked, {} dirs, {} symlinks, {} item errors",
                section.section,
                stats.copied,
                stats.bytes_copied,
                stats.linked,
                stats.directories,
                stats.symlinks,
                stats.item_errors()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cadence_flags() {
        let cli = Cli::try_parse_from(["nova-snapshot", "-c", "/etc/nova.toml", "-W"]).unwrap();
        assert_eq!(cli.cadence(), Some(Cadence::Week));
        assert_eq!(cli.mode(), RunMode::Advance);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/nova.toml")));
    }

    #[test]
    fn test_cadence_flags_are_exclusive() {
        assert!(Cli::try_parse_from(["nova-snapshot", "-H", "-D"]).is_err());
    }

    #[test]
    fn test_cadence_is_optional_at_parse_time() {
        let cli = Cli::try_parse_from(["nova-snapshot", "-c", "x.toml", "-r"]).unwrap();
        assert_eq!(cli.cadence(), None);
        assert_eq!(cli.mode(), RunMode::Reload);
    }

    #[test]
    fn test_del_dataset() {
        let cli = Cli::try_parse_from(["nova-snapshot", "-M", "--del-dataset", "3"]).unwrap();
        assert_eq!(cli.del_dataset, Some(3));
        assert!(Cli::try_parse_from(["nova-snapshot", "-M", "--del-dataset", "3", "-r"]).is_err());
    }

    #[test]
    fn test_missing_config_is_exit_1() {
        let cli = Cli::try_parse_from(["nova-snapshot", "-D"]).unwrap();
        let failure = load_config(&cli).unwrap_err();
        assert_eq!(failure.exit_code(), 1);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Failure::NoCadence.exit_code(), 2);
        assert_eq!(Failure::Bootstrap(anyhow::anyhow!("x")).exit_code(), 3);
        assert_eq!(Failure::Run(anyhow::anyhow!("x")).exit_code(), 4);
    }

    #[test]
    fn test_unwritable_repository_is_exit_3() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let blocker = temp_dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        let config = Config::parse(&format!(
            "[general]\nrepository = \"{}\"\n",
            blocker.join("repo").display()
        ))
        .unwrap();
        let failure = open_repository(&config).err().unwrap();
        assert_eq!(failure.exit_code(), 3);
    }
}
