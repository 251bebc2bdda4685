use anyhow::{bail, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand, ValueEnum};
use mps_adapters::{Credentials, SearchParams};
use mps_core::validators::validate_rut;
use mps_core::BidStatus;
use mps_sync::{RunOptions, RunSummary, ScrapeOptions, SyncConfig};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "mps-cli")]
#[command(about = "Scrapes Mercado Público agile bids into a local database")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    scrape: ScrapeArgs,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape, save and merge (the default).
    Scrape(ScrapeArgs),
    /// Create or upgrade the database schema.
    Migrate {
        #[arg(long, short = 'd')]
        database: Option<String>,
    },
    /// Merge the local cache without opening a browser.
    Load {
        #[arg(long, short = 'd')]
        database: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Category {
    Published,
    Closed,
    BoEmitted,
    Cancelled,
    Any,
}

impl Category {
    fn status(self) -> Option<BidStatus> {
        match self {
            Self::Published => Some(BidStatus::Published),
            Self::Closed => Some(BidStatus::Closed),
            Self::BoEmitted => Some(BidStatus::BuyingOrderEmitted),
            Self::Cancelled => Some(BidStatus::Cancelled),
            Self::Any => None,
        }
    }
}

#[derive(Debug, Clone, Args)]
struct ScrapeArgs {
    /// RUT used to log into Mercado Público.
    #[arg(long, short = 'l')]
    login: Option<String>,
    #[arg(long, short = 'p')]
    password: Option<String>,
    /// Database connection string; defaults to DATABASE_URL.
    #[arg(long, short = 'd')]
    database: Option<String>,
    /// First publication date to search (YYYY-MM-DD).
    #[arg(long, short = 'f', value_parser = parse_date)]
    from: Option<NaiveDate>,
    #[arg(long, short = 'u', value_parser = parse_date)]
    until: Option<NaiveDate>,
    /// Search the last N days instead of a date range.
    #[arg(long)]
    days_before: Option<u32>,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long, short = 'c', value_enum, default_value_t = Category::Any)]
    category: Category,
    #[arg(long, overrides_with = "no_scrape")]
    scrape: bool,
    #[arg(long, overrides_with = "scrape")]
    no_scrape: bool,
    #[arg(long, overrides_with = "no_save_files")]
    save_files: bool,
    #[arg(long, overrides_with = "save_files")]
    no_save_files: bool,
    /// Skip listings already in the database or the local cache.
    #[arg(long)]
    only_missing: bool,
    #[arg(long, overrides_with = "no_merge")]
    merge: bool,
    #[arg(long, overrides_with = "merge")]
    no_merge: bool,
}

fn parse_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| format!("{value:?} is not a YYYY-MM-DD date"))
}

impl ScrapeArgs {
    fn date_range(&self, today: NaiveDate) -> Result<(NaiveDate, NaiveDate)> {
        if let Some(days) = self.days_before {
            return Ok((today - chrono::Days::new(u64::from(days)), today));
        }
        match (self.from, self.until) {
            (Some(from), Some(until)) if from <= until => Ok((from, until)),
            (Some(_), Some(_)) => bail!("--from must not be after --until"),
            _ => bail!("--from and --until, or --days-before, are required when scraping"),
        }
    }

    fn credentials(&self) -> Result<Credentials> {
        let (Some(login), Some(password)) = (&self.login, &self.password) else {
            bail!("--login and --password are required when scraping");
        };
        let Ok(username) = validate_rut(login) else {
            bail!("--login must be a valid RUT");
        };
        Ok(Credentials {
            username,
            password: password.clone(),
        })
    }

    fn run_options(&self, today: NaiveDate) -> Result<RunOptions> {
        let scrape = if self.no_scrape {
            None
        } else {
            let (from, until) = self.date_range(today)?;
            Some(ScrapeOptions {
                credentials: self.credentials()?,
                search: SearchParams {
                    from,
                    until,
                    status: self.category.status(),
                },
                limit: self.limit,
            })
        };
        Ok(RunOptions {
            scrape,
            save_files: !self.no_save_files,
            only_missing: self.only_missing,
            merge: !self.no_merge,
        })
    }
}

fn config(database: Option<&str>) -> SyncConfig {
    let config = SyncConfig::from_env();
    match database {
        Some(url) => config.with_database_url(url),
        None => config,
    }
}

fn report(summary: &RunSummary) {
    println!(
        "run complete: run_id={} expected={} fetched={} merged={} already_stored={} skipped={} failed={}",
        summary.run_id,
        summary.expected,
        summary.fetched,
        summary.merged,
        summary.skipped_existing,
        summary.skipped_known,
        summary.failed
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command.unwrap_or(Commands::Scrape(cli.scrape)) {
        Commands::Scrape(args) => {
            let options = args.run_options(Local::now().date_naive())?;
            let config = config(args.database.as_deref());
            info!(database = %config.database_url, "starting run");
            let summary = mps_sync::run(&config, options).await?;
            report(&summary);
        }
        Commands::Migrate { database } => {
            let config = config(database.as_deref());
            mps_sync::migrate(&config.database_url).await?;
            println!("migrations applied to {}", config.database_url);
        }
        Commands::Load { database } => {
            let config = config(database.as_deref());
            let options = RunOptions {
                scrape: None,
                save_files: false,
                only_missing: false,
                merge: true,
            };
            let summary = mps_sync::run(&config, options).await?;
            report(&summary);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("mps-cli").chain(args.iter().copied())).unwrap()
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    #[test]
    fn bare_flags_mean_scrape() {
        let cli = parse(&["-l", "12.345.678-5", "-p", "secret", "--days-before", "7", "-c", "bo-emitted"]);
        assert!(cli.command.is_none());
        let options = cli.scrape.run_options(today()).unwrap();
        let scrape = options.scrape.unwrap();
        assert_eq!(scrape.search.from, NaiveDate::from_ymd_opt(2024, 3, 8).unwrap());
        assert_eq!(scrape.search.until, today());
        assert_eq!(scrape.search.status, Some(BidStatus::BuyingOrderEmitted));
        assert_eq!(scrape.credentials.username.compact(), "123456785");
        assert!(options.save_files && options.merge && !options.only_missing);
    }

    #[test]
    fn scraping_requires_valid_login_and_range() {
        let cli = parse(&["-l", "12.345.678-9", "-p", "x", "-f", "2024-03-01", "-u", "2024-03-02"]);
        assert!(cli.scrape.run_options(today()).is_err());

        let cli = parse(&["-l", "12.345.678-5", "-p", "x", "-f", "2024-03-01"]);
        assert!(cli.scrape.run_options(today()).is_err());
    }

    #[test]
    fn negated_flags_turn_steps_off() {
        let cli = parse(&["--no-scrape", "--no-merge", "--no-save-files"]);
        let options = cli.scrape.run_options(today()).unwrap();
        assert!(options.scrape.is_none());
        assert!(!options.merge && !options.save_files);
    }

    #[test]
    fn subcommands_parse() {
        assert!(matches!(parse(&["migrate", "-d", "sqlite::memory:"]).command, Some(Commands::Migrate { .. })));
        assert!(matches!(parse(&["load"]).command, Some(Commands::Load { database: None })));
        assert!(parse_date("15-03-2024").is_err());
    }
}
