use std::path::{Path, PathBuf};
use structopt::StructOpt;

use smbguard::config::Config;
use smbguard::input::normalizer::parse_timestamp;
use smbguard::input::{source_from_config, EventFilter, EventNormalizer};
use smbguard::models::{IpRecord, RecordFilter, ScanMode, SortBy, SortOrder};
use smbguard::service::GuardService;

/// smbguard command line interface
#[derive(StructOpt, Debug)]
#[structopt(name = "smbguard", about = "Failed-login tracker and brute-force ban engine")]
struct Cli {
    /// Path to configuration file
    #[structopt(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt, Debug)]
enum Command {
    /// Generate a default configuration file
    Config {
        /// Output path for the configuration file
        #[structopt(short, long, default_value = "config.toml")]
        output: PathBuf,
    },
    /// Run one scan now
    Scan,
    /// List tracked addresses
    List {
        /// Only addresses with at least this many attempts
        #[structopt(long, default_value = "0")]
        min_attempts: u32,
        /// Only addresses last seen at or after this time
        #[structopt(long)]
        since: Option<String>,
        /// Only addresses last seen at or before this time
        #[structopt(long)]
        until: Option<String>,
        /// last_attempt, attempts, ip or banned_time
        #[structopt(long, default_value = "last_attempt")]
        sort_by: String,
        /// asc or desc
        #[structopt(long, default_value = "desc")]
        order: String,
        /// Print JSON instead of a table
        #[structopt(long)]
        json: bool,
    },
    /// Ban an address manually
    Ban {
        ip: String,
        #[structopt(long)]
        attempts: Option<u32>,
        #[structopt(long)]
        workstation: Option<String>,
        #[structopt(long)]
        user: Option<String>,
    },
    /// Lift a ban
    Unban { ip: String },
    /// Show the recorded failed logins of an address
    History { ip: String },
    /// Show ban statistics
    Stats {
        /// Window in days (1-30)
        #[structopt(short, long, default_value = "7")]
        days: u32,
    },
    /// Show normalized events from the configured source
    Parse {
        /// Number of events to show
        #[structopt(short, long, default_value = "10")]
        lines: usize,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Warn)
        .init();

    let cli = Cli::from_args();

    if let Command::Config { output } = &cli.command {
        Config::default().to_file(output)?;
        println!("Default configuration written to: {:?}", output);
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    if let Command::Parse { lines } = &cli.command {
        return parse_events(&config, *lines);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let service = GuardService::from_config(&config, runtime.handle().clone(), None)?;

    match cli.command {
        Command::Scan => match service.run_scan_now(ScanMode::Manual)? {
            Some(processed) => println!("Scan complete: {} event(s) processed", processed),
            None => println!("A scan is already in progress"),
        },
        Command::List {
            min_attempts,
            since,
            until,
            sort_by,
            order,
            json,
        } => {
            let filter = RecordFilter {
                min_attempts,
                start: since.as_deref().map(parse_bound).transpose()?,
                end: until.as_deref().map(parse_bound).transpose()?,
                sort_by: SortBy::from_str(&sort_by),
                sort_order: SortOrder::from_str(&order),
            };
            let records = service.list_records(&filter)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_records(&records);
            }
        }
        Command::Ban {
            ip,
            attempts,
            workstation,
            user,
        } => {
            let record = service.add_manual_ban(&ip, attempts, workstation.as_deref(), user.as_deref())?;
            println!("Banned {} ({} attempts)", record.address, record.attempts);
        }
        Command::Unban { ip } => {
            service.remove_ban(&ip)?;
            println!("Unbanned {}", ip);
        }
        Command::History { ip } => {
            let events = service.events_for(&ip)?;
            println!("{} event(s) recorded for {}", events.len(), ip);
            for event in &events {
                println!(
                    "  {}  User: {}, Workstation: {}",
                    event.occurred_at.format("%Y-%m-%d %H:%M:%S"),
                    event.user,
                    event.workstation
                );
            }
        }
        Command::Stats { days } => {
            let stats = service.stats(days)?;
            println!("Banned addresses:        {}", stats.total_banned);
            println!("Banned in last {:>2} days: {}", stats.window_days, stats.recent_banned);
            for point in &stats.timeline {
                println!("  {}  {}", point.date, point.attempts);
            }
        }
        Command::Config { .. } | Command::Parse { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<Config, Box<dyn std::error::Error>> {
    if path.exists() {
        Ok(Config::from_file(path)?)
    } else {
        eprintln!("Configuration file not found: {:?}; using defaults", path);
        eprintln!("Run 'smbguard config' to generate one");
        Ok(Config::default())
    }
}

fn parse_bound(raw: &str) -> Result<chrono::DateTime<chrono::Utc>, Box<dyn std::error::Error>> {
    parse_timestamp(raw).ok_or_else(|| format!("Invalid time '{}'", raw).into())
}

fn print_records(records: &[IpRecord]) {
    println!(
        "{:<40} {:>8}  {:<20} {:<6} {:<20} {}",
        "ADDRESS", "ATTEMPTS", "LAST ATTEMPT", "BANNED", "BANNED AT", "USER"
    );
    for record in records {
        let banned = match (record.banned, record.manual) {
            (true, true) => "manual",
            (true, false) => "yes",
            (false, _) => "no",
        };
        println!(
            "{:<40} {:>8}  {:<20} {:<6} {:<20} {}",
            record.address,
            record.attempts,
            record.last_attempt.format("%Y-%m-%d %H:%M:%S"),
            banned,
            record
                .banned_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
            record.last_user
        );
    }
}

fn parse_events(config: &Config, lines: usize) -> Result<(), Box<dyn std::error::Error>> {
    let source = source_from_config(&config.input)?;
    let filter = EventFilter {
        log_name: config.scan.log_name.clone(),
        event_id: config.scan.event_id,
    };
    let normalizer = EventNormalizer::new();

    let raw = source.fetch_raw_records(&filter)?;
    let events: Vec<_> = raw.iter().filter_map(|r| normalizer.normalize(r)).collect();
    let display_count = std::cmp::min(lines, events.len());

    println!(
        "Parsed {} event(s) from {} record(s) (showing {}):\n",
        events.len(),
        raw.len(),
        display_count
    );
    for event in events.iter().take(display_count) {
        println!(
            "  {}  IP: {}, User: {}, Workstation: {}",
            event.occurred_at.format("%Y-%m-%d %H:%M:%S"),
            event.address,
            event.user,
            event.workstation
        );
    }
    Ok(())
}
