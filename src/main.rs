use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

use carddav::config::{self, Config};
use carddav::{Addressing, CardDavClient, Failure, Operation, Payload, TimeRange};

#[derive(Parser, Debug)]
#[command(name = "carddav", version, about = "Talk to a CardDAV address book")]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Collection URL, overriding the configured one
    #[arg(long, global = true)]
    url: Option<String>,

    /// Increase log detail (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a new card
    Add(CardArgs),
    /// Remove the server copy of a card
    Delete(AddressedCardArgs),
    /// Replace the server copy of a card
    Modify(AddressedCardArgs),
    /// Print every card in the collection
    GetAll(GetAllArgs),
    /// Print cards, optionally scoped to a time range
    Get(GetArgs),
    /// Print the collection's display name
    DisplayName,
    /// Check whether the URL is a CardDAV collection
    Enabled,
    /// List the methods the server allows
    Options,
}

#[derive(Args, Debug)]
struct CardArgs {
    /// Card file, or `-` for stdin
    #[arg(value_name = "CARD")]
    card: String,
}

#[derive(Args, Debug)]
struct AddressedCardArgs {
    #[command(flatten)]
    card: CardArgs,

    /// Locate the card by its URI property instead of its UID
    #[arg(long)]
    by_uri: bool,
}

#[derive(Args, Debug)]
struct GetAllArgs {
    /// Annotate each card with its server URI
    #[arg(long)]
    by_uri: bool,
}

#[derive(Args, Debug)]
struct GetArgs {
    /// Range start (RFC 3339)
    #[arg(long, requires = "end")]
    start: Option<String>,

    /// Range end (RFC 3339)
    #[arg(long, requires = "start")]
    end: Option<String>,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = config::load(cli.config.as_deref())?;
    let url = resolve_url(cli.url.as_deref(), &config)?;
    let operation = build_operation(&cli.command)?;

    let client = CardDavClient::new(config.client.clone())
        .context("failed to set up HTTP client")?
        .with_credentials(config.username.clone(), config.password.clone());

    match client.execute(&url, &operation) {
        Ok(payload) => Ok(report(payload)),
        Err(failure) => {
            print_failure(&failure);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn resolve_url(flag: Option<&str>, config: &Config) -> Result<String> {
    match flag.or(config.url.as_deref()) {
        Some(url) if !url.trim().is_empty() => Ok(url.trim().to_string()),
        _ => bail!("no collection URL given; pass --url or set `url` in the configuration"),
    }
}

fn build_operation(command: &Command) -> Result<Operation> {
    let addressing = |by_uri: bool| {
        if by_uri {
            Addressing::ByUri
        } else {
            Addressing::ByUid
        }
    };

    Ok(match command {
        Command::Add(args) => Operation::Add {
            card: read_card(&args.card)?,
        },
        Command::Delete(args) => Operation::Delete {
            card: read_card(&args.card.card)?,
            addressing: addressing(args.by_uri),
        },
        Command::Modify(args) => Operation::Modify {
            card: read_card(&args.card.card)?,
            addressing: addressing(args.by_uri),
        },
        Command::GetAll(args) => Operation::GetAll {
            addressing: addressing(args.by_uri),
        },
        Command::Get(args) => Operation::Get {
            range: parse_range(args.start.as_deref(), args.end.as_deref())?,
        },
        Command::DisplayName => Operation::GetDisplayName,
        Command::Enabled => Operation::EnabledProbe,
        Command::Options => Operation::ListOptions,
    })
}

fn read_card(source: &str) -> Result<String> {
    if source == "-" {
        let mut card = String::new();
        io::stdin()
            .read_to_string(&mut card)
            .context("failed to read card from stdin")?;
        return Ok(card);
    }
    let path = Path::new(source);
    fs::read_to_string(path).with_context(|| format!("failed to read card from {}", path.display()))
}

fn parse_range(start: Option<&str>, end: Option<&str>) -> Result<Option<TimeRange>> {
    let (Some(start), Some(end)) = (start, end) else {
        return Ok(None);
    };
    let parse = |label: &str, value: &str| {
        OffsetDateTime::parse(value, &Rfc3339).with_context(|| format!("invalid --{} `{}`", label, value))
    };
    let range = TimeRange {
        start: parse("start", start)?,
        end: parse("end", end)?,
    };
    if range.end < range.start {
        bail!("--end is before --start");
    }
    Ok(Some(range))
}

fn report(payload: Payload) -> ExitCode {
    match payload {
        Payload::Done => println!("OK"),
        Payload::Cards(cards) => print!("{}", cards),
        Payload::DisplayName(name) => println!("{}", name),
        Payload::Enabled(enabled) => {
            println!("{}", enabled);
            if !enabled {
                return ExitCode::FAILURE;
            }
        }
        Payload::Options(methods) => {
            for method in methods {
                println!("{}", method);
            }
        }
    }
    ExitCode::SUCCESS
}

fn print_failure(failure: &Failure) {
    eprintln!("{}", failure);
}
