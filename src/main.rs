//! cidr-collapse
//!
//! Reads dotted-quad addresses, `a - b` ranges and `a/n` blocks from files or
//! standard input and prints the minimal set of CIDR blocks covering exactly
//! those addresses, one per line, in ascending order.
//!
//! Usage:
//!   cidr-collapse [OPTIONS] [FILE]...

use std::borrow::Cow;
use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser as _;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cidr_collapse::{CidrTrie, Parser};

const PROG: &str = env!("CARGO_PKG_NAME");

/// Collapse IPv4 addresses, ranges and CIDR blocks into a minimal CIDR list
#[derive(clap::Parser)]
#[command(name = "cidr-collapse")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Input files; standard input when none are given or for `-`
    files: Vec<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Exit with a failure status if any input item was malformed
    #[arg(long)]
    strict: bool,

    /// Log block, address and node counts once the input is consumed
    #[arg(long)]
    stats: bool,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let mut trie = CidrTrie::new();
    let mut malformed = 0usize;

    if cli.files.is_empty() {
        malformed += load(&mut trie, "<stdin>", &read_stdin()?);
    }
    for path in &cli.files {
        if path.as_os_str() == "-" {
            malformed += load(&mut trie, "<stdin>", &read_stdin()?);
            continue;
        }
        let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        malformed += load(&mut trie, &path.display().to_string(), &bytes);
    }

    if cli.stats {
        tracing::info!(
            blocks = trie.block_count(),
            addresses = trie.address_count(),
            nodes = trie.node_count(),
            memory = trie.memory_usage(),
            malformed,
            "input consumed"
        );
    }

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for block in trie.blocks() {
        writeln!(out, "{block}").context("writing output")?;
    }
    out.flush().context("writing output")?;

    if cli.strict && malformed > 0 {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn read_stdin() -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    io::stdin()
        .read_to_end(&mut bytes)
        .context("reading standard input")?;
    Ok(bytes)
}

/// Input as text. Bytes that are not UTF-8 become U+FFFD, which the parser
/// reports as an invalid character in the item holding it.
fn decode<'a>(source: &str, bytes: &'a [u8]) -> Cow<'a, str> {
    let text = String::from_utf8_lossy(bytes);
    if let Cow::Owned(_) = text {
        tracing::debug!(source, "input is not valid UTF-8");
    }
    text
}

/// Insert every well-formed item of `bytes`, reporting the rest on stderr.
/// Returns the number of malformed items.
fn load(trie: &mut CidrTrie, source: &str, bytes: &[u8]) -> usize {
    let text = decode(source, bytes);
    let mut inserted = 0usize;
    let mut malformed = 0usize;
    for item in Parser::new(&text) {
        match item {
            Ok(entry) => {
                trie.insert_entry(&entry);
                inserted += 1;
            }
            Err(err) => {
                eprintln!("{PROG}: {source}: {err}");
                malformed += 1;
            }
        }
    }
    tracing::debug!(source, inserted, malformed, "loaded input");
    malformed
}
