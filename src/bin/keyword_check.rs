use anyhow::{Result, bail};
use clap::Parser;
use log::{debug, info};
use std::io::{self, BufRead};
use std::path::PathBuf;

use chatwatch::{KeywordFilter, MatchMode, MonitorConfig};

#[derive(Parser)]
#[command(name = "keyword-check")]
#[command(about = "Run the keyword filter over sample text and show what matches")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "chatwatch.toml")]
    config: PathBuf,

    /// Keywords to use instead of the configured list (repeatable)
    #[arg(short, long = "keyword")]
    keywords: Vec<String>,

    /// Match mode: contain, exact, fuzzy (overrides config file)
    #[arg(short, long)]
    mode: Option<MatchMode>,

    /// Match case-sensitively (overrides config file)
    #[arg(long)]
    case_sensitive: bool,

    /// Fuzzy similarity threshold (overrides config file)
    #[arg(short, long)]
    threshold: Option<f64>,

    /// Print per-keyword similarity scores
    #[arg(short, long)]
    scores: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Text to check; reads lines from stdin when omitted
    text: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Warn)
            .init();
    }

    let config = MonitorConfig::load_or_default(&args.config)?;
    let mut settings = config.keywords;
    if let Some(mode) = args.mode {
        settings.match_mode = mode;
    }
    if args.case_sensitive {
        settings.case_sensitive = true;
    }
    if let Some(threshold) = args.threshold {
        if !(0.0..=1.0).contains(&threshold) {
            bail!("threshold must be within [0, 1], got {}", threshold);
        }
        settings.fuzzy_threshold = threshold;
    }

    let keywords = if args.keywords.is_empty() {
        settings.list.clone()
    } else {
        args.keywords.clone()
    };
    let filter = KeywordFilter::from_settings(keywords, &settings);
    if filter.keywords().is_empty() {
        bail!("no keywords: pass --keyword or set [keywords] list in {:?}", args.config);
    }
    info!(
        "Checking against {} keywords in {} mode",
        filter.keywords().len(),
        filter.mode()
    );

    let texts: Vec<String> = if args.text.is_empty() {
        io::stdin().lock().lines().collect::<io::Result<_>>()?
    } else {
        args.text.clone()
    };

    let mut matched_lines = 0;
    for text in texts.iter().filter(|t| !t.trim().is_empty()) {
        let matches = filter.matches(text);
        if matches.is_empty() {
            println!("  -  {}", text);
        } else {
            matched_lines += 1;
            println!("  ✓  {}  =>  {}", text, matches.join(", "));
        }
        if args.scores {
            for keyword in filter.keywords() {
                println!("       {:<16} {:.3}", keyword, filter.score(text, keyword));
            }
        }
    }

    debug!("{} of {} lines matched", matched_lines, texts.len());
    println!("\n{} matched", matched_lines);
    Ok(())
}
