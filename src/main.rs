use anyhow::{bail, Result};
use clap::{value_parser, Arg, ArgAction, Command};
use log::LevelFilter;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process;

use unsub_pilot::cache::VisitedCache;
use unsub_pilot::config::{CliOverrides, Config, Settings};
use unsub_pilot::extract::LinkExtractor;
use unsub_pilot::issues::IssueLog;
use unsub_pilot::lexicon::Lexicon;
use unsub_pilot::mail::{GmailClient, MailProvider};
use unsub_pilot::prompt::{Confirmer, ForceConfirmer, StdinConfirmer};
use unsub_pilot::quota::QuotaLedger;
use unsub_pilot::report;
use unsub_pilot::scan::{
    DomainScorer, HybridAnalysisScorer, LinkScanner, ScoredLink, VirusTotalScorer,
    HYBRID_ANALYSIS_LIMITS, VIRUS_TOTAL_LIMITS,
};
use unsub_pilot::visit::{LinkVisitor, VisitOptions, VisitOutcome};

#[tokio::main]
async fn main() {
    let matches = Command::new("unsub-pilot")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Scores and drives email unsubscribe links from a Gmail label")
        .arg(
            Arg::new("label")
                .short('l')
                .long("label")
                .value_name("LABEL")
                .help("Gmail label to scan for unsubscribe links"),
        )
        .arg(
            Arg::new("max")
                .short('m')
                .long("max")
                .value_name("N")
                .value_parser(value_parser!(usize))
                .help("Maximum number of messages to scan"),
        )
        .arg(
            Arg::new("no-limit")
                .long("no-limit")
                .action(ArgAction::SetTrue)
                .help("Scan every message in the label"),
        )
        .arg(
            Arg::new("threshold")
                .short('t')
                .long("threshold")
                .value_name("SCORE")
                .value_parser(value_parser!(f64))
                .help("Maximum risk score (0-100) a link may have and still be visited"),
        )
        .arg(
            Arg::new("vt-key")
                .long("vt-key")
                .value_name("KEY")
                .help("VirusTotal API key"),
        )
        .arg(
            Arg::new("ha-key")
                .long("ha-key")
                .value_name("KEY")
                .help("Hybrid Analysis API key (used when no VirusTotal key is set)"),
        )
        .arg(
            Arg::new("token")
                .long("token")
                .value_name("TOKEN")
                .help("Gmail OAuth bearer token"),
        )
        .arg(
            Arg::new("settings")
                .short('s')
                .long("settings")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("YAML settings file; CLI flags override its values"),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .value_name("DIR")
                .value_parser(value_parser!(PathBuf))
                .help("Directory for the visited cache, quota files, report, and logs"),
        )
        .arg(
            Arg::new("success-words")
                .long("success-words")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Word list marking a body as a completed unsubscribe"),
        )
        .arg(
            Arg::new("intent-words")
                .long("intent-words")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Word list marking a button label as an unsubscribe action"),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .value_name("REPORT")
                .value_parser(value_parser!(PathBuf))
                .help("Replay a previously written scored-link report instead of scanning mail"),
        )
        .arg(
            Arg::new("yes")
                .short('y')
                .long("yes")
                .action(ArgAction::SetTrue)
                .help("Answer yes to every confirmation prompt"),
        )
        .arg(
            Arg::new("mailto")
                .long("mailto")
                .action(ArgAction::SetTrue)
                .help("Send an unsubscribe email when a landing page offers a mailto link"),
        )
        .arg(
            Arg::new("ignore-quota")
                .long("ignore-quota")
                .action(ArgAction::SetTrue)
                .help("Disable reputation-service quota enforcement"),
        )
        .arg(
            Arg::new("usage")
                .long("usage")
                .action(ArgAction::SetTrue)
                .help("Show reputation-service quota usage and exit"),
        )
        .arg(
            Arg::new("count")
                .long("count")
                .action(ArgAction::SetTrue)
                .help("Count messages in the label and exit"),
        )
        .arg(
            Arg::new("list")
                .long("list")
                .action(ArgAction::SetTrue)
                .help("List message subjects in the label and exit"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable debug logging"),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    let settings = match matches.get_one::<PathBuf>("settings") {
        Some(path) => match Settings::load(path) {
            Ok(settings) => settings,
            Err(e) => {
                log::error!("{e:#}");
                process::exit(1);
            }
        },
        None => Settings::default(),
    };

    let cli = CliOverrides {
        label: matches.get_one::<String>("label").cloned(),
        max_messages: matches.get_one::<usize>("max").copied(),
        no_limit: matches.get_flag("no-limit"),
        threshold: matches.get_one::<f64>("threshold").copied(),
        virus_total_api_key: matches.get_one::<String>("vt-key").cloned(),
        hybrid_analysis_api_key: matches.get_one::<String>("ha-key").cloned(),
        gmail_token: matches.get_one::<String>("token").cloned(),
        data_dir: matches.get_one::<PathBuf>("data-dir").cloned(),
        success_words_path: matches.get_one::<PathBuf>("success-words").cloned(),
        intent_words_path: matches.get_one::<PathBuf>("intent-words").cloned(),
        ignore_quota: matches.get_flag("ignore-quota"),
        force_yes: matches.get_flag("yes"),
        enable_mailto: matches.get_flag("mailto"),
        dry_run_report: matches.get_one::<PathBuf>("dry-run").cloned(),
    };
    let config = Config::resolve(cli, settings);

    let mode = Mode {
        usage: matches.get_flag("usage"),
        count: matches.get_flag("count"),
        list: matches.get_flag("list"),
    };

    if let Err(e) = run(&config, mode).await {
        log::error!("{e:#}");
        process::exit(1);
    }
}

struct Mode {
    usage: bool,
    count: bool,
    list: bool,
}

async fn run(config: &Config, mode: Mode) -> Result<()> {
    if mode.usage {
        return show_usage(config);
    }

    let confirmer: Box<dyn Confirmer> = if config.force_yes {
        Box::new(ForceConfirmer)
    } else {
        Box::new(StdinConfirmer)
    };

    if mode.count || mode.list {
        let mail = gmail_client(config)?;
        let extractor = LinkExtractor::new(&mail);
        if mode.count {
            let total = extractor.count_label(&config.label).await?;
            println!("{} messages in label '{}'", total, config.label);
        } else {
            for (id, subject) in extractor.list_label(&config.label).await? {
                println!("{id}  {subject}");
            }
        }
        return Ok(());
    }

    let mut issues = IssueLog::new();
    let dry_run = config.dry_run_report.is_some();
    let mut cache = VisitedCache::open(config.visited_cache_path())?;

    // Either replay an existing report or extract and score fresh links.
    let (scored, message_index, mail) = if let Some(report_path) = &config.dry_run_report {
        log::info!("Dry run: replaying {}", report_path.display());
        let scored = report::load_report(report_path)?;
        (scored, HashMap::new(), None)
    } else {
        let mail = gmail_client(config)?;
        let extractor = LinkExtractor::new(&mail);
        let extraction = extractor.collect(&config.label, config.max_messages).await?;
        log::info!(
            "Found {} unsubscribe links in {} messages",
            extraction.candidates.len(),
            extraction.scanned
        );
        if extraction.candidates.is_empty() {
            println!("No unsubscribe links found.");
            return Ok(());
        }

        // Scoring quota is only spent on links the executor could still act on.
        let candidates = extraction.urls();
        let fresh = cache.filter_unvisited(&candidates);
        if fresh.len() < candidates.len() {
            log::info!(
                "{} link(s) already visited; not rescanning them",
                candidates.len() - fresh.len()
            );
        }
        if fresh.is_empty() {
            println!("All discovered links were already visited.");
            return Ok(());
        }

        let scored = score_links(config, confirmer.as_ref(), &fresh).await?;
        if scored.is_empty() {
            println!("No links were scored.");
            return Ok(());
        }

        let report_path = config.report_path();
        report::write_report(&report_path, &scored, scorer_name(config))?;
        log::info!("Wrote scored-link report to {}", report_path.display());

        (scored, extraction.message_index(), Some(mail))
    };

    let lexicon = Lexicon::load(
        config.success_words_path.as_deref(),
        config.intent_words_path.as_deref(),
    )?;
    let options = VisitOptions {
        empty_body_is_success: config.empty_body_is_success,
        enable_mailto: config.enable_mailto,
        dry_run,
    };

    let mut visitor = LinkVisitor::new(&lexicon, &mut cache, mail.as_ref(), options)?;
    let visit_report = visitor
        .run(
            &scored,
            config.threshold,
            &message_index,
            &mut issues,
            &config.log_dir(),
            confirmer.as_ref(),
        )
        .await;

    println!("\nResults:");
    println!("  visited:        {}", visit_report.outcomes.len());
    println!("  unsubscribed:   {}", visit_report.successes());
    println!(
        "  failed:         {}",
        visit_report.count(VisitOutcome::Failed)
    );
    println!(
        "  indeterminate:  {}",
        visit_report.count(VisitOutcome::Indeterminate)
    );
    println!(
        "  already done:   {}",
        visit_report.count(VisitOutcome::AlreadyVisited)
    );
    println!("  skipped:        {}", visit_report.skipped);

    if !issues.is_empty() {
        let issues_path = config.issues_path();
        issues.write(&issues_path)?;
        println!("\nWorst offenders:");
        for bucket in issues.taxonomy(10) {
            println!(
                "  {} ({} failures): {}",
                bucket.domain,
                bucket.failures,
                bucket.reasons.join("; ")
            );
        }
        println!("Issue details written to {}", issues_path.display());
    }

    if let Some(mail) = &mail {
        delete_unsubscribed(mail, &visit_report.deletable, confirmer.as_ref()).await;
    }

    Ok(())
}

fn gmail_client(config: &Config) -> Result<GmailClient> {
    match &config.gmail_token {
        Some(token) => GmailClient::new(token),
        None => bail!("no Gmail token supplied; use --token or the settings file"),
    }
}

fn scorer_name(config: &Config) -> &'static str {
    if config.virus_total_api_key.is_some() {
        "VirusTotal"
    } else {
        "Hybrid Analysis"
    }
}

async fn score_links(
    config: &Config,
    confirmer: &dyn Confirmer,
    links: &[String],
) -> Result<Vec<ScoredLink>> {
    if let Some(key) = &config.virus_total_api_key {
        let scorer = VirusTotalScorer::new(key)?;
        run_scan(&scorer, config, confirmer, links).await
    } else if let Some(key) = &config.hybrid_analysis_api_key {
        let scorer = HybridAnalysisScorer::new(key)?;
        run_scan(&scorer, config, confirmer, links).await
    } else {
        bail!("no reputation API key supplied; use --vt-key or --ha-key")
    }
}

async fn run_scan<S: DomainScorer>(
    scorer: &S,
    config: &Config,
    confirmer: &dyn Confirmer,
    links: &[String],
) -> Result<Vec<ScoredLink>> {
    let mut ledger = QuotaLedger::open(
        config.quota_path(scorer.quota_file_name()),
        scorer.service_name(),
        scorer.quota_limits(),
    )?;
    let mut scanner = LinkScanner::new(scorer, &mut ledger, confirmer, config.enforce_quota);
    scanner.scan(links).await
}

fn show_usage(config: &Config) -> Result<()> {
    let services = [
        ("VirusTotal", "vt_requests.json", VIRUS_TOTAL_LIMITS),
        ("Hybrid Analysis", "ha_requests.json", HYBRID_ANALYSIS_LIMITS),
    ];
    for (service, file, limits) in services {
        let mut ledger = QuotaLedger::open(config.quota_path(file), service, limits)?;
        println!("{service}:");
        for (window, used, limit) in ledger.snapshot() {
            println!("  per {}: {used}/{limit}", window.label());
        }
    }
    Ok(())
}

async fn delete_unsubscribed(mail: &GmailClient, deletable: &[String], confirmer: &dyn Confirmer) {
    if deletable.is_empty() {
        return;
    }

    let prompt = format!(
        "Delete {} message(s) whose unsubscribe succeeded?",
        deletable.len()
    );
    if !confirmer.confirm(&prompt) {
        log::info!("Leaving unsubscribed messages in place");
        return;
    }

    for id in deletable {
        match mail.delete_message(id).await {
            Ok(()) => log::info!("Deleted message {id}"),
            Err(e) => log::warn!("Failed to delete message {id}: {e}"),
        }
    }
}
