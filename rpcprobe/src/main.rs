use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use prober::{Backoff, ProbeOptions};
use rpcprobe_core::catalog::{self, MethodCall};
use rpcprobe_core::{EndpointSnapshot, Outcome, ProbeResult};
use serde_json::json;
use session::{aggregate_rows, AggregatePolicy, Session, SessionOptions};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

mod config;

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_else(|_| String::new())
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json, Jsonl }

#[derive(Debug, Parser)]
#[command(name = "rpcprobe", version, about = "Concurrent JSON-RPC endpoint latency prober")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./rpcprobe.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// List the default method catalog with call parameters
    Methods,
    /// Probe endpoints across the method catalog and report latencies
    Probe {
        /// Endpoint URLs (bare hosts get an http:// prefix)
        #[arg(conflicts_with = "targets")]
        rpcs: Vec<String>,
        /// File with newline-delimited endpoint URLs (comments with # and blanks ignored)
        #[arg(long, value_name = "FILE", conflicts_with = "rpcs")]
        targets: Option<PathBuf>,
        /// Methods: comma-separated list. Default: built-in catalog.
        #[arg(long)]
        methods: Option<String>,
        /// Timeout per request in milliseconds
        #[arg(long, default_value_t = 8000)]
        timeout_ms: u64,
        /// Max retries after an HTTP 429
        #[arg(long, default_value_t = 5)]
        retries: u32,
        /// Fallback delay between retries in milliseconds (Retry-After wins)
        #[arg(long, default_value_t = 2000)]
        retry_delay_ms: u64,
        /// Double the retry delay on each attempt instead of keeping it fixed
        #[arg(long, default_value_t = false)]
        exponential_backoff: bool,
        /// Max concurrent requests across all endpoints
        #[arg(long, default_value_t = 32)]
        concurrency: usize,
        /// Count error latencies in mean/median
        #[arg(long, default_value_t = false)]
        include_errors: bool,
        /// Output format: text, json, or jsonl (jsonl streams results as they settle)
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
        /// Output file (overwrites). Stdout if omitted.
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
        /// Write CSV instead of text/json when --out is provided
        #[arg(long, default_value_t = false)]
        csv: bool,
    },
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::new(filter))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let loaded_cfg = config::load_config(cli.config.as_deref());
    match cli.command {
        Commands::Version => {
            println!("rpcprobe {} (core {})", env!("CARGO_PKG_VERSION"), rpcprobe_core::version());
        }
        Commands::Methods => {
            for call in catalog::default_catalog() {
                println!("{} {}", call.method, serde_json::to_string(&call.params)?);
            }
        }
        Commands::Probe {
            rpcs, targets, methods, mut timeout_ms, mut retries, mut retry_delay_ms,
            mut exponential_backoff, mut concurrency, mut include_errors, mut format, out, csv,
        } => {
            let probe_cfg = loaded_cfg.as_ref().and_then(|c| c.probe.clone());
            if let Some(p) = &probe_cfg {
                if p.timeout_ms.is_some() { timeout_ms = p.timeout_ms.unwrap(); }
                if p.retries.is_some() { retries = p.retries.unwrap(); }
                if p.retry_delay_ms.is_some() { retry_delay_ms = p.retry_delay_ms.unwrap(); }
                if p.exponential_backoff.is_some() { exponential_backoff = p.exponential_backoff.unwrap(); }
                if p.concurrency.is_some() { concurrency = p.concurrency.unwrap(); }
                if p.include_errors.is_some() { include_errors = p.include_errors.unwrap(); }
                if let Some(f) = &p.format {
                    format = match f.as_str() { "json" => OutputFormat::Json, "jsonl" => OutputFormat::Jsonl, _ => OutputFormat::Text };
                }
            }

            let method_names: Vec<String> = if let Some(spec) = &methods {
                spec.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
            } else if let Some(list) = probe_cfg.as_ref().and_then(|p| p.methods.clone()) {
                list
            } else {
                catalog::DEFAULT_METHODS.iter().map(|s| s.to_string()).collect()
            };
            if method_names.is_empty() {
                return Err(anyhow!("no methods to probe"));
            }
            let calls = catalog::calls_for(&method_names);

            let raw_urls: Vec<String> = if !rpcs.is_empty() {
                rpcs
            } else if let Some(path) = &targets {
                let fh = File::open(path)?;
                BufReader::new(fh)
                    .lines()
                    .filter_map(|l| l.ok())
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty() && !s.starts_with('#'))
                    .collect()
            } else if let Some(list) = probe_cfg.as_ref().and_then(|p| p.rpcs.clone()) {
                list
            } else {
                return Err(anyhow!("provide endpoint URLs or --targets <file>"));
            };
            let urls = normalize_urls(&raw_urls)?;
            if urls.is_empty() {
                return Err(anyhow!("no endpoint URLs to probe"));
            }

            let opts = SessionOptions {
                probe: ProbeOptions {
                    timeout_ms,
                    max_retries: retries,
                    retry_delay_ms,
                    backoff: if exponential_backoff { Backoff::Exponential } else { Backoff::Fixed },
                },
                concurrency,
                aggregate: if include_errors { AggregatePolicy::IncludeErrors } else { AggregatePolicy::SuccessOnly },
            };

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_probe(urls, calls, opts, format, out, csv))?;
        }
    }
    Ok(())
}

async fn run_probe(
    urls: Vec<String>,
    methods: Vec<MethodCall>,
    opts: SessionOptions,
    format: OutputFormat,
    out: Option<PathBuf>,
    csv: bool,
) -> Result<()> {
    if csv && out.is_none() {
        return Err(anyhow!("--csv requires --out <file>"));
    }
    let policy = opts.aggregate;
    let started_at = now_rfc3339();
    let start = Instant::now();
    let session = Session::new(methods.clone(), opts)?;

    let printer = if format == OutputFormat::Jsonl && !csv {
        let rx = session.subscribe();
        let writer: Box<dyn Write + Send> = match &out {
            Some(path) => Box::new(BufWriter::new(File::create(path)?)),
            None => Box::new(std::io::stdout()),
        };
        Some(tokio::spawn(stream_jsonl(rx, writer)))
    } else {
        None
    };

    session.reconcile(&urls);
    session.settled().await;
    let duration_ms = start.elapsed().as_millis();
    let ended_at = now_rfc3339();
    let snapshot = session.snapshot();

    if let Some(handle) = printer {
        let _ = handle.await;
        return Ok(());
    }

    if csv {
        if let Some(path) = &out {
            write_csv(path, &snapshot, &started_at, &ended_at)?;
        }
        return Ok(());
    }

    match format {
        OutputFormat::Text => {
            let mut body = render_text(&snapshot, &methods, policy);
            body.push_str(&format!(
                "\n({} endpoints, {} methods, {} ms)",
                snapshot.len(),
                methods.len(),
                duration_ms
            ));
            write_out(&out, &body)?;
        }
        OutputFormat::Json => {
            let aggregates: serde_json::Map<String, serde_json::Value> = methods
                .iter()
                .map(|m| {
                    let v = match aggregate_rows(&snapshot, &m.method, policy) {
                        Some(s) => json!({ "mean_ms": s.mean, "median_ms": s.median, "samples": s.samples }),
                        None => serde_json::Value::Null,
                    };
                    (m.method.clone(), v)
                })
                .collect();
            let obj = json!({
                "endpoints": snapshot,
                "aggregates": aggregates,
                "started_at": started_at,
                "ended_at": ended_at,
                "duration_ms": duration_ms,
            });
            write_out(&out, &serde_json::to_string(&obj)?)?;
        }
        OutputFormat::Jsonl => {}
    }
    Ok(())
}

/// Emit one line per endpoint identity and per settled (endpoint, method)
/// slot, as merges land. Ends once every tracked row has settled.
async fn stream_jsonl(mut rx: watch::Receiver<Vec<EndpointSnapshot>>, mut w: Box<dyn Write + Send>) {
    let mut seen_slots: HashSet<(String, String)> = HashSet::new();
    let mut seen_identities: HashSet<String> = HashSet::new();
    loop {
        let snap = rx.borrow_and_update().clone();
        for row in &snap {
            if row.identity != rpcprobe_core::IDENTITY_PENDING && seen_identities.insert(row.url.clone()) {
                let obj = json!({ "url": row.url, "client": row.identity });
                let _ = writeln!(w, "{}", obj);
            }
            for res in &row.results {
                if !res.outcome.is_terminal() {
                    continue;
                }
                if !seen_slots.insert((row.url.clone(), res.method.clone())) {
                    continue;
                }
                let obj = json!({
                    "url": row.url,
                    "method": res.method,
                    "outcome": res.outcome,
                    "elapsed_ms": res.elapsed_ms,
                    "message": res.message,
                });
                let _ = writeln!(w, "{}", obj);
            }
        }
        if !snap.is_empty() && snap.iter().all(|r| r.is_settled()) {
            break;
        }
        if rx.changed().await.is_err() {
            break;
        }
    }
    let _ = w.flush();
}

/// Methods as rows, endpoints as columns, aggregates on the right.
fn render_text(rows: &[EndpointSnapshot], methods: &[MethodCall], policy: AggregatePolicy) -> String {
    let mut headers = vec!["method".to_string()];
    headers.extend(rows.iter().map(|r| host_label(&r.url)));
    headers.push("mean".to_string());
    headers.push("median".to_string());

    let mut lines: Vec<Vec<String>> = Vec::new();
    let mut client = vec!["(client)".to_string()];
    client.extend(rows.iter().map(|r| r.identity.clone()));
    client.push(String::new());
    client.push(String::new());
    lines.push(client);

    for call in methods {
        let mut line = vec![call.method.clone()];
        for row in rows {
            line.push(row.result(&call.method).map(cell).unwrap_or_default());
        }
        match aggregate_rows(rows, &call.method, policy) {
            Some(s) => {
                line.push(format!("{:.2} ms", s.mean));
                line.push(format!("{:.2} ms", s.median));
            }
            None => {
                line.push("—".to_string());
                line.push("—".to_string());
            }
        }
        lines.push(line);
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for line in &lines {
        for (i, text) in line.iter().enumerate() {
            widths[i] = widths[i].max(text.chars().count());
        }
    }

    let mut output = String::new();
    render_line(&mut output, &headers, &widths);
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    render_line(&mut output, &rule, &widths);
    for line in &lines {
        render_line(&mut output, line, &widths);
    }
    output.pop();
    output
}

fn render_line(output: &mut String, cells: &[String], widths: &[usize]) {
    for (i, text) in cells.iter().enumerate() {
        if i > 0 {
            output.push_str("  ");
        }
        output.push_str(text);
        let pad = widths[i].saturating_sub(text.chars().count());
        for _ in 0..pad {
            output.push(' ');
        }
    }
    while output.ends_with(' ') {
        output.pop();
    }
    output.push('\n');
}

fn cell(res: &ProbeResult) -> String {
    match res.outcome {
        Outcome::Pending => "pending".to_string(),
        Outcome::Success => format!("{:.2} ms", res.elapsed_ms.unwrap_or(0.0)),
        Outcome::ProtocolError | Outcome::TransportError => format!(
            "err: {} ({:.2} ms)",
            res.message.as_deref().unwrap_or("error"),
            res.elapsed_ms.unwrap_or(0.0)
        ),
    }
}

fn host_label(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_else(|| url.to_string())
}

fn outcome_str(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Pending => "pending",
        Outcome::Success => "success",
        Outcome::ProtocolError => "protocol_error",
        Outcome::TransportError => "transport_error",
    }
}

fn write_csv(path: &Path, rows: &[EndpointSnapshot], started_at: &str, ended_at: &str) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(File::create(path)?);
    wtr.write_record(["url", "client", "method", "outcome", "elapsed_ms", "message", "started_at", "ended_at"])?;
    for row in rows {
        for res in &row.results {
            let elapsed = res.elapsed_ms.map(|v| format!("{v:.2}")).unwrap_or_default();
            wtr.write_record([
                row.url.as_str(),
                row.identity.as_str(),
                res.method.as_str(),
                outcome_str(res.outcome),
                elapsed.as_str(),
                res.message.as_deref().unwrap_or(""),
                started_at,
                ended_at,
            ])?;
        }
    }
    wtr.flush()?;
    Ok(())
}

fn write_out(out: &Option<PathBuf>, body: &str) -> Result<()> {
    match out {
        Some(path) => {
            let mut w = BufWriter::new(File::create(path)?);
            writeln!(w, "{}", body)?;
        }
        None => println!("{}", body),
    }
    Ok(())
}

fn normalize_url(raw: &str) -> Result<String> {
    let raw = raw.trim();
    let candidate = if raw.contains("://") { raw.to_string() } else { format!("http://{raw}") };
    let parsed = Url::parse(&candidate).map_err(|e| anyhow!("invalid endpoint URL {raw}: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(candidate),
        other => Err(anyhow!("unsupported URL scheme {other} for {raw}")),
    }
}

/// Normalize and de-duplicate while preserving first-seen order.
fn normalize_urls(raws: &[String]) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    for raw in raws {
        let url = normalize_url(raw)?;
        if seen.insert(url.clone()) {
            urls.push(url);
        }
    }
    Ok(urls)
}
