use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use fuzzdeck_core::{EngineKind, RunId, RunSpec, ScanMethod, ScanSpec, TelemetryEvent, Transport};
use seeds::{SeedKind, SeedLibrary, SeedRequest};
use std::path::PathBuf;
use supervisor::{RunSupervisor, ScanSupervisor, Subscription};
use tracing_subscriber::EnvFilter;

mod config;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json, Jsonl }

#[derive(Debug, Parser)]
#[command(name = "fuzzdeck", version, about = "Supervised network fuzzing runs and port discovery")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./fuzzdeck.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Raise log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// List network interfaces usable for runs
    Interfaces {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Start one fuzzing run and stream its telemetry until it ends (Ctrl-C stops it)
    Run {
        /// Target IP address or host name
        #[arg(long)]
        target: String,
        #[arg(long)]
        port: u16,
        #[arg(long, default_value = "tcp")]
        transport: Transport,
        /// Interface to capture on
        #[arg(long)]
        iface: String,
        /// Engine: mutation, session, crafting or relay
        #[arg(long, default_value = "mutation")]
        engine: EngineKind,
        /// Seconds before the run expires; 0 runs until stopped
        #[arg(long, default_value_t = 0)]
        duration: u64,
        /// Minimum delay between sends in milliseconds
        #[arg(long)]
        throttle_ms: Option<u64>,
        /// Seed file (repeatable), or the name of a seed in the seed library
        #[arg(long = "seed")]
        seeds: Vec<String>,
        /// Extra engine option as key=value; values are parsed as JSON when possible (repeatable)
        #[arg(long = "opt", value_name = "KEY=VALUE")]
        opts: Vec<String>,
        /// Allow targets outside loopback and private ranges
        #[arg(long, default_value_t = false)]
        confirm_remote: bool,
        /// Record synthesized frames instead of sniffing the interface
        #[arg(long, default_value_t = false)]
        no_sniff: bool,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Inspect recorded runs
    Runs {
        #[command(subcommand)]
        cmd: RunsCmd,
    },
    /// Discover open ports on a target
    Scan {
        /// Target host or IP
        target: String,
        #[arg(long, default_value = "builtin")]
        method: ScanMethod,
        /// Ports: comma/range list (e.g., 22,80,443 or 1-1024,8080). Default: 1-1024.
        #[arg(long)]
        ports: Option<String>,
        /// Select top N common ports (conflicts with --ports)
        #[arg(long, conflicts_with = "ports")]
        top: Option<usize>,
        /// Also probe UDP
        #[arg(long, default_value_t = false)]
        udp: bool,
        /// Skip the TCP connect scan
        #[arg(long, default_value_t = false)]
        no_tcp: bool,
        /// Timeout per port in milliseconds
        #[arg(long, default_value_t = 300)]
        timeout_ms: u64,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Manage seed payloads
    Seed {
        #[command(subcommand)]
        cmd: SeedCmd,
    },
}

#[derive(Debug, Subcommand)]
enum RunsCmd {
    /// List runs in the runs directory, newest first
    List {
        /// Write CSV to stdout
        #[arg(long, default_value_t = false)]
        csv: bool,
    },
    /// Print one run's metadata record
    Show { run_id: RunId },
    /// Delete a run's artifacts
    Delete { run_id: RunId },
}

#[derive(Debug, Subcommand)]
enum SeedCmd {
    /// Generate a protocol seed
    Generate {
        #[arg(long, value_parser = ["http", "dns", "ssh", "custom"])]
        kind: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Host header for http seeds
        #[arg(long)]
        host: Option<String>,
        /// Query name for dns seeds
        #[arg(long)]
        qname: Option<String>,
        /// Payload bytes for custom seeds
        #[arg(long)]
        payload_hex: Option<String>,
    },
    /// Copy a file into the seed library
    Add {
        name: String,
        file: PathBuf,
        #[arg(long, default_value = "")]
        description: String,
    },
    List,
    Delete { name: String },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn seed_kind(s: &str) -> Result<SeedKind> {
    Ok(match s {
        "http" => SeedKind::Http,
        "dns" => SeedKind::Dns,
        "ssh" => SeedKind::Ssh,
        "custom" => SeedKind::Custom,
        other => bail!("unknown seed kind {other}"),
    })
}

fn parse_opt(kv: &str) -> Result<(String, serde_json::Value)> {
    let (k, v) = kv.split_once('=').ok_or_else(|| anyhow!("expected KEY=VALUE, got {kv}"))?;
    let value = serde_json::from_str(v).unwrap_or_else(|_| serde_json::Value::String(v.to_string()));
    Ok((k.trim().to_string(), value))
}

fn print_event(event: &TelemetryEvent, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => match event {
            TelemetryEvent::Heartbeat { sent, errors } => println!("heartbeat sent={sent} errors={errors}"),
            TelemetryEvent::Info { message } => println!("info  {message}"),
            TelemetryEvent::Error { message } => println!("error {message}"),
            TelemetryEvent::Finished { summary } => {
                println!(
                    "finished state={} reason={} sent={} errors={}{}",
                    summary.state,
                    summary.reason,
                    summary.sent,
                    summary.errors,
                    summary.artifact.as_deref().map(|a| format!(" trace={a}")).unwrap_or_default()
                );
                if let Some(d) = &summary.detail {
                    println!("  {d}");
                }
            }
        },
        OutputFormat::Json | OutputFormat::Jsonl => println!("{}", serde_json::to_string(event)?),
    }
    Ok(())
}

/// Prints events until the channel closes. The first Ctrl-C calls `on_interrupt`;
/// the stream keeps draining so the `finished` event still reaches stdout.
/// Returns whether a `finished` event was seen.
async fn follow(mut sub: Subscription, format: OutputFormat, on_interrupt: impl FnOnce()) -> Result<bool> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut on_interrupt = Some(on_interrupt);
    let mut finished = false;
    loop {
        tokio::select! {
            ev = sub.next() => match ev {
                Some(ev) => {
                    finished |= ev.is_finished();
                    print_event(&ev, format)?;
                }
                None => break,
            },
            _ = &mut ctrl_c, if on_interrupt.is_some() => {
                tracing::info!("interrupted, stopping");
                if let Some(f) = on_interrupt.take() {
                    f();
                }
            }
        }
    }
    if sub.dropped() > 0 {
        tracing::warn!(dropped = sub.dropped(), "output fell behind; some events were skipped");
    }
    Ok(finished)
}

/// Prints the `finished` event from history when the live stream missed it.
fn print_missed_finish(history: Option<Vec<TelemetryEvent>>, format: OutputFormat) -> Result<()> {
    if let Some(ev) = history.and_then(|h| h.into_iter().rev().find(TelemetryEvent::is_finished)) {
        print_event(&ev, format)?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Version => {
            println!("{} {}", fuzzdeck_core::TOOL_NAME, fuzzdeck_core::version());
        }
        Commands::Interfaces { format } => {
            for i in fuzzdeck_core::iface::list_interfaces() {
                match format {
                    OutputFormat::Text => {
                        let addrs: Vec<String> = i.addrs.iter().map(|a| a.to_string()).collect();
                        println!(
                            "{}{}{} {}",
                            i.name,
                            if i.up { "" } else { " (down)" },
                            if i.loopback { " (loopback)" } else { "" },
                            addrs.join(",")
                        );
                    }
                    OutputFormat::Json | OutputFormat::Jsonl => println!("{}", serde_json::to_string(&i)?),
                }
            }
        }
        Commands::Run {
            target,
            port,
            transport,
            iface,
            engine,
            duration,
            throttle_ms,
            seeds,
            opts,
            confirm_remote,
            no_sniff,
            format,
        } => {
            let mut spec = RunSpec::new(target, port, transport, iface, engine);
            spec.duration_seconds = duration;
            spec.throttle_ms = throttle_ms;
            for s in seeds {
                let p = PathBuf::from(&s);
                if p.is_file() {
                    spec.seed_files.push(p);
                } else {
                    spec.seed_files.push(SeedLibrary::open(cfg.seeds_dir())?.get_path(&s)?);
                }
            }
            for kv in &opts {
                let (k, v) = parse_opt(kv)?;
                spec.extra_opts.insert(k, v);
            }
            if confirm_remote {
                spec.extra_opts.insert("confirm_remote".into(), serde_json::Value::Bool(true));
            }
            let mut sup_cfg = cfg.supervisor();
            if no_sniff {
                sup_cfg.capture.sniff = false;
            }

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async move {
                let sup = RunSupervisor::new(sup_cfg)?;
                let run_id = sup.start(spec).await.with_context(|| "starting run")?;
                let snap = sup.get(run_id).ok_or_else(|| anyhow!("run {run_id} vanished"))?;
                match format {
                    OutputFormat::Text => {
                        println!("run {run_id} started");
                        if let Some(addr) = snap.listen_addr {
                            println!("relay listening on {addr}");
                        }
                    }
                    _ => println!("{}", serde_json::json!({ "run_id": run_id, "listen_addr": snap.listen_addr })),
                }
                let sub = sup.subscribe(run_id)?;
                let stopper = sup.clone();
                let finished = follow(sub, format, move || {
                    tokio::spawn(async move {
                        if let Err(e) = stopper.stop(run_id).await {
                            tracing::error!(%run_id, error = %e, "stop failed");
                        }
                    });
                })
                .await?;
                if !finished {
                    print_missed_finish(sup.history(run_id), format)?;
                }
                sup.shutdown().await;
                if format == OutputFormat::Text {
                    println!("artifacts in {}", snap.paths.dir.display());
                }
                Ok::<_, anyhow::Error>(())
            })?;
        }
        Commands::Runs { cmd } => {
            let store = run_store::RunStore::open_or_create(cfg.runs_dir())?;
            match cmd {
                RunsCmd::List { csv } => {
                    let runs = store.list()?;
                    if csv {
                        let mut wtr = csv::Writer::from_writer(std::io::stdout());
                        wtr.write_record(["run_id", "engine", "target", "transport", "state", "reason", "created_at", "finished_at", "sent", "errors", "trace"])?;
                        for m in runs {
                            wtr.write_record([
                                m.run_id.to_string(),
                                m.spec.engine.to_string(),
                                m.spec.endpoint(),
                                m.spec.transport.to_string(),
                                m.state.to_string(),
                                m.reason.map(|r| r.to_string()).unwrap_or_default(),
                                m.created_at,
                                m.finished_at.unwrap_or_default(),
                                m.sent.to_string(),
                                m.errors.to_string(),
                                m.trace.map(|t| t.path).unwrap_or_default(),
                            ])?;
                        }
                        wtr.flush()?;
                    } else {
                        for m in runs {
                            println!(
                                "{} {} {} {} {} sent={} errors={}",
                                m.run_id,
                                m.created_at,
                                m.spec.engine,
                                m.spec.endpoint(),
                                m.reason.map(|r| r.to_string()).unwrap_or_else(|| m.state.to_string()),
                                m.sent,
                                m.errors
                            );
                        }
                    }
                }
                RunsCmd::Show { run_id } => {
                    println!("{}", serde_json::to_string_pretty(&store.load(&run_id)?)?);
                }
                RunsCmd::Delete { run_id } => {
                    let meta = store.load(&run_id)?;
                    if meta.state.is_active() && meta.finished_at.is_none() {
                        tracing::warn!(%run_id, state = %meta.state, "deleting a run that never recorded an end");
                    }
                    store.remove(&run_id)?;
                    println!("deleted {run_id}");
                }
            }
        }
        Commands::Scan { target, method, ports, top, udp, no_tcp, timeout_ms, format } => {
            let spec = ScanSpec { target, method, tcp: !no_tcp, udp, ports, top_ports: top, timeout_ms };
            let sup_cfg = cfg.supervisor();
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async move {
                let sup = ScanSupervisor::new(sup_cfg);
                let scan_id = sup.start(spec)?;
                if format == OutputFormat::Text {
                    println!("scan {scan_id} started");
                }
                let sub = sup.subscribe(scan_id)?;
                let stopper = sup.clone();
                let finished = follow(sub, format, move || {
                    tokio::spawn(async move {
                        if let Err(e) = stopper.stop(scan_id).await {
                            tracing::error!(%scan_id, error = %e, "stop failed");
                        }
                    });
                })
                .await?;
                if !finished && format != OutputFormat::Text {
                    print_missed_finish(sup.history(scan_id), format)?;
                }
                let snap = sup.get(scan_id).ok_or_else(|| anyhow!("scan {scan_id} vanished"))?;
                match (format, sup.result(scan_id)?) {
                    (OutputFormat::Text, Some(r)) => {
                        let join = |v: &[u16]| v.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(",");
                        println!("method: {}", r.method);
                        println!("tcp open: {}", join(&r.tcp_open));
                        println!("udp maybe open: {}", join(&r.udp_maybe_open));
                    }
                    (OutputFormat::Text, None) => {
                        println!("no result ({})", snap.reason.map(|r| r.to_string()).unwrap_or_else(|| snap.state.to_string()))
                    }
                    (_, result) => println!("{}", serde_json::json!({ "scan_id": scan_id, "state": snap.state, "reason": snap.reason, "result": result })),
                }
                Ok::<_, anyhow::Error>(())
            })?;
        }
        Commands::Seed { cmd } => {
            let library = SeedLibrary::open(cfg.seeds_dir())?;
            match cmd {
                SeedCmd::Generate { kind, name, description, host, qname, payload_hex } => {
                    let req = SeedRequest { kind: Some(seed_kind(&kind)?), name, description, host, qname, payload_hex };
                    let d = library.generate(&req)?;
                    println!("{}", serde_json::to_string(&d)?);
                }
                SeedCmd::Add { name, file, description } => {
                    let bytes = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
                    let d = library.add(&name, &bytes, &description)?;
                    println!("{}", serde_json::to_string(&d)?);
                }
                SeedCmd::List => {
                    for d in library.list()? {
                        println!("{}\t{}\t{}", d.name, d.size, d.description);
                    }
                }
                SeedCmd::Delete { name } => {
                    library.delete(&name)?;
                    println!("deleted {name}");
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opts_parse_json_or_string() {
        assert_eq!(parse_opt("throttle_ms=5").unwrap(), ("throttle_ms".into(), serde_json::json!(5)));
        assert_eq!(parse_opt("proxy_bind_host=127.0.0.1").unwrap().1, serde_json::json!("127.0.0.1"));
        assert_eq!(
            parse_opt(r#"anomaly_profile={"null_bytes":3}"#).unwrap().1,
            serde_json::json!({ "null_bytes": 3 })
        );
        assert!(parse_opt("novalue").is_err());
    }

    #[test]
    fn cli_parses_run() {
        let cli = Cli::try_parse_from([
            "fuzzdeck", "run", "--target", "127.0.0.1", "--port", "9001", "--transport", "udp", "--iface", "lo",
            "--engine", "radamsa", "--opt", "throttle_ms=0",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { transport, engine, opts, .. } => {
                assert_eq!(transport, Transport::Udp);
                assert_eq!(engine, EngineKind::Mutation);
                assert_eq!(opts, vec!["throttle_ms=0".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
