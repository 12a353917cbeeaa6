use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use anyhow::Context;
use aup_applier::{Applier, Outcome, Task};
use aup_catalog::{Catalog, Object, ObjectType};
use aup_crypto::SigningKey;
use aup_instance::{
    Audience, AudienceIndex, EventFilter, EventKind, Instance, InstanceConfig, InstanceEvent,
    CATALOG_KEY,
};
use aup_storage::Storage;
use aup_types::{FileKind, Oid};
use colored::Colorize;
use serde_json::json;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let format = cli.format;
    match cli.command {
        Command::Run(args) => cmd_run(args),
        Command::Apply(args) => cmd_apply(args, format),
        Command::Catalog(args) => cmd_catalog(args, format),
        Command::Storage(args) => cmd_storage(args, format),
        Command::Gc(args) => cmd_gc(args, format),
        Command::Status(args) => cmd_status(args, format),
        Command::Keygen => cmd_keygen(format),
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

fn cmd_run(args: ConfigArgs) -> anyhow::Result<()> {
    let config = InstanceConfig::load(&args.config)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    runtime.block_on(run_agent(config))
}

async fn run_agent(config: InstanceConfig) -> anyhow::Result<()> {
    let mut instance = Instance::new();
    let mut completions = instance.subscribe(EventFilter {
        audiences: Some(vec![Audience::Target]),
        kinds: Some(vec![EventKind::TotallyComplete]),
    });
    instance.start(config)?;
    println!("{} aup agent started", "✓".green().bold());

    if instance.target_complete()? {
        report_update(instance.update_target()?);
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = instance.tick(Instant::now()) {
                    tracing::error!(error = %e, "tick failed");
                }
                let mut complete = false;
                while let Ok(event) = completions.try_recv() {
                    complete |= matches!(event, InstanceEvent::TotallyComplete { .. });
                }
                if complete {
                    match instance.update_target() {
                        Ok(outcome) => report_update(outcome),
                        Err(e) => tracing::error!(error = %e, "target update failed"),
                    }
                }
            }
            _ = &mut shutdown => break,
        }
    }

    instance.stop()?;
    println!("{} aup agent stopped", "✓".green().bold());
    Ok(())
}

fn report_update(outcome: Outcome) {
    if outcome.failed() {
        println!("{} target update: {}", "✗".red().bold(), outcome.to_string().red());
    } else {
        println!("{} target update: {}", "✓".green().bold(), outcome.to_string().cyan());
    }
}

// ---------------------------------------------------------------------------
// One-shot apply
// ---------------------------------------------------------------------------

fn cmd_apply(args: ApplyArgs, format: OutputFormat) -> anyhow::Result<()> {
    let storage = Storage::open(&args.state, true)?;
    let catalog = load_catalog(&storage)?;
    let kinds = parse_kinds(&args.kinds)?;

    let mut applier = Applier::new();
    applier.add_catalog(&catalog).add_storage(&storage);
    for root in &args.roots {
        let oid: Oid = root.parse().with_context(|| format!("bad root oid {root}"))?;
        applier.add_root(oid, kinds.iter().copied());
    }

    let mut task = Task::VERBOSE_MAJOR;
    if args.fix {
        task |= Task::REMOVE_WRONGS
            | Task::EMPLACE_MISSINGS
            | Task::EMPLACE_CHANGES
            | Task::REMOVE_EXTRA;
    }
    if args.check_storage {
        task |= Task::CHECK_STORAGE;
    }

    std::fs::create_dir_all(&args.target)
        .with_context(|| format!("failed to create {}", args.target.display()))?;
    let outcome = applier.process(&args.target, task)?;

    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({ "outcome": outcome.bits(), "flags": outcome.names() })
        ),
        OutputFormat::Text => report_update(outcome),
    }
    if outcome.failed() {
        anyhow::bail!("target not applied: {outcome}");
    }
    Ok(())
}

fn parse_kinds(list: &str) -> anyhow::Result<BTreeSet<FileKind>> {
    let mut kinds = BTreeSet::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match item {
            "*" => kinds.extend(FileKind::ALL),
            "minimal" => kinds.extend(FileKind::MINIMAL),
            name => {
                kinds.insert(name.parse::<FileKind>()?);
            }
        }
    }
    Ok(kinds)
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

fn load_catalog(storage: &Storage) -> anyhow::Result<Catalog> {
    match storage.get(CATALOG_KEY, 0, None)? {
        Some(blob) => Ok(Catalog::from_bytes(&blob)?),
        None => Ok(Catalog::new()),
    }
}

fn cmd_catalog(args: CatalogArgs, format: OutputFormat) -> anyhow::Result<()> {
    let storage = Storage::open(&args.state, false)?;
    let catalog = load_catalog(&storage)?;
    match args.action {
        CatalogAction::List { object_type } => {
            let filter = object_type
                .map(|t| t.parse::<ObjectType>().map_err(anyhow::Error::msg))
                .transpose()?;
            let oids = catalog.enumerate(filter);
            match format {
                OutputFormat::Json => {
                    let rows: Vec<_> = oids
                        .iter()
                        .filter_map(|oid| catalog.get_ref(oid).map(|o| object_json(oid, o)))
                        .collect();
                    println!("{}", serde_json::Value::Array(rows));
                }
                OutputFormat::Text => {
                    for oid in &oids {
                        if let Some(object) = catalog.get_ref(oid) {
                            println!(
                                "{} {:<8} {}",
                                oid.short_hex().yellow(),
                                object.object_type().to_string().cyan(),
                                summary(object)
                            );
                        }
                    }
                    println!("{} object(s)", oids.len().to_string().bold());
                }
            }
        }
        CatalogAction::Show { oid } => {
            let oid: Oid = oid.parse().with_context(|| format!("bad oid {oid}"))?;
            let object = catalog
                .get_ref(&oid)
                .with_context(|| format!("object {oid} not in catalog"))?;
            match format {
                OutputFormat::Json => println!("{:#}", object_json(&oid, object)),
                OutputFormat::Text => show_object(&oid, object),
            }
        }
    }
    Ok(())
}

fn summary(object: &Object) -> String {
    match object {
        Object::File(f) => format!("{} ({}, {} bytes)", f.path, f.kind, f.size),
        Object::Unit(u) => format!("{} ({} files)", u.name, u.dependencies.len()),
        Object::Release(r) => format!(
            "{} {}/{} {} {}",
            r.src_branch,
            r.platform_os,
            r.platform_arch,
            r.provider,
            moment(r.src_moment)
        ),
    }
}

fn moment(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .and_then(|s| chrono::DateTime::<chrono::Utc>::from_timestamp(s, 0))
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| secs.to_string())
}

fn show_object(oid: &Oid, object: &Object) {
    println!("{} {}", object.object_type().to_string().cyan().bold(), oid.to_string().yellow());
    match object {
        Object::File(f) => {
            println!("  path:    {}", f.path);
            println!("  kind:    {}", f.kind);
            println!("  perms:   {:o}", f.perms);
            println!("  size:    {}", f.size);
            println!("  content: {}", f.content);
        }
        Object::Unit(u) => {
            println!("  name:    {}", u.name);
            for pattern in &u.extra_allowed {
                println!("  extra:   {pattern}");
            }
        }
        Object::Release(r) => {
            println!("  branch:       {}", r.src_branch);
            println!("  revision:     {}", r.src_revision);
            println!("  moment:       {}", moment(r.src_moment));
            println!("  platform:     {}/{}", r.platform_os, r.platform_arch);
            println!(
                "  compiler:     {} {} ({})",
                r.compiler, r.compiler_version, r.compiler_optimization
            );
            println!("  provider:     {}", r.provider);
            println!("  stability:    {}", r.stability);
            println!("  signer:       {}", hex::encode(&r.signer));
            let verdict = if r.verify_signature() {
                "valid".green()
            } else {
                "INVALID".red().bold()
            };
            println!("  signature:    {verdict}");
        }
    }
    for dep in object.dependencies() {
        println!("  dep:     {}", dep.to_string().dimmed());
    }
}

fn object_json(oid: &Oid, object: &Object) -> serde_json::Value {
    let deps: Vec<String> = object.dependencies().iter().map(Oid::to_hex).collect();
    match object {
        Object::File(f) => json!({
            "oid": oid.to_hex(), "type": "file", "dependencies": deps,
            "path": f.path, "kind": f.kind, "perms": f.perms, "size": f.size,
            "content": f.content.to_hex(),
        }),
        Object::Unit(u) => json!({
            "oid": oid.to_hex(), "type": "unit", "dependencies": deps,
            "name": u.name, "extra_allowed": u.extra_allowed,
        }),
        Object::Release(r) => json!({
            "oid": oid.to_hex(), "type": "release", "dependencies": deps,
            "src_branch": r.src_branch, "src_revision": r.src_revision,
            "src_moment": r.src_moment, "platform_os": r.platform_os,
            "platform_arch": r.platform_arch, "compiler": r.compiler,
            "compiler_version": r.compiler_version,
            "compiler_optimization": r.compiler_optimization,
            "provider": r.provider, "stability": r.stability,
            "signer": hex::encode(&r.signer), "signature_valid": r.verify_signature(),
        }),
    }
}

fn cmd_storage(args: StorageArgs, format: OutputFormat) -> anyhow::Result<()> {
    let storage = Storage::open(&args.state, false)?;
    match args.action {
        StorageAction::List => {
            let blobs = storage.enumerate()?;
            match format {
                OutputFormat::Json => {
                    let rows: Vec<String> = blobs.iter().map(Oid::to_hex).collect();
                    println!("{}", json!(rows));
                }
                OutputFormat::Text => {
                    for oid in &blobs {
                        println!("{}", oid.to_string().yellow());
                    }
                    println!("{} blob(s)", blobs.len().to_string().bold());
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Instance maintenance
// ---------------------------------------------------------------------------

fn started(args: &ConfigArgs) -> anyhow::Result<Instance> {
    let config = InstanceConfig::load(&args.config)?;
    let mut instance = Instance::new();
    instance.start(config)?;
    Ok(instance)
}

fn cmd_gc(args: ConfigArgs, format: OutputFormat) -> anyhow::Result<()> {
    let mut instance = started(&args)?;
    let report = instance.collect_garbage()?;
    instance.save_catalog(false)?;
    instance.stop()?;
    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({ "catalog_dropped": report.catalog_dropped, "storage_dropped": report.storage_dropped })
        ),
        OutputFormat::Text => println!(
            "{} GC: {} catalog object(s), {} blob(s) removed",
            "✓".green(),
            report.catalog_dropped.to_string().bold(),
            report.storage_dropped.to_string().bold()
        ),
    }
    Ok(())
}

fn cmd_status(args: ConfigArgs, format: OutputFormat) -> anyhow::Result<()> {
    let mut instance = started(&args)?;
    let index = instance.index()?.clone();
    instance.stop()?;

    match format {
        OutputFormat::Json => {
            let audience = |a: &AudienceIndex| {
                json!({
                    "most_releases": a.most_releases.iter().map(Oid::to_hex).collect::<Vec<_>>(),
                    "catalog_incomplete": a.catalog_incomplete.len(),
                    "catalog_complete": a.catalog_complete.len(),
                    "storage_incomplete": a.storage_incomplete.len(),
                    "storage_complete": a.storage_complete.len(),
                    "complete": a.is_complete(),
                })
            };
            println!(
                "{:#}",
                json!({
                    "releases": index.all_releases.len(),
                    "target": audience(&index.target),
                    "buffer": audience(&index.buffer),
                })
            );
        }
        OutputFormat::Text => {
            println!("Known releases: {}", index.all_releases.len().to_string().bold());
            for audience in Audience::BOTH {
                let a = index.audience(audience);
                let state = if a.is_complete() {
                    "complete".green()
                } else {
                    "incomplete".yellow()
                };
                println!("{} {}", audience.to_string().bold(), state);
                for oid in &a.most_releases {
                    println!("  release {}", oid.short_hex().yellow());
                }
                println!(
                    "  catalog: {} present, {} missing",
                    a.catalog_complete.len(),
                    a.catalog_incomplete.len()
                );
                println!(
                    "  storage: {} present, {} missing",
                    a.storage_complete.len(),
                    a.storage_incomplete.len()
                );
            }
        }
    }
    Ok(())
}

fn cmd_keygen(format: OutputFormat) -> anyhow::Result<()> {
    let key = SigningKey::generate();
    let secret = hex::encode(key.as_bytes());
    let public = hex::encode(&key.verifying_key().to_bytes());
    match format {
        OutputFormat::Json => println!("{}", json!({ "secret": secret, "public": public })),
        OutputFormat::Text => {
            println!("{} {}", "secret:".red().bold(), secret);
            println!("{} {}", "public:".green().bold(), public);
        }
    }
    Ok(())
}
