mod cli;
mod config;
mod jobs;
mod loader;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dcmkit_anonymize::{AnonymizationEngine, TemplateStore};
use dcmkit_common::CancelFlag;
use dcmkit_hierarchy::Hierarchy;
use dcmkit_send::{SendEngine, SendTarget};
use dcmkit_validate::DicomValidator;

use crate::cli::{Cli, Command, ExportMode};
use crate::config::AppConfig;

const ENV_LOG: &str = "DCMKIT_LOG";

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (config, _config_path) = AppConfig::load(cli.config.as_deref());
    init_tracing(&cli, &config)?;
    if !cli.extra.is_empty() {
        warn!("Ignoring unrecognized arguments: {:?}", cli.extra);
    }

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            eprintln!("Cancellation requested, finishing the current file...");
            cancel.cancel();
        })
        .context("Error setting Ctrl-C handler")?;
    }

    match cli.command {
        None => {
            let path = cli
                .path
                .clone()
                .context("Provide a DICOM file, directory or zip archive to load")?;
            cmd_scan(&path, &cancel)
        }
        Some(Command::Scan { path }) => cmd_scan(&path, &cancel),
        Some(Command::Validate { path }) => cmd_validate(&path, &cancel),
        Some(Command::Anonymize { path, template }) => cmd_anonymize(&path, &template, &cancel),
        Some(Command::Export { path, output, mode }) => {
            cmd_export(&path, output, mode, &config, &cancel)
        }
        Some(Command::Send {
            path,
            dest,
            host,
            port,
            called_ae_title,
        }) => cmd_send(&path, dest, host, port, called_ae_title, &config, &cancel),
        Some(Command::Merge {
            path,
            level,
            primary,
            secondaries,
        }) => cmd_merge(&path, level, &primary, &secondaries, &cancel),
        Some(Command::Delete { path, level, keys }) => cmd_delete(&path, level, &keys, &cancel),
        Some(Command::Templates) => cmd_templates(),
    }
}

fn init_tracing(cli: &Cli, config: &AppConfig) -> anyhow::Result<()> {
    let level = if cli.trace {
        tracing::Level::TRACE
    } else if cli.debug {
        tracing::Level::DEBUG
    } else {
        config.tracing_level()
    };
    let filter =
        EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    match &config.log_path {
        Some(log_path) => {
            if let Some(dir) = log_path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .with_context(|| format!("Cannot open log file {}", log_path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

/// Loads the input on a background worker. The returned session keeps
/// any zip extraction directory alive until it is dropped.
fn load_session(path: &Path, cancel: &CancelFlag) -> anyhow::Result<loader::LoadedSession> {
    let path = path.to_path_buf();
    let handle = jobs::spawn("load", cancel.clone(), move |ctx| {
        loader::load_path(&path, &ctx.cancel, |current, total, name| {
            ctx.progress(current, total, name)
        })
        .map_err(|e| e.to_string())
    });
    handle.wait().map_err(|e| anyhow!(e))
}

fn build_hierarchy(files: Vec<PathBuf>, cancel: &CancelFlag) -> anyhow::Result<Hierarchy> {
    let handle = jobs::spawn("hierarchy", cancel.clone(), move |ctx| {
        let outcome = Hierarchy::build_with_progress(&files, &ctx.cancel, |current, total, name| {
            ctx.progress(current, total, name)
        });
        for skipped in &outcome.skipped {
            warn!("Skipped {}: {}", skipped.path.display(), skipped.reason);
        }
        Ok(outcome.hierarchy)
    });
    handle.wait().map_err(|e: String| anyhow!(e))
}

fn cmd_scan(path: &Path, cancel: &CancelFlag) -> anyhow::Result<()> {
    let session = load_session(path, cancel)?;
    let hierarchy = build_hierarchy(session.files.clone(), cancel)?;
    print_tree(&hierarchy);
    let (patients, studies, series, instances) = hierarchy.counts();
    println!("{patients} patient(s), {studies} study(ies), {series} series, {instances} instance(s)");
    Ok(())
}

fn print_tree(hierarchy: &Hierarchy) {
    fn walk(hierarchy: &Hierarchy, node: dcmkit_hierarchy::NodeId, depth: usize) {
        let entry = hierarchy.node(node);
        println!("{}{}", "  ".repeat(depth), entry.label);
        for child in entry.children() {
            walk(hierarchy, *child, depth + 1);
        }
    }
    for root in hierarchy.roots() {
        walk(hierarchy, *root, 0);
    }
}

fn cmd_validate(path: &Path, cancel: &CancelFlag) -> anyhow::Result<()> {
    let session = load_session(path, cancel)?;
    let files = session.files.clone();
    let handle = jobs::spawn("validate", cancel.clone(), move |ctx| {
        let validator = DicomValidator::new();
        Ok(validator.validate_collection(&files, &ctx.cancel, |current, total, name| {
            ctx.progress(current, total, name)
        }))
    });
    let collection = handle.wait().map_err(|e: String| anyhow!(e))?;

    for (file, result) in &collection.file_results {
        if result.issues.is_empty() {
            continue;
        }
        println!("{}", file.display());
        for issue in &result.issues {
            println!("  {issue}");
        }
    }
    if !collection.collection_issues.is_empty() {
        println!("Collection:");
        for issue in &collection.collection_issues {
            println!("  {issue}");
        }
    }
    let summary = collection.summary();
    println!(
        "{} file(s): {} valid, {} with errors, {} with warnings ({} errors, {} warnings total)",
        summary.total_files,
        summary.valid_files,
        summary.files_with_errors,
        summary.files_with_warnings,
        summary.total_errors,
        summary.total_warnings
    );
    let stats = &collection.statistics;
    println!(
        "{} instance(s), {} patient(s), {} study(ies), {} series; modalities: {:?}",
        stats.total_instances,
        stats.unique_patients,
        stats.unique_studies,
        stats.unique_series,
        stats.modality_distribution
    );
    if collection.cancelled {
        println!("Validation was cancelled; the report is partial.");
    }
    Ok(())
}

fn cmd_anonymize(path: &Path, template_name: &str, cancel: &CancelFlag) -> anyhow::Result<()> {
    let store = TemplateStore::load(&config::config_dir());
    let template = store
        .get(template_name)
        .with_context(|| {
            format!(
                "Unknown template '{template_name}'. Available: {}",
                store.names().join(", ")
            )
        })?
        .clone();

    let session = load_session(path, cancel)?;
    let files = session.files.clone();
    let handle = jobs::spawn("anonymize", cancel.clone(), move |ctx| {
        let mut engine = AnonymizationEngine::new();
        Ok(engine.anonymize_collection(&template, &files, &ctx.cancel, |current, total, name| {
            ctx.progress(current, total, name)
        }))
    });
    let result = handle.wait().map_err(|e: String| anyhow!(e))?;

    for (file, reason) in &result.failed_files {
        warn!("{}: {}", file.display(), reason);
    }
    let summary = result.summary();
    println!(
        "Anonymized {}/{} file(s) in {:.1}s ({} failed, {} skipped, {} UID(s) remapped{})",
        summary.anonymized_count,
        summary.total_files,
        summary.duration_seconds,
        summary.failed_count,
        summary.skipped_count,
        summary.uid_mappings_count,
        if summary.date_shift_applied {
            ", dates shifted"
        } else {
            ""
        }
    );
    if result.cancelled {
        println!("Anonymization was cancelled; counts are partial.");
    }
    Ok(())
}

fn cmd_export(
    path: &Path,
    output: Option<PathBuf>,
    mode: ExportMode,
    config: &AppConfig,
    cancel: &CancelFlag,
) -> anyhow::Result<()> {
    let session = load_session(path, cancel)?;
    let files = session.files.clone();
    let output = output.unwrap_or_else(|| match mode {
        ExportMode::Flat => config.default_export_dir.join("export"),
        ExportMode::Zip => config.default_export_dir.join("export.zip"),
        ExportMode::DicomdirZip => config.default_export_dir.join("export_dicomdir.zip"),
    });
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file_set_id = config.ae_title.clone();

    let handle = jobs::spawn("export", cancel.clone(), move |ctx| {
        let progress =
            |current: usize, total: usize, name: &str| ctx.progress(current, total, name);
        let result = match mode {
            ExportMode::Flat => {
                dcmkit_dicomdir::export_flat(&files, &output, &ctx.cancel, progress)
            }
            ExportMode::Zip => dcmkit_dicomdir::export_zip(&files, &output, &ctx.cancel, progress),
            ExportMode::DicomdirZip => dcmkit_dicomdir::export_dicomdir_zip(
                &files,
                &output,
                &file_set_id,
                &ctx.cancel,
                progress,
            ),
        };
        result.map_err(|e| e.to_string())
    });
    let report = handle.wait().map_err(|e: String| anyhow!(e))?;

    for (file, reason) in &report.failed {
        warn!("{}: {}", file.display(), reason);
    }
    println!(
        "Exported {} file(s) to {}{}",
        report.exported,
        report.output.display(),
        if report.cancelled { " (cancelled, partial)" } else { "" }
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_send(
    path: &Path,
    dest: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    called_ae_title: String,
    config: &AppConfig,
    cancel: &CancelFlag,
) -> anyhow::Result<()> {
    let (called, host, port, calling) = match dest {
        Some(label) => {
            let destination = config
                .find_destination(&label)
                .with_context(|| format!("No destination '{label}' in the configuration"))?;
            (
                destination.ae_title.clone(),
                destination.host.clone(),
                destination.port,
                destination.calling_ae_title.clone(),
            )
        }
        None => {
            let host = host.context("Provide --dest or --host/--port")?;
            let port = port.context("Provide --dest or --host/--port")?;
            (called_ae_title, host, port, None)
        }
    };
    let calling_ae_title = calling.unwrap_or_else(|| config.ae_title.clone());
    let mut target = SendTarget::new(format!("{called}@{host}:{port}"), calling_ae_title);
    target.called_ae_title = Some(called);

    let session = load_session(path, cancel)?;
    let files = session.files.clone();
    info!("Sending {} file(s) to {}", files.len(), target.addr);

    let handle = jobs::spawn("send", cancel.clone(), move |ctx| {
        let engine = SendEngine::new(target);
        engine
            .send_files(&files, &ctx.cancel, |progress| {
                ctx.progress(progress.current, progress.total, &progress.message)
            })
            .map_err(|e| e.to_string())
    });
    let outcome = handle.wait().map_err(|e: String| anyhow!(e))?;

    for detail in &outcome.error_details {
        warn!("{detail}");
    }
    println!(
        "Sent {} file(s), {} warning(s), {} failed, {} converted{}",
        outcome.success,
        outcome.warnings,
        outcome.failed,
        outcome.converted_count,
        if outcome.cancelled { " (cancelled, partial)" } else { "" }
    );
    if outcome.failed > 0 {
        bail!("{} file(s) could not be sent", outcome.failed);
    }
    Ok(())
}

fn cmd_merge(
    path: &Path,
    level: cli::MergeLevel,
    primary: &str,
    secondaries: &[String],
    cancel: &CancelFlag,
) -> anyhow::Result<()> {
    let session = load_session(path, cancel)?;
    let hierarchy = build_hierarchy(session.files.clone(), cancel)?;

    let node_level = match level {
        cli::MergeLevel::Patient => dcmkit_hierarchy::Level::Patient,
        cli::MergeLevel::Study => dcmkit_hierarchy::Level::Study,
        cli::MergeLevel::Series => dcmkit_hierarchy::Level::Series,
    };
    let primary_node = hierarchy
        .find(node_level, primary)
        .with_context(|| format!("No {} with key '{primary}'", node_level.name()))?;
    let mut secondary_nodes = Vec::new();
    for key in secondaries {
        let node = hierarchy
            .find(node_level, key)
            .with_context(|| format!("No {} with key '{key}'", node_level.name()))?;
        secondary_nodes.push(node);
    }

    let report = match level {
        cli::MergeLevel::Patient => {
            dcmkit_hierarchy::merge_patients(&hierarchy, primary_node, &secondary_nodes)?
        }
        cli::MergeLevel::Study => {
            dcmkit_hierarchy::merge_studies(&hierarchy, primary_node, &secondary_nodes)?
        }
        cli::MergeLevel::Series => {
            dcmkit_hierarchy::merge_series(&hierarchy, primary_node, &secondary_nodes)?
        }
    };
    for warning in &report.warnings {
        warn!("{warning}");
    }
    for (file, reason) in &report.failed {
        warn!("{}: {}", file.display(), reason);
    }
    println!(
        "Merged {} file(s) into '{primary}' ({} failed)",
        report.updated,
        report.failed.len()
    );

    // re-group from the rewritten files
    let rebuilt = build_hierarchy(session.files.clone(), cancel)?;
    let (patients, studies, series, instances) = rebuilt.counts();
    println!("{patients} patient(s), {studies} study(ies), {series} series, {instances} instance(s)");
    Ok(())
}

fn cmd_delete(
    path: &Path,
    level: cli::SelectLevel,
    keys: &[String],
    cancel: &CancelFlag,
) -> anyhow::Result<()> {
    let session = load_session(path, cancel)?;
    let mut hierarchy = build_hierarchy(session.files.clone(), cancel)?;

    let node_level = match level {
        cli::SelectLevel::Patient => dcmkit_hierarchy::Level::Patient,
        cli::SelectLevel::Study => dcmkit_hierarchy::Level::Study,
        cli::SelectLevel::Series => dcmkit_hierarchy::Level::Series,
        cli::SelectLevel::Instance => dcmkit_hierarchy::Level::Instance,
    };
    let mut nodes = Vec::new();
    for key in keys {
        let node = hierarchy
            .find(node_level, key)
            .with_context(|| format!("No {} with key '{key}'", node_level.name()))?;
        nodes.push(node);
    }

    let report = dcmkit_hierarchy::delete_files(&mut hierarchy, &nodes);
    for (file, reason) in &report.failed {
        warn!("{}: {}", file.display(), reason);
    }
    println!(
        "Deleted {} file(s) ({} failed)",
        report.deleted,
        report.failed.len()
    );
    let (patients, studies, series, instances) = hierarchy.counts();
    println!("{patients} patient(s), {studies} study(ies), {series} series, {instances} instance(s)");
    Ok(())
}

fn cmd_templates() -> anyhow::Result<()> {
    let store = TemplateStore::load(&config::config_dir());
    for name in store.names() {
        let template = store.get(name).expect("name comes from the store");
        println!(
            "{name} (v{}): {} rule(s){}",
            template.version,
            template.rules.len(),
            if template.description.is_empty() {
                String::new()
            } else {
                format!(" - {}", template.description)
            }
        );
    }
    Ok(())
}
