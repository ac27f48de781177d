use std::time::Duration;

use anyhow::Context;
use atty::Stream;
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use hubsnap_core::{
    list_cached_snapshots, resolve_snapshot_with, storage_folder, CommandStatus, Config,
    ContentId, ExecutionOutcome, RepoId, SnapshotError, SnapshotRequest,
};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

mod cli;
mod style;

use cli::{CacheArgs, CommandCli, DownloadArgs, HubsnapCli, PathArgs};
use style::Style;

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = HubsnapCli::parse();
    init_tracing(cli.trace, cli.verbose, cli.quiet);

    let outcome = execute(&cli.command).map_err(|err| eyre!("{err:?}"))?;
    let code = emit_output(&cli, &outcome)?;

    if code == 0 {
        Ok(())
    } else {
        std::process::exit(code);
    }
}

fn init_tracing(trace: bool, verbose: u8, quiet: bool) {
    let level = if trace {
        "trace"
    } else if quiet {
        "warn"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let directives = format!("hubsnap={level},hubsnap_core={level},hubsnap_store={level}");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn execute(command: &CommandCli) -> anyhow::Result<ExecutionOutcome> {
    match command {
        CommandCli::Download(args) => Ok(download(args)),
        CommandCli::Path(args) => Ok(snapshot_path(args)),
        CommandCli::List(args) => list(args),
    }
}

fn load_config(cache: &CacheArgs) -> Result<Config, SnapshotError> {
    let config = Config::from_env()?;
    match &cache.cache_dir {
        Some(dir) => Ok(config.with_cache_dir(dir)?),
        None => Ok(config),
    }
}

fn download(args: &DownloadArgs) -> ExecutionOutcome {
    let config = match load_config(&args.cache) {
        Ok(config) => config,
        Err(err) => return ExecutionOutcome::from(&err),
    };

    let mut request = SnapshotRequest::new(&args.repo_id).force_download(args.force);
    if let Some(revision) = &args.revision {
        request = request.revision(revision);
    }
    if let Some(framework) = args.framework {
        request = request.framework(framework);
    }
    if let Some(jobs) = args.jobs {
        request = request.jobs(jobs);
    }
    if let Some(secs) = args.timeout {
        request = request.timeout(Duration::from_secs(secs));
    }

    match resolve_snapshot_with(&config, &request) {
        Ok(snapshot) => ExecutionOutcome::success(
            snapshot.folder.display().to_string(),
            json!({
                "folder": snapshot.folder,
                "repo_id": snapshot.repo_id,
                "content_id": snapshot.content_id,
                "files": snapshot.files.len(),
                "cache_source": config.cache().source,
                "passthrough": true,
            }),
        ),
        Err(err) => ExecutionOutcome::from(&err),
    }
}

fn snapshot_path(args: &PathArgs) -> ExecutionOutcome {
    let repo_id = match RepoId::parse(&args.repo_id) {
        Ok(repo_id) => repo_id,
        Err(err) => return ExecutionOutcome::from(&err),
    };
    let content_id = match ContentId::parse(&args.content_id) {
        Ok(content_id) => content_id,
        Err(reason) => {
            return ExecutionOutcome::user_error(
                format!("invalid content id '{}': {reason}", args.content_id),
                json!({ "reason": "invalid_content_id" }),
            )
        }
    };
    let config = match load_config(&args.cache) {
        Ok(config) => config,
        Err(err) => return ExecutionOutcome::from(&err),
    };
    let folder = storage_folder(&config.cache().path, &repo_id, &content_id);
    ExecutionOutcome::success(
        folder.display().to_string(),
        json!({
            "folder": folder,
            "exists": folder.is_dir(),
            "passthrough": true,
        }),
    )
}

fn list(args: &CacheArgs) -> anyhow::Result<ExecutionOutcome> {
    let config = match load_config(args) {
        Ok(config) => config,
        Err(err) => return Ok(ExecutionOutcome::from(&err)),
    };
    let root = &config.cache().path;
    let snapshots = list_cached_snapshots(root)
        .with_context(|| format!("failed to read cache root {}", root.display()))?;
    let message = match snapshots.len() {
        0 => format!("no snapshots under {}", root.display()),
        1 => format!("1 snapshot under {}", root.display()),
        n => format!("{n} snapshots under {}", root.display()),
    };
    Ok(ExecutionOutcome::success(
        message,
        json!({
            "cache_root": root,
            "cache_source": config.cache().source,
            "snapshots": snapshots,
        }),
    ))
}

fn emit_output(cli: &HubsnapCli, outcome: &ExecutionOutcome) -> Result<i32> {
    let code = outcome.status.exit_code();

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcome.to_json())?);
        return Ok(code);
    }

    if outcome.status != CommandStatus::Ok {
        let style = Style::new(cli.no_color, atty::is(Stream::Stderr));
        eprintln!("{}", style.status(outcome.status, &outcome.message));
        for cause in causes(&outcome.details) {
            eprintln!("{}", style.info(&format!("  caused by: {cause}")));
        }
        return Ok(code);
    }

    if cli.quiet {
        return Ok(code);
    }
    let style = Style::new(cli.no_color, atty::is(Stream::Stdout));
    if is_passthrough(&outcome.details) {
        println!("{}", outcome.message);
    } else {
        println!("{}", style.status(outcome.status, &outcome.message));
        if let Some(table) = render_snapshot_table(&style, &outcome.details) {
            println!("{table}");
        }
    }
    Ok(code)
}

fn causes(details: &Value) -> impl Iterator<Item = &str> {
    details
        .get("causes")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
}

fn is_passthrough(details: &Value) -> bool {
    details
        .as_object()
        .and_then(|map| map.get("passthrough"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

struct SnapshotRow {
    repo_id: String,
    content_id: String,
    files: String,
    size: String,
}

fn render_snapshot_table(style: &Style, details: &Value) -> Option<String> {
    let snapshots = details.get("snapshots")?.as_array()?;
    if snapshots.is_empty() {
        return None;
    }

    let mut rows = Vec::new();
    for snapshot in snapshots {
        let obj = snapshot.as_object()?;
        rows.push(SnapshotRow {
            repo_id: obj.get("repo_id")?.as_str()?.to_string(),
            content_id: obj.get("content_id")?.as_str()?.to_string(),
            files: obj.get("files")?.as_u64()?.to_string(),
            size: format_bytes(obj.get("size_bytes")?.as_u64()?),
        });
    }

    Some(format_snapshot_table(style, &rows))
}

fn format_snapshot_table(style: &Style, rows: &[SnapshotRow]) -> String {
    let headers = ["Repository", "Content id", "Files", "Size"];
    let mut widths = headers.map(str::len);
    for row in rows {
        widths[0] = widths[0].max(row.repo_id.len());
        widths[1] = widths[1].max(row.content_id.len());
        widths[2] = widths[2].max(row.files.len());
        widths[3] = widths[3].max(row.size.len());
    }

    let header_line = format!(
        "{:<w0$}  {:<w1$}  {:>w2$}  {:>w3$}",
        headers[0],
        headers[1],
        headers[2],
        headers[3],
        w0 = widths[0],
        w1 = widths[1],
        w2 = widths[2],
        w3 = widths[3],
    );

    let mut lines = vec![
        style.table_header(&header_line),
        format!(
            "{:-<w0$}  {:-<w1$}  {:-<w2$}  {:-<w3$}",
            "",
            "",
            "",
            "",
            w0 = widths[0],
            w1 = widths[1],
            w2 = widths[2],
            w3 = widths[3],
        ),
    ];
    for row in rows {
        lines.push(format!(
            "{:<w0$}  {:<w1$}  {:>w2$}  {:>w3$}",
            row.repo_id,
            row.content_id,
            row.files,
            row.size,
            w0 = widths[0],
            w1 = widths[1],
            w2 = widths[2],
            w3 = widths[3],
        ));
    }
    lines.join("\n")
}

#[allow(clippy::cast_precision_loss)]
fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}
