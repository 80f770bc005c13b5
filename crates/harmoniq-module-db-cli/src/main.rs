use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use harmoniq_module_db::{HandleInfo, ModuleDatabase, ModuleDbConfig, ModuleRecord, ModuleType};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "harmoniq-module-db", about = "Inspect and load Harmoniq processing modules")]
struct Args {
    /// JSON configuration listing built-in modules and loader sizes
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Extra dynamic module as ID:TYPE:PATH:TAG (ids and types accept 0x prefixes)
    #[arg(long = "module", value_name = "SPEC", value_parser = parse_module)]
    modules: Vec<ModuleRecord>,

    /// Override the number of loader threads
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every registered module
    List,
    /// Load modules in one batch, report the outcome and release them
    Load {
        #[arg(value_name = "ID", value_parser = parse_id, required = true)]
        ids: Vec<u32>,
    },
    /// Query a module's version from its static properties
    Version {
        #[arg(value_name = "ID", value_parser = parse_id)]
        id: u32,
    },
    /// Print the effective configuration
    Config,
}

fn parse_id(value: &str) -> Result<u32, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|err| format!("invalid id {value}: {err}"))
}

fn parse_module(value: &str) -> Result<ModuleRecord, String> {
    let mut parts = value.splitn(4, ':');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(id), Some(module_type), Some(path), Some(tag)) => Ok(ModuleRecord::dynamic(
            ModuleType(parse_id(module_type)?),
            parse_id(id)?,
            path,
            tag,
        )),
        _ => Err(format!("expected ID:TYPE:PATH:TAG, got {value}")),
    }
}

#[derive(Debug, Serialize)]
struct LoadReport {
    module_id: u32,
    ok: bool,
    error: Option<String>,
    dynamic: bool,
    fallback: bool,
    version: Option<(u32, u32)>,
}

impl LoadReport {
    fn from_info(info: &HandleInfo) -> Self {
        let handle = info.handle.as_ref();
        let version = handle
            .and_then(|handle| handle.static_properties().ok())
            .map(|props| (props.version_major, props.version_minor));
        Self {
            module_id: info.module_id,
            ok: info.result.is_ok(),
            error: info.result.as_ref().err().map(ToString::to_string),
            dynamic: handle.map_or(false, |handle| handle.is_dynamic()),
            fallback: handle.map_or(false, |handle| handle.is_fallback()),
            version,
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<ModuleDbConfig> {
    let mut config = match &args.config {
        Some(path) => ModuleDbConfig::load(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => ModuleDbConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.worker_threads = workers;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let args = Args::parse();
    let config = load_config(&args)?;

    if let Command::Config = args.command {
        println!("{}", config.to_json_string()?);
        return Ok(());
    }

    let db = ModuleDatabase::new(config)?;
    for (record, result) in args
        .modules
        .iter()
        .zip(db.register_custom_modules(&args.modules))
    {
        if let Err(err) = result {
            bail!("module 0x{:X}: {err}", record.module_id);
        }
    }

    let mut failed = false;
    match &args.command {
        Command::List => {
            let infos: Vec<_> = db
                .module_ids()
                .into_iter()
                .filter_map(|id| db.module_info(id))
                .collect();
            if args.json {
                println!("{}", serde_json::to_string_pretty(&infos)?);
            } else {
                for info in infos {
                    let source = info
                        .source_path
                        .as_ref()
                        .map(|path| path.display().to_string())
                        .unwrap_or_else(|| if info.is_static { "static".into() } else { "-".into() });
                    println!(
                        "0x{:08X}  type {:>2}  {:?}{}  {}",
                        info.module_id,
                        info.module_type.0,
                        info.interface_type,
                        if info.is_built_in { " (built-in)" } else { "" },
                        source
                    );
                }
            }
        }
        Command::Load { ids } => {
            let mut batch = db.request_handles(ids);
            let reports: Vec<_> = batch.iter().map(LoadReport::from_info).collect();
            db.release_handles(&mut batch);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                for report in &reports {
                    match (&report.error, report.version) {
                        (Some(error), _) => println!("0x{:08X}  failed: {error}", report.module_id),
                        (None, version) => println!(
                            "0x{:08X}  ok{}{}{}",
                            report.module_id,
                            if report.dynamic { " dynamic" } else { " static" },
                            if report.fallback { " (fallback)" } else { "" },
                            version
                                .map(|(major, minor)| format!(" v{major}.{minor}"))
                                .unwrap_or_default()
                        ),
                    }
                }
            }
            failed = reports.iter().any(|report| !report.ok);
        }
        Command::Version { id } => {
            let version = db.module_version(*id)?;
            if args.json {
                println!("{}", serde_json::to_string(&version)?);
            } else {
                println!("{}.{}", version.major, version.minor);
            }
        }
        Command::Config => {}
    }

    if failed {
        drop(db);
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn ids_accept_hex_and_decimal() {
        assert_eq!(parse_id("0x07001000"), Ok(0x0700_1000));
        assert_eq!(parse_id("42"), Ok(42));
        assert!(parse_id("0xZZ").is_err());
    }

    #[test]
    fn module_spec_needs_four_fields() {
        let record = parse_module("0x1000:3:/lib/foo.so:foo").unwrap();
        assert_eq!(record.module_id, 0x1000);
        assert_eq!(record.module_type, ModuleType::DECODER);
        assert_eq!(record.source_path.as_deref(), Some(Path::new("/lib/foo.so")));
        assert_eq!(record.tag.as_deref(), Some("foo"));
        assert!(parse_module("0x1000:3:/lib/foo.so").is_err());
    }
}
