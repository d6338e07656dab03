use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sparsebcd_rs::cluster::LocalCluster;
use sparsebcd_rs::config::{ConfigOverrides, LearnerConfig, LearnerOverrides, ServerOverrides};
use sparsebcd_rs::reader::LibsvmOpener;
use sparsebcd_rs::updater::dump_model_file;
use sparsebcd_rs::JobKind;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage:
  sparsebcd_local [train] [--config FILE] [--data-in PATH] [--data-val PATH]
                  [--epochs N] [--workers N] [--sync] [--model-out PATH] [--report PATH]
  sparsebcd_local dump --model-in PATH [--name-dump PATH] [--aux] [--reverse]";

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn overrides() -> anyhow::Result<ConfigOverrides> {
    let learner = LearnerOverrides {
        data_in: parse_arg("--data-in"),
        data_val: parse_arg("--data-val"),
        max_num_epochs: parse_arg("--epochs").map(|v| v.parse()).transpose()?,
        model_out: parse_arg("--model-out").map(PathBuf::from),
    };
    let server = ServerOverrides {
        sync_mode: has_flag("--sync").then_some(true),
        num_workers: parse_arg("--workers").map(|v| v.parse()).transpose()?,
    };
    Ok(ConfigOverrides {
        learner: Some(learner),
        server: Some(server),
    })
}

fn train() -> anyhow::Result<()> {
    let config = LearnerConfig::load(parse_arg("--config").as_deref(), overrides()?)?;
    let cluster = LocalCluster::start(config, Arc::new(LibsvmOpener))?;
    let result = cluster.run();
    let stats = cluster.shutdown();
    let report = result?;

    for (epoch, m) in report.metrics(JobKind::Train).iter().enumerate() {
        println!(
            "epoch {epoch}: train objective {:.6} accuracy {:.4} ({} examples)",
            m.mean_objective(),
            m.accuracy(),
            m.num_examples
        );
    }
    for (epoch, m) in report.metrics(JobKind::Validate).iter().enumerate() {
        println!(
            "epoch {epoch}: validation objective {:.6} accuracy {:.4}",
            m.mean_objective(),
            m.accuracy()
        );
    }
    if let Some(stats) = stats {
        println!(
            "server: {} pulls, {} async pushes, {} sync rounds, {} rejected",
            stats.pulls, stats.async_pushes, stats.flushes, stats.rejected
        );
    }
    if let Some(path) = parse_arg("--report") {
        fs::write(&path, serde_json::to_string_pretty(&report)?)?;
    }
    Ok(())
}

fn dump() -> anyhow::Result<()> {
    let model_in = parse_arg("--model-in").ok_or_else(|| anyhow::anyhow!("--model-in is required"))?;
    let name_dump = parse_arg("--name-dump")
        .unwrap_or_else(|| sparsebcd_rs::config::DEFAULT_NAME_DUMP.to_string());
    dump_model_file(
        Path::new(&model_in),
        Path::new(&name_dump),
        has_flag("--aux"),
        has_flag("--reverse"),
    )?;
    println!("wrote {name_dump}");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match std::env::args().nth(1).as_deref() {
        Some("dump") => dump(),
        Some("--help") | Some("-h") => {
            println!("{USAGE}");
            Ok(())
        }
        _ => train(),
    }
}
