use colored::Colorize;

use am_gateway::GatewayConfig;
use am_topology::PlacementTable;
use am_types::TableVersion;

use crate::cli::*;
use crate::cluster::{check_report, run_demo, tables, DemoReport};

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    match cli.command {
        Command::Demo(args) => cmd_demo(config, args, cli.format).await,
        Command::Topology(args) => cmd_topology(args, cli.format),
        Command::Config(args) => cmd_config(config, args),
    }
}

async fn cmd_demo(config: GatewayConfig, args: DemoArgs, format: OutputFormat) -> anyhow::Result<()> {
    let report = run_demo(config, args).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_report(&report),
    }
    check_report(&report)
}

fn print_report(report: &DemoReport) {
    println!(
        "{} {} writes ({} bytes) across {} blobs on {} nodes in {} ms",
        "✓".green().bold(),
        report.writes.to_string().bold(),
        report.bytes_written,
        report.blobs.len(),
        report.nodes,
        report.elapsed_ms
    );
    println!(
        "  Object size: {}  DLT: {}  DMT: {}",
        report.object_size,
        format!("v{}", report.dlt_version).cyan(),
        format!("v{}", report.dmt_version).cyan()
    );
    for retired in &report.retired {
        println!("  Retired: {}", retired.yellow());
    }
    for blob in &report.blobs {
        let status = if blob.verified { "verified".green() } else { "MISMATCH".red().bold() };
        println!(
            "  {:<10} {:>8} bytes {:>4} objects  {}",
            blob.name, blob.size, blob.objects, status
        );
    }
}

fn cmd_topology(args: TopologyArgs, format: OutputFormat) -> anyhow::Result<()> {
    let (dlt, dmt) = tables(&args.cluster, TableVersion(1), 0)?;
    if format == OutputFormat::Json {
        let value = serde_json::json!({
            "dlt": { "version": dlt.version().0, "width_bits": dlt.width_bits(), "columns": dlt.columns() },
            "dmt": { "version": dmt.version().0, "columns": dmt.columns() },
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }
    println!("{} {} ({} columns)", "DLT".bold(), dlt.version(), dlt.columns().len());
    for (index, column) in dlt.columns().iter().enumerate() {
        println!("  {:>4}  {}", index, join(column));
    }
    println!("{} {} ({} columns)", "DMT".bold(), dmt.version(), dmt.columns().len());
    for (index, column) in dmt.columns().iter().enumerate() {
        println!("  {:>4}  {}", index, join(column));
    }
    Ok(())
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ")
}

fn cmd_config(config: GatewayConfig, args: ConfigArgs) -> anyhow::Result<()> {
    match args.action {
        ConfigAction::Show => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        ConfigAction::Check { path } => {
            let checked = GatewayConfig::load(&path)?;
            println!(
                "{} {} is valid (object size {}, policy {:?})",
                "✓".green().bold(),
                path.display(),
                checked.object_size,
                checked.replica_policy()
            );
            Ok(())
        }
    }
}
