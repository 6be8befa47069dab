use std::sync::Arc;

use clap::{CommandFactory, Parser};
use cyroid::{
    cli::{AnsiStyles, CyroidArgs, CyroidSubcommand, RangeDefinition},
    config::Settings,
    docker::{BollardConnector, BollardDocker},
    orchestration::{Orchestrator, RangeOverview, SqliteEventSink},
    store::SqliteStore,
    utils::default_db_path,
    validator::ValidationResult,
    CyroidResult,
};
use tracing_subscriber::{fmt, EnvFilter};

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> CyroidResult<()> {
    dotenvy::dotenv().ok();

    let args = CyroidArgs::parse();

    // Initialize tracing subscriber with EnvFilter
    let filter = if args.verbose {
        EnvFilter::new("cyroid=debug")
    } else {
        EnvFilter::from_default_env()
    };
    fmt()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .with_env_filter(filter)
        .init();

    let Some(subcommand) = args.subcommand else {
        CyroidArgs::command().print_help()?;
        return Ok(());
    };

    let settings = Settings::load(args.config.as_deref()).await?;
    let db_path = args.db.unwrap_or_else(default_db_path);
    tracing::debug!("opening range database: path={db_path:?}");
    let store = SqliteStore::open(&db_path).await?;

    if let CyroidSubcommand::Create { file } = &subcommand {
        tracing::trace!("creating range: file={file:?}");
        let records = RangeDefinition::load(file).await?.into_records()?;
        records.save(&store).await?;
        println!(
            "{} {} ({} networks, {} vms)",
            "created".valid(),
            records.range.id.to_string().literal(),
            records.networks.len(),
            records.vms.len()
        );
        return Ok(());
    }

    let orchestrator = Orchestrator::new(
        settings,
        Arc::new(BollardDocker::connect_local()?),
        Arc::new(BollardConnector::default()),
        Arc::new(store.clone()),
        Arc::new(SqliteEventSink::spawn(store)),
    );

    match subcommand {
        CyroidSubcommand::Create { .. } => (),
        CyroidSubcommand::Deploy { range } => {
            tracing::trace!("deploying range: range={range}");
            let report = orchestrator.deploy_range(range).await?;
            print!("{report}");
        }
        CyroidSubcommand::Start { range } => {
            let range = orchestrator.start_range(range).await?;
            println!("{} is {}", range.name.literal(), range.status.to_string().valid());
        }
        CyroidSubcommand::Stop { range } => {
            let range = orchestrator.stop_range(range).await?;
            println!("{} is {}", range.name.literal(), range.status.to_string().valid());
        }
        CyroidSubcommand::Teardown { range } => {
            let range = orchestrator.teardown_range(range).await?;
            println!("{} is {}", range.name.literal(), range.status.to_string().valid());
        }
        CyroidSubcommand::Validate { range, json } => {
            let result = orchestrator.validator().validate_range(range).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_validation(&result);
            }
        }
        CyroidSubcommand::Status { range: Some(range) } => {
            print_overview(&orchestrator.describe_range(range).await?);
        }
        CyroidSubcommand::Status { range: None } => {
            for range in orchestrator.store().list_ranges().await? {
                println!(
                    "{}  {:<24} {}",
                    range.id.to_string().literal(),
                    range.name,
                    range.status.as_str()
                );
            }
        }
        CyroidSubcommand::Sandboxes => {
            for sandbox in orchestrator.dind().list_range_containers().await? {
                let ip = sandbox
                    .management_ip
                    .map(|ip| ip.to_string())
                    .unwrap_or_else(|| "-".into());
                let state = if sandbox.running {
                    "running".valid()
                } else {
                    "stopped".invalid()
                };
                println!(
                    "{}  {:<40} {:<15} {}",
                    sandbox.range_id.to_string().literal(),
                    sandbox.container_name,
                    ip,
                    state
                );
            }
        }
        CyroidSubcommand::Vnc { vm } => match orchestrator.ensure_vnc_mapping(vm).await? {
            Some(mapping) => println!(
                "{}:{} (console port {})",
                mapping.proxy_host, mapping.proxy_port, mapping.original_port
            ),
            None => println!("{}", "no console is forwarded for this vm".invalid()),
        },
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: *
//--------------------------------------------------------------------------------------------------

fn print_validation(result: &ValidationResult) {
    for error in &result.errors {
        println!("{} {error}", "error:".error());
    }
    for warning in &result.warnings {
        println!("{} {warning}", "warning:".placeholder());
    }
    for info in &result.info {
        println!("{info}");
    }

    if result.valid {
        println!("{}", "range is deployable".valid());
    } else {
        println!("{}", "range is not deployable".invalid());
    }
}

fn print_overview(overview: &RangeOverview) {
    let range = &overview.range;
    println!("{} {} ({})", "range".header(), range.name, range.status);
    if let Some(error) = &range.error_message {
        println!("  {} {error}", "error:".error());
    }
    if let Some(sandbox) = &range.sandbox {
        println!(
            "  sandbox {} at {}",
            sandbox.container_name, sandbox.management_ip
        );
    }
    if let Some(router) = &overview.router {
        println!("  router {}", router.status);
    }

    println!("{}", "networks".header());
    for network in &overview.networks {
        let interface = network.vyos_interface.as_deref().unwrap_or("-");
        println!(
            "  {:<16} {:<18} {:<6} internet={} dhcp={}",
            network.name,
            network.subnet.to_string(),
            interface,
            network.internet_enabled,
            network.dhcp_enabled
        );
    }

    println!("{}", "vms".header());
    for vm in &overview.vms {
        let console = range
            .vnc_proxy_mappings
            .get(&vm.id)
            .map(|m| format!("{}:{}", m.proxy_host, m.proxy_port))
            .unwrap_or_else(|| "-".into());
        println!(
            "  {:<16} {:<15} {:<8} {}",
            vm.hostname, vm.ip_address.to_string(), vm.status.as_str(), console
        );
    }
}
