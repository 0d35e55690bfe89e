use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use sizeflow_core::{OrderId, PhoneNumber};
use sizeflow_infra::{Config, Dispatcher, SizingDefaults, SqliteStore, TickReport, WorkflowEngine};
use sizeflow_observability::LogFormat;
use sizeflow_sizing::{Gender, RecommendationEngine};

mod cli;
use cli::{Cli, Command, EnrollArgs, RecommendArgs, TickArgs, WatchArgs};

#[tokio::main]
async fn main() -> ExitCode {
    sizeflow_observability::init_with(LogFormat::Text);
    let cli = Cli::parse();

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> Result<()> {
    match command {
        // Offline: only the chart defaults are read.
        Command::Recommend(args) => {
            let defaults = SizingDefaults::from_env().context("loading sizing defaults")?;
            recommend(&defaults, args)
        }
        command => run_with_store(command).await,
    }
}

async fn run_with_store(command: Command) -> Result<()> {
    let config = Config::from_env().context("loading configuration")?;
    match command {
        Command::Migrate => {
            open_store(&config).await?;
            println!("schema is up to date");
            Ok(())
        }
        Command::Enroll(args) => enroll(&config, args).await,
        Command::Tick(args) => tick(&config, args).await,
        Command::Watch(args) => watch(&config, args).await,
        Command::Recommend(args) => {
            let defaults = SizingDefaults {
                gender: config.default_gender,
                product: config.default_product.clone(),
            };
            recommend(&defaults, args)
        }
    }
}

async fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening database {}", config.database_url))?;
    store.migrate().await.context("applying migrations")?;
    Ok(Arc::new(store))
}

async fn build_engine(config: &Config) -> Result<WorkflowEngine> {
    let store = open_store(config).await?;
    let mode = config.dispatch_mode().context("configuring outbound dispatch")?;
    let dispatcher = Dispatcher::new(store.clone(), mode, config.dispatcher_config());
    Ok(WorkflowEngine::new(
        store,
        dispatcher,
        RecommendationEngine::default(),
        config.engine_config(),
    ))
}

async fn enroll(config: &Config, args: EnrollArgs) -> Result<()> {
    let order_id = OrderId::new(&args.order_id).context("--order-id")?;
    let phone = PhoneNumber::parse(&args.phone).context("--phone")?;
    let engine = build_engine(config).await?;

    let created = engine
        .enroll(order_id.clone(), phone.clone(), args.name, args.store)
        .await
        .context("enrolling order")?;
    if created {
        println!("enrolled order {order_id} ({phone})");
    } else {
        println!("order {order_id} already enrolled; contact details updated");
    }
    Ok(())
}

async fn tick(config: &Config, args: TickArgs) -> Result<()> {
    let engine = build_engine(config).await?;
    let report = engine.tick().await.context("processing batch")?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }
    Ok(())
}

async fn watch(config: &Config, args: WatchArgs) -> Result<()> {
    let engine = build_engine(config).await?;
    let mut interval = tokio::time::interval(Duration::from_secs(args.interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tracing::info!(interval_secs = args.interval_secs, "watching");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted; stopping");
                return Ok(());
            }
            _ = interval.tick() => {
                let report = engine.tick().await.context("processing batch")?;
                print_summary(&report);
            }
        }
    }
}

fn recommend(defaults: &SizingDefaults, args: RecommendArgs) -> Result<()> {
    let (gender, product) = chart_selection(defaults, &args)?;
    let recommendation =
        RecommendationEngine::default().recommend(args.height, args.weight, gender, &product, args.age);
    println!("{}", serde_json::to_string_pretty(&recommendation)?);
    Ok(())
}

fn chart_selection(defaults: &SizingDefaults, args: &RecommendArgs) -> Result<(Gender, String)> {
    let gender = match args.gender.as_deref() {
        Some(raw) => raw.parse::<Gender>().context("--gender")?,
        None => defaults.gender,
    };
    let product = args.product.clone().unwrap_or_else(|| defaults.product.clone());
    Ok((gender, product))
}

fn print_summary(report: &TickReport) {
    println!(
        "processed={} advanced={} unchanged={} send_failures={} failed={} lost_races={}",
        report.processed,
        report.advanced,
        report.unchanged,
        report.send_failures,
        report.failed,
        report.lost_races
    );
    for (state, count) in &report.states {
        println!("{:<18} {count}", state.as_str());
    }
}
