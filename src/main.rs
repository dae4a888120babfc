//! # tbload - Main Entry Point
//!
//! Dispatches the four subcommands:
//! - `init`: provision test devices on ThingsBoard and record them locally
//! - `info`: show the local store
//! - `run`: drive the MQTT publish load test and report the results
//! - `clean`: delete the provisioned devices and the local store
//!
//! Run reports go to stdout whatever the log level. Runtime errors are logged
//! and end the process with status 1; usage errors are reported by clap with
//! status 2.

use anyhow::{Context, Result};
use clap::Parser;
use tbload::cli::{Args, Command, InfoArgs, InitArgs, RunArgs};
use tbload::client::{ClientOptions, MqttClient};
use tbload::provision::{self, TenantClient};
use tbload::results::write_report;
use tbload::runner::{LoadRunner, RunConfig};
use tbload::store::{DeviceStore, InitInfo};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let guard = match tbload::logging::init_tracing(
        args.verbose,
        args.quiet,
        !args.no_color,
        args.log_file.as_deref(),
    ) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = dispatch(args).await {
        error!("{:#}", e);
        // flush the file writer before exiting
        drop(guard);
        std::process::exit(1);
    }
}

async fn dispatch(args: Args) -> Result<()> {
    let store = DeviceStore::open(&args.store)
        .with_context(|| format!("opening store {}", args.store.display()))?;

    match args.command {
        Command::Init(init) => init_command(store, init).await,
        Command::Info(opts) => info_command(&store, opts),
        Command::Run(run) => run_command(store, run).await,
        Command::Clean => clean_command(store).await,
    }
}

async fn init_command(mut store: DeviceStore, args: InitArgs) -> Result<()> {
    let mut client = TenantClient::new(&args.server_host, &args.username, &args.password);
    client.login().await.context("login failed")?;

    store.save_init_info(&InitInfo {
        server_host: client.base_url().to_string(),
        username: args.username.clone(),
        password: args.password.clone(),
        device_num: args.device_num,
    })?;

    info!("provisioning {} devices...", args.device_num);
    let saved = provision::provision_devices(&client, &mut store, args.device_num).await?;
    info!("init complete: {} devices saved to {}", saved, store.path().display());
    Ok(())
}

fn info_command(store: &DeviceStore, args: InfoArgs) -> Result<()> {
    match store.init_info() {
        Ok(init) => {
            info!("Server Host: {}", init.server_host);
            info!("Username:    {}", init.username);
            info!("Device Num:  {}", init.device_num);
        }
        Err(e) => warn!("{}", e),
    }

    if args.detail {
        for (key, value) in store.entries() {
            info!("{} = {}", key, value);
        }
    }

    if args.summary {
        match store.summary()? {
            Some(summary) => {
                info!("Last run {} at {}", summary.run_id, summary.timestamp);
                write_report(&mut std::io::stdout().lock(), &summary)?;
            }
            None => info!("no run summary saved yet"),
        }
    }
    Ok(())
}

async fn run_command(mut store: DeviceStore, args: RunArgs) -> Result<()> {
    let config = RunConfig::from_args(&args)?;
    let runner = LoadRunner::new(config);

    let outcome = runner
        .run(&store, |device, broker| {
            MqttClient::new(ClientOptions::new(
                &device.client_id,
                &device.auth_token,
                broker.clone(),
            ))
        })
        .await?;

    let summary = outcome
        .summary
        .with_context(|| format!("{} results collected", outcome.results.len()))?;
    write_report(&mut std::io::stdout().lock(), &summary)?;
    store.save_summary(&summary)?;
    Ok(())
}

async fn clean_command(store: DeviceStore) -> Result<()> {
    let init = store.init_info()?;
    let mut client = TenantClient::new(&init.server_host, &init.username, &init.password);
    client.login().await.context("login failed")?;

    let deleted = provision::clean_devices(&client, store).await?;
    info!("clean complete: {} devices deleted", deleted);
    Ok(())
}
