// Copyright (c) 2024-present Inferlay contributors.
// Licensed under the Apache License, Version 2.0.

mod cli;
mod config;
mod keypair;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ledger::http::LedgerEndpoints;
use ledger::{HttpLedgerGateway, LedgerGateway};
use operator::{
    Coordinator, CoordinatorConfig, FeeDistributor, HttpInferenceBackend, HttpSettlementGateway,
    InferenceBackend, Publisher, WorkerContext,
};
use tracing::info;

fn main() -> Result<()> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = crate::cli::parse_cli();

    match &cli.command {
        crate::cli::Commands::Init(args) => {
            let config_path = args
                .config
                .clone()
                .unwrap_or_else(crate::config::NodeConfiguration::default_config_path);

            let mut cfg = crate::config::NodeConfiguration::default();
            cfg = cfg.merge_with_env();
            cfg = cfg.merge_with_cli(&cli);

            if !args.force {
                if config_path.exists() {
                    return Err(anyhow!(
                        "config file already exists: {} (use --force to overwrite)",
                        config_path.display()
                    ));
                }
                if crate::keypair::keypair_exists(&cfg.keypair_path) {
                    return Err(anyhow!(
                        "keypair already exists: {} (use --force to overwrite)",
                        cfg.keypair_path.display()
                    ));
                }
            }

            std::fs::create_dir_all(&cfg.data_dir).with_context(|| {
                format!("failed to create data_dir: {}", cfg.data_dir.display())
            })?;

            let kp = crate::keypair::OperatorKeypair::generate();
            crate::keypair::save_keypair(&kp, &cfg.keypair_path)?;

            cfg.save_to_file(&config_path)?;

            println!(
                "init complete: config_path={}, data_dir={}, operator_address={}",
                config_path.display(),
                cfg.data_dir.display(),
                kp.address()
            );
        }
        crate::cli::Commands::Start(args) => {
            let config_path = args
                .config
                .clone()
                .unwrap_or_else(crate::config::NodeConfiguration::default_config_path);

            let mut cfg = if config_path.exists() {
                let loaded = crate::config::NodeConfiguration::load_from_file(&config_path)?;
                println!("loaded config: {}", config_path.display());
                loaded
            } else {
                println!(
                    "config not found; using defaults: {}",
                    config_path.display()
                );
                crate::config::NodeConfiguration::default()
            };

            cfg = cfg.merge_with_env();
            cfg = cfg.merge_with_cli(&cli);
            cfg.validate()?;

            let kp = if crate::keypair::keypair_exists(&cfg.keypair_path) {
                crate::keypair::load_keypair(&cfg.keypair_path)?
            } else {
                let kp = crate::keypair::OperatorKeypair::generate();
                crate::keypair::save_keypair(&kp, &cfg.keypair_path)?;
                kp
            };

            run_operator(cfg, kp).await?;
        }
        crate::cli::Commands::Keygen(args) => {
            let kp = crate::keypair::OperatorKeypair::generate();

            let out = args
                .output
                .clone()
                .unwrap_or_else(|| PathBuf::from("operator_keypair.bin"));
            crate::keypair::save_keypair(&kp, &out)?;

            if args.show_address {
                println!("generated keypair: address={}", kp.address());
            }
        }
        crate::cli::Commands::Version(args) => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            if args.verbose {
                let git_commit = option_env!("GIT_COMMIT").unwrap_or("unknown");
                let build_date = option_env!("BUILD_DATE").unwrap_or("unknown");
                let rustc_version = option_env!("RUSTC_VERSION").unwrap_or("unknown");
                println!("git_commit: {git_commit}");
                println!("build_date: {build_date}");
                println!("rustc: {rustc_version}");
            }
        }
    }

    Ok(())
}

async fn run_operator(
    cfg: crate::config::NodeConfiguration,
    kp: crate::keypair::OperatorKeypair,
) -> Result<()> {
    let operator_address = kp.address();
    info!(
        address = %operator_address,
        sealing_key = %BASE64.encode(kp.sealing_public().as_bytes()),
        "operator identity loaded"
    );

    let gateway: Arc<dyn LedgerGateway> = Arc::new(
        HttpLedgerGateway::new(LedgerEndpoints {
            graphql_url: cfg.ledger.gateway_url.clone(),
            data_url: cfg.ledger.data_url.clone(),
            bundler_url: cfg.ledger.bundler_url.clone(),
        })
        .map_err(|e| anyhow!("ledger gateway setup failed: {e}"))?,
    );

    let registrations =
        operator::registration::discover(gateway.as_ref(), &operator_address, &cfg.services)
            .await
            .context("registration discovery failed")?;
    info!(count = registrations.len(), "registrations discovered");

    let backend: Arc<dyn InferenceBackend> = Arc::new(
        HttpInferenceBackend::new().map_err(|e| anyhow!("backend client setup failed: {e}"))?,
    );
    let publisher = Publisher::new(
        Arc::clone(&gateway),
        operator_address.clone(),
        cfg.ledger.registrar_node.clone(),
    );

    let distributor = match &cfg.settlement {
        Some(settlement) => {
            let settlement_gateway =
                HttpSettlementGateway::new(settlement.url.clone(), operator_address.clone())
                    .map_err(|e| anyhow!("settlement gateway setup failed: {e}"))?;
            Some(Arc::new(FeeDistributor::new(
                Arc::new(settlement_gateway),
                operator_address.clone(),
                cfg.marketplace_address.clone(),
            )))
        }
        None => None,
    };

    let worker = Arc::new(WorkerContext {
        gateway: Arc::clone(&gateway),
        backend,
        publisher,
        operator_address: operator_address.clone(),
        marketplace_address: cfg.marketplace_address.clone(),
        settlement: distributor.clone(),
        sealing_secret: Some(kp.sealing_secret()),
    });

    let mut coordinator = Coordinator::new(
        gateway,
        worker,
        distributor,
        registrations,
        operator_address,
        CoordinatorConfig {
            poll_interval: Duration::from_secs(cfg.poll_interval_secs),
            start_block: cfg.start_block,
        },
    );

    tokio::select! {
        _ = coordinator.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}
