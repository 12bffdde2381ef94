// Copyright (c) 2024-present Inferlay contributors.
// Licensed under the Apache License, Version 2.0.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "inferlay-node")]
#[command(version, about = "Inferlay marketplace operator node", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize operator configuration and generate key material
    Init(InitArgs),
    /// Start the operator
    Start(StartArgs),
    /// Generate a new operator keypair
    Keygen(KeygenArgs),
    /// Display version information
    Version(VersionArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct InitArgs {
    /// Config file path
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Data directory path
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Overwrite existing config/keypair
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct StartArgs {
    /// Config file path
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Data directory override
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Ledger GraphQL endpoint override
    #[arg(long)]
    pub gateway_url: Option<String>,
    /// Ledger raw-data endpoint override
    #[arg(long)]
    pub data_url: Option<String>,
    /// Bundler endpoint override
    #[arg(long)]
    pub bundler_url: Option<String>,
    /// Poll interval in seconds
    #[arg(long)]
    pub poll_interval: Option<u64>,
    /// Ignore requests below this block height
    #[arg(long)]
    pub start_block: Option<u64>,
    /// Disable secondary-chain fee distribution
    #[arg(long, default_value_t = false)]
    pub disable_settlement: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct KeygenArgs {
    /// Output path for the keypair
    #[arg(long)]
    pub output: Option<PathBuf>,
    /// Display the derived ledger address after generation
    #[arg(long, default_value_t = false)]
    pub show_address: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct VersionArgs {
    /// Show detailed build information
    #[arg(long, default_value_t = false)]
    pub verbose: bool,
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}
