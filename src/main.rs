//! Bracket Lottery Client
//!
//! Command line entry point: deploy and watch a lottery on a node, play one
//! configured participant against it, or run a whole lottery on the simulated
//! ledger.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ethers::types::{Address, U256};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

use bracket_lottery::{
    config::PlayerConfig,
    ledger::{Ledger, SimConfig, TournamentContract, TxSignal},
    Config, EngineSupervisor, Participant, RpcLedger, SimulatedLedger, Timing, TournamentEngine,
    TournamentMonitor, VERSION,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Commit-reveal elimination lottery client")]
struct Cli {
    /// Configuration file (JSON); defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a configured participant and play the lottery to the end
    Player {
        /// Index into the configured player table
        #[arg(long)]
        id: usize,

        /// Lottery contract address
        #[arg(long, value_parser = parse_address)]
        lottery: Address,
    },

    /// Deploy a lottery from the configured advertiser and narrate it
    Start {
        /// Bracket levels; 2^levels participants are needed
        #[arg(long, default_value_t = 2)]
        levels: u32,

        /// Deposit in wei
        #[arg(long, default_value = "1000000000000000000")]
        deposit: String,
    },

    /// Narrate a lottery until it is won or refunded
    Monitor {
        /// Lottery contract address
        #[arg(long, value_parser = parse_address)]
        lottery: Address,
    },

    /// Deploy and play a whole lottery on an in-process simulated ledger
    Simulate {
        /// Bracket levels; 2^levels participants are needed
        #[arg(long, default_value_t = 2)]
        levels: u32,

        /// Participant index that never registers
        #[arg(long)]
        stall: Option<usize>,

        /// Deposit in wei
        #[arg(long, default_value = "1000000000000000000")]
        deposit: String,

        /// Divide every protocol timeout and cadence by this factor
        #[arg(long, default_value_t = 60)]
        time_scale: u32,
    },
}

fn parse_address(raw: &str) -> Result<Address, String> {
    raw.parse()
        .map_err(|e| format!("invalid address {:?}: {}", raw, e))
}

fn init_tracing(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;
    #[cfg(feature = "debug-tracing")]
    let filter = filter.add_directive(tracing::Level::DEBUG.into());

    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };
    init_tracing(&config.log_level)?;
    info!("Bracket lottery client v{}", VERSION);

    match cli.command {
        Command::Player { id, lottery } => play(&config, id, lottery).await,
        Command::Start { levels, deposit } => {
            let deposit = U256::from_dec_str(&deposit).context("deposit must be a decimal wei amount")?;
            start(&config, levels, deposit).await
        }
        Command::Monitor { lottery } => monitor(&config, lottery).await,
        Command::Simulate {
            levels,
            stall,
            deposit,
            time_scale,
        } => {
            let deposit = U256::from_dec_str(&deposit).context("deposit must be a decimal wei amount")?;
            simulate(&config, levels, stall, deposit, time_scale).await
        }
    }
}

async fn play(config: &Config, id: usize, lottery: Address) -> Result<()> {
    let player = config.player(id)?;
    let ledger = RpcLedger::connect(config.rpc_config())?;

    let levels = TournamentContract::new(ledger.clone(), lottery)
        .levels()
        .await
        .context("cannot read lottery levels")?;
    let secrets = Participant::random_secrets(&mut rand::thread_rng(), levels);
    let participant = player.participant(secrets);

    let mut engine = TournamentEngine::new(ledger, lottery, participant, config.gas, config.timing).await?;
    let outcome = engine.register_and_play().await?;
    println!("{}: {}", player.alias, outcome);
    Ok(())
}

/// Follow creation signals until the lottery address is known.
async fn deployed(mut signals: UnboundedReceiver<TxSignal>) -> Result<Address> {
    loop {
        match signals.recv().await {
            Some(TxSignal::TransactionHash(hash)) => {
                info!(tx = %hex::encode(hash), "Lottery creation broadcast")
            }
            Some(TxSignal::Mined(receipt)) => {
                if !receipt.success {
                    bail!("lottery creation reverted in block {}", receipt.block);
                }
                return receipt
                    .contract_address
                    .context("creation receipt carries no contract address");
            }
            None => bail!("lottery creation was dropped"),
        }
    }
}

async fn start(config: &Config, levels: u32, deposit: U256) -> Result<()> {
    let bytecode = config.bytecode()?;
    let ledger = RpcLedger::connect(config.rpc_config())?;

    let advertiser = &config.advertiser;
    ledger
        .unlock(advertiser.address, &advertiser.password)
        .await
        .context("cannot unlock the advertiser account")?;

    let signals = ledger
        .deploy_lottery(advertiser.address, &bytecode, levels, deposit, config.gas)
        .await?;
    let lottery = deployed(signals).await?;
    info!(?lottery, levels, %deposit, "Lottery deployed");
    println!("Lottery address: {:?}", lottery);

    let summary = TournamentMonitor::start(ledger, lottery).await?.run().await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn monitor(config: &Config, lottery: Address) -> Result<()> {
    let ledger = RpcLedger::connect(config.rpc_config())?;
    let summary = TournamentMonitor::start(ledger, lottery).await?.run().await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Player `index` of a simulated run. Configured players come first.
fn simulated_player(config: &Config, index: usize) -> PlayerConfig {
    match config.players.get(index) {
        Some(player) => player.clone(),
        None => PlayerConfig {
            alias: format!("Player{}", index),
            address: Address::from_low_u64_be(0x1_0000 + index as u64),
            password: String::new(),
            salt: index as u64 + 1,
        },
    }
}

async fn simulate(
    config: &Config,
    levels: u32,
    stall: Option<usize>,
    deposit: U256,
    time_scale: u32,
) -> Result<()> {
    let participants = 1usize
        .checked_shl(levels)
        .context("too many levels")?;
    let ledger = SimulatedLedger::new(SimConfig::scaled(time_scale));
    let timing = Timing::scaled(time_scale);
    let funds = deposit.saturating_mul(U256::from(10)) + U256::exp10(20);

    let advertiser = &config.advertiser;
    ledger.fund_account(advertiser.address, funds, &advertiser.password);
    ledger.unlock(advertiser.address, &advertiser.password).await?;

    let lottery = deployed(ledger.deploy_lottery(advertiser.address, levels, deposit)?).await?;
    info!(?lottery, levels, participants, "Lottery deployed");

    let watching = tokio::spawn(TournamentMonitor::start(ledger.clone(), lottery).await?.run());

    let supervisor = EngineSupervisor::new();
    for index in 0..participants {
        let player = simulated_player(config, index);
        if stall == Some(index) {
            warn!(alias = %player.alias, "Participant stalls and never registers");
            continue;
        }
        ledger.fund_account(player.address, funds, &player.password);

        let secrets = Participant::random_secrets(&mut rand::thread_rng(), levels);
        let engine = TournamentEngine::new(
            ledger.clone(),
            lottery,
            player.participant(secrets),
            config.gas,
            timing,
        )
        .await?;
        supervisor.spawn(Uuid::new_v4(), engine).await?;
    }

    let reports = supervisor.join_all().await;

    println!("=== Results ===");
    for report in &reports {
        match &report.result {
            Ok(outcome) => println!("{:<10} {}", report.alias, outcome),
            Err(err) => println!("{:<10} failed: {}", report.alias, err),
        }
    }

    let failed = reports.iter().filter(|r| r.result.is_err()).count();
    if failed > 0 {
        // The lottery cannot reach a terminal event without every engine
        watching.abort();
        bail!("{} participant run(s) failed", failed);
    }
    let summary = watching.await??;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
