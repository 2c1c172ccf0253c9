//! Gekko Miner
//!
//! Drives one BM1387 chain against a simulated chip bus with synthetic work.

use std::future::pending;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use crossbeam::channel::{Receiver, Sender, unbounded};
use gekko_miner::{
    config::{Args, Config},
    core::{Submit, Target, Work},
    device::{DeviceRegistry, SimulatedChain},
    error::{Error, Result},
    utils::{self, format_difficulty},
};
use tracing::{error, info, warn};

/// Version bits pools commonly allow to roll
const VERSION_ROLLING_MASK: u32 = 0x1fff_e000;

/// Interval between metrics reports
const METRICS_INTERVAL: Duration = Duration::from_secs(30);

const COINBASE1: &str = "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff2003";
const COINBASE2: &str = "ffffffff0100f2052a010000001976a914000000000000000000000000000000000000000088ac00000000";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_args(&args)?;

    if args.print_config {
        let rendered = toml::to_string_pretty(&config)
            .map_err(|e| Error::config(format!("Failed to serialize config: {}", e)))?;
        println!("{}", rendered);
        return Ok(());
    }

    utils::init_logging(&config.logging.level, &config.logging.format);
    info!("Starting Gekko Miner v{}", gekko_miner::VERSION);

    let settings = config.device.chain_settings();
    let (vendor, product) = settings.model.usb_id();
    info!(
        serial = %settings.serial,
        product = settings.model.product(),
        usb_id = %format!("{:04x}:{:04x}", vendor, product),
        "simulating device"
    );
    let chain = SimulatedChain::new(settings.expected_chips)
        .with_nonce_probability(config.simulation.nonce_probability);

    let registry = DeviceRegistry::new();
    let controller = registry.claim(settings, Arc::new(chain))?;

    let bring_up = Arc::clone(&controller);
    tokio::task::spawn_blocking(move || bring_up.reset())
        .await
        .map_err(|e| Error::other(format!("Bring-up task failed: {}", e)))??;
    info!(
        serial = %controller.serial(),
        chips = controller.chip_count().unwrap_or_default(),
        frequency = controller.frequency().unwrap_or_default(),
        "device running"
    );

    let (submit_tx, submit_rx) = unbounded();
    spawn_submit_logger(submit_rx)?;

    let mut work_timer =
        tokio::time::interval(Duration::from_secs(config.simulation.work_interval_secs));
    let mut metrics_timer = tokio::time::interval(METRICS_INTERVAL);
    metrics_timer.tick().await;

    let run_for = args.run_for.map(Duration::from_secs);
    let deadline = async move {
        match run_for {
            Some(duration) => tokio::time::sleep(duration).await,
            None => pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut jobs: u64 = 0;
    loop {
        tokio::select! {
            _ = work_timer.tick() => {
                jobs += 1;
                let work = synthetic_work(jobs, config.simulation.share_difficulty, submit_tx.clone())?;
                let delivered = registry.update_work(&work);
                if delivered == 0 {
                    warn!(job_id = %work.job_id, "no device accepted work");
                }
            }

            _ = metrics_timer.tick() => {
                controller.metrics().log_metrics(&controller.context());
                if registry.is_empty() {
                    error!(serial = %controller.serial(), "device retired, stopping");
                    break;
                }
            }

            _ = &mut deadline => {
                info!("Run time elapsed");
                break;
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    registry.close_all();
    controller.metrics().log_metrics(&controller.context());
    info!("Gekko Miner stopped");
    Ok(())
}

/// Build a fresh job with a random previous hash
fn synthetic_work(sequence: u64, difficulty: f64, submit: Sender<Submit>) -> Result<Work> {
    let coinbase1 = hex::decode(COINBASE1)
        .map_err(|e| Error::other(format!("Bad coinbase template: {}", e)))?;
    let coinbase2 = hex::decode(COINBASE2)
        .map_err(|e| Error::other(format!("Bad coinbase template: {}", e)))?;
    let ntime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default();

    let work = Work::new(
        format!("{:x}", sequence),
        rand::random::<[u8; 32]>(),
        coinbase1,
        coinbase2,
        0x2000_0000,
        0x1705_ae3a,
        ntime,
        Target::from_difficulty(difficulty)?,
        submit,
    )
    .with_extranonce(vec![0x08, 0x00, 0x00, 0x2a], 4)
    .with_version_rolling(VERSION_ROLLING_MASK);

    info!(job_id = %work.job_id, difficulty = %format_difficulty(difficulty), "new work");
    Ok(work)
}

/// Log shares as the pool layer would receive them
fn spawn_submit_logger(submits: Receiver<Submit>) -> Result<()> {
    std::thread::Builder::new()
        .name("submit-log".to_string())
        .spawn(move || {
            while let Ok(submit) = submits.recv() {
                info!(
                    job_id = %submit.job_id,
                    extranonce2 = %format!("{:08x}", submit.extranonce2),
                    ntime = %format!("{:08x}", submit.ntime),
                    nonce = %format!("{:08x}", submit.nonce),
                    version_mask = %format!("{:08x}", submit.version_mask),
                    "submit"
                );
            }
        })?;
    Ok(())
}
