use clap::Parser;
use exiprobe::{Args, ChannelOutcome, Probe};
use std::sync::Arc;
use tracing::info;

fn main() {
    // Parse command-line arguments
    let args = Args::parse();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(2);
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let bus = match args.build_bus() {
        Ok(bus) => Arc::new(bus),
        Err(e) => {
            eprintln!("Failed to set up the EXI bus: {}", e);
            std::process::exit(2);
        }
    };

    let probe = Probe::new(bus, args.to_probe_config());

    info!("=== Probing Memory Cards ===");
    let report = match probe.run() {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Bus error: {}", e);
            std::process::exit(2);
        }
    };

    info!("=== Probe Complete ===");
    for (channel, outcome) in &report.channels {
        match outcome {
            ChannelOutcome::NotAttached => info!("{}: empty", channel),
            ChannelOutcome::UndefinedGeometry { id, index } => eprintln!(
                "{}: card id {:#06x} has undefined sector size class {}",
                channel, id, index
            ),
            ChannelOutcome::Unresponsive { waited } => {
                eprintln!("{}: card did not respond within {:?}", channel, waited)
            }
            ChannelOutcome::Completed(card) => {
                info!("{}: {}", channel, card.geometry);
                for speed in &card.speeds {
                    if speed.matches {
                        info!("{} @ {}: read back matches", channel, speed.speed);
                    } else {
                        eprintln!("{} @ {}: read back differs", channel, speed.speed);
                    }
                }
            }
        }
    }
    info!("Elapsed: {:?}", report.elapsed);

    let exit_code = if report.passed() {
        info!("PASS: every attached card round-tripped its page");
        0
    } else {
        1
    };

    std::process::exit(exit_code);
}
