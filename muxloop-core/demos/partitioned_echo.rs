//! Partitioned echo server example for Muxloop.
//!
//! Runs one dispatcher per worker thread on a shared port, then stops
//! them all after a fixed time.
//!
//! Usage: `cargo run --example partitioned_echo [seconds]`

use muxloop_core::arch::{run_partitioned, RuntimeMode};
use muxloop_core::config::{LoggingConfig, ServerConfig};
use muxloop_core::dispatch::{Ctx, Handler};
use muxloop_core::logging;
use muxloop_core::net::Connection;
use std::time::Duration;

struct Echo {
    partition: usize,
}

impl Handler for Echo {
    type Context = ();

    fn on_connect(&mut self, conn: &mut Connection<()>, _ctx: &mut Ctx<'_, ()>) {
        println!("partition {} took {}", self.partition, conn.id());
    }

    fn on_data(&mut self, conn: &mut Connection<()>, data: &[u8], _ctx: &mut Ctx<'_, ()>) -> usize {
        conn.send(data);
        data.len()
    }
}

fn main() -> anyhow::Result<()> {
    let seconds: u64 = std::env::args()
        .nth(1)
        .map(|s| s.parse())
        .transpose()?
        .unwrap_or(30);

    let config = ServerConfig {
        logging: LoggingConfig {
            thread_names: true,
            ..LoggingConfig::default()
        },
        ..ServerConfig::default()
    };
    logging::init(&config.logging);

    let mode = RuntimeMode::detect();
    println!("Runtime mode: {}", mode.description());

    let partitions = run_partitioned(config, mode, |partition| Echo { partition })?;
    println!(
        "{} partitions listening on {} for {}s",
        partitions.len(),
        partitions.local_addr(),
        seconds
    );

    std::thread::sleep(Duration::from_secs(seconds));
    partitions.stop();
    partitions.join()?;
    println!("All partitions stopped");
    Ok(())
}
