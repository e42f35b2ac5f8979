//! Echo server example for Muxloop.
//!
//! Echoes every byte back to its sender and logs how much each connection
//! transferred when it closes.
//!
//! Usage: `cargo run --example echo_server [config.toml]`

use anyhow::Context;
use muxloop_core::config::ServerConfig;
use muxloop_core::dispatch::{Ctx, Dispatcher, Handler};
use muxloop_core::logging;
use muxloop_core::net::{CloseReason, Connection};

/// Per-connection byte counter.
struct Echo;

impl Handler for Echo {
    type Context = u64;

    fn on_connect(&mut self, conn: &mut Connection<u64>, _ctx: &mut Ctx<'_, u64>) {
        conn.attach(0);
    }

    fn on_data(&mut self, conn: &mut Connection<u64>, data: &[u8], _ctx: &mut Ctx<'_, u64>) -> usize {
        conn.send(data);
        if let Some(total) = conn.attachment_mut() {
            *total += data.len() as u64;
        }
        data.len()
    }

    fn on_close(&mut self, conn: &mut Connection<u64>, reason: &CloseReason, _ctx: &mut Ctx<'_, u64>) {
        let total = conn.take_attachment().unwrap_or_default();
        println!("{} closed ({}), echoed {} bytes", conn.id(), reason, total);
    }
}

fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::from_file(&path).with_context(|| format!("loading {path}"))?,
        None => ServerConfig::default(),
    };
    logging::init(&config.logging);

    let mut dispatcher = Dispatcher::new(config, Echo).context("creating dispatcher")?;
    let addr = dispatcher.bind().context("binding listener")?;
    println!("Echo server listening on {addr}");

    dispatcher.run().context("dispatcher failed")?;
    Ok(())
}
