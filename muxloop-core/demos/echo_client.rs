//! Echo client example for Muxloop.
//!
//! Opens several connections from one dispatcher, sends a message on each
//! and stops once every echo has come back.
//!
//! Usage: `cargo run --example echo_client [addr] [connections]`

use anyhow::Context;
use muxloop_core::config::ServerConfig;
use muxloop_core::dispatch::{Ctx, Dispatcher, Handler};
use muxloop_core::logging;
use muxloop_core::net::{CloseReason, Connection};
use std::net::SocketAddr;
use std::time::Instant;

const MESSAGE: &[u8] = b"hello from muxloop";

/// Tracks echoed bytes per connection.
struct Client {
    remaining: usize,
}

impl Handler for Client {
    type Context = (Instant, usize);

    fn on_connect(&mut self, conn: &mut Connection<Self::Context>, _ctx: &mut Ctx<'_, Self::Context>) {
        conn.attach((Instant::now(), 0));
        conn.send(MESSAGE);
    }

    fn on_data(
        &mut self,
        conn: &mut Connection<Self::Context>,
        data: &[u8],
        _ctx: &mut Ctx<'_, Self::Context>,
    ) -> usize {
        let done = match conn.attachment_mut() {
            Some((started, received)) => {
                *received += data.len();
                (*received >= MESSAGE.len()).then(|| started.elapsed())
            }
            None => None,
        };
        if let Some(elapsed) = done {
            println!("{}: echo after {:?}", conn.id(), elapsed);
            conn.close();
        }
        data.len()
    }

    fn on_close(
        &mut self,
        conn: &mut Connection<Self::Context>,
        reason: &CloseReason,
        ctx: &mut Ctx<'_, Self::Context>,
    ) {
        if !matches!(reason, CloseReason::Local) {
            println!("{}: {}", conn.id(), reason);
        }
        self.remaining -= 1;
        if self.remaining == 0 {
            ctx.stop();
        }
    }
}

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let addr: SocketAddr = args
        .next()
        .unwrap_or_else(|| "127.0.0.1:7878".to_string())
        .parse()
        .context("invalid address")?;
    let connections: usize = args
        .next()
        .map(|n| n.parse())
        .transpose()
        .context("invalid connection count")?
        .unwrap_or(8);

    let config = ServerConfig::default();
    logging::init(&config.logging);

    let mut dispatcher = Dispatcher::new(config, Client { remaining: 0 })?;
    for _ in 0..connections {
        match dispatcher.connect(addr) {
            Ok(_) => dispatcher.handler_mut().remaining += 1,
            Err(err) => eprintln!("connect to {addr} failed: {err}"),
        }
    }
    if dispatcher.handler().remaining == 0 {
        anyhow::bail!("no connection could be started");
    }

    dispatcher.run()?;
    Ok(())
}
