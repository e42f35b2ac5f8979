//! File server example for Muxloop.
//!
//! Sends the given file to every client straight from a memory mapping,
//! prefixed with its length, then closes the connection.
//!
//! Usage: `cargo run --example send_file <path>`

use anyhow::Context;
use muxloop_core::config::ServerConfig;
use muxloop_core::dispatch::{Ctx, Dispatcher, Handler};
use muxloop_core::logging;
use muxloop_core::net::{CloseReason, Connection};
use std::fs::File;
use std::path::PathBuf;
use tracing::warn;

struct FileServer {
    path: PathBuf,
}

impl Handler for FileServer {
    type Context = ();

    fn on_connect(&mut self, conn: &mut Connection<()>, _ctx: &mut Ctx<'_, ()>) {
        let queued = File::open(&self.path).and_then(|file| {
            let len = file.metadata()?.len();
            conn.send(&len.to_be_bytes());
            conn.send_file(&file)
        });
        if let Err(err) = queued {
            warn!(conn = %conn.id(), error = %err, "cannot send file");
        }
        conn.close();
    }

    fn on_data(&mut self, _conn: &mut Connection<()>, data: &[u8], _ctx: &mut Ctx<'_, ()>) -> usize {
        data.len()
    }

    fn on_close(&mut self, conn: &mut Connection<()>, reason: &CloseReason, _ctx: &mut Ctx<'_, ()>) {
        println!("{} done: {}", conn.id(), reason);
    }
}

fn main() -> anyhow::Result<()> {
    let path: PathBuf = std::env::args()
        .nth(1)
        .context("usage: send_file <path>")?
        .into();
    anyhow::ensure!(path.is_file(), "{} is not a file", path.display());

    let config = ServerConfig::default();
    logging::init(&config.logging);

    let mut dispatcher = Dispatcher::new(config, FileServer { path })?;
    let addr = dispatcher.bind()?;
    println!("Serving file on {addr}");
    dispatcher.run()?;
    Ok(())
}
