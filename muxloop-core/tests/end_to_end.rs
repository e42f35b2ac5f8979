//! End-to-end tests over loopback sockets, using only the public API.

use muxloop_core::config::ServerConfig;
use muxloop_core::dispatch::{Ctx, Dispatcher, DispatcherHandle, Handler};
use muxloop_core::net::{CloseReason, ConnId, Connection};
use muxloop_core::poll::{Multiplexer, PollMultiplexer};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

fn test_config() -> ServerConfig {
    ServerConfig {
        port: 0,
        poll_timeout_ms: 20,
        shutdown_grace_ms: 500,
        ..ServerConfig::default()
    }
}

fn client(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
}

/// Runs a bound dispatcher on its own thread; the handler is returned on join.
fn spawn<H>(mut dispatcher: Dispatcher<H>) -> (DispatcherHandle, JoinHandle<H>)
where
    H: Handler + Send + 'static,
    H::Context: Send,
{
    let handle = dispatcher.handle();
    let thread = std::thread::spawn(move || {
        dispatcher.run().unwrap();
        dispatcher.into_handler()
    });
    (handle, thread)
}

/// Drives `dispatcher` on the current thread until `done` holds.
fn run_until<H: Handler>(dispatcher: &mut Dispatcher<H>, mut done: impl FnMut(&Dispatcher<H>) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done(dispatcher) {
        assert!(Instant::now() < deadline, "dispatcher did not reach the expected state");
        assert!(dispatcher.run_once().unwrap());
    }
}

#[derive(Default)]
struct Echo {
    connected: usize,
    closed: Vec<String>,
}

impl Handler for Echo {
    type Context = ();

    fn on_connect(&mut self, _conn: &mut Connection<()>, _ctx: &mut Ctx<'_, ()>) {
        self.connected += 1;
    }

    fn on_data(&mut self, conn: &mut Connection<()>, data: &[u8], _ctx: &mut Ctx<'_, ()>) -> usize {
        conn.send(data);
        data.len()
    }

    fn on_close(&mut self, _conn: &mut Connection<()>, reason: &CloseReason, _ctx: &mut Ctx<'_, ()>) {
        self.closed.push(reason.to_string());
    }
}

#[test]
fn test_ping_is_echoed() {
    let mut dispatcher = Dispatcher::new(test_config(), Echo::default()).unwrap();
    let addr = dispatcher.bind().unwrap();
    assert_eq!(dispatcher.local_addrs(), vec![addr]);
    let (handle, thread) = spawn(dispatcher);

    let mut stream = client(addr);
    stream.write_all(b"ping").unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");

    drop(stream);
    // Let the dispatcher observe the close before stopping.
    std::thread::sleep(Duration::from_millis(100));
    handle.stop();

    let echo = thread.join().unwrap();
    assert_eq!(echo.connected, 1);
    assert_eq!(echo.closed, vec!["peer closed the connection".to_string()]);
}

#[test]
fn test_half_closed_clients_get_their_echo() {
    let mut dispatcher = Dispatcher::new(test_config(), Echo::default()).unwrap();
    let addr = dispatcher.bind().unwrap();
    let (handle, thread) = spawn(dispatcher);

    for _ in 0..20 {
        let mut stream = client(addr);
        stream.write_all(b"ping").unwrap();
        stream.shutdown(Shutdown::Write).unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"ping");
    }

    handle.stop();
    let echo = thread.join().unwrap();
    assert_eq!(echo.connected, 20);
    assert_eq!(echo.closed.len(), 20);
    assert!(echo.closed.iter().all(|r| r == "peer closed the connection"));
}

/// Never consumes anything, so its buffer fills and reading is parked.
#[derive(Default)]
struct Hoarder {
    ids: Vec<ConnId>,
    closed: Vec<String>,
}

impl Handler for Hoarder {
    type Context = ();

    fn on_connect(&mut self, conn: &mut Connection<()>, _ctx: &mut Ctx<'_, ()>) {
        self.ids.push(conn.id());
    }

    fn on_data(&mut self, _conn: &mut Connection<()>, _data: &[u8], _ctx: &mut Ctx<'_, ()>) -> usize {
        0
    }

    fn on_close(&mut self, _conn: &mut Connection<()>, reason: &CloseReason, _ctx: &mut Ctx<'_, ()>) {
        self.closed.push(reason.to_string());
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
#[test]
fn test_saturated_connection_sees_peer_close() {
    let config = ServerConfig {
        buffer_capacity: 4,
        ..test_config()
    };
    let mut dispatcher = Dispatcher::new(config, Hoarder::default()).unwrap();
    let addr = dispatcher.bind().unwrap();

    let mut stream = client(addr);
    stream.write_all(b"hello").unwrap();

    run_until(&mut dispatcher, |d| {
        d.handler()
            .ids
            .first()
            .and_then(|&id| d.connection(id))
            .map_or(false, |conn| conn.registered_interest().is_empty())
    });

    drop(stream);
    run_until(&mut dispatcher, |d| d.connection_count() == 0);
    assert_eq!(dispatcher.handler().closed, vec!["peer closed the connection".to_string()]);
}

/// Waits for five-byte frames and grows its buffer when a frame does not fit.
#[derive(Default)]
struct Frames {
    seen: Vec<Vec<u8>>,
}

impl Handler for Frames {
    type Context = ();

    fn on_data(&mut self, conn: &mut Connection<()>, data: &[u8], _ctx: &mut Ctx<'_, ()>) -> usize {
        self.seen.push(data.to_vec());
        if data.len() < 5 {
            conn.reserve_inbound(8);
            return 0;
        }
        conn.send(&data[..5]);
        5
    }
}

#[test]
fn test_frame_larger_than_buffer() {
    let config = ServerConfig {
        buffer_capacity: 4,
        ..test_config()
    };
    let mut dispatcher = Dispatcher::new(config, Frames::default()).unwrap();
    let addr = dispatcher.bind().unwrap();
    let (handle, thread) = spawn(dispatcher);

    let mut stream = client(addr);
    stream.write_all(b"hello").unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");

    handle.stop();
    let frames = thread.join().unwrap();

    // The first delivery is capped by the 4-byte buffer; unconsumed bytes
    // are kept and handed back with the fifth.
    assert!(frames.seen[0].len() <= 4);
    assert!(b"hello".starts_with(&frames.seen[0]));
    assert_eq!(frames.seen.last().unwrap(), b"hello");
}

#[test]
fn test_backlog_of_one_accepts_all_pending() {
    let config = ServerConfig {
        backlog: 1,
        ..test_config()
    };
    let mut dispatcher = Dispatcher::new(config, Echo::default()).unwrap();
    let addr = dispatcher.bind().unwrap();

    // Both connects complete before the dispatcher accepts anything.
    let mut first = client(addr);
    let mut second = client(addr);

    let (handle, thread) = spawn(dispatcher);

    for (stream, byte) in [(&mut first, b'a'), (&mut second, b'b')] {
        stream.write_all(&[byte]).unwrap();
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(buf[0], byte);
    }

    handle.stop();
    assert_eq!(thread.join().unwrap().connected, 2);
}

#[test]
fn test_idle_wait_times_out() {
    let mut mux = PollMultiplexer::new();
    let mut events = Vec::new();

    let start = Instant::now();
    mux.wait(&mut events, Some(Duration::from_millis(100))).unwrap();
    let elapsed = start.elapsed();

    assert!(events.is_empty());
    assert!(elapsed >= Duration::from_millis(90), "returned after {elapsed:?}");

    let config = ServerConfig {
        poll_timeout_ms: 100,
        ..test_config()
    };
    let mut dispatcher = Dispatcher::new(config, Echo::default()).unwrap();
    let start = Instant::now();
    assert!(dispatcher.run_once().unwrap());
    assert!(dispatcher.run_once().unwrap());
    assert!(start.elapsed() >= Duration::from_millis(180));
    assert_eq!(dispatcher.connection_count(), 0);
}

/// Greets every connection it makes and records how each one ended.
#[derive(Default)]
struct Greeter {
    established: Vec<ConnId>,
    failures: Vec<ConnId>,
}

impl Handler for Greeter {
    type Context = ();

    fn on_connect(&mut self, conn: &mut Connection<()>, _ctx: &mut Ctx<'_, ()>) {
        self.established.push(conn.id());
        conn.send(b"hi");
        conn.close();
    }

    fn on_data(&mut self, _conn: &mut Connection<()>, data: &[u8], _ctx: &mut Ctx<'_, ()>) -> usize {
        data.len()
    }

    fn on_close(&mut self, conn: &mut Connection<()>, reason: &CloseReason, ctx: &mut Ctx<'_, ()>) {
        if matches!(reason, CloseReason::ConnectFailed(_)) {
            self.failures.push(conn.id());
        }
        if ctx.connection_count() == 0 {
            ctx.stop();
        }
    }
}

#[test]
fn test_outgoing_connections() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let refused = {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap()
    };

    let mut dispatcher = Dispatcher::new(test_config(), Greeter::default()).unwrap();
    let good = dispatcher.connect(listener.local_addr().unwrap()).unwrap();
    // Loopback may refuse synchronously; otherwise the failure arrives as readiness.
    let bad = dispatcher.connect(refused).ok();

    let (_handle, thread) = spawn(dispatcher);

    let (mut peer, _) = listener.accept().unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut greeting = Vec::new();
    peer.read_to_end(&mut greeting).unwrap();
    assert_eq!(greeting, b"hi");

    let greeter = thread.join().unwrap();
    assert_eq!(greeter.established, vec![good]);
    assert_eq!(greeter.failures, bad.into_iter().collect::<Vec<_>>());
}

/// Publishes connection ids so the test can address them from outside.
struct Registry {
    ids: Arc<Mutex<Vec<ConnId>>>,
}

impl Handler for Registry {
    type Context = ();

    fn on_connect(&mut self, conn: &mut Connection<()>, _ctx: &mut Ctx<'_, ()>) {
        self.ids.lock().unwrap().push(conn.id());
    }

    fn on_data(&mut self, _conn: &mut Connection<()>, data: &[u8], _ctx: &mut Ctx<'_, ()>) -> usize {
        data.len()
    }
}

#[test]
fn test_handle_sends_from_another_thread() {
    let ids = Arc::new(Mutex::new(Vec::new()));
    let mut dispatcher = Dispatcher::new(test_config(), Registry { ids: Arc::clone(&ids) }).unwrap();
    let addr = dispatcher.bind().unwrap();
    let (handle, thread) = spawn(dispatcher);

    let mut stream = client(addr);
    let deadline = Instant::now() + Duration::from_secs(5);
    let id = loop {
        if let Some(id) = ids.lock().unwrap().first().copied() {
            break id;
        }
        assert!(Instant::now() < deadline, "connection never registered");
        std::thread::sleep(Duration::from_millis(5));
    };

    handle.send(id, b"pushed".to_vec()).unwrap();
    let mut buf = [0u8; 6];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"pushed");

    handle.close(id).unwrap();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    handle.stop();
    thread.join().unwrap();
}

/// Serves a file to every client, then closes.
struct FileServer {
    path: std::path::PathBuf,
}

impl Handler for FileServer {
    type Context = ();

    fn on_connect(&mut self, conn: &mut Connection<()>, _ctx: &mut Ctx<'_, ()>) {
        let file = std::fs::File::open(&self.path).unwrap();
        conn.send(b"HEAD");
        conn.send_file(&file).unwrap();
        conn.close();
    }

    fn on_data(&mut self, _conn: &mut Connection<()>, data: &[u8], _ctx: &mut Ctx<'_, ()>) -> usize {
        data.len()
    }
}

#[test]
fn test_file_is_sent_after_queued_bytes() {
    let path = std::env::temp_dir().join(format!("muxloop-e2e-{}.bin", std::process::id()));
    let contents: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, &contents).unwrap();

    let mut dispatcher = Dispatcher::new(test_config(), FileServer { path: path.clone() }).unwrap();
    let addr = dispatcher.bind().unwrap();
    let (handle, thread) = spawn(dispatcher);

    let mut stream = client(addr);
    let mut received = Vec::new();
    stream.read_to_end(&mut received).unwrap();

    assert_eq!(&received[..4], b"HEAD");
    assert_eq!(&received[4..], &contents[..]);

    handle.stop();
    thread.join().unwrap();
    std::fs::remove_file(&path).unwrap();
}
