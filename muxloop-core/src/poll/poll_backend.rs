//! Level-triggered readiness backend built on `poll(2)`.

use super::{Event, Interest, Multiplexer, Ready, Token};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;
use tracing::trace;

/// Requested for registrations with empty interest. The kernel always
/// reports `POLLHUP` and `POLLERR`; on Linux `POLLRDHUP` also surfaces a
/// peer that only sent FIN.
#[cfg(any(target_os = "linux", target_os = "android"))]
const PARKED_EVENTS: libc::c_short = libc::POLLRDHUP;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const PARKED_EVENTS: libc::c_short = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const HANGUP_EVENTS: libc::c_short = libc::POLLHUP | libc::POLLRDHUP;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const HANGUP_EVENTS: libc::c_short = libc::POLLHUP;

/// Registration bookkeeping parallel to the `pollfd` array.
#[derive(Debug, Clone, Copy)]
struct Registration {
    fd: RawFd,
    interest: Interest,
    token: Token,
}

/// A [`Multiplexer`] backed by `poll(2)`.
///
/// Readiness is level-triggered: a descriptor that still has unread data
/// is reported again on the next wait without new traffic.
pub struct PollMultiplexer {
    /// Array handed to the kernel. Entries with empty interest are still
    /// polled, but only for hang-up and error.
    pollfds: Vec<libc::pollfd>,

    /// Same order as `pollfds`.
    registrations: Vec<Registration>,

    /// Descriptor to array index.
    index: HashMap<RawFd, usize>,
}

impl Default for PollMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl PollMultiplexer {
    /// Creates an empty multiplexer.
    pub fn new() -> Self {
        Self {
            pollfds: Vec::new(),
            registrations: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Interest currently registered for `fd`.
    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.index.get(&fd).map(|&i| self.registrations[i].interest)
    }

    fn to_pollfd(fd: RawFd, interest: Interest) -> libc::pollfd {
        let mut events: libc::c_short = 0;
        if interest.is_readable() || interest.is_acceptable() {
            events |= libc::POLLIN;
        }
        if interest.is_writable() {
            events |= libc::POLLOUT;
        }
        if interest.is_empty() {
            events = PARKED_EVENTS;
        }

        libc::pollfd {
            fd,
            events,
            revents: 0,
        }
    }

    fn to_ready(revents: libc::c_short, interest: Interest) -> Ready {
        let mut ready = Ready::EMPTY;
        if revents & libc::POLLIN != 0 {
            if interest.is_acceptable() {
                ready = ready | Ready::ACCEPTABLE;
            }
            if interest.is_readable() {
                ready = ready | Ready::READABLE;
            }
        }
        if revents & libc::POLLOUT != 0 && interest.is_writable() {
            ready = ready | Ready::WRITABLE;
        }
        if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            ready = ready | Ready::ERROR;
        }
        if revents & HANGUP_EVENTS != 0 {
            ready = ready | Ready::HANGUP;
        }
        ready
    }
}

/// Converts a timeout to whole milliseconds, rounding up so that a short
/// non-zero timeout does not turn into a busy poll.
fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if Duration::from_millis(ms as u64) < d {
                ms += 1;
            }
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

impl Multiplexer for PollMultiplexer {
    fn register(&mut self, fd: RawFd, interest: Interest, token: Token) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot register a negative descriptor",
            ));
        }

        let registration = Registration {
            fd,
            interest,
            token,
        };

        match self.index.get(&fd) {
            Some(&i) => {
                self.pollfds[i] = Self::to_pollfd(fd, interest);
                self.registrations[i] = registration;
            }
            None => {
                self.index.insert(fd, self.registrations.len());
                self.pollfds.push(Self::to_pollfd(fd, interest));
                self.registrations.push(registration);
            }
        }

        trace!(fd, ?interest, token = token.0, "registered descriptor");
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let Some(i) = self.index.remove(&fd) else {
            return Ok(());
        };

        self.pollfds.swap_remove(i);
        self.registrations.swap_remove(i);
        if let Some(moved) = self.registrations.get(i) {
            self.index.insert(moved.fd, i);
        }

        trace!(fd, "deregistered descriptor");
        Ok(())
    }

    fn wait(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();

        let rc = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms(timeout),
            )
        };

        if rc < 0 {
            let err = io::Error::last_os_error();
            // A signal cut the wait short; treat it like an empty tick.
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        if rc == 0 {
            return Ok(());
        }

        for (pfd, reg) in self.pollfds.iter_mut().zip(&self.registrations) {
            if pfd.revents == 0 {
                continue;
            }
            let ready = Self::to_ready(pfd.revents, reg.interest);
            pfd.revents = 0;
            if !ready.is_empty() {
                events.push(Event {
                    token: reg.token,
                    ready,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;
    use std::time::Instant;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_timeout_ms_rounds_up() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_ms(Some(Duration::from_micros(10))), 1);
        assert_eq!(timeout_ms(Some(Duration::from_millis(100))), 100);
    }

    #[test]
    fn test_wait_times_out_empty() {
        let mut mux = PollMultiplexer::new();
        let mut events = Vec::new();

        let start = Instant::now();
        mux.wait(&mut events, Some(Duration::from_millis(100))).unwrap();
        let elapsed = start.elapsed();

        assert!(events.is_empty());
        assert!(elapsed >= Duration::from_millis(90), "returned after {elapsed:?}");
    }

    #[test]
    fn test_register_update_and_deregister() {
        let (a, b) = connected_pair();
        let mut mux = PollMultiplexer::new();

        mux.register(a.as_raw_fd(), Interest::READABLE, Token(1)).unwrap();
        mux.register(b.as_raw_fd(), Interest::READABLE, Token(2)).unwrap();
        mux.register(a.as_raw_fd(), Interest::WRITABLE, Token(1)).unwrap();
        assert_eq!(mux.len(), 2);
        assert_eq!(mux.interest(a.as_raw_fd()), Some(Interest::WRITABLE));

        mux.deregister(a.as_raw_fd()).unwrap();
        mux.deregister(a.as_raw_fd()).unwrap();
        assert_eq!(mux.len(), 1);
        assert_eq!(mux.interest(b.as_raw_fd()), Some(Interest::READABLE));

        // Never registered: still fine.
        mux.deregister(9999).unwrap();
    }

    #[test]
    fn test_level_triggered_readiness() {
        let (mut client, server) = connected_pair();
        let mut mux = PollMultiplexer::new();
        mux.register(server.as_raw_fd(), Interest::READABLE, Token(7)).unwrap();

        client.write_all(b"ping").unwrap();

        let mut events = Vec::new();
        for _ in 0..2 {
            mux.wait(&mut events, Some(Duration::from_secs(1))).unwrap();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].token, Token(7));
            assert!(events[0].ready.is_readable());
        }
    }

    #[test]
    fn test_empty_interest_is_parked() {
        let (mut client, server) = connected_pair();
        let mut mux = PollMultiplexer::new();
        mux.register(server.as_raw_fd(), Interest::NONE, Token(3)).unwrap();

        client.write_all(b"ignored").unwrap();

        let mut events = Vec::new();
        mux.wait(&mut events, Some(Duration::from_millis(20))).unwrap();
        assert!(events.is_empty());
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_empty_interest_still_reports_hangup() {
        let (mut client, server) = connected_pair();
        let mut mux = PollMultiplexer::new();
        mux.register(server.as_raw_fd(), Interest::NONE, Token(6)).unwrap();

        client.write_all(b"unread").unwrap();
        drop(client);

        let mut events = Vec::new();
        mux.wait(&mut events, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token, Token(6));
        assert!(events[0].ready.is_hangup());
        assert!(!events[0].ready.is_readable());
    }

    #[test]
    fn test_invalid_descriptor_reported_as_error() {
        let (client, _server) = connected_pair();
        let mut mux = PollMultiplexer::new();

        // Far above anything this process has open.
        let stale: RawFd = 999_999;
        mux.register(stale, Interest::READABLE, Token(4)).unwrap();
        mux.register(client.as_raw_fd(), Interest::WRITABLE, Token(5)).unwrap();

        let mut events = Vec::new();
        mux.wait(&mut events, Some(Duration::from_secs(1))).unwrap();

        let stale_event = events.iter().find(|e| e.token == Token(4)).unwrap();
        assert!(stale_event.ready.is_error());
        assert!(events.iter().any(|e| e.token == Token(5) && e.ready.is_writable()));
    }
}
