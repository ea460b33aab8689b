//! Shared test helpers: an in-memory datagram network so two hosts can
//! run the full protocol deterministically, with loss, duplication, and
//! reordering under test control.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use lanes::{Event, Host, Socket};

type Datagram = (Vec<u8>, SocketAddr);

#[derive(Default)]
struct NetworkInner {
    inboxes: HashMap<SocketAddr, VecDeque<Datagram>>,
    /// Datagrams still to drop, per (from, to) link.
    drop_plan: HashMap<(SocketAddr, SocketAddr), usize>,
    /// Deliver every datagram twice.
    duplicate: bool,
}

/// A hub connecting any number of [`TestSocket`]s by address.
#[derive(Clone, Default)]
pub struct TestNetwork {
    inner: Rc<RefCell<NetworkInner>>,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket at `addr` and hand it out for `Host::with_socket`.
    pub fn socket(&self, addr: &str) -> Box<dyn Socket> {
        let addr: SocketAddr = addr.parse().expect("socket addr");
        self.inner.borrow_mut().inboxes.insert(addr, VecDeque::new());
        Box::new(TestSocket {
            addr,
            inner: self.inner.clone(),
        })
    }

    /// Drop the next `count` datagrams flowing from `from` to `to`.
    pub fn drop_next(&self, from: &str, to: &str, count: usize) {
        let from = from.parse().expect("from addr");
        let to = to.parse().expect("to addr");
        self.inner.borrow_mut().drop_plan.insert((from, to), count);
    }

    /// Deliver every subsequent datagram twice.
    pub fn set_duplicate(&self, duplicate: bool) {
        self.inner.borrow_mut().duplicate = duplicate;
    }

    /// Reverse the undelivered datagrams queued at `addr`.
    pub fn reorder_pending(&self, addr: &str) {
        let addr: SocketAddr = addr.parse().expect("addr");
        let mut inner = self.inner.borrow_mut();
        if let Some(inbox) = inner.inboxes.get_mut(&addr) {
            let reversed: VecDeque<Datagram> = inbox.drain(..).rev().collect();
            *inbox = reversed;
        }
    }
}

struct TestSocket {
    addr: SocketAddr,
    inner: Rc<RefCell<NetworkInner>>,
}

impl Socket for TestSocket {
    fn send_to(&mut self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let mut inner = self.inner.borrow_mut();

        if let Some(remaining) = inner.drop_plan.get_mut(&(self.addr, target)) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(buf.len());
            }
        }

        let duplicate = inner.duplicate;
        let from = self.addr;
        if let Some(inbox) = inner.inboxes.get_mut(&target) {
            inbox.push_back((buf.to_vec(), from));
            if duplicate {
                inbox.push_back((buf.to_vec(), from));
            }
        }
        Ok(buf.len())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let mut inner = self.inner.borrow_mut();
        let inbox = inner.inboxes.get_mut(&self.addr).expect("registered socket");
        match inbox.pop_front() {
            Some((data, from)) => {
                let length = data.len().min(buf.len());
                buf[..length].copy_from_slice(&data[..length]);
                Ok(Some((length, from)))
            }
            None => Ok(None),
        }
    }

    fn wait(&mut self, timeout_ms: u32) -> io::Result<bool> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        loop {
            {
                let inner = self.inner.borrow();
                if !inner.inboxes[&self.addr].is_empty() {
                    return Ok(true);
                }
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

/// Service both hosts once, collecting every event with a host tag.
pub fn pump_once(a: &mut Host, b: &mut Host, events: &mut Vec<(char, Event)>) {
    while let Some(event) = a.service(0).expect("service a") {
        events.push(('a', event));
    }
    while let Some(event) = b.service(0).expect("service b") {
        events.push(('b', event));
    }
}

/// Service both hosts until `done` or the iteration budget runs out,
/// sleeping a millisecond per round so timers advance.
pub fn pump_until(
    a: &mut Host,
    b: &mut Host,
    events: &mut Vec<(char, Event)>,
    iterations: usize,
    mut done: impl FnMut(&[(char, Event)]) -> bool,
) {
    for _ in 0..iterations {
        pump_once(a, b, events);
        if done(events) {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Drive two hosts through the handshake, returning the peer ids
/// (connector's view, acceptor's view).
pub fn establish(
    connector: &mut Host,
    acceptor: &mut Host,
    acceptor_addr: &str,
    channel_count: usize,
    data: u32,
) -> (lanes::PeerId, lanes::PeerId) {
    let peer = connector
        .connect(acceptor_addr.parse().expect("addr"), channel_count, data)
        .expect("connect");

    let mut events = Vec::new();
    pump_until(connector, acceptor, &mut events, 50, |events| {
        events.iter().filter(|(_, e)| matches!(e, Event::Connect { .. })).count() >= 2
    });

    let accepted = events
        .iter()
        .find_map(|(host, event)| match event {
            Event::Connect { peer, .. } if *host == 'b' => Some(*peer),
            _ => None,
        })
        .expect("acceptor connect event");

    (peer, accepted)
}
