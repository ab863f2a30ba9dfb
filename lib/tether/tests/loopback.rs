//! End-to-end exercises: two complete link stacks wired back to back
//! through an in-memory byte transport, driven tick by tick with a
//! simulated clock.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tether::prelude::*;

#[derive(Clone, Default)]
struct Trace {
    events: Rc<RefCell<Vec<String>>>,
    data: Rc<RefCell<Vec<Vec<u8>>>>,
}

impl Trace {
    fn events(&self) -> Vec<String> {
        self.events.borrow().clone()
    }

    fn data(&self) -> Vec<Vec<u8>> {
        self.data.borrow().clone()
    }

    fn saw(&self, label: &str) -> bool {
        self.events.borrow().iter().any(|event| event == label)
    }

    fn record(&self, event: &ChannelEvent<'_>) {
        let label = match event {
            ChannelEvent::Start => "start",
            ChannelEvent::End => "end",
            ChannelEvent::ServerFailed => "server-failed",
            ChannelEvent::ServerConnected => "server-connected",
            ChannelEvent::ServerDisconnected => "server-disconnected",
            ChannelEvent::ServerData(data) => {
                self.data.borrow_mut().push(data.to_vec());
                "server-data"
            }
            ChannelEvent::ClientConnected => "client-connected",
            ChannelEvent::ClientDisconnected => "client-disconnected",
            ChannelEvent::ClientData(data) => {
                self.data.borrow_mut().push(data.to_vec());
                "client-data"
            }
            ChannelEvent::Idle => return,
        };
        self.events.borrow_mut().push(label.to_string());
    }
}

/// Server side handler: echoes every received message back to the client.
struct EchoServer {
    trace: Trace,
}

impl EchoServer {
    fn new(trace: &Trace) -> Box<EchoServer> {
        Box::new(EchoServer {
            trace: trace.clone(),
        })
    }
}

impl ChannelHandler for EchoServer {
    fn poll(&mut self, event: ChannelEvent<'_>, ctx: &mut ChannelCtx<'_>) -> LinkResult<()> {
        self.trace.record(&event);
        if let ChannelEvent::ClientData(data) = event {
            let echo = data.to_vec();
            ctx.tx_client(&echo)?;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Client side handler: optionally sends a message as soon as the server
/// connection is up, and drains an externally fed outbox while idle.
struct Client {
    trace: Trace,
    send_on_connect: Option<Vec<u8>>,
    outbox: Rc<RefCell<Vec<Vec<u8>>>>,
}

impl Client {
    fn new(trace: &Trace) -> Box<Client> {
        Box::new(Client {
            trace: trace.clone(),
            send_on_connect: None,
            outbox: Rc::new(RefCell::new(Vec::new())),
        })
    }

    fn sending(trace: &Trace, message: &[u8]) -> Box<Client> {
        let mut client = Client::new(trace);
        client.send_on_connect = Some(message.to_vec());
        client
    }

    fn with_outbox(trace: &Trace, outbox: &Rc<RefCell<Vec<Vec<u8>>>>) -> Box<Client> {
        let mut client = Client::new(trace);
        client.outbox = outbox.clone();
        client
    }
}

impl ChannelHandler for Client {
    fn poll(&mut self, event: ChannelEvent<'_>, ctx: &mut ChannelCtx<'_>) -> LinkResult<()> {
        self.trace.record(&event);
        match event {
            ChannelEvent::ServerConnected => {
                if let Some(message) = self.send_on_connect.take() {
                    ctx.tx_server(&message)?;
                }
            }
            ChannelEvent::Idle => {
                if ctx.server_peer != 0 && ctx.tx_server_idle() {
                    let next = {
                        let mut outbox = self.outbox.borrow_mut();
                        if outbox.is_empty() {
                            None
                        } else {
                            Some(outbox.remove(0))
                        }
                    };
                    if let Some(message) = next {
                        ctx.tx_server(&message)?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Request/response client built on the shared-access layer: commands go
/// out verbatim and replies come back verbatim.
struct VerbatimProto;

impl ShareProto for VerbatimProto {
    type Cmd = Vec<u8>;
    type Reply = Vec<u8>;

    fn send(
        &mut self,
        cmd: &Vec<u8>,
        _reply: &mut Vec<u8>,
        tx: &mut dyn FnMut(&[u8]) -> LinkResult<()>,
    ) -> LinkResult<()> {
        tx(cmd)
    }

    fn receive(&mut self, _cmd: &Vec<u8>, reply: &mut Vec<u8>, data: &[u8]) -> LinkResult<()> {
        reply.extend_from_slice(data);
        Ok(())
    }
}

struct RpcClient {
    share: SharedAccess<VerbatimProto>,
    connected: bool,
}

impl RpcClient {
    fn new() -> Box<RpcClient> {
        Box::new(RpcClient {
            share: SharedAccess::new(VerbatimProto),
            connected: false,
        })
    }
}

impl ChannelHandler for RpcClient {
    fn poll(&mut self, event: ChannelEvent<'_>, ctx: &mut ChannelCtx<'_>) -> LinkResult<()> {
        match event {
            ChannelEvent::ServerConnected => self.connected = true,
            ChannelEvent::ServerDisconnected | ChannelEvent::End => {
                self.connected = false;
                self.share.shutdown();
            }
            ChannelEvent::ServerData(data) => self.share.poll_data(data)?,
            ChannelEvent::Idle => {
                if self.connected && ctx.tx_server_idle() {
                    let mut tx = |bytes: &[u8]| ctx.tx_server(bytes);
                    self.share.poll_idle(&mut tx)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct Pair {
    a: LinkStack<MemoryLink>,
    b: LinkStack<MemoryLink>,
    now: Instant,
    step: Duration,
}

impl Pair {
    fn new() -> Pair {
        let (ta, tb) = MemoryLink::pair();
        let mut a = LinkStack::new(ta, LinkOptions::default(), None);
        let mut b = LinkStack::new(tb, LinkOptions::default(), None);
        let now = Instant::now();
        a.start_link(now).unwrap();
        b.start_link(now).unwrap();
        Pair {
            a,
            b,
            now,
            step: Duration::from_millis(1),
        }
    }

    fn tick(&mut self) {
        self.now += self.step;
        self.a.poll(self.now).unwrap();
        self.b.poll(self.now).unwrap();
    }

    fn run(&mut self, ticks: usize) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    fn run_until<F: FnMut(&mut Pair) -> bool>(&mut self, max: usize, mut done: F) {
        for _ in 0..max {
            if done(self) {
                return;
            }
            self.tick();
        }
        panic!("condition not reached within {} ticks", max);
    }

    /// Establish the connection and let the info and registry exchanges
    /// settle.
    fn connect(&mut self) {
        self.run_until(10_000, |pair| pair.a.connected() && pair.b.connected());
        self.run(3_000);
    }
}

#[test]
fn test_link_establishes_era() {
    let mut pair = Pair::new();
    pair.connect();

    assert_eq!(pair.a.dialect(), Dialect::Era);
    assert_eq!(pair.b.dialect(), Dialect::Era);
    assert!(pair.a.stats().rx_frames > 0);
    assert!(pair.b.stats().rx_frames > 0);

    let status = pair.a.status().to_string();
    assert!(status.contains("Connected to an Era device."));
    assert!(status.contains("LINK.*"));
}

#[test]
fn test_channel_roundtrip_with_fragmentation() {
    let mut pair = Pair::new();
    pair.connect();

    let server_trace = Trace::default();
    pair.b
        .create_channel(ChannelConfig::server("ECHO.*"), EchoServer::new(&server_trace))
        .unwrap();

    let message: Vec<u8> = (0..700u32).map(|i| (i % 251) as u8).collect();
    let client_trace = Trace::default();
    pair.a
        .create_channel(
            ChannelConfig::client("ECHO.*"),
            Client::sending(&client_trace, &message),
        )
        .unwrap();

    let trace = client_trace.clone();
    pair.run_until(60_000, move |_| !trace.data.borrow().is_empty());

    assert_eq!(client_trace.data(), vec![message.clone()]);
    assert_eq!(server_trace.data(), vec![message]);
    assert!(client_trace.saw("server-connected"));
    assert!(server_trace.saw("client-connected"));
}

#[test]
fn test_rpc_requests_serialize_in_order() {
    let mut pair = Pair::new();
    pair.connect();

    let server_trace = Trace::default();
    pair.b
        .create_channel(
            ChannelConfig::server("SYS$RPCS.*"),
            EchoServer::new(&server_trace),
        )
        .unwrap();
    let chan = pair
        .a
        .create_channel(ChannelConfig::client("SYS$RPCS.*"), RpcClient::new())
        .unwrap();

    pair.run_until(20_000, |pair| {
        pair.a
            .with_channel::<RpcClient, _, _>(chan, |client| client.connected)
            .unwrap_or(false)
    });

    let first = pair
        .a
        .with_channel::<RpcClient, _, _>(chan, |client| client.share.fore(vec![1, 10, 11]))
        .unwrap();
    let second = pair
        .a
        .with_channel::<RpcClient, _, _>(chan, |client| client.share.fore(vec![2, 20, 21]))
        .unwrap();

    // The second request is issued only after the first reply arrived
    pair.run_until(30_000, |_| first.is_done());
    assert!(!second.is_done());
    pair.run_until(30_000, |_| second.is_done());

    assert_eq!(first.try_take().unwrap().unwrap(), vec![1, 10, 11]);
    assert_eq!(second.try_take().unwrap().unwrap(), vec![2, 20, 21]);
}

#[test]
fn test_arq_recovers_from_lost_bytes() {
    let mut pair = Pair::new();
    pair.connect();

    let server_trace = Trace::default();
    pair.b
        .create_channel(ChannelConfig::server("ECHO.*"), EchoServer::new(&server_trace))
        .unwrap();

    let client_trace = Trace::default();
    let outbox = Rc::new(RefCell::new(Vec::new()));
    pair.a
        .create_channel(
            ChannelConfig::client("ECHO.*"),
            Client::with_outbox(&client_trace, &outbox),
        )
        .unwrap();

    let trace = client_trace.clone();
    pair.run_until(20_000, move |_| trace.saw("server-connected"));

    // Sever the return path and send; the acknowledgements disappear and
    // the retry timer must recover the exchange
    pair.b.transport_mut().set_fault(|_| None);
    outbox.borrow_mut().push((0..200u8).collect());
    pair.run_until(60_000, |pair| pair.a.stats().tx_retry_frames > 0);
    assert!(client_trace.data().is_empty());

    pair.b.transport_mut().clear_fault();
    let trace = client_trace.clone();
    pair.run_until(60_000, move |_| !trace.data.borrow().is_empty());

    // The duplicate deliveries were suppressed on the server side
    let message: Vec<u8> = (0..200u8).collect();
    assert_eq!(server_trace.data(), vec![message.clone()]);
    assert_eq!(client_trace.data(), vec![message]);
    assert!(pair.b.stats().rx_retry_frames > 0);
}

#[test]
fn test_idle_timeout_disconnects_both_sides() {
    let mut pair = Pair::new();
    pair.connect();

    let server_trace = Trace::default();
    pair.b
        .create_channel(ChannelConfig::server("ECHO.*"), EchoServer::new(&server_trace))
        .unwrap();
    let client_trace = Trace::default();
    let chan = pair
        .a
        .create_channel(ChannelConfig::client("ECHO.*"), Client::new(&client_trace))
        .unwrap();

    let trace = client_trace.clone();
    pair.run_until(20_000, move |_| trace.saw("server-connected"));

    // A minute of silence drops the link and tears down every channel
    pair.step = Duration::from_millis(50);
    let trace = client_trace.clone();
    pair.run_until(2_000, move |_| trace.saw("end"));

    assert!(client_trace.saw("server-disconnected"));
    assert!(server_trace.saw("end"));
    assert!(!pair
        .a
        .status()
        .channels
        .iter()
        .any(|info| info.chan == chan && info.name == "ECHO.*"));
}

#[test]
fn test_graceful_shutdown_notifies_peer() {
    let mut pair = Pair::new();
    pair.connect();

    let server_trace = Trace::default();
    pair.b
        .create_channel(ChannelConfig::server("ECHO.*"), EchoServer::new(&server_trace))
        .unwrap();
    let client_trace = Trace::default();
    pair.a
        .create_channel(ChannelConfig::client("ECHO.*"), Client::new(&client_trace))
        .unwrap();

    let trace = client_trace.clone();
    pair.run_until(20_000, move |_| trace.saw("server-connected"));

    pair.a.begin_shutdown().unwrap();
    pair.run_until(30_000, |pair| pair.a.shutdown_complete());
    pair.run(500);

    assert_eq!(pair.a.mode(), UserMode::Inactive);
    assert!(client_trace.saw("end"));
    assert!(server_trace.saw("client-disconnected"));
    assert!(server_trace.saw("end"));
    assert!(!pair.b.connected());
}
