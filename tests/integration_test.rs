//! Integration tests for the relay server
//!
//! Servers run in-process on ephemeral loopback ports; clients speak the
//! framed wire protocol over real sockets.

use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use relay_server::framing::{frame, split, END_MARKER};
use relay_server::{Config, Server};

const IO_TIMEOUT: Duration = Duration::from_secs(3);
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Relay server running on a background thread until dropped
struct ServerThread {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    control: SocketAddr,
    peer: SocketAddr,
    status: SocketAddr,
}

/// Loopback config on ephemeral ports
fn test_config(id: &str, heartbeat_secs: u64) -> Config {
    Config {
        server_id: id.to_string(),
        bind_address: IpAddr::from([127, 0, 0, 1]),
        control_port: 0,
        peer_port: 0,
        status_port: 0,
        advertise_ip: Some("127.0.0.1".to_string()),
        heartbeat_interval_secs: heartbeat_secs,
        poll_timeout_ms: 20,
        ..Config::default()
    }
}

impl ServerThread {
    fn start(id: &str, heartbeat_secs: u64) -> Self {
        Self::start_with(test_config(id, heartbeat_secs))
    }

    fn start_with(config: Config) -> Self {
        let mut server = Server::bind(&config).expect("bind server");
        let shutdown = server.shutdown_handle();
        let control = server.control_addr().expect("control addr");
        let peer = server.peer_addr().expect("peer addr");
        let status = server.status_addr().expect("status addr");

        let thread = thread::spawn(move || {
            server.run().expect("server loop");
        });

        ServerThread {
            shutdown,
            thread: Some(thread),
            control,
            peer,
            status,
        }
    }
}

impl Drop for ServerThread {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Framed TCP client
struct Client {
    stream: TcpStream,
    buffer: Vec<u8>,
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect");
        stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
        Client {
            stream,
            buffer: Vec::new(),
        }
    }

    fn send(&mut self, text: &str) {
        self.stream.write_all(&frame(text)).unwrap();
    }

    /// Next complete framed message
    fn recv(&mut self) -> String {
        loop {
            if let Some(end) = self.buffer.iter().position(|b| *b == END_MARKER) {
                let message: Vec<u8> = self.buffer.drain(..=end).collect();
                return split(&message).into_iter().next().unwrap_or_default();
            }

            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).expect("read reply");
            assert!(n > 0, "server closed the connection");
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    fn request(&mut self, text: &str) -> String {
        self.send(text);
        self.recv()
    }
}

/// Repeat a request until the reply satisfies `done`
fn wait_for(client: &mut Client, request: &str, done: impl Fn(&str) -> bool) -> String {
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    loop {
        let reply = client.request(request);
        if done(&reply) || Instant::now() > deadline {
            return reply;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

/// Listener with a full accept queue: further dials to it never complete.
/// The held streams keep the queue full.
fn stalled_listener() -> (TcpListener, Vec<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let mut held = Vec::new();
    for _ in 0..4096 {
        match TcpStream::connect_timeout(&addr, Duration::from_millis(200)) {
            Ok(stream) => held.push(stream),
            Err(_) => break,
        }
    }
    (listener, held)
}

fn status_query(addr: SocketAddr, text: &str) -> Vec<u8> {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    socket.send_to(&frame(text), addr).unwrap();

    let mut buf = [0u8; 2048];
    let (n, _) = socket.recv_from(&mut buf).expect("status reply");
    buf[..n].to_vec()
}

#[test]
fn test_users_chat_on_one_server() {
    let server = ServerThread::start("A", 3600);
    let mut alice = Client::connect(server.control);
    let mut bob = Client::connect(server.control);

    assert_eq!(alice.request("CONNECT alice"), "Connected as alice");
    assert_eq!(bob.request("CONNECT bob"), "Connected as bob");
    assert_eq!(alice.request("WHO"), "alice\nbob");

    assert_eq!(alice.request("MSG bob hello there"), "Message sent");
    assert_eq!(bob.recv(), "From alice: hello there");

    assert_eq!(alice.request("MSG carol hi"), "No such user");
    assert_eq!(bob.request("FETCH 6"), "Index out of range");
    assert_eq!(bob.request("LEAVE"), "Leaving");
    assert_eq!(alice.request("WHO"), "alice");
}

#[test]
fn test_unframed_line_is_accepted() {
    let server = ServerThread::start("A", 3600);
    let mut client = Client::connect(server.control);

    client.stream.write_all(b"CONNECT carol\n").unwrap();
    assert_eq!(client.recv(), "Connected as carol");
}

#[test]
fn test_status_query_without_peers() {
    let server = ServerThread::start("A", 3600);
    assert_eq!(status_query(server.status, "LISTSERVERS"), frame(""));
    // Any datagram is a server-list query
    assert_eq!(status_query(server.status, "WHO"), frame(""));
}

#[test]
fn test_closed_user_frees_name() {
    let server = ServerThread::start("A", 3600);
    let mut alice = Client::connect(server.control);
    assert_eq!(alice.request("CONNECT alice"), "Connected as alice");
    drop(alice);

    let mut again = Client::connect(server.control);
    let reply = wait_for(&mut again, "CONNECT alice", |r| r.starts_with("Connected"));
    assert_eq!(reply, "Connected as alice");
}

#[test]
fn test_two_servers_exchange_identities() {
    let a = ServerThread::start("A", 3600);
    let b = ServerThread::start("B", 3600);
    let mut operator = Client::connect(a.control);

    let port = b.peer.port();
    assert_eq!(
        operator.request(&format!("ADDSERVER 127.0.0.1 {}", port)),
        format!("Connected to 127.0.0.1 {}", port)
    );

    let expected_b = format!("B,127.0.0.1,{}", port);
    let listing = wait_for(&mut operator, "LISTSERVERS", |r| r == expected_b);
    assert_eq!(listing, expected_b);

    // B learned A through its own ID request on the accepted connection
    let mut remote = Client::connect(b.control);
    let expected_a = format!("A,127.0.0.1,{}", a.peer.port());
    let listing = wait_for(&mut remote, "LISTSERVERS", |r| r == expected_a);
    assert_eq!(listing, expected_a);

    let status = split(&status_query(a.status, "LISTSERVERS"));
    assert_eq!(status, vec![expected_b]);
}

#[test]
fn test_command_delegated_to_peer() {
    let a = ServerThread::start("A", 3600);
    let b = ServerThread::start("B", 3600);
    let mut operator = Client::connect(a.control);

    operator.request(&format!("ADDSERVER 127.0.0.1 {}", b.peer.port()));
    wait_for(&mut operator, "LISTSERVERS", |r| r.starts_with("B,"));

    assert_eq!(operator.request("CMD,B,A,FETCH 2"), "Forwarded to B");
    assert_eq!(
        operator.recv(),
        "RSP,A,A,FETCH,2,c81e728d9d4c2f636f067f89cc14862c"
    );

    assert_eq!(operator.request("CMD,Z,A,WHO"), "Forwarding failed");
}

#[test]
fn test_routes_learned_through_hub() {
    let a = ServerThread::start("A", 1);
    let hub = ServerThread::start("B", 1);
    let c = ServerThread::start("C", 1);

    let mut op_a = Client::connect(a.control);
    let mut op_c = Client::connect(c.control);
    op_a.request(&format!("ADDSERVER 127.0.0.1 {}", hub.peer.port()));
    op_c.request(&format!("ADDSERVER 127.0.0.1 {}", hub.peer.port()));

    let routes = wait_for(&mut op_a, "LISTROUTES", |r| r.starts_with("A;B;C\n"));
    let lines: Vec<&str> = routes.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "A;B;C");
    assert_eq!(lines[1], "A;-;A;B");
    assert!(lines[2].ends_with('Z'));

    // Losing the hub drops everything routed through it
    drop(hub);
    let routes = wait_for(&mut op_a, "LISTROUTES", |r| r.starts_with("A\n"));
    assert!(routes.starts_with("A\nA;-\n"), "{:?}", routes);
}

#[test]
fn test_pending_dial_does_not_stall_other_clients() {
    let (listener, _held) = stalled_listener();
    let stalled = listener.local_addr().unwrap().port();

    let b = ServerThread::start("B", 3600);
    let a = ServerThread::start_with(Config {
        max_peers: 1,
        connect_timeout_ms: 2000,
        ..test_config("A", 3600)
    });
    let mut operator = Client::connect(a.control);
    let mut alice = Client::connect(a.control);
    assert_eq!(alice.request("CONNECT alice"), "Connected as alice");

    let started = Instant::now();
    assert_eq!(
        operator.request(&format!("ADDSERVER 127.0.0.1 {}", stalled)),
        format!("Connected to 127.0.0.1 {}", stalled)
    );
    assert_eq!(alice.request("WHO"), "alice");
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "other clients waited {:?} on the dial",
        started.elapsed()
    );

    // The dial holds the only peer slot until it times out
    let add_b = format!("ADDSERVER 127.0.0.1 {}", b.peer.port());
    assert_eq!(operator.request(&add_b), "Maximum number of servers reached");

    let reply = wait_for(&mut operator, &add_b, |r| r.starts_with("Connected"));
    assert_eq!(reply, format!("Connected to 127.0.0.1 {}", b.peer.port()));
    let listing = wait_for(&mut operator, "LISTSERVERS", |r| r.starts_with("B,"));
    assert_eq!(listing, format!("B,127.0.0.1,{}", b.peer.port()));
}

#[test]
fn test_peer_connections_beyond_cap_are_closed() {
    let server = ServerThread::start_with(Config {
        max_peers: 1,
        ..test_config("A", 3600)
    });

    let mut first = Client::connect(server.peer);
    assert_eq!(first.recv(), "CMD,,A,ID");
    first.send("RSP,A,A,ID,P,127.0.0.1,9999");

    let mut operator = Client::connect(server.control);
    let listing = wait_for(&mut operator, "LISTSERVERS", |r| !r.is_empty());
    assert_eq!(listing, "P,127.0.0.1,9999");

    let mut second = TcpStream::connect(server.peer).unwrap();
    second.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    let mut buf = [0u8; 64];
    match second.read(&mut buf) {
        Ok(0) => {}
        Err(e) if e.kind() == ErrorKind::ConnectionReset => {}
        other => panic!("surplus peer connection left open: {:?}", other),
    }

    assert_eq!(operator.request("LISTSERVERS"), "P,127.0.0.1,9999");
    assert_eq!(split(&status_query(server.status, "LISTSERVERS")), vec!["P,127.0.0.1,9999".to_string()]);
    // The first peer is still served
    assert_eq!(
        first.request("CMD,A,P,ID"),
        format!("RSP,P,P,ID,A,127.0.0.1,{}", server.peer.port())
    );
}
