//! An in-process mock of a small CQL cluster, good enough to exercise connection
//! pooling, topology discovery, failover, and prepared-statement management without a
//! real server.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::watch,
};

use cassandra::{options::EndPoint, policies::AddressTranslator};

const OPCODE_ERROR: u8 = 0x00;
const OPCODE_STARTUP: u8 = 0x01;
const OPCODE_READY: u8 = 0x02;
const OPCODE_OPTIONS: u8 = 0x05;
const OPCODE_SUPPORTED: u8 = 0x06;
const OPCODE_QUERY: u8 = 0x07;
const OPCODE_RESULT: u8 = 0x08;
const OPCODE_PREPARE: u8 = 0x09;
const OPCODE_EXECUTE: u8 = 0x0A;
const OPCODE_REGISTER: u8 = 0x0B;
const OPCODE_BATCH: u8 = 0x0D;

/// One fake coordinator listening on a real localhost socket.
pub struct MockNode {
    /// The fabricated internal address the node gossips (10.0.0.<id>).
    pub fake_ip: [u8; 4],
    /// Where the node actually listens.
    pub addr: SocketAddr,
    state: Arc<NodeState>,
}

struct NodeState {
    node_id: u8,
    datacenter: String,
    /// Fake IPs of the other nodes of the cluster, as reported in system.peers.
    peers: std::sync::Mutex<Vec<[u8; 4]>>,
    /// When set, new connections are accepted and immediately dropped.
    rejecting: AtomicBool,
    /// Delay applied to application queries (not system table reads).
    query_delay_ms: AtomicUsize,
    /// When set, application queries fail with an Overloaded error.
    overloaded: AtomicBool,
    prepare_count: AtomicUsize,
    query_count: AtomicUsize,
    /// REGISTER requests received. Only a control connection ever registers for
    /// events, so this counts control sessions hosted by this node.
    register_count: AtomicUsize,
    kill_signal: watch::Sender<u64>,
}

impl MockNode {
    pub async fn start(node_id: u8, datacenter: &str) -> MockNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (kill_signal, _) = watch::channel(0);
        let state = Arc::new(NodeState {
            node_id,
            datacenter: datacenter.to_string(),
            peers: std::sync::Mutex::new(Vec::new()),
            rejecting: AtomicBool::new(false),
            query_delay_ms: AtomicUsize::new(0),
            overloaded: AtomicBool::new(false),
            prepare_count: AtomicUsize::new(0),
            query_count: AtomicUsize::new(0),
            register_count: AtomicUsize::new(0),
            kill_signal,
        });

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                if accept_state.rejecting.load(Ordering::SeqCst) {
                    drop(socket);
                    continue;
                }
                let conn_state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = serve_connection(socket, conn_state).await;
                });
            }
        });

        MockNode {
            fake_ip: [10, 0, 0, node_id],
            addr,
            state,
        }
    }

    pub fn set_peers(&self, peers: Vec<[u8; 4]>) {
        *self.state.peers.lock().unwrap() = peers;
    }

    /// Simulates the node going down: existing connections reset, new ones refused.
    pub fn kill(&self) {
        self.state.rejecting.store(true, Ordering::SeqCst);
        self.state.kill_signal.send_modify(|g| *g += 1);
    }

    /// Brings a killed node back.
    pub fn revive(&self) {
        self.state.rejecting.store(false, Ordering::SeqCst);
    }

    pub fn set_query_delay(&self, delay: Duration) {
        self.state
            .query_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn set_overloaded(&self, overloaded: bool) {
        self.state.overloaded.store(overloaded, Ordering::SeqCst);
    }

    pub fn prepare_count(&self) -> usize {
        self.state.prepare_count.load(Ordering::SeqCst)
    }

    pub fn query_count(&self) -> usize {
        self.state.query_count.load(Ordering::SeqCst)
    }

    /// How many control sessions were ever established against this node.
    pub fn register_count(&self) -> usize {
        self.state.register_count.load(Ordering::SeqCst)
    }

    pub fn endpoint(&self) -> EndPoint {
        EndPoint::new(self.addr.ip().to_string(), self.addr.port())
    }
}

/// Maps the fabricated 10.0.0.x addresses gossiped by mock nodes back to the real
/// localhost listeners.
#[derive(Debug)]
pub struct MockTranslator {
    mapping: HashMap<std::net::IpAddr, EndPoint>,
}

impl MockTranslator {
    pub fn for_nodes(nodes: &[&MockNode]) -> MockTranslator {
        let mapping = nodes
            .iter()
            .map(|node| {
                (
                    std::net::IpAddr::from(node.fake_ip),
                    node.endpoint(),
                )
            })
            .collect();
        MockTranslator { mapping }
    }
}

impl AddressTranslator for MockTranslator {
    fn translate(&self, address: SocketAddr) -> EndPoint {
        match self.mapping.get(&address.ip()) {
            Some(endpoint) => endpoint.clone(),
            None => EndPoint::new(address.ip().to_string(), address.port()),
        }
    }
}

/// Wires up `count` nodes that all know about each other.
pub async fn start_cluster(count: u8, datacenter: &str) -> Vec<MockNode> {
    let mut nodes = Vec::new();
    for id in 1..=count {
        nodes.push(MockNode::start(id, datacenter).await);
    }
    for node in &nodes {
        let peers = nodes
            .iter()
            .filter(|other| other.fake_ip != node.fake_ip)
            .map(|other| other.fake_ip)
            .collect();
        node.set_peers(peers);
    }
    nodes
}

async fn serve_connection(mut socket: TcpStream, state: Arc<NodeState>) -> std::io::Result<()> {
    // Any kill signal after this connection was accepted tears it down.
    let mut kill = state.kill_signal.subscribe();
    loop {
        let mut header = [0u8; 9];
        tokio::select! {
            read = socket.read_exact(&mut header) => {
                if read.is_err() {
                    return Ok(());
                }
            }
            _ = kill.changed() => {
                return Ok(());
            }
        }

        let stream = i16::from_be_bytes([header[2], header[3]]);
        let opcode = header[4];
        let length = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
        let mut body = vec![0u8; length];
        socket.read_exact(&mut body).await?;

        let response = match opcode {
            OPCODE_OPTIONS => respond(stream, OPCODE_SUPPORTED, supported_body()),
            OPCODE_STARTUP => respond(stream, OPCODE_READY, Vec::new()),
            OPCODE_REGISTER => {
                state.register_count.fetch_add(1, Ordering::SeqCst);
                respond(stream, OPCODE_READY, Vec::new())
            }
            OPCODE_PREPARE => {
                state.prepare_count.fetch_add(1, Ordering::SeqCst);
                respond(stream, OPCODE_RESULT, prepared_body())
            }
            OPCODE_QUERY => {
                let query = read_long_string(&body);
                if query.contains("system.local") {
                    respond(stream, OPCODE_RESULT, local_rows(&state))
                } else if query.contains("system.peers") {
                    respond(stream, OPCODE_RESULT, peers_rows(&state))
                } else {
                    application_query(stream, &state).await
                }
            }
            OPCODE_EXECUTE | OPCODE_BATCH => application_query(stream, &state).await,
            _ => respond(
                stream,
                OPCODE_ERROR,
                error_body(0x000A, "unexpected opcode"),
            ),
        };

        socket.write_all(&response).await?;
        socket.flush().await?;
    }
}

async fn application_query(stream: i16, state: &NodeState) -> Vec<u8> {
    state.query_count.fetch_add(1, Ordering::SeqCst);
    let delay = state.query_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay as u64)).await;
    }
    if state.overloaded.load(Ordering::SeqCst) {
        respond(
            stream,
            OPCODE_ERROR,
            error_body(0x1001, "coordinator overloaded"),
        )
    } else {
        respond(stream, OPCODE_RESULT, void_body())
    }
}

fn respond(stream: i16, opcode: u8, body: Vec<u8>) -> Vec<u8> {
    let mut frame = Vec::with_capacity(9 + body.len());
    frame.push(0x84);
    frame.push(0x00);
    frame.extend_from_slice(&stream.to_be_bytes());
    frame.push(opcode);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    frame
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    put_u16(buf, s.len() as u16);
    buf.extend_from_slice(s.as_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    put_i32(buf, b.len() as i32);
    buf.extend_from_slice(b);
}


fn supported_body() -> Vec<u8> {
    let mut body = Vec::new();
    put_u16(&mut body, 2);
    put_string(&mut body, "CQL_VERSION");
    put_u16(&mut body, 1);
    put_string(&mut body, "3.0.0");
    put_string(&mut body, "COMPRESSION");
    put_u16(&mut body, 0);
    body
}

fn void_body() -> Vec<u8> {
    let mut body = Vec::new();
    put_i32(&mut body, 1);
    body
}

fn prepared_body() -> Vec<u8> {
    let mut body = Vec::new();
    put_i32(&mut body, 4);
    // query id
    put_u16(&mut body, 4);
    body.extend_from_slice(b"qid1");
    // parameter metadata: no flags, no columns, no pk indexes
    put_i32(&mut body, 0);
    put_i32(&mut body, 0);
    put_i32(&mut body, 0);
    // result metadata: no flags, no columns
    put_i32(&mut body, 0);
    put_i32(&mut body, 0);
    body
}

fn error_body(code: i32, message: &str) -> Vec<u8> {
    let mut body = Vec::new();
    put_i32(&mut body, code);
    put_string(&mut body, message);
    body
}

const TYPE_VARCHAR: u16 = 0x000D;
const TYPE_UUID: u16 = 0x000C;
const TYPE_INET: u16 = 0x0010;
const TYPE_SET: u16 = 0x0022;

struct RowsBuilder {
    columns: Vec<(String, Vec<u16>)>,
    rows: Vec<Vec<Option<Vec<u8>>>>,
}

impl RowsBuilder {
    fn new(columns: &[(&str, &[u16])]) -> RowsBuilder {
        RowsBuilder {
            columns: columns
                .iter()
                .map(|(name, codes)| (name.to_string(), codes.to_vec()))
                .collect(),
            rows: Vec::new(),
        }
    }

    fn row(&mut self, cells: Vec<Option<Vec<u8>>>) {
        assert_eq!(cells.len(), self.columns.len());
        self.rows.push(cells);
    }

    fn build(&self, table: &str) -> Vec<u8> {
        let mut body = Vec::new();
        put_i32(&mut body, 2); // Rows
        put_i32(&mut body, 1); // global tables spec
        put_i32(&mut body, self.columns.len() as i32);
        put_string(&mut body, "system");
        put_string(&mut body, table);
        for (name, codes) in &self.columns {
            put_string(&mut body, name);
            for code in codes {
                put_u16(&mut body, *code);
            }
        }
        put_i32(&mut body, self.rows.len() as i32);
        for row in &self.rows {
            for cell in row {
                match cell {
                    Some(bytes) => put_bytes(&mut body, bytes),
                    None => put_i32(&mut body, -1),
                }
            }
        }
        body
    }
}

fn text_cell(s: &str) -> Option<Vec<u8>> {
    Some(s.as_bytes().to_vec())
}

fn uuid_cell(node_id: u8) -> Option<Vec<u8>> {
    let mut bytes = [0u8; 16];
    bytes[15] = node_id;
    Some(bytes.to_vec())
}

fn tokens_cell(node_id: u8) -> Option<Vec<u8>> {
    let token = (node_id as i64 * 1000).to_string();
    let mut cell = Vec::new();
    put_i32(&mut cell, 1);
    put_i32(&mut cell, token.len() as i32);
    cell.extend_from_slice(token.as_bytes());
    Some(cell)
}

fn local_rows(state: &NodeState) -> Vec<u8> {
    let mut builder = RowsBuilder::new(&[
        ("data_center", &[TYPE_VARCHAR]),
        ("rack", &[TYPE_VARCHAR]),
        ("release_version", &[TYPE_VARCHAR]),
        ("partitioner", &[TYPE_VARCHAR]),
        ("host_id", &[TYPE_UUID]),
        ("tokens", &[TYPE_SET, TYPE_VARCHAR]),
    ]);
    builder.row(vec![
        text_cell(&state.datacenter),
        text_cell("rack1"),
        text_cell("4.1.0"),
        text_cell("org.apache.cassandra.dht.Murmur3Partitioner"),
        uuid_cell(state.node_id),
        tokens_cell(state.node_id),
    ]);
    builder.build("local")
}

fn peers_rows(state: &NodeState) -> Vec<u8> {
    let mut builder = RowsBuilder::new(&[
        ("peer", &[TYPE_INET]),
        ("rpc_address", &[TYPE_INET]),
        ("data_center", &[TYPE_VARCHAR]),
        ("rack", &[TYPE_VARCHAR]),
        ("release_version", &[TYPE_VARCHAR]),
        ("host_id", &[TYPE_UUID]),
        ("tokens", &[TYPE_SET, TYPE_VARCHAR]),
    ]);
    let peers = state.peers.lock().unwrap().clone();
    for peer in peers {
        builder.row(vec![
            Some(peer.to_vec()),
            Some(peer.to_vec()),
            text_cell(&state.datacenter),
            text_cell("rack1"),
            text_cell("4.1.0"),
            uuid_cell(peer[3]),
            tokens_cell(peer[3]),
        ]);
    }
    builder.build("peers")
}

fn read_long_string(body: &[u8]) -> String {
    let len = i32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
    String::from_utf8_lossy(&body[4..4 + len]).to_string()
}
