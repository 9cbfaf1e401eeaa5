use std::io::{BufReader, Write};
use std::net::TcpStream;
use std::time::Duration;

use shardpipe_common::{encode_command, key_slot, read_response, RespValue};
use shardpipe_devnode::{Deployment, DevCluster};

struct RawConn {
    reader: BufReader<TcpStream>,
    line: Vec<u8>,
}

impl RawConn {
    fn open(addr: &str) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        RawConn {
            reader: BufReader::new(stream),
            line: Vec::new(),
        }
    }

    fn send(&mut self, args: &[&[u8]]) {
        let mut out = Vec::new();
        encode_command(args, &mut out);
        let stream = self.reader.get_mut();
        stream.write_all(&out).unwrap();
        stream.flush().unwrap();
    }

    fn read(&mut self) -> RespValue {
        read_response(&mut self.reader, &mut self.line).unwrap()
    }

    fn exec(&mut self, args: &[&[u8]]) -> RespValue {
        self.send(args);
        self.read()
    }
}

#[test]
fn standalone_node_answers_pipelined_requests() {
    let cluster = DevCluster::start_standalone().unwrap();
    let mut conn = RawConn::open(cluster.addr(0));

    conn.send(&[b"SET", b"k", b"v"]);
    conn.send(&[b"GET", b"k"]);
    conn.send(&[b"INCR", b"n"]);
    assert_eq!(conn.read(), RespValue::Simple(b"OK".to_vec()));
    assert_eq!(conn.read(), RespValue::bulk("v"));
    assert_eq!(conn.read(), RespValue::Integer(1));
    assert_eq!(cluster.metrics(0).commands_total, 3);
}

#[test]
fn cluster_reports_slots_and_redirects() {
    let cluster = DevCluster::start(3).unwrap();
    let addrs = cluster.addrs();
    let mut conn = RawConn::open(&addrs[0]);

    let slots = conn.exec(&[b"CLUSTER", b"SLOTS"]);
    let entries = slots.as_array().unwrap();
    assert_eq!(entries.len(), 3);

    // "foo" hashes to slot 12182, owned by the last node in a balanced layout.
    assert_eq!(cluster.owner_of(b"foo"), Some(2));
    let reply = conn.exec(&[b"GET", b"foo"]);
    assert_eq!(
        reply,
        RespValue::Error(format!("MOVED 12182 {}", addrs[2]).into_bytes())
    );
    assert_eq!(cluster.metrics(0).redirects_total, 1);

    let mut owner = RawConn::open(&addrs[2]);
    assert_eq!(owner.exec(&[b"SET", b"foo", b"1"]), RespValue::Simple(b"OK".to_vec()));
}

#[test]
fn resharding_moves_ownership_but_keeps_data() {
    let cluster = DevCluster::start(2).unwrap();
    let addrs = cluster.addrs();
    let key = b"bar";
    assert_eq!(cluster.owner_of(key), Some(0));

    let mut first = RawConn::open(&addrs[0]);
    assert_eq!(first.exec(&[b"SET", key, b"before"]), RespValue::Simple(b"OK".to_vec()));

    let slot = cluster.move_key(key, 1);
    assert_eq!(slot, key_slot(key));
    assert_eq!(
        first.exec(&[b"GET", key]),
        RespValue::Error(format!("MOVED {} {}", slot, addrs[1]).into_bytes())
    );

    let mut second = RawConn::open(&addrs[1]);
    assert_eq!(second.exec(&[b"GET", key]), RespValue::bulk("before"));

    cluster.unassign(slot, slot);
    assert_eq!(
        second.exec(&[b"GET", key]),
        RespValue::Error(b"CLUSTERDOWN Hash slot not served".to_vec())
    );
}

#[test]
fn sentinel_and_password_deployments() {
    let primary = DevCluster::launch(
        Deployment::standalone("127.0.0.1", 0)
            .unwrap()
            .with_password("secret"),
    )
    .unwrap();
    let sentinel = DevCluster::start_sentinel("mymaster", primary.addr(0)).unwrap();

    let mut conn = RawConn::open(sentinel.addr(0));
    let reply = conn.exec(&[b"SENTINEL", b"get-master-addr-by-name", b"mymaster"]);
    let parts = reply.as_array().unwrap();
    let addr = format!(
        "{}:{}",
        String::from_utf8_lossy(parts[0].as_bytes().unwrap()),
        String::from_utf8_lossy(parts[1].as_bytes().unwrap())
    );
    assert_eq!(addr, primary.addr(0));

    let mut data = RawConn::open(primary.addr(0));
    assert!(matches!(data.exec(&[b"GET", b"k"]), RespValue::Error(_)));
    assert_eq!(data.exec(&[b"AUTH", b"secret"]), RespValue::Simple(b"OK".to_vec()));
    assert_eq!(data.exec(&[b"GET", b"k"]), RespValue::Bulk(None));
}

#[test]
fn shutdown_closes_connections() {
    let mut cluster = DevCluster::start_standalone().unwrap();
    let mut conn = RawConn::open(cluster.addr(0));
    assert_eq!(conn.exec(&[b"PING"]), RespValue::Simple(b"PONG".to_vec()));

    cluster.shutdown();
    // The write itself may or may not fail; the read must.
    let _ = conn.reader.get_mut().write_all(b"*1\r\n$4\r\nPING\r\n");
    let mut line = Vec::new();
    assert!(read_response(&mut conn.reader, &mut line).is_err());
}
