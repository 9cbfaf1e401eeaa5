//! # TCP Server
//!
//! Accept RESP2 connections, parse commands, and answer them from the shared
//! keyspace, behaving like a standalone node, a cluster member or a sentinel.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use shardpipe_common::{encode_value, key_slot, RespValue};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tracing::{debug, info, warn};

use crate::layout::SlotLayout;
use crate::metrics::Metrics;
use crate::parser::{RespError, RespParser};
use crate::store::{Keyspace, StoreError, TtlStatus};

/// Logical databases available to a standalone node.
pub const STANDALONE_DATABASES: usize = 16;

/// How a node answers.
#[derive(Debug)]
pub enum Role {
    /// Owns the whole keyspace.
    Standalone,
    /// Serves only the slots `layout` assigns to `index`.
    ClusterMember {
        index: usize,
        layout: Arc<SlotLayout>,
    },
    /// Answers primary lookups for one monitored master.
    Sentinel {
        master_name: String,
        master_addr: String,
    },
}

/// Everything a node's connections share.
#[derive(Debug)]
pub struct NodeContext {
    addr: String,
    role: Role,
    databases: Vec<Arc<Keyspace>>,
    password: Option<String>,
    metrics: Metrics,
}

impl NodeContext {
    pub fn new(addr: impl Into<String>, role: Role, databases: Vec<Arc<Keyspace>>) -> Self {
        NodeContext {
            addr: addr.into(),
            role,
            databases,
            password: None,
            metrics: Metrics::new(),
        }
    }

    /// Requires AUTH with `password` before any data command.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

/// Per-connection session state.
#[derive(Debug)]
struct ConnState {
    authenticated: bool,
    db: usize,
}

/// Accepts connections until `shutdown` resolves.
pub async fn serve_until<F>(listener: TcpListener, ctx: Arc<NodeContext>, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send,
{
    tokio::pin!(shutdown);
    info!(addr = %ctx.addr, role = role_name(&ctx.role), "node listening");
    loop {
        select! {
            _ = &mut shutdown => {
                debug!(addr = %ctx.addr, "node shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    ctx.metrics.record_connection();
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, ctx).await {
                            debug!(peer = %peer, error = %err, "connection closed with error");
                        }
                    });
                }
                Err(err) => warn!(error = %err, "failed to accept connection"),
            }
        }
    }
    Ok(())
}

/// Handles a single TCP client connection.
///
/// Every complete request in a read is answered, and the answers are written
/// back in one batch.
pub async fn handle_connection(mut stream: TcpStream, ctx: Arc<NodeContext>) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut out = Vec::with_capacity(8 * 1024);
    let mut parser = RespParser::new();
    let mut state = ConnState {
        authenticated: ctx.password.is_none(),
        db: 0,
    };

    loop {
        let bytes = stream.read_buf(&mut buffer).await?;
        if bytes == 0 {
            break;
        }

        out.clear();
        loop {
            match parser.parse(&mut buffer) {
                Ok(Some(args)) if args.is_empty() => continue,
                Ok(Some(args)) => {
                    ctx.metrics.record_command();
                    let reply = dispatch_command(&args, &ctx, &mut state);
                    if let RespValue::Error(message) = &reply {
                        if message.starts_with(b"MOVED ") {
                            ctx.metrics.record_redirect();
                        } else {
                            ctx.metrics.record_error();
                        }
                    }
                    encode_value(&reply, &mut out);
                }
                Ok(None) => break,
                Err(RespError::Protocol) => {
                    encode_value(&error("ERR protocol error"), &mut out);
                    stream.write_all(&out).await?;
                    return Ok(());
                }
            }
        }
        if !out.is_empty() {
            stream.write_all(&out).await?;
        }
    }

    Ok(())
}

fn dispatch_command(args: &[Vec<u8>], ctx: &NodeContext, state: &mut ConnState) -> RespValue {
    let cmd = args[0].to_ascii_uppercase();
    match cmd.as_slice() {
        b"PING" => return handle_ping(args),
        b"AUTH" => return handle_auth(args, ctx, state),
        _ => {}
    }
    if !state.authenticated {
        return error("NOAUTH Authentication required.");
    }

    match cmd.as_slice() {
        b"SELECT" => handle_select(args, ctx, state),
        b"CLIENT" => simple("OK"),
        b"INFO" => handle_info(ctx),
        b"CLUSTER" => handle_cluster(args, ctx),
        b"SENTINEL" => handle_sentinel(args, ctx),
        b"GET" | b"SET" | b"DEL" | b"EXISTS" | b"EXPIRE" | b"PEXPIRE" | b"TTL" | b"INCR"
        | b"DECR" => {
            handle_keyed(&cmd, args, ctx, state)
        }
        _ => error(&format!(
            "ERR unknown command '{}'",
            String::from_utf8_lossy(&args[0])
        )),
    }
}

fn handle_keyed(cmd: &[u8], args: &[Vec<u8>], ctx: &NodeContext, state: &ConnState) -> RespValue {
    if args.len() < 2 {
        return wrong_arity(cmd);
    }
    if let Some(redirect) = check_ownership(&args[1..key_count(cmd, args.len())], ctx) {
        return redirect;
    }
    let keyspace = match &ctx.role {
        Role::Sentinel { .. } => return error("ERR data commands are not served by sentinels"),
        _ => &ctx.databases[state.db],
    };

    match cmd {
        b"GET" => handle_get(args, keyspace),
        b"SET" => handle_set(args, keyspace),
        b"DEL" => handle_del(args, keyspace),
        b"EXISTS" => handle_exists(args, keyspace),
        b"EXPIRE" | b"PEXPIRE" => handle_expire(cmd, args, keyspace),
        b"TTL" => handle_ttl(args, keyspace),
        b"INCR" => handle_incr(args, keyspace, 1),
        _ => handle_incr(args, keyspace, -1),
    }
}

/// Exclusive end index of the key arguments.
fn key_count(cmd: &[u8], args: usize) -> usize {
    match cmd {
        b"DEL" | b"EXISTS" => args,
        _ => 2,
    }
}

/// Cluster members refuse keys they do not own.
fn check_ownership(keys: &[Vec<u8>], ctx: &NodeContext) -> Option<RespValue> {
    let (index, layout) = match &ctx.role {
        Role::ClusterMember { index, layout } => (*index, layout),
        _ => return None,
    };
    let slot = key_slot(&keys[0]);
    if keys[1..].iter().any(|key| key_slot(key) != slot) {
        return Some(error("CROSSSLOT Keys in request don't hash to the same slot"));
    }
    match layout.owner(slot) {
        Some(owner) if owner == index => None,
        Some(owner) => {
            let addr = layout.addr(owner).unwrap_or("?");
            Some(error(&format!("MOVED {} {}", slot, addr)))
        }
        None => Some(error("CLUSTERDOWN Hash slot not served")),
    }
}

fn handle_ping(args: &[Vec<u8>]) -> RespValue {
    match args.len() {
        1 => simple("PONG"),
        2 => RespValue::bulk(args[1].clone()),
        _ => wrong_arity(b"PING"),
    }
}

fn handle_auth(args: &[Vec<u8>], ctx: &NodeContext, state: &mut ConnState) -> RespValue {
    // AUTH <password> or AUTH <username> <password>; usernames are not checked.
    let supplied = match args.len() {
        2 => &args[1],
        3 => &args[2],
        _ => return wrong_arity(b"AUTH"),
    };
    match &ctx.password {
        Some(password) if password.as_bytes() == supplied.as_slice() => {
            state.authenticated = true;
            simple("OK")
        }
        Some(_) => error("WRONGPASS invalid username-password pair"),
        None => simple("OK"),
    }
}

fn handle_select(args: &[Vec<u8>], ctx: &NodeContext, state: &mut ConnState) -> RespValue {
    if args.len() != 2 {
        return wrong_arity(b"SELECT");
    }
    let db = match parse_u64(&args[1]) {
        Ok(db) => db as usize,
        Err(reply) => return reply,
    };
    if matches!(ctx.role, Role::ClusterMember { .. }) && db != 0 {
        return error("ERR SELECT is not allowed in cluster mode");
    }
    if db >= ctx.databases.len() {
        return error("ERR DB index is out of range");
    }
    state.db = db;
    simple("OK")
}

fn handle_info(ctx: &NodeContext) -> RespValue {
    let info = format!(
        "role:master\r\nmode:{}\r\nkeys:{}\r\n",
        role_name(&ctx.role),
        ctx.databases.first().map_or(0, |keyspace| keyspace.len())
    );
    RespValue::bulk(info)
}

fn handle_cluster(args: &[Vec<u8>], ctx: &NodeContext) -> RespValue {
    let layout = match &ctx.role {
        Role::ClusterMember { layout, .. } => layout,
        _ => return error("ERR This instance has cluster support disabled"),
    };
    let sub = args.get(1).map(|sub| sub.to_ascii_uppercase());
    match sub.as_deref() {
        Some(b"SLOTS") => cluster_slots(layout),
        Some(b"KEYSLOT") if args.len() == 3 => RespValue::Integer(key_slot(&args[2]) as i64),
        _ => error("ERR unknown CLUSTER subcommand"),
    }
}

/// `[[start, end, [host, port, id]], ...]`, one entry per owned range.
fn cluster_slots(layout: &SlotLayout) -> RespValue {
    let entries = layout
        .ranges()
        .into_iter()
        .filter_map(|(start, end, node)| {
            let addr = layout.addr(node)?;
            let (host, port) = addr.rsplit_once(':')?;
            let port: i64 = port.parse().ok()?;
            Some(RespValue::Array(Some(vec![
                RespValue::Integer(start as i64),
                RespValue::Integer(end as i64),
                RespValue::Array(Some(vec![
                    RespValue::bulk(host),
                    RespValue::Integer(port),
                    RespValue::bulk(format!("devnode-{}", node)),
                ])),
            ])))
        })
        .collect();
    RespValue::Array(Some(entries))
}

fn handle_sentinel(args: &[Vec<u8>], ctx: &NodeContext) -> RespValue {
    let (master_name, master_addr) = match &ctx.role {
        Role::Sentinel {
            master_name,
            master_addr,
        } => (master_name, master_addr),
        _ => return error("ERR unknown command 'SENTINEL'"),
    };
    let sub = args.get(1).map(|sub| sub.to_ascii_lowercase());
    if sub.as_deref() != Some(&b"get-master-addr-by-name"[..]) || args.len() != 3 {
        return error("ERR unknown SENTINEL subcommand");
    }
    if args[2] != master_name.as_bytes() {
        return RespValue::Array(None);
    }
    match master_addr.rsplit_once(':') {
        Some((host, port)) => RespValue::Array(Some(vec![
            RespValue::bulk(host),
            RespValue::bulk(port),
        ])),
        None => RespValue::Array(None),
    }
}

fn handle_get(args: &[Vec<u8>], keyspace: &Keyspace) -> RespValue {
    if args.len() != 2 {
        return wrong_arity(b"GET");
    }
    RespValue::Bulk(keyspace.get(&args[1]))
}

fn handle_set(args: &[Vec<u8>], keyspace: &Keyspace) -> RespValue {
    if args.len() < 3 {
        return wrong_arity(b"SET");
    }
    let mut ttl = None;
    let mut must_exist = None;
    let mut idx = 3;
    while idx < args.len() {
        match args[idx].to_ascii_uppercase().as_slice() {
            b"NX" if must_exist.is_none() => must_exist = Some(false),
            b"XX" if must_exist.is_none() => must_exist = Some(true),
            unit @ (b"EX" | b"PX") if ttl.is_none() && idx + 1 < args.len() => {
                let amount = match parse_u64(&args[idx + 1]) {
                    Ok(0) => return error("ERR invalid expire time in 'set' command"),
                    Ok(amount) => amount,
                    Err(reply) => return reply,
                };
                ttl = Some(match unit {
                    b"EX" => Duration::from_secs(amount),
                    _ => Duration::from_millis(amount),
                });
                idx += 1;
            }
            _ => return error("ERR syntax error"),
        }
        idx += 1;
    }

    match must_exist {
        None => {
            keyspace.set(args[1].clone(), args[2].clone(), ttl);
            simple("OK")
        }
        Some(must_exist) => {
            if keyspace.set_when(args[1].clone(), args[2].clone(), ttl, must_exist) {
                simple("OK")
            } else {
                RespValue::Bulk(None)
            }
        }
    }
}

fn handle_del(args: &[Vec<u8>], keyspace: &Keyspace) -> RespValue {
    let removed = args[1..].iter().filter(|key| keyspace.delete(key)).count();
    RespValue::Integer(removed as i64)
}

fn handle_exists(args: &[Vec<u8>], keyspace: &Keyspace) -> RespValue {
    let found = args[1..].iter().filter(|key| keyspace.exists(key)).count();
    RespValue::Integer(found as i64)
}

fn handle_expire(cmd: &[u8], args: &[Vec<u8>], keyspace: &Keyspace) -> RespValue {
    if args.len() != 3 {
        return wrong_arity(cmd);
    }
    let amount = match parse_u64(&args[2]) {
        Ok(value) => value,
        Err(reply) => return reply,
    };
    let ttl = match cmd {
        b"PEXPIRE" => Duration::from_millis(amount),
        _ => Duration::from_secs(amount),
    };
    let applied = keyspace.expire(&args[1], ttl);
    RespValue::Integer(applied as i64)
}

fn handle_ttl(args: &[Vec<u8>], keyspace: &Keyspace) -> RespValue {
    if args.len() != 2 {
        return wrong_arity(b"TTL");
    }
    match keyspace.ttl(&args[1]) {
        TtlStatus::Missing => RespValue::Integer(-2),
        TtlStatus::NoExpiry => RespValue::Integer(-1),
        // Rounded to the nearest second, as Redis does.
        TtlStatus::ExpiresIn(left) => RespValue::Integer(((left.as_millis() + 500) / 1000) as i64),
    }
}

fn handle_incr(args: &[Vec<u8>], keyspace: &Keyspace, delta: i64) -> RespValue {
    if args.len() != 2 {
        return wrong_arity(if delta > 0 { b"INCR" } else { b"DECR" });
    }
    match keyspace.incr_by(&args[1], delta) {
        Ok(value) => RespValue::Integer(value),
        Err(StoreError::NotAnInteger) => error("ERR value is not an integer or out of range"),
    }
}

fn role_name(role: &Role) -> &'static str {
    match role {
        Role::Standalone => "standalone",
        Role::ClusterMember { .. } => "cluster",
        Role::Sentinel { .. } => "sentinel",
    }
}

fn simple(message: &str) -> RespValue {
    RespValue::Simple(message.as_bytes().to_vec())
}

fn error(message: &str) -> RespValue {
    RespValue::Error(message.as_bytes().to_vec())
}

fn wrong_arity(cmd: &[u8]) -> RespValue {
    error(&format!(
        "ERR wrong number of arguments for '{}' command",
        String::from_utf8_lossy(cmd).to_ascii_lowercase()
    ))
}

fn parse_u64(arg: &[u8]) -> Result<u64, RespValue> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|text| text.parse::<u64>().ok())
        .ok_or_else(|| error("ERR value is not an integer or out of range"))
}
