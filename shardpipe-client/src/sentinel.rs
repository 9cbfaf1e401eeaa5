//! Primary discovery through sentinels.

use shardpipe_common::RespValue;
use tracing::{info, warn};

use crate::connection::{ConnectSettings, Connection};
use crate::error::{PipelineError, PipelineResult};

/// Asks each sentinel in turn for the current primary of `master_name`.
///
/// Returns the first `host:port` answer. Sentinels that are down or do not
/// know the master are skipped.
pub fn resolve_master(
    sentinels: &[String],
    master_name: &str,
    settings: &ConnectSettings,
) -> PipelineResult<String> {
    for sentinel in sentinels {
        match query_master(sentinel, master_name, settings) {
            Ok(Some(addr)) => {
                info!(sentinel = %sentinel, master = %master_name, addr = %addr, "primary resolved");
                return Ok(addr);
            }
            Ok(None) => warn!(sentinel = %sentinel, master = %master_name, "sentinel does not know master"),
            Err(err) => warn!(sentinel = %sentinel, error = %err, "sentinel query failed"),
        }
    }
    Err(PipelineError::Topology(format!(
        "no sentinel could resolve master {}",
        master_name
    )))
}

fn query_master(
    sentinel: &str,
    master_name: &str,
    settings: &ConnectSettings,
) -> PipelineResult<Option<String>> {
    let mut conn = Connection::open(sentinel, &settings.bare())?;
    let reply = conn.exec(&[
        b"SENTINEL",
        b"get-master-addr-by-name",
        master_name.as_bytes(),
    ])?;
    match reply {
        RespValue::Array(Some(items)) if items.len() == 2 => {
            let host = items[0].as_bytes();
            let port = items[1].as_bytes();
            match (host, port) {
                (Some(host), Some(port)) => Ok(Some(format!(
                    "{}:{}",
                    String::from_utf8_lossy(host),
                    String::from_utf8_lossy(port)
                ))),
                _ => Err(PipelineError::ProtocolDecode(
                    "sentinel: host and port must be bulk strings".into(),
                )),
            }
        }
        RespValue::Array(None) | RespValue::Bulk(None) => Ok(None),
        RespValue::Error(message) => Err(PipelineError::from_error_reply(&message)),
        other => Err(PipelineError::ProtocolDecode(format!(
            "sentinel: unexpected {} reply",
            other.type_name()
        ))),
    }
}
