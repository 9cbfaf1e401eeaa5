//! Reading back pipelined replies in enqueue order.

use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::operation::Reply;
use crate::session::{Lease, PendingOperation};

/// What a drain pass produced.
#[derive(Debug)]
pub(crate) struct DrainOutcome {
    /// First failure in enqueue order, if any.
    pub(crate) error: Option<PipelineError>,
    /// Replies decoded before the first failure.
    pub(crate) resolved: usize,
    /// Replies read and dropped after the first failure.
    pub(crate) discarded: usize,
}

impl DrainOutcome {
    pub(crate) fn into_result(self) -> PipelineResult<()> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Walks the queue once, reading each reply from the connection its
/// operation was written to.
///
/// Replies on one connection come back in write order, and the queue holds
/// operations in write order, so reading one reply per queued operation keeps
/// every connection aligned.
pub(crate) struct ResponseDrain<'a> {
    leases: &'a mut [Lease],
    queue: &'a [PendingOperation],
}

impl<'a> ResponseDrain<'a> {
    pub(crate) fn new(leases: &'a mut [Lease], queue: &'a [PendingOperation]) -> Self {
        ResponseDrain { leases, queue }
    }

    /// Reads every reply.
    ///
    /// **Logic**:
    /// 1. Until something fails, decode each reply and hand it to `sink`.
    /// 2. After the first failure keep reading, but only to discard, so the
    ///    connections end with nothing in flight where the wire allows it.
    /// 3. A connection that broke is skipped; the pool evicts it on release.
    pub(crate) fn run(self, mut sink: Option<&mut Vec<Reply>>) -> DrainOutcome {
        let mut outcome = DrainOutcome {
            error: None,
            resolved: 0,
            discarded: 0,
        };

        for op in self.queue {
            let conn = &mut self.leases[op.lease].conn;

            if outcome.error.is_some() {
                if conn.is_broken() {
                    continue;
                }
                match conn.read_reply() {
                    Ok(_) => outcome.discarded += 1,
                    Err(err) => {
                        debug!(seq = op.seq, addr = %conn.addr(), error = %err, "discard read failed")
                    }
                }
                continue;
            }

            match conn.read_reply().and_then(|reply| op.command.decode(reply)) {
                Ok(reply) => {
                    outcome.resolved += 1;
                    if let Some(sink) = sink.as_deref_mut() {
                        sink.push(reply);
                    }
                }
                Err(err) => {
                    debug!(
                        seq = op.seq,
                        addr = %conn.addr(),
                        command = op.command.name(),
                        error = %err,
                        "pipelined reply failed"
                    );
                    if err.poisons_connection() {
                        conn.mark_broken();
                    }
                    outcome.error = Some(err);
                }
            }
        }

        outcome
    }
}
