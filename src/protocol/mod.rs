//! This module provides the fan out / fan in barrier every orchestration step runs on.
//!
//! A step issues one call per participating player, all at once, each on its
//! own worker of smol's blocking pool, since a node call blocks until that
//! node's leg of the distributed protocol is done. Results come back over a
//! channel in the order they complete.
//!
//! There are two ways of waiting:
//! - [fan_out] is for steps where every player must succeed. The first error
//!   to arrive aborts the step. Calls still in flight are not cancelled; they
//!   run to completion and their results are dropped.
//! - [fan_out_all] is for steps that tolerate failures, and waits for every player.
//!
//! Both accept an optional deadline for the whole barrier. A player that has
//! not answered by then is reported as [NodeError::Timeout].

use std::time::{Duration, Instant};

use smol::{channel, future::FutureExt, Timer};
use tracing::{debug, warn};

use crate::{node::NodeError, participants::Participant};

/// One player's call, ready to be dispatched.
pub(crate) type PlayerCall<T> = Box<dyn FnOnce() -> Result<T, NodeError> + Send + 'static>;

type Outcome<T> = (Participant, Result<T, NodeError>);

/// Dispatch every call, and deliver outcomes as they complete.
fn dispatch<T: Send + 'static>(calls: Vec<(Participant, PlayerCall<T>)>) -> channel::Receiver<Outcome<T>> {
    let (tx, rx) = channel::unbounded();
    for (player, call) in calls {
        let tx = tx.clone();
        smol::unblock(move || {
            let result = call();
            // The receiver is gone once the step has been aborted.
            let _ = tx.try_send((player, result));
        })
        .detach();
    }
    rx
}

async fn next<T>(rx: &channel::Receiver<T>, deadline: Option<Instant>) -> Option<T> {
    let recv = async { rx.recv().await.ok() };
    match deadline {
        Some(at) => {
            recv.or(async {
                Timer::at(at).await;
                None
            })
            .await
        }
        None => recv.await,
    }
}

/// Run calls where every player must succeed.
///
/// On success, the outputs are returned in player order. Otherwise, the first
/// failing player is returned along with its error.
pub(crate) fn fan_out<T: Send + 'static>(
    calls: Vec<(Participant, PlayerCall<T>)>,
    deadline: Option<Duration>,
) -> Result<Vec<(Participant, T)>, (Participant, NodeError)> {
    let mut pending: Vec<Participant> = calls.iter().map(|(p, _)| *p).collect();
    let deadline = deadline.map(|d| Instant::now() + d);
    let rx = dispatch(calls);

    smol::block_on(async {
        let mut out = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            match next(&rx, deadline).await {
                Some((player, Ok(value))) => {
                    debug!(%player, "call completed");
                    pending.retain(|p| *p != player);
                    out.push((player, value));
                }
                Some((player, Err(e))) => {
                    warn!(%player, error = %e, "call failed, aborting step");
                    return Err((player, e));
                }
                None => {
                    warn!(missing = pending.len(), "deadline passed, aborting step");
                    return Err((pending[0], NodeError::Timeout));
                }
            }
        }
        out.sort_by_key(|(p, _)| *p);
        Ok(out)
    })
}

/// Run calls where failures are tolerated, waiting for every player.
///
/// The outcomes are returned in player order.
pub(crate) fn fan_out_all<T: Send + 'static>(
    calls: Vec<(Participant, PlayerCall<T>)>,
    deadline: Option<Duration>,
) -> Vec<Outcome<T>> {
    let mut pending: Vec<Participant> = calls.iter().map(|(p, _)| *p).collect();
    let deadline = deadline.map(|d| Instant::now() + d);
    let rx = dispatch(calls);

    smol::block_on(async {
        let mut out = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            match next(&rx, deadline).await {
                Some((player, result)) => {
                    if let Err(e) = &result {
                        warn!(%player, error = %e, "call failed");
                    }
                    pending.retain(|p| *p != player);
                    out.push((player, result));
                }
                None => {
                    warn!(missing = pending.len(), "deadline passed");
                    out.extend(pending.drain(..).map(|p| (p, Err(NodeError::Timeout))));
                }
            }
        }
        out.sort_by_key(|(p, _)| *p);
        out
    })
}
