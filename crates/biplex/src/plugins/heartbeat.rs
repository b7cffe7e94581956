//! Timed heartbeat between peers.
//!
//! The ping side sends a CALL or PUSH of [`HEARTBEAT_SERVICE_METHOD`]
//! whenever a session has been idle past the configured rate; any other
//! traffic rearms the timer. The pong side answers heartbeats, adopts the
//! rate advertised in the `hb_` meta key, and closes sessions that go
//! silent for two rate periods.
//!
//! Paths are registered through the HTTP mapper, so both sides must use
//! it (the default).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use biplex_core::{BoxFuture, MessageSetting, Status};

use crate::context::{CallCtx, PushCtx, ReadCtx, WriteCtx};
use crate::peer::Peer;
use crate::plugin::Plugin;
use crate::session::{PreSession, Session, Swap};

/// Canonical heartbeat service method.
pub const HEARTBEAT_SERVICE_METHOD: &str = "/heartbeat";

/// Meta key carrying the sender's heartbeat rate in whole seconds.
const HEARTBEAT_META_KEY: &str = "hb_";

const SWAP_KEY: &str = "hb_info";

/// Lower bound on the heartbeat rate.
const MIN_RATE_SECOND: u64 = 3;

#[derive(Clone)]
struct HeartbeatInfo {
    last: Instant,
    rate: Duration,
}

fn init_info(swap: &Swap, rate: Duration) {
    swap.insert(
        SWAP_KEY,
        HeartbeatInfo {
            last: Instant::now(),
            rate,
        },
    );
}

/// Refreshes the last-beat stamp, adopting `rate` when non-zero. Returns
/// true when no info existed yet.
fn update_info(swap: &Swap, rate: Duration) -> bool {
    let first = !swap.contains(SWAP_KEY);
    let prev_rate = swap
        .get_cloned::<HeartbeatInfo>(SWAP_KEY)
        .map(|info| info.rate)
        .unwrap_or(Duration::from_secs(MIN_RATE_SECOND));
    swap.insert(
        SWAP_KEY,
        HeartbeatInfo {
            last: Instant::now(),
            rate: if rate.is_zero() { prev_rate } else { rate },
        },
    );
    first
}

fn touch(sess: &Arc<Session>) {
    if sess.health() {
        update_info(sess.swap(), Duration::ZERO);
    }
}

/// Heartbeat sender. `use_call` picks CALL over PUSH pings.
pub fn ping(rate_second: u64, use_call: bool) -> Arc<dyn Plugin> {
    let rate_second = rate_second.max(MIN_RATE_SECOND);
    tracing::info!(rate_second, "set heartbeat rate");
    Arc::new(HeartPing {
        state: Arc::new(PingState {
            rate: Mutex::new(Duration::from_secs(rate_second)),
            use_call: AtomicBool::new(use_call),
        }),
    })
}

struct PingState {
    rate: Mutex<Duration>,
    use_call: AtomicBool,
}

struct HeartPing {
    state: Arc<PingState>,
}

impl Plugin for HeartPing {
    fn name(&self) -> &'static str {
        "heart-ping"
    }

    fn post_new_peer(&self, peer: &Peer) -> Result<(), Status> {
        let state = self.state.clone();
        let peer = peer.clone();
        let shutdown = peer.core.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let rate = *state.rate.lock();
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(rate) => {}
                }
                let use_call = state.use_call.load(Ordering::Relaxed);
                let rate_second = rate.as_secs().to_string();
                peer.core.hub.range(|sess| {
                    if !sess.health() {
                        return true;
                    }
                    let Some(info) = sess.swap().get_cloned::<HeartbeatInfo>(SWAP_KEY) else {
                        return true;
                    };
                    if info.last + info.rate > Instant::now() {
                        return true;
                    }
                    let rate_second = rate_second.clone();
                    tokio::spawn(async move {
                        let setting = MessageSetting::new()
                            .with_set_meta(HEARTBEAT_META_KEY, rate_second);
                        let sent = if use_call {
                            sess.call_with::<(), ()>(HEARTBEAT_SERVICE_METHOD, (), setting)
                                .await
                                .map(|_| ())
                        } else {
                            sess.push_with(HEARTBEAT_SERVICE_METHOD, (), setting).await
                        };
                        if let Err(stat) = sent {
                            tracing::warn!(id = %sess.id(), %stat, "heartbeat failed; closing session");
                            let _ = sess.close().await;
                        }
                    });
                    true
                });
            }
        });
        Ok(())
    }

    fn post_dial<'a>(
        &'a self,
        sess: PreSession<'a>,
        _is_redial: bool,
    ) -> BoxFuture<'a, Result<(), Status>> {
        let rate = *self.state.rate.lock();
        Box::pin(async move {
            init_info(sess.swap(), rate);
            Ok(())
        })
    }

    fn post_accept<'a>(&'a self, sess: PreSession<'a>) -> BoxFuture<'a, Result<(), Status>> {
        let rate = *self.state.rate.lock();
        Box::pin(async move {
            init_info(sess.swap(), rate);
            Ok(())
        })
    }

    fn post_write_call(&self, ctx: &mut WriteCtx<'_>) -> Result<(), Status> {
        touch(ctx.session());
        Ok(())
    }

    fn post_write_push(&self, ctx: &mut WriteCtx<'_>) -> Result<(), Status> {
        touch(ctx.session());
        Ok(())
    }

    fn post_read_call_header(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        touch(ctx.session());
        Ok(())
    }

    fn post_read_push_header(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        touch(ctx.session());
        Ok(())
    }
}

/// Heartbeat receiver: answers pings and reaps sessions that miss two
/// periods.
pub fn pong() -> Arc<dyn Plugin> {
    Arc::new(HeartPong)
}

struct HeartPong;

fn handle_heartbeat(sess: &Arc<Session>, rate_meta: Option<&str>) -> Result<(), Status> {
    let rate_second: i64 = match rate_meta {
        None | Some("") => 0,
        Some(s) => s.parse().unwrap_or(-1),
    };
    let first = update_info(
        sess.swap(),
        Duration::from_secs(rate_second.max(0) as u64),
    );
    if first && rate_second < 0 {
        return Err(Status::bad_message(format!(
            "invalid heartbeat rate: {:?}",
            rate_meta.unwrap_or_default()
        )));
    }
    if rate_second > 0 {
        tracing::trace!(id = %sess.id(), rate_second, "heart-pong: rate adopted");
    } else {
        tracing::trace!(id = %sess.id(), "heart-pong");
    }
    Ok(())
}

impl Plugin for HeartPong {
    fn name(&self) -> &'static str {
        "heart-pong"
    }

    fn post_new_peer(&self, peer: &Peer) -> Result<(), Status> {
        peer.route_call("heartbeat", |ctx: CallCtx, _arg: ()| async move {
            let rate = ctx.meta().get(HEARTBEAT_META_KEY).map(str::to_string);
            handle_heartbeat(ctx.session(), rate.as_deref())?;
            Ok(())
        })?;
        peer.route_push("heartbeat", |ctx: PushCtx, _arg: ()| async move {
            let rate = ctx.meta().get(HEARTBEAT_META_KEY).map(str::to_string);
            handle_heartbeat(ctx.session(), rate.as_deref())
        })?;

        let peer = peer.clone();
        let shutdown = peer.core.shutdown.clone();
        let initial = Duration::from_secs(MIN_RATE_SECOND) - Duration::from_millis(1);
        tokio::spawn(async move {
            let mut interval = initial;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let mut stale = Vec::new();
                peer.core.hub.range(|sess| {
                    let Some(info) = sess.swap().get_cloned::<HeartbeatInfo>(SWAP_KEY) else {
                        return true;
                    };
                    if sess.health() && info.last + info.rate * 2 < Instant::now() {
                        stale.push(sess);
                    } else if info.rate < interval || interval == initial {
                        interval = info.rate;
                    }
                    true
                });
                for sess in stale {
                    tracing::warn!(id = %sess.id(), "heartbeat lost; closing session");
                    let _ = sess.close().await;
                }
            }
        });
        Ok(())
    }

    fn post_write_call(&self, ctx: &mut WriteCtx<'_>) -> Result<(), Status> {
        touch(ctx.session());
        Ok(())
    }

    fn post_write_push(&self, ctx: &mut WriteCtx<'_>) -> Result<(), Status> {
        touch(ctx.session());
        Ok(())
    }

    fn post_read_call_header(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        if ctx.service_method() != HEARTBEAT_SERVICE_METHOD {
            touch(ctx.session());
        }
        Ok(())
    }

    fn post_read_push_header(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        if ctx.service_method() != HEARTBEAT_SERVICE_METHOD {
            touch(ctx.session());
        }
        Ok(())
    }
}
