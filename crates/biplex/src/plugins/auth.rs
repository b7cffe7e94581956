//! Session authentication at connection setup.
//!
//! The bearer side (client) sends one `AUTH_CALL` carrying its credentials
//! right after dialing; the checker side (server) receives it in
//! `post_accept` and answers with one `AUTH_REPLY`. Wrong credentials
//! reject the session before any user message is exchanged.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use biplex_core::{BoxFuture, MessageSetting, Mtype, Status};

use crate::plugin::Plugin;
use crate::session::PreSession;

/// How long each side waits for the single auth message.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Client-side auth plugin: sends `info` as an `AUTH_CALL` after every
/// dial (including redials) and verifies the `AUTH_REPLY` body with
/// `verify`.
pub fn bearer<Info, Ret, F>(info: Info, verify: F) -> Arc<dyn Plugin>
where
    Info: Serialize + Send + Sync + 'static,
    Ret: DeserializeOwned + Send + Sync + 'static,
    F: Fn(&Ret) -> Result<(), Status> + Send + Sync + 'static,
{
    Arc::new(AuthBearer {
        info,
        verify,
        setting: MessageSetting::new(),
        _ret: PhantomData::<fn() -> Ret>,
    })
}

/// Server-side auth plugin: receives the `AUTH_CALL`, passes its decoded
/// body to `check`, and answers with the returned value (or the error
/// status) as an `AUTH_REPLY`.
pub fn checker<Info, Ret, F>(check: F) -> Arc<dyn Plugin>
where
    Info: DeserializeOwned + Send + Sync + 'static,
    Ret: Serialize + Send + Sync + 'static,
    F: for<'a> Fn(PreSession<'a>, Info) -> Result<Ret, Status> + Send + Sync + 'static,
{
    Arc::new(AuthChecker {
        check,
        setting: MessageSetting::new(),
        _info: PhantomData::<fn() -> Info>,
        _ret: PhantomData::<fn() -> Ret>,
    })
}

struct AuthBearer<Info, Ret, F> {
    info: Info,
    verify: F,
    setting: MessageSetting,
    _ret: PhantomData<fn() -> Ret>,
}

impl<Info, Ret, F> Plugin for AuthBearer<Info, Ret, F>
where
    Info: Serialize + Send + Sync + 'static,
    Ret: DeserializeOwned + Send + Sync + 'static,
    F: Fn(&Ret) -> Result<(), Status> + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        "auth-bearer"
    }

    fn post_dial<'a>(
        &'a self,
        sess: PreSession<'a>,
        _is_redial: bool,
    ) -> BoxFuture<'a, Result<(), Status>> {
        Box::pin(async move {
            sess.pre_send(
                Mtype::AuthCall,
                "",
                Some(&self.info),
                Status::ok(),
                self.setting.clone(),
            )
            .await?;
            let reply = sess.pre_receive(Some(AUTH_TIMEOUT)).await?;
            if !reply.status().is_ok() {
                return Err(reply.status().clone());
            }
            if reply.mtype() != Mtype::AuthReply {
                return Err(Status::unauthorized(format!(
                    "auth message(1st) expect: AUTH_REPLY, but received: {}",
                    reply.mtype().text()
                )));
            }
            let ret: Ret = sess.decode_body(&reply)?;
            (self.verify)(&ret)
        })
    }
}

struct AuthChecker<Info, Ret, F> {
    check: F,
    setting: MessageSetting,
    _info: PhantomData<fn() -> Info>,
    _ret: PhantomData<fn() -> Ret>,
}

impl<Info, Ret, F> Plugin for AuthChecker<Info, Ret, F>
where
    Info: DeserializeOwned + Send + Sync + 'static,
    Ret: Serialize + Send + Sync + 'static,
    F: for<'a> Fn(PreSession<'a>, Info) -> Result<Ret, Status> + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        "auth-checker"
    }

    fn post_accept<'a>(&'a self, sess: PreSession<'a>) -> BoxFuture<'a, Result<(), Status>> {
        Box::pin(async move {
            let msg = sess.pre_receive(Some(AUTH_TIMEOUT)).await?;
            if msg.mtype() != Mtype::AuthCall {
                let stat = Status::unauthorized(format!(
                    "auth message(1st) expect: AUTH_CALL, but received: {}",
                    msg.mtype().text()
                ));
                let _ = sess
                    .pre_send::<()>(Mtype::AuthReply, "", None, stat.clone(), self.setting.clone())
                    .await;
                return Err(stat);
            }
            let info: Info = match sess.decode_body(&msg) {
                Ok(info) => info,
                Err(stat) => {
                    let _ = sess
                        .pre_send::<()>(
                            Mtype::AuthReply,
                            "",
                            None,
                            stat.clone(),
                            self.setting.clone(),
                        )
                        .await;
                    return Err(stat);
                }
            };
            match (self.check)(sess, info) {
                Ok(ret) => {
                    sess.pre_send(
                        Mtype::AuthReply,
                        "",
                        Some(&ret),
                        Status::ok(),
                        self.setting.clone(),
                    )
                    .await
                }
                Err(stat) => {
                    let _ = sess
                        .pre_send::<()>(
                            Mtype::AuthReply,
                            "",
                            None,
                            stat.clone(),
                            self.setting.clone(),
                        )
                        .await;
                    Err(stat)
                }
            }
        })
    }
}
