//! Router: maps canonical service methods to handlers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use biplex_core::{BodyCodec, BoxFuture, Status};

use crate::context::{CallCtx, HandlerCtx, PushCtx, UnknownCallCtx, UnknownPushCtx};
use crate::plugin::{Plugin, PluginContainer};

/// How controller/method names become canonical service methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceMethodMapper {
    /// Slash paths with snake_case words: `("/echo", "AddSuffix")` maps to
    /// `/echo/add_suffix`.
    #[default]
    Http,
    /// Dot paths with CamelCase words: `("Echo", "add_suffix")` maps to
    /// `Echo.AddSuffix`.
    Rpc,
}

fn snake_words(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.chars() {
        if c == '_' || c == '-' {
            if !out.ends_with('_') && !out.is_empty() {
                out.push('_');
            }
            prev_lower = false;
        } else if c.is_uppercase() {
            if prev_lower && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
            prev_lower = false;
        } else {
            out.push(c);
            prev_lower = c.is_lowercase() || c.is_ascii_digit();
        }
    }
    out.trim_matches('_').to_string()
}

fn camel_words(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for chunk in name.split(['_', '-', '/']).filter(|s| !s.is_empty()) {
        let mut chars = chunk.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
        }
    }
    out
}

impl ServiceMethodMapper {
    /// Joins a canonical prefix and a raw name into a canonical path.
    pub fn join(&self, prefix: &str, name: &str) -> String {
        match self {
            ServiceMethodMapper::Http => {
                let mut path = String::new();
                for seg in prefix
                    .split('/')
                    .chain(name.split(['/', '.']))
                    .filter(|s| !s.is_empty())
                {
                    path.push('/');
                    path.push_str(&snake_words(seg));
                }
                if path.is_empty() {
                    path.push('/');
                }
                path
            }
            ServiceMethodMapper::Rpc => {
                let mut path = String::new();
                for seg in prefix
                    .split('.')
                    .chain(name.split(['/', '.']))
                    .filter(|s| !s.is_empty())
                {
                    if !path.is_empty() {
                        path.push('.');
                    }
                    path.push_str(&camel_words(seg));
                }
                path
            }
        }
    }
}

/// Whether a handler answers CALLs or consumes PUSHes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Call,
    Push,
}

/// What a handler produced: an encoded reply body (CALLs only) and a
/// status.
pub(crate) struct HandlerOutcome {
    pub(crate) reply_codec: BodyCodec,
    pub(crate) reply_body: Option<Vec<u8>>,
    pub(crate) status: Status,
}

impl HandlerOutcome {
    pub(crate) fn error(status: Status) -> Self {
        Self {
            reply_codec: BodyCodec::Raw,
            reply_body: None,
            status,
        }
    }
}

pub(crate) type HandlerFunc =
    Arc<dyn Fn(Arc<HandlerCtx>) -> BoxFuture<'static, HandlerOutcome> + Send + Sync>;

/// A registered handler: canonical name, kind, plugin chain and the erased
/// invocation function.
pub struct Handler {
    name: String,
    kind: HandlerKind,
    plugins: Arc<PluginContainer>,
    func: HandlerFunc,
}

impl Handler {
    /// Canonical service method.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    pub(crate) fn plugins(&self) -> &PluginContainer {
        &self.plugins
    }

    pub(crate) fn invoke(&self, ctx: Arc<HandlerCtx>) -> BoxFuture<'static, HandlerOutcome> {
        (self.func)(ctx)
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Tables {
    call: RwLock<HashMap<String, Arc<Handler>>>,
    push: RwLock<HashMap<String, Arc<Handler>>>,
    unknown_call: RwLock<Option<Arc<Handler>>>,
    unknown_push: RwLock<Option<Arc<Handler>>>,
    mapper: RwLock<ServiceMethodMapper>,
}

/// Root of the handler tables.
///
/// Cheap to clone; clones share the tables. [`Router::sub_route`] scopes a
/// path prefix with an extended plugin chain.
#[derive(Clone)]
pub struct Router {
    root: SubRouter,
}

impl Router {
    pub(crate) fn new(plugins: PluginContainer) -> Self {
        Self {
            root: SubRouter {
                tables: Arc::new(Tables::default()),
                prefix: String::new(),
                plugins,
            },
        }
    }

    /// Selects the canonical path format. Takes effect for subsequent
    /// registrations, so call this before routing.
    pub fn set_service_method_mapper(&self, mapper: ServiceMethodMapper) {
        *self.root.tables.mapper.write() = mapper;
    }

    pub fn sub_route(&self, prefix: &str, plugins: Vec<Arc<dyn Plugin>>) -> SubRouter {
        self.root.sub_route(prefix, plugins)
    }

    pub fn route_call<A, R, F, Fut>(&self, name: &str, f: F) -> Result<String, Status>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(CallCtx, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Status>> + Send + 'static,
    {
        self.root.route_call(name, f)
    }

    pub fn route_push<A, F, Fut>(&self, name: &str, f: F) -> Result<String, Status>
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(PushCtx, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        self.root.route_push(name, f)
    }

    pub fn route_call_raw<F, Fut>(&self, name: &str, f: F) -> Result<String, Status>
    where
        F: Fn(CallCtx, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, Status>> + Send + 'static,
    {
        self.root.route_call_raw(name, f)
    }

    pub fn route_push_raw<F, Fut>(&self, name: &str, f: F) -> Result<String, Status>
    where
        F: Fn(PushCtx, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        self.root.route_push_raw(name, f)
    }

    /// Installs the fallback run when no CALL handler matches. The fallback
    /// sees the raw body and returns `(codec id, encoded reply body)`.
    pub fn set_unknown_call<F, Fut>(&self, f: F)
    where
        F: Fn(UnknownCallCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(u8, Vec<u8>), Status>> + Send + 'static,
    {
        let plugins = Arc::new(self.root.plugins.clone());
        let f = Arc::new(f);
        let func: HandlerFunc = Arc::new(move |hctx: Arc<HandlerCtx>| {
            let f = f.clone();
            Box::pin(async move {
                let ctx = UnknownCallCtx { inner: hctx };
                match f(ctx).await {
                    Ok((codec_id, body)) => match BodyCodec::by_id(codec_id) {
                        Ok(codec) => HandlerOutcome {
                            reply_codec: codec,
                            reply_body: Some(body),
                            status: Status::ok(),
                        },
                        Err(stat) => HandlerOutcome::error(stat),
                    },
                    Err(stat) => HandlerOutcome::error(stat),
                }
            })
        });
        *self.root.tables.unknown_call.write() = Some(Arc::new(Handler {
            name: "*".into(),
            kind: HandlerKind::Call,
            plugins,
            func,
        }));
    }

    /// Installs the fallback run when no PUSH handler matches.
    pub fn set_unknown_push<F, Fut>(&self, f: F)
    where
        F: Fn(UnknownPushCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let plugins = Arc::new(self.root.plugins.clone());
        let f = Arc::new(f);
        let func: HandlerFunc = Arc::new(move |hctx: Arc<HandlerCtx>| {
            let f = f.clone();
            Box::pin(async move {
                let ctx = UnknownPushCtx { inner: hctx };
                let status = match f(ctx).await {
                    Ok(()) => Status::ok(),
                    Err(stat) => stat,
                };
                HandlerOutcome {
                    reply_codec: BodyCodec::Raw,
                    reply_body: None,
                    status,
                }
            })
        });
        *self.root.tables.unknown_push.write() = Some(Arc::new(Handler {
            name: "*".into(),
            kind: HandlerKind::Push,
            plugins,
            func,
        }));
    }

    pub(crate) fn get_call(&self, path: &str) -> Option<Arc<Handler>> {
        self.root.tables.call.read().get(path).cloned()
    }

    pub(crate) fn get_push(&self, path: &str) -> Option<Arc<Handler>> {
        self.root.tables.push.read().get(path).cloned()
    }

    pub(crate) fn unknown_call(&self) -> Option<Arc<Handler>> {
        self.root.tables.unknown_call.read().clone()
    }

    pub(crate) fn unknown_push(&self) -> Option<Arc<Handler>> {
        self.root.tables.unknown_push.read().clone()
    }
}

/// A routing group: a path prefix plus an inherited plugin chain.
#[derive(Clone)]
pub struct SubRouter {
    tables: Arc<Tables>,
    prefix: String,
    plugins: PluginContainer,
}

impl SubRouter {
    /// A nested group. Child plugins run after the inherited chain.
    pub fn sub_route(&self, prefix: &str, plugins: Vec<Arc<dyn Plugin>>) -> SubRouter {
        let mapper = *self.tables.mapper.read();
        SubRouter {
            tables: self.tables.clone(),
            prefix: mapper.join(&self.prefix, prefix),
            plugins: self.plugins.child_with(&plugins),
        }
    }

    /// Registers a CALL handler under this group and returns its canonical
    /// path. The argument is decoded with the message's body codec; the
    /// reply is encoded with the caller's accepted codec.
    pub fn route_call<A, R, F, Fut>(&self, name: &str, f: F) -> Result<String, Status>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(CallCtx, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Status>> + Send + 'static,
    {
        self.route_call_with(name, f, Vec::new())
    }

    /// [`SubRouter::route_call`] with handler-specific plugins appended to
    /// the chain.
    pub fn route_call_with<A, R, F, Fut>(
        &self,
        name: &str,
        f: F,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<String, Status>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(CallCtx, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Status>> + Send + 'static,
    {
        let f = Arc::new(f);
        let func: HandlerFunc = Arc::new(move |hctx: Arc<HandlerCtx>| {
            let f = f.clone();
            Box::pin(async move {
                let codec = match hctx.input_codec() {
                    Ok(codec) => codec,
                    Err(stat) => return HandlerOutcome::error(stat),
                };
                let arg: A = match codec.unmarshal(hctx.input.body()) {
                    Ok(arg) => arg,
                    Err(stat) => return HandlerOutcome::error(stat),
                };
                let ctx = CallCtx { inner: hctx.clone() };
                match f(ctx, arg).await {
                    Ok(reply) => {
                        let reply_codec = hctx.reply_codec();
                        match reply_codec.marshal(&reply) {
                            Ok(body) => HandlerOutcome {
                                reply_codec,
                                reply_body: Some(body),
                                status: Status::ok(),
                            },
                            Err(stat) => HandlerOutcome::error(stat),
                        }
                    }
                    Err(stat) => HandlerOutcome::error(stat),
                }
            })
        });
        self.register(name, HandlerKind::Call, func, plugins)
    }

    /// Registers a PUSH handler under this group and returns its canonical
    /// path.
    pub fn route_push<A, F, Fut>(&self, name: &str, f: F) -> Result<String, Status>
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(PushCtx, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        self.route_push_with(name, f, Vec::new())
    }

    /// [`SubRouter::route_push`] with handler-specific plugins appended to
    /// the chain.
    pub fn route_push_with<A, F, Fut>(
        &self,
        name: &str,
        f: F,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<String, Status>
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(PushCtx, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let f = Arc::new(f);
        let func: HandlerFunc = Arc::new(move |hctx: Arc<HandlerCtx>| {
            let f = f.clone();
            Box::pin(async move {
                let codec = match hctx.input_codec() {
                    Ok(codec) => codec,
                    Err(stat) => return HandlerOutcome::error(stat),
                };
                let arg: A = match codec.unmarshal(hctx.input.body()) {
                    Ok(arg) => arg,
                    Err(stat) => return HandlerOutcome::error(stat),
                };
                let ctx = PushCtx { inner: hctx };
                let status = match f(ctx, arg).await {
                    Ok(()) => Status::ok(),
                    Err(stat) => stat,
                };
                HandlerOutcome {
                    reply_codec: BodyCodec::Raw,
                    reply_body: None,
                    status,
                }
            })
        });
        self.register(name, HandlerKind::Push, func, plugins)
    }

    /// Registers a CALL handler whose body is raw bytes: the argument is
    /// the raw-coded input body passed through unchanged, and the returned
    /// bytes travel back under the raw codec.
    pub fn route_call_raw<F, Fut>(&self, name: &str, f: F) -> Result<String, Status>
    where
        F: Fn(CallCtx, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, Status>> + Send + 'static,
    {
        let f = Arc::new(f);
        let func: HandlerFunc = Arc::new(move |hctx: Arc<HandlerCtx>| {
            let f = f.clone();
            Box::pin(async move {
                let codec = match hctx.input_codec() {
                    Ok(codec) => codec,
                    Err(stat) => return HandlerOutcome::error(stat),
                };
                let arg = match codec.unmarshal_bytes(hctx.input.body()) {
                    Ok(bytes) => Bytes::from(bytes),
                    Err(stat) => return HandlerOutcome::error(stat),
                };
                let ctx = CallCtx { inner: hctx };
                match f(ctx, arg).await {
                    Ok(body) => match BodyCodec::Raw.marshal_bytes(&body) {
                        Ok(body) => HandlerOutcome {
                            reply_codec: BodyCodec::Raw,
                            reply_body: Some(body),
                            status: Status::ok(),
                        },
                        Err(stat) => HandlerOutcome::error(stat),
                    },
                    Err(stat) => HandlerOutcome::error(stat),
                }
            })
        });
        self.register(name, HandlerKind::Call, func, Vec::new())
    }

    /// Registers a PUSH handler whose body is raw bytes.
    pub fn route_push_raw<F, Fut>(&self, name: &str, f: F) -> Result<String, Status>
    where
        F: Fn(PushCtx, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let f = Arc::new(f);
        let func: HandlerFunc = Arc::new(move |hctx: Arc<HandlerCtx>| {
            let f = f.clone();
            Box::pin(async move {
                let codec = match hctx.input_codec() {
                    Ok(codec) => codec,
                    Err(stat) => return HandlerOutcome::error(stat),
                };
                let arg = match codec.unmarshal_bytes(hctx.input.body()) {
                    Ok(bytes) => Bytes::from(bytes),
                    Err(stat) => return HandlerOutcome::error(stat),
                };
                let ctx = PushCtx { inner: hctx };
                let status = match f(ctx, arg).await {
                    Ok(()) => Status::ok(),
                    Err(stat) => stat,
                };
                HandlerOutcome {
                    reply_codec: BodyCodec::Raw,
                    reply_body: None,
                    status,
                }
            })
        });
        self.register(name, HandlerKind::Push, func, Vec::new())
    }

    fn register(
        &self,
        name: &str,
        kind: HandlerKind,
        func: HandlerFunc,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<String, Status> {
        let mapper = *self.tables.mapper.read();
        let path = mapper.join(&self.prefix, name);
        let handler = Arc::new(Handler {
            name: path.clone(),
            kind,
            plugins: Arc::new(self.plugins.child_with(&plugins)),
            func,
        });

        {
            let mut table = match kind {
                HandlerKind::Call => self.tables.call.write(),
                HandlerKind::Push => self.tables.push.write(),
            };
            if table.contains_key(&path) {
                tracing::error!(path = %path, "handler already registered");
                return Err(Status::new(
                    biplex_core::code::UNKNOWN_ERROR,
                    "duplicate handler registration",
                    path,
                ));
            }
            table.insert(path.clone(), handler.clone());
        }

        handler.plugins.post_reg(&handler)?;
        tracing::debug!(path = %path, kind = ?kind, "handler registered");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_mapper_paths() {
        let m = ServiceMethodMapper::Http;
        assert_eq!(m.join("", "AddSuffix"), "/add_suffix");
        assert_eq!(m.join("/echo", "AddSuffix"), "/echo/add_suffix");
        assert_eq!(m.join("/group", "Home.Test"), "/group/home/test");
        assert_eq!(m.join("", "ABcXYz"), "/abc_xyz");
        assert_eq!(m.join("", "Aa__Bb"), "/aa_bb");
    }

    #[test]
    fn test_rpc_mapper_paths() {
        let m = ServiceMethodMapper::Rpc;
        assert_eq!(m.join("", "add_suffix"), "AddSuffix");
        assert_eq!(m.join("Group", "home_test"), "Group.HomeTest");
        assert_eq!(m.join("Group.Home", "Test"), "Group.Home.Test");
    }

    #[test]
    fn test_register_and_lookup() {
        let router = Router::new(PluginContainer::new());
        let path = router
            .route_call("echo/AddSuffix", |_ctx: CallCtx, arg: String| async move {
                Ok::<_, Status>(arg)
            })
            .unwrap();
        assert_eq!(path, "/echo/add_suffix");
        assert!(router.get_call("/echo/add_suffix").is_some());
        assert!(router.get_call("/echo/addsuffix").is_none());
        assert!(router.get_push("/echo/add_suffix").is_none());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let router = Router::new(PluginContainer::new());
        router
            .route_push("note", |_ctx: PushCtx, _arg: String| async { Ok(()) })
            .unwrap();
        let dup = router.route_push("note", |_ctx: PushCtx, _arg: String| async { Ok(()) });
        assert!(dup.is_err());
    }

    #[test]
    fn test_sub_route_prefix_composition() {
        let router = Router::new(PluginContainer::new());
        let group = router.sub_route("group", Vec::new());
        let home = group.sub_route("home", Vec::new());
        let path = home
            .route_call("Test", |_ctx: CallCtx, arg: i32| async move {
                Ok::<_, Status>(arg)
            })
            .unwrap();
        assert_eq!(path, "/group/home/test");
    }
}
