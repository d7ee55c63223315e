//! 路由：把路由键映射到不可变的处理链。
//!
//! # 契约说明（What）
//! - 处理链 = 全局中间件 + 路由级中间件 + 终端处理器，在注册时一次性拼装后冻结；
//! - 注册只在流量开始前进行（`&mut self`），查找经 `Arc<dyn Router<C>>` 共享，二者不会并发；
//! - 查找顺序：非零数值 ID 命中 → URI 命中 → 兜底链 → `RouteNotFound`。

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::Context;
use crate::error::{ErrorCode, Result, RpcError};
use crate::packet::{Packet, Route};

/// 处理链中的单个环节。中间件通过 [`Context::next`] 继续执行后续环节。
pub type Handler<C> = Arc<dyn Fn(&mut Context<C>) + Send + Sync>;

/// 冻结后的有序处理链。
pub type HandlerChain<C> = Arc<[Handler<C>]>;

/// 把闭包包装为 [`Handler`]。
pub fn handler<C, F>(f: F) -> Handler<C>
where
    F: Fn(&mut Context<C>) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// 按包查找处理链的契约。
pub trait Router<C>: Send + Sync + 'static {
    fn get_handlers(&self, packet: &Packet) -> Result<HandlerChain<C>>;
}

/// 默认的哈希路由表。
pub struct DefaultRouter<C> {
    middlewares: Vec<Handler<C>>,
    uris: HashMap<String, HandlerChain<C>>,
    ids: HashMap<u32, HandlerChain<C>>,
    fallback: Option<HandlerChain<C>>,
}

impl<C: 'static> DefaultRouter<C> {
    pub fn new() -> Self {
        Self {
            middlewares: Vec::new(),
            uris: HashMap::new(),
            ids: HashMap::new(),
            fallback: None,
        }
    }

    /// 追加全局中间件，仅作用于此后注册的路由。
    pub fn use_middlewares(&mut self, middlewares: impl IntoIterator<Item = Handler<C>>) -> &mut Self {
        self.middlewares.extend(middlewares);
        self
    }

    pub fn use_middleware<F>(&mut self, middleware: F) -> &mut Self
    where
        F: Fn(&mut Context<C>) + Send + Sync + 'static,
    {
        self.middlewares.push(handler(middleware));
        self
    }

    /// 注册只有终端处理器的路由。
    pub fn register<F>(&mut self, route: impl Into<Route>, terminal: F) -> Result<()>
    where
        F: Fn(&mut Context<C>) + Send + Sync + 'static,
    {
        self.register_with(route, Vec::new(), terminal)
    }

    /// 注册带路由级中间件的路由；重复的键返回 `RouteConflict`。
    pub fn register_with<F>(
        &mut self,
        route: impl Into<Route>,
        middlewares: impl IntoIterator<Item = Handler<C>>,
        terminal: F,
    ) -> Result<()>
    where
        F: Fn(&mut Context<C>) + Send + Sync + 'static,
    {
        let route = route.into();
        let occupied = match &route {
            Route::Id(0) => {
                return Err(RpcError::new(
                    ErrorCode::UnexpectedCode,
                    "msg id 0 is reserved for packets without a numeric route",
                ));
            }
            Route::Id(id) => self.ids.contains_key(id),
            Route::Uri(uri) => self.uris.contains_key(uri),
        };
        if occupied {
            return Err(RpcError::new(
                ErrorCode::RouteConflict,
                format!("route {route:?} is already registered"),
            ));
        }

        let chain = self.build_chain(middlewares, handler(terminal));
        match route {
            Route::Id(id) => {
                self.ids.insert(id, chain);
            }
            Route::Uri(uri) => {
                self.uris.insert(uri, chain);
            }
        }
        Ok(())
    }

    /// 安装兜底链，在没有任何路由命中时使用；再次调用会覆盖。
    pub fn no_router<F>(&mut self, terminal: F)
    where
        F: Fn(&mut Context<C>) + Send + Sync + 'static,
    {
        self.no_router_with(Vec::new(), terminal);
    }

    pub fn no_router_with<F>(&mut self, middlewares: impl IntoIterator<Item = Handler<C>>, terminal: F)
    where
        F: Fn(&mut Context<C>) + Send + Sync + 'static,
    {
        self.fallback = Some(self.build_chain(middlewares, handler(terminal)));
    }

    fn build_chain(
        &self,
        middlewares: impl IntoIterator<Item = Handler<C>>,
        terminal: Handler<C>,
    ) -> HandlerChain<C> {
        self.middlewares
            .iter()
            .cloned()
            .chain(middlewares)
            .chain(std::iter::once(terminal))
            .collect()
    }
}

impl<C: 'static> Default for DefaultRouter<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: 'static> Router<C> for DefaultRouter<C> {
    fn get_handlers(&self, packet: &Packet) -> Result<HandlerChain<C>> {
        let by_id = match packet.msg_id() {
            0 => None,
            id => self.ids.get(&id),
        };
        if let Some(chain) = by_id {
            return Ok(chain.clone());
        }
        if let Some(chain) = self.uris.get(packet.uri()) {
            return Ok(chain.clone());
        }
        if let Some(chain) = &self.fallback {
            return Ok(chain.clone());
        }
        Err(RpcError::new(
            ErrorCode::RouteNotFound,
            format!(
                "no handler for uri `{}` / msg id {}",
                packet.uri(),
                packet.msg_id()
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;

    fn packet(uri: &str, msg_id: u32) -> Packet {
        let mut packet = Packet::new();
        packet.set_uri(uri);
        packet.set_msg_id(msg_id);
        packet
    }

    #[test]
    fn numeric_route_wins_over_uri() {
        let mut router = DefaultRouter::<JsonCodec>::new();
        router.register("user.get", |_ctx| {}).expect("注册 URI");
        router.register(7u32, |_ctx| {}).expect("注册数值 ID");
        let by_id = router.get_handlers(&packet("user.get", 7)).expect("命中数值路由");
        let by_uri = router.get_handlers(&packet("user.get", 0)).expect("命中 URI");
        assert!(!Arc::ptr_eq(&by_id, &by_uri));
        assert!(Arc::ptr_eq(
            &by_id,
            &router.get_handlers(&packet("other", 7)).expect("数值路由")
        ));
    }

    #[test]
    fn unknown_numeric_id_falls_back_to_uri_then_fallback() {
        let mut router = DefaultRouter::<JsonCodec>::new();
        router.register("echo", |_ctx| {}).expect("注册");
        assert!(router.get_handlers(&packet("echo", 99)).is_ok());
        let err = router
            .get_handlers(&packet("missing", 0))
            .err()
            .expect("未注册");
        assert!(err.is(ErrorCode::RouteNotFound));

        router.no_router(|_ctx| {});
        assert!(router.get_handlers(&packet("missing", 0)).is_ok());
    }

    #[test]
    fn duplicate_and_reserved_routes_are_rejected() {
        let mut router = DefaultRouter::<JsonCodec>::new();
        router.register("a", |_ctx| {}).expect("首次注册");
        let err = router.register("a", |_ctx| {}).expect_err("重复注册");
        assert!(err.is(ErrorCode::RouteConflict));
        let err = router.register(0u32, |_ctx| {}).expect_err("保留 ID");
        assert!(err.is(ErrorCode::UnexpectedCode));
    }

    #[test]
    fn chain_is_global_then_route_then_terminal() {
        let mut router = DefaultRouter::<JsonCodec>::new();
        router.use_middleware(|_ctx| {});
        router
            .register_with("a", vec![handler(|_ctx| {}), handler(|_ctx| {})], |_ctx| {})
            .expect("注册");
        router.use_middleware(|_ctx| {});
        router.register("b", |_ctx| {}).expect("注册");
        assert_eq!(router.get_handlers(&packet("a", 0)).expect("a").len(), 4);
        assert_eq!(router.get_handlers(&packet("b", 0)).expect("b").len(), 3);
    }
}
