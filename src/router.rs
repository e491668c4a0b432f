use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::responder::Responder;
use crate::update::Update;

/// Business logic bound to a command or content pattern.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, update: &Update, responder: &Responder) -> Result<()>;
}

/// Pure check on an update; must not perform I/O.
type Predicate = Box<dyn Fn(&Update) -> bool + Send + Sync>;

struct Route {
    predicate: Predicate,
    handler: Arc<dyn Handler>,
}

/// Ordered handler table. Built once at startup, then only read.
pub struct CommandRouter {
    routes: Vec<Route>,
    fallback: Arc<dyn Handler>,
}

impl CommandRouter {
    pub fn new<H>(fallback: H) -> Self
    where
        H: Handler + 'static,
    {
        Self {
            routes: Vec::new(),
            fallback: Arc::new(fallback),
        }
    }

    /// Register a handler for updates matching `predicate`.
    pub fn route_when<P, H>(mut self, predicate: P, handler: H) -> Self
    where
        P: Fn(&Update) -> bool + Send + Sync + 'static,
        H: Handler + 'static,
    {
        self.routes.push(Route {
            predicate: Box::new(predicate),
            handler: Arc::new(handler),
        });
        self
    }

    /// Register a handler for `/name` commands.
    pub fn command<H>(self, name: &str, handler: H) -> Self
    where
        H: Handler + 'static,
    {
        let name = name.trim_start_matches('/').to_lowercase();
        self.route_when(
            move |update: &Update| update.command().is_some_and(|(cmd, _)| cmd == name),
            handler,
        )
    }

    /// First matching registration in order, or the fallback.
    pub fn route(&self, update: &Update) -> Arc<dyn Handler> {
        self.routes
            .iter()
            .find(|route| (route.predicate)(update))
            .map(|route| route.handler.clone())
            .unwrap_or_else(|| self.fallback.clone())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }
}
