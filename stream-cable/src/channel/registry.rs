use std::{collections::HashMap, sync::Arc};

use super::ChannelHandler;

type Factory = Arc<dyn Fn() -> Box<dyn ChannelHandler> + Send + Sync>;

/// Channel class name -> handler factory.
///
/// A fresh handler is built for every subscription, so handler state is
/// never shared between connections.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    factories: HashMap<String, Factory>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, H>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: ChannelHandler,
    {
        let factory: Factory = Arc::new(move || -> Box<dyn ChannelHandler> { Box::new(factory()) });
        self.factories.insert(name.into(), factory);
        self
    }

    pub fn build(&self, name: &str) -> Option<Box<dyn ChannelHandler>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}
