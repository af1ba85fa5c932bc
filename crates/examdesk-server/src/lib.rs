use std::sync::Arc;

use examdesk_core::{AppConfig, ChatService};

mod http;

pub use http::{app_router, serve, CORRELATION_HEADER};

/// Shared, read-only handles for every request.
#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatService>,
}

impl AppState {
    pub fn new(chat: ChatService) -> Self {
        Self {
            chat: Arc::new(chat),
        }
    }

    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        Ok(Self::new(ChatService::from_config(config)?))
    }
}
