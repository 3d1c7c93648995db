//! Placeholder socket adapter.
//!
//! There is no real transport here. Sent messages loop back into an
//! in-memory inbox so that machines and their owners can be wired against
//! the `websocket` adapter type before a real socket collaborator exists.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::adapter::Adapter;
use crate::error::EntangleError;

#[derive(Debug, Default)]
struct SocketState {
    url: Option<String>,
    connected: bool,
    inbox: VecDeque<Value>,
}

/// Loopback stand-in for a socket transport.
#[derive(Debug, Default)]
pub struct SocketAdapter {
    state: Mutex<SocketState>,
}

impl SocketAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    /// URL passed to `connect`, if one was given.
    pub fn url(&self) -> Option<String> {
        self.state().url.clone()
    }

    /// Messages waiting to be received.
    pub fn pending(&self) -> usize {
        self.state().inbox.len()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SocketState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn not_connected() -> EntangleError {
        EntangleError::NotConnected {
            adapter_type: "websocket",
        }
    }
}

#[async_trait]
impl Adapter for SocketAdapter {
    async fn connect(&self, config: Value) -> Result<()> {
        let url = config.get("url").and_then(Value::as_str).map(str::to_owned);
        debug!(url = ?url, "socket adapter connected");

        let mut state = self.state();
        state.url = url;
        state.connected = true;
        Ok(())
    }

    async fn send(&self, data: Value) -> Result<Value> {
        let mut state = self.state();
        if !state.connected {
            return Err(Self::not_connected().into());
        }
        state.inbox.push_back(data);
        Ok(json!({ "sent": true }))
    }

    async fn receive(&self) -> Result<Value> {
        let mut state = self.state();
        if !state.connected {
            return Err(Self::not_connected().into());
        }
        Ok(state.inbox.pop_front().unwrap_or(Value::Null))
    }
}
