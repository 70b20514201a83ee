//! Shared helpers for integration tests
#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use demand_broker::config::{ConsumerConfig, ManagementConfig};
use demand_broker::messaging::providers::InMemoryBroker;
use demand_broker::messaging::{handler_fn, Broker, Consumer, MessageHandler};
use demand_broker::web::{create_app, ManagementState};

pub const FAST_RECONNECT: Duration = Duration::from_millis(20);

/// Broker core over an in-memory transport with a short reconnect delay
pub fn memory_broker(memory: &InMemoryBroker) -> Arc<Broker> {
    Arc::new(Broker::new(Arc::new(memory.clone()), FAST_RECONNECT))
}

pub fn consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        consumer_id: Some("test-consumer".to_string()),
        reconnect_delay_ms: FAST_RECONNECT.as_millis() as u64,
        ..ConsumerConfig::default()
    }
}

pub fn memory_consumer(memory: &InMemoryBroker) -> Consumer {
    Consumer::new("test-consumer", memory_broker(memory), &consumer_config())
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Handler that records every body it sees and fails while `failures` remain
#[derive(Clone, Default)]
pub struct RecordingHandler {
    pub seen: Arc<Mutex<Vec<Value>>>,
    pub calls: Arc<AtomicUsize>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> Arc<dyn MessageHandler> {
        let seen = Arc::clone(&self.seen);
        let calls = Arc::clone(&self.calls);
        handler_fn(move |message| {
            let seen = Arc::clone(&seen);
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                seen.lock().push(message.body);
                Ok(())
            }
        })
    }

    pub fn failing_handler(&self) -> Arc<dyn MessageHandler> {
        let calls = Arc::clone(&self.calls);
        handler_fn(move |_message| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("handler always fails"))
            }
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<Value> {
        self.seen.lock().clone()
    }
}

/// Serve the management API on an ephemeral port, returning its base URL
pub async fn spawn_management_server(broker: Arc<Broker>) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let address = listener.local_addr().expect("local address");
    let app = create_app(ManagementState::new(broker, ManagementConfig::default()));
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("management server");
    });
    (format!("http://{address}"), handle)
}

/// Run `f` with a timeout so a hung loop fails the test instead of stalling it
pub async fn within<T>(timeout: Duration, f: impl Future<Output = T>) -> T {
    tokio::time::timeout(timeout, f)
        .await
        .expect("operation timed out")
}
