//! Shared fixtures for the scenario tests

#![allow(dead_code)]

use std::sync::Arc;

use perpetual_core::{
    ChannelConfig, ChannelHandler, Connection, ConnectionConfig, ConnectionHandler, DialRequest,
    PerpetualChannel, Scheduler,
};
use perpetual_harness::MockTransport;

pub const FEED: &str = "mock://feed";

/// Install a test subscriber honoring RUST_LOG; safe to call repeatedly
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Channel on the mock transport with short test timings
pub fn create_test_channel(
    transport: &MockTransport,
    handler: Arc<dyn ChannelHandler>,
) -> PerpetualChannel {
    create_test_channel_with(transport, handler, Vec::new())
}

/// Channel whose connections walk `initializers` before joining
pub fn create_test_channel_with(
    transport: &MockTransport,
    handler: Arc<dyn ChannelHandler>,
    initializers: Vec<Arc<dyn ConnectionHandler>>,
) -> PerpetualChannel {
    init_tracing();
    PerpetualChannel::builder(DialRequest::new(FEED))
        .config(ChannelConfig::testing())
        .initializers(initializers)
        .handler(handler)
        .build(&Scheduler::current(), transport.handle())
        .expect("valid test configuration")
}

/// Standalone connection on the mock transport with short test timings
pub fn create_test_connection(
    transport: &MockTransport,
    stages: Vec<Arc<dyn ConnectionHandler>>,
) -> Connection {
    init_tracing();
    Connection::builder(DialRequest::new(FEED))
        .name("test")
        .config(ConnectionConfig::testing())
        .handlers(stages)
        .connect(&Scheduler::current(), transport.handle())
        .expect("valid test configuration")
}
