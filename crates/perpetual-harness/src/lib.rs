//! Perpetual Channels Test Harness
//!
//! Deterministic building blocks for testing connections and perpetual
//! channels without a network:
//! - `MockTransport`: dials parked until the test accepts or rejects them
//! - `MockPeer`: the server side of one link
//! - `RecordingHandler`: connection stage or channel consumer recording its
//!   callbacks
//!
//! Combined with tokio's paused clock, every timer-driven behavior (rotation,
//! liveness, retries) can be asserted to the millisecond.

pub mod mock_transport;
pub mod recording;

pub use mock_transport::{
    MockPeer, MockTransport, MockTransportConfig, MockTransportStats, PendingDial,
};
pub use recording::{Recorded, Recording, RecordingHandler, DEFAULT_WAIT};

use perpetual_core::{Connection, ConnectionState, PerpetualChannel};

/// Wait until `channel` holds exactly `count` joined connections
///
/// Returns false if that did not happen within `DEFAULT_WAIT`.
pub async fn wait_for_connections(channel: &PerpetualChannel, count: usize) -> bool {
    let mut connections = channel.subscribe_connections();
    let reached = async {
        loop {
            if connections.borrow_and_update().len() == count {
                return true;
            }
            if connections.changed().await.is_err() {
                return false;
            }
        }
    };
    tokio::time::timeout(DEFAULT_WAIT, reached)
        .await
        .unwrap_or(false)
}

/// Wait until `connection` reaches `state` or a later one
pub async fn wait_for_state(connection: &Connection, state: ConnectionState) -> ConnectionState {
    let mut states = connection.subscribe_state();
    let reached = async {
        loop {
            let current = *states.borrow_and_update();
            if current >= state {
                return current;
            }
            if states.changed().await.is_err() {
                return current;
            }
        }
    };
    tokio::time::timeout(DEFAULT_WAIT, reached)
        .await
        .unwrap_or_else(|_| connection.state())
}
