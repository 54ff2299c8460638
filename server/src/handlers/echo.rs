//! Echo handler (latency testing)

use protocol::ControlMessage;
use tracing::{debug, info};

/// Answer a ping
///
/// The reply mirrors the probe's sequence number and send time untouched,
/// so the client computes RTT on its own clock.
pub fn handle_ping(connection_id: u64, seq: u64, send_time: f64, log_requests: bool) -> ControlMessage {
    if log_requests {
        info!("Echo seq={} from connection {}", seq, connection_id);
    } else {
        debug!("Echo seq={} from connection {}", seq, connection_id);
    }
    ControlMessage::Pong { seq, send_time }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pong_mirrors_ping() {
        let reply = handle_ping(1, 42, 1234.5678, false);
        assert_eq!(reply, ControlMessage::Pong { seq: 42, send_time: 1234.5678 });
    }

    #[test]
    fn test_pong_wire_fields() {
        let json = handle_ping(1, 7, 0.25, true).to_json().unwrap();
        assert_eq!(json, r#"{"type":"pong","seq":7,"sendTime":0.25}"#);
    }
}
