use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

/// Outcome of an upgrade request against the cable endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeDecision {
    /// Complete the websocket handshake, advertising `protocol`.
    Accept { protocol: &'static str },
    /// Not a websocket request.
    Reject,
}

pub fn negotiate(is_websocket: bool, protocol_definition: &'static str) -> UpgradeDecision {
    if is_websocket {
        UpgradeDecision::Accept {
            protocol: protocol_definition,
        }
    } else {
        UpgradeDecision::Reject
    }
}

/// `426 Upgrade Required` asking the client to come back over a websocket.
pub fn upgrade_required() -> Response {
    (
        StatusCode::UPGRADE_REQUIRED,
        [(header::CONNECTION, "Upgrade"), (header::UPGRADE, "websocket")],
    )
        .into_response()
}
