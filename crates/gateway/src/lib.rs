//! Gateway side of the dashboard socket.
//!
//! Accepts WebSocket clients, answers every request frame with exactly one
//! `<event>:result` envelope, and pushes domain broadcasts to every
//! connected client. The model catalogue, log buffer, presets and router
//! state live in in-process [`services`].

pub mod broadcast;
pub mod error;
pub mod methods;
pub mod server;
pub mod services;
pub mod state;
pub mod ws;

pub use {
    broadcast::EventBus,
    error::{MethodError, MethodResult},
    methods::{MethodContext, MethodRegistry},
    server::{build_gateway, build_gateway_app, serve_gateway, start_gateway},
    services::GatewayServices,
    state::GatewayState,
};
