//! Exchange transport: signed REST client, adaptive rate limiter, and the
//! two websocket channels (public depth, private order/position/wallet).

pub mod auth;
pub mod client;
pub mod events;
pub mod rate_limit;
pub mod ws_private;
pub mod ws_public;

pub use auth::Credentials;
pub use client::{ExchangeClient, NewOrder, PlaceOrderAck, RemoteOrder, RemotePosition};
pub use events::WsEvent;
pub use rate_limit::AdaptiveRateLimiter;
pub use ws_private::PrivateStream;
pub use ws_public::PublicStream;
