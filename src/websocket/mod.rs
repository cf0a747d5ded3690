mod factory;

pub use factory::{WebSocketFactory, WsSink, WsStream};
