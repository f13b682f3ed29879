//! Exchange Stream - real-time market data layer
//!
//! Keeps venue websocket connections alive, routes their frames and
//! maintains a consistent order book per (exchange, pair, asset) even when
//! updates arrive out of order.

pub mod config;
pub mod currency;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod metrics;
pub mod orderbook;
pub mod publisher;
pub mod subscription;
pub mod venue;
pub mod websocket;

pub use config::Config;
pub use currency::{Asset, CurrencyPair};
pub use dispatch::{BookSettings, DispatchState, Dispatcher};
pub use error::{Result, StreamError};
pub use events::StreamEvent;
pub use orderbook::{Book, BookKey, OrderBookStore, PriceLevel, Side};
pub use publisher::{EventFanout, IpcPublisher};
pub use subscription::{ChannelKind, ChannelSubscription, SubscriptionRegistry};
pub use venue::{Kraken, StreamVenue};
pub use websocket::{Session, StreamConnection, StreamManager, StreamSettings, TransportConfig};
