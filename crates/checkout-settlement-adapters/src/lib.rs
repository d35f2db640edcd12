pub mod chain_rpc;
pub mod clock;
pub mod config;
pub mod eip1193;
pub mod order_backend;

pub use chain_rpc::JsonRpcChainAdapter;
pub use clock::SystemClockAdapter;
pub use config::{CheckoutAdapterConfig, RuntimeProfile};
pub use eip1193::{classify_provider_error, Eip1193Adapter};
pub use order_backend::OrderBackendAdapter;
