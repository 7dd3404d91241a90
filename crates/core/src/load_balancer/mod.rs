//! 负载均衡：任务束大小的计算与按通道的负载均衡器管理

pub mod adaptive;
pub mod factory;
pub mod manual;
pub mod persistence;
pub mod slot;

pub use adaptive::{AdaptiveBundler, AdaptiveParameters, ADAPTIVE};
pub use factory::{client_default_info, driver_default_info, LoadBalancerFactory, SUPPORTED_ALGORITHMS};
pub use manual::{ManualBundler, MANUAL};
pub use persistence::InMemoryBundlerPersistence;
pub use slot::BundlerSlot;
