pub mod load_balancer;
pub mod notification;
pub mod runner;
pub mod transport;

pub use load_balancer::*;
pub use notification::*;
pub use runner::*;
pub use transport::*;
