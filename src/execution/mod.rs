//! Order execution: broker abstraction, simulation, and the chase loop

pub mod broker;
pub mod engine;
pub mod live;
pub mod order;
pub mod sim;

pub use broker::{Balance, BrokerClient, BrokerError, BrokerResult};
pub use engine::{ChaseOutcome, ExecutionEngine};
pub use live::RestBroker;
pub use order::{Order, OrderStatus, Side};
pub use sim::SimBroker;
