//! Fakes and fixtures for exercising environment assembly without a
//! container runtime.

pub mod capture;
pub mod faults;
pub mod fixtures;
pub mod platform;

pub use capture::{capture, init_tracing, CapturedEvent, CapturedEvents};
pub use faults::TestFault;
pub use fixtures::*;
pub use platform::{
    node_container_name, Event, FakeChain, FakeCluster, FakeLogStream, FakeMockAdapter,
    FakePlatform, Journal,
};
