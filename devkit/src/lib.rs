/*!
# gridwatch devkit - fixtures and harness for tests

- Builders for topology documents and sensor snapshots
- A three-substation sample grid (A, B, C) with two border lines
- An in-process harness over the in-memory bus
*/

pub mod fixtures;
pub mod harness;

pub use fixtures::{SnapshotBuilder, TopologyBuilder};
pub use harness::{init_test_tracing, Observer, TestHarness};
