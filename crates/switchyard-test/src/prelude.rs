//! Prelude module - commonly used test helpers.
//!
//! Use `use switchyard_test::prelude::*;` in tests.

pub use crate::fixtures::{
    init_test_logging, read_json_within, read_message_within, test_core, test_manager, test_url,
    wait_for,
};
pub use crate::mocks::{FnCodeUnit, LoadRecord, RecordingLoader, StaticCodeUnitLoader};
