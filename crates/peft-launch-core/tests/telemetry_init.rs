//! Installs the global tracing subscriber, so it lives in its own test
//! binary to avoid racing `#[traced_test]` unit tests for the global slot.

use peft_launch_core::init_tracing;
use tracing::Level;

#[test]
fn test_init_tracing_twice_is_safe() {
    init_tracing(false, Level::INFO);
    init_tracing(true, Level::DEBUG);
}
