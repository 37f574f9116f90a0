use std::sync::Once;

static START: Once = Once::new();

/// Setup function that is only run once, even if called multiple times.
pub fn setup() {
    START.call_once(|| {
        tracing_subscriber::fmt::init();
    });
}
