use hyphae::Executor;

pub fn trace_init() {
    use tracing_subscriber::filter::LevelFilter;
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_test_writer()
        .try_init();
}

/// Returns an executor that re-raises coroutine panics, so a failed assertion
/// inside a coroutine fails the test.
pub fn executor() -> Executor {
    Executor::builder()
        .stack_size(128 * 1024)
        .fail_on_error(true)
        .build()
        .expect("failed to create executor")
}
