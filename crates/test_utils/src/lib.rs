//! Test utilities for ferret.

pub mod id;
pub use id::*;

pub mod listener;
pub use listener::*;

pub mod request;
pub use request::*;

/// Generate some random bytes.
pub fn random_bytes(len: usize) -> Vec<u8> {
    use rand::Rng;
    let mut out = vec![0; len];
    rand::thread_rng().fill(&mut out[..]);
    out
}

/// Enable tracing with the RUST_LOG environment variable.
///
/// This is intended to be used in tests, so it defaults to DEBUG level.
pub fn enable_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::Level::DEBUG.into())
                .from_env_lossy(),
        )
        .try_init();
}

/// Poll a check block until it passes or the timeout in milliseconds
/// expires. A `return` inside the block ends the wait and becomes the
/// value of the whole expression; a bare `break` ends the wait with
/// `()`.
#[macro_export]
macro_rules! iter_check {
    ($timeout:literal, $code:block) => {{
        tokio::time::timeout(
            std::time::Duration::from_millis($timeout),
            async {
                loop {
                    $code
                    tokio::time::sleep(std::time::Duration::from_millis(
                        1,
                    ))
                    .await;
                }
            },
        )
        .await
        .unwrap()
    }};
    ($code:block) => {
        $crate::iter_check!(100, $code)
    };
}
