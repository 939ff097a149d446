//! Timeout enforcement.
//!
//! # Responsibilities
//! - Bound every socket-level connect attempt with a deadline
//! - Surface expiry as a distinct `io::ErrorKind::TimedOut` error
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - A zero timeout disables the deadline rather than failing instantly

use std::future::Future;
use std::io;
use std::time::Duration;

/// Run a connect future under a deadline.
pub async fn connect_with_timeout<F, T>(timeout: Duration, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    if timeout.is_zero() {
        return fut.await;
    }

    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect timed out after {}ms", timeout.as_millis()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_elapses() {
        let err = connect_with_timeout(Duration::from_millis(500), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, io::Error>(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_connect_result_passes_through() {
        let value = connect_with_timeout(Duration::from_millis(500), async { Ok::<_, io::Error>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let err = connect_with_timeout(Duration::ZERO, async {
            Err::<(), _>(io::Error::from(io::ErrorKind::ConnectionRefused))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
