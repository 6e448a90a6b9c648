//! Byte-rate throttling for streamed payloads
//!
//! Each chunk is released no earlier than the moment at which all previously scheduled bytes would
//! have been sent at the configured rate. Backpressure comes from the consumer simply not being
//! handed the next chunk until that moment.

use futures::StreamExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRate {
    bytes_per_sec: std::num::NonZeroU64,
}

impl ByteRate {
    /// Returns `None` for a rate of 0, which means "no throttling".
    pub fn new(bytes_per_sec: u64) -> Option<Self> {
        std::num::NonZeroU64::new(bytes_per_sec).map(|bytes_per_sec| Self { bytes_per_sec })
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec.get()
    }

    /// Time needed to send `bytes` at this rate.
    pub fn duration_for(&self, bytes: u64) -> std::time::Duration {
        std::time::Duration::from_secs_f64(bytes as f64 / self.bytes_per_sec.get() as f64)
    }
}

/// Wrap `stream` so that it yields at most `rate` bytes per second. `None` passes it through.
pub fn limit_stream<S, E>(
    stream: S,
    rate: Option<ByteRate>,
) -> futures::stream::BoxStream<'static, Result<bytes::Bytes, E>>
where
    S: futures::Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    E: Send + 'static,
{
    let Some(rate) = rate else {
        return stream.boxed();
    };
    let mut started: Option<tokio::time::Instant> = None;
    let mut scheduled: u64 = 0;
    stream
        .then(move |chunk| {
            let release = match &chunk {
                Ok(bytes) => {
                    let start = *started.get_or_insert_with(tokio::time::Instant::now);
                    let release = start + rate.duration_for(scheduled);
                    scheduled += bytes.len() as u64;
                    Some(release)
                }
                Err(_) => None,
            };
            async move {
                if let Some(release) = release {
                    tokio::time::sleep_until(release).await;
                }
                chunk
            }
        })
        .boxed()
}
