//! Send-time fragmentation.
//!
//! An encoded packet leaves the server as several contiguous writes spaced
//! by a fixed delay, so the outer stream never carries one record per
//! logical packet.

use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::sleep;

use crate::error::{Error, Result};

/// Default number of writes per packet
pub const DEFAULT_FRAGMENT_COUNT: usize = 3;

/// Default delay between consecutive writes
pub const DEFAULT_FRAGMENT_DELAY: Duration = Duration::from_millis(25);

/// Fragmentation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentConfig {
    /// Number of fragments per packet (at least 1)
    pub count: usize,
    /// Pause between fragments
    pub delay: Duration,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            count: DEFAULT_FRAGMENT_COUNT,
            delay: DEFAULT_FRAGMENT_DELAY,
        }
    }
}

/// Split `packet` into `count` contiguous ranges of `len / count` bytes,
/// with the remainder folded into the last one.
pub fn split_fragments(packet: &[u8], count: usize) -> Vec<&[u8]> {
    let count = count.max(1);
    let part = packet.len() / count;

    (0..count)
        .map(|i| {
            let start = i * part;
            let end = if i == count - 1 { packet.len() } else { start + part };
            &packet[start..end]
        })
        .collect()
}

/// Writes packets as timed fragments.
#[derive(Debug, Clone, Default)]
pub struct Fragmenter {
    config: FragmentConfig,
}

impl Fragmenter {
    /// Create a fragmenter with the given parameters.
    pub fn new(config: FragmentConfig) -> Self {
        Self { config }
    }

    /// Current parameters.
    pub fn config(&self) -> &FragmentConfig {
        &self.config
    }

    /// Write `packet` as fragments, flushing each one before the pause.
    ///
    /// A failed write aborts the remaining fragments; there is no retry.
    pub async fn send<W>(&self, writer: &mut W, packet: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let fragments = split_fragments(packet, self.config.count);
        let last = fragments.len() - 1;

        for (index, fragment) in fragments.into_iter().enumerate() {
            writer
                .write_all(fragment)
                .await
                .map_err(|source| Error::FragmentWrite { index, source })?;
            writer
                .flush()
                .await
                .map_err(|source| Error::FragmentWrite { index, source })?;

            if index < last && !self.config.delay.is_zero() {
                sleep(self.config.delay).await;
            }
        }

        Ok(())
    }
}
