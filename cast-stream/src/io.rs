//! Bridges between byte streams and rings.

use std::time::Duration;

use cast_core::{ByteConsumer, ByteProducer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use crate::error::Result;

/// Largest single read from a byte source.
pub const READ_CHUNK: usize = 256;

/// Copy `reader` into `ring` until end of stream or shutdown.
///
/// Reads are sized to the ring's free space so nothing is ever dropped
/// here; while the ring is full the pump waits `poll` and tries again.
/// Returns the number of bytes moved.
pub async fn pump_into_ring<R>(
    mut reader: R,
    mut ring: ByteProducer,
    poll: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_CHUNK];
    let mut total = 0u64;

    loop {
        if *shutdown.borrow() || ring.is_abandoned() {
            break;
        }
        let room = ring.free().min(READ_CHUNK);
        if room == 0 {
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        }

        // A shutdown change re-checks the flag at the top of the loop.
        let n = tokio::select! {
            read = reader.read(&mut buf[..room]) => read?,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };
        if n == 0 {
            tracing::debug!("byte source ended after {} bytes", total);
            break;
        }
        ring.push(&buf[..n]);
        total += n as u64;
    }
    Ok(total)
}

/// Copy `ring` into `writer` until shutdown, polling every `poll` while
/// the ring is empty. Whatever is buffered at shutdown is still written.
///
/// Returns the number of bytes moved.
pub async fn drain_ring<W>(
    mut ring: ByteConsumer,
    mut writer: W,
    poll: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK * 4];
    let mut total = 0u64;
    let mut stopping = *shutdown.borrow();

    loop {
        let n = ring.pop_into(&mut buf);
        if n > 0 {
            writer.write_all(&buf[..n]).await?;
            total += n as u64;
            continue;
        }
        writer.flush().await?;
        if stopping {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            changed = shutdown.changed() => {
                stopping = changed.is_err() || *shutdown.borrow();
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cast_core::byte_ring;

    #[tokio::test]
    async fn pump_moves_everything_that_fits() {
        let (producer, mut consumer) = byte_ring(1600);
        let (_tx, rx) = watch::channel(false);
        let source: Vec<u8> = (0..600u32).map(|b| b as u8).collect();

        let moved = pump_into_ring(source.as_slice(), producer, Duration::from_millis(10), rx)
            .await
            .unwrap();
        assert_eq!(moved, 600);

        let mut out = vec![0u8; 1600];
        let n = consumer.pop_into(&mut out);
        assert_eq!(&out[..n], source.as_slice());
    }

    #[tokio::test(start_paused = true)]
    async fn pump_waits_for_room_instead_of_dropping() {
        let (producer, mut consumer) = byte_ring(100);
        let (_tx, rx) = watch::channel(false);
        let source = vec![7u8; 250];

        let pump = tokio::spawn(async move {
            pump_into_ring(source.as_slice(), producer, Duration::from_millis(10), rx).await
        });

        let mut received = 0;
        let mut out = [0u8; 64];
        while received < 250 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            received += consumer.pop_into(&mut out);
        }
        assert_eq!(pump.await.unwrap().unwrap(), 250);
    }

    #[tokio::test]
    async fn pump_keeps_running_when_shutdown_stays_false() {
        let (producer, mut consumer) = byte_ring(64);
        let (tx, rx) = watch::channel(false);
        let (mut writer, reader) = tokio::io::duplex(64);

        let pump = tokio::spawn(async move {
            pump_into_ring(reader, producer, Duration::from_millis(10), rx).await
        });
        tokio::task::yield_now().await;

        tx.send(false).unwrap();
        writer.write_all(b"still here").await.unwrap();
        drop(writer);

        assert_eq!(pump.await.unwrap().unwrap(), 10);
        let mut out = [0u8; 64];
        let n = consumer.pop_into(&mut out);
        assert_eq!(&out[..n], b"still here");
    }

    #[tokio::test(start_paused = true)]
    async fn drain_writes_buffered_bytes_and_flushes_on_shutdown() {
        let (mut producer, consumer) = byte_ring(64);
        let (tx, rx) = watch::channel(false);
        producer.push(b"hello ");

        let drain = tokio::spawn(async move {
            let mut out = Vec::new();
            let result = drain_ring(consumer, &mut out, Duration::from_millis(10), rx).await;
            result.map(|_| out)
        });

        tokio::time::sleep(Duration::from_millis(25)).await;
        producer.push(b"world");
        tx.send(true).unwrap();

        assert_eq!(drain.await.unwrap().unwrap(), b"hello world".to_vec());
    }
}
