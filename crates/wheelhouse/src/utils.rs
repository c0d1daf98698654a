use std::io::Read;

use bytes::Bytes;
use tokio::sync::mpsc::Receiver;

/// A blocking [`Read`] over a channel of downloaded byte chunks.
///
/// The async side pushes chunks from the HTTP body into the channel; a
/// conversion running on a blocking worker pulls them out through this
/// adapter. The channel is bounded, so a conversion that falls behind
/// suspends the download rather than buffering the wheel.
///
/// Must only be read from a blocking context (it parks the thread while
/// waiting for the next chunk).
pub struct ChannelReader {
    receiver: Receiver<std::io::Result<Bytes>>,
    current: Bytes,
}

impl ChannelReader {
    /// Wraps the receiving end of a chunk channel.
    pub fn new(receiver: Receiver<std::io::Result<Bytes>>) -> Self {
        Self {
            receiver,
            current: Bytes::new(),
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.current.is_empty() {
            match self.receiver.blocking_recv() {
                Some(Ok(chunk)) => self.current = chunk,
                Some(Err(err)) => return Err(err),
                None => return Ok(0),
            }
        }
        let n = self.current.len().min(buf.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current = self.current.split_off(n);
        Ok(n)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_reads_chunks_in_order() {
        let (sender, receiver) = tokio::sync::mpsc::channel(4);
        sender.blocking_send(Ok(Bytes::from_static(b"hello "))).unwrap();
        sender.blocking_send(Ok(Bytes::from_static(b"world"))).unwrap();
        drop(sender);

        let mut reader = ChannelReader::new(receiver);
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn test_propagates_errors() {
        let (sender, receiver) = tokio::sync::mpsc::channel(4);
        sender
            .blocking_send(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "dropped",
            )))
            .unwrap();
        drop(sender);

        let mut reader = ChannelReader::new(receiver);
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).is_err());
    }

    #[test]
    fn test_empty_chunks_are_skipped() {
        let (sender, receiver) = tokio::sync::mpsc::channel(4);
        sender.blocking_send(Ok(Bytes::new())).unwrap();
        sender.blocking_send(Ok(Bytes::from_static(b"x"))).unwrap();
        drop(sender);

        let mut reader = ChannelReader::new(receiver);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"x");
    }
}
