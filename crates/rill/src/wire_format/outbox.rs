use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// Coalesces small writes into chunks of at most `view_size` bytes before
/// they are handed to a Destination.
#[derive(Debug)]
pub struct Outbox {
    ready: VecDeque<Bytes>,
    current: BytesMut,
    view_size: usize,
}

impl Outbox {
    pub fn new(view_size: usize) -> Self {
        let view_size = view_size.max(1);
        Self { ready: VecDeque::new(), current: BytesMut::with_capacity(view_size), view_size }
    }

    pub fn push(&mut self, data: &[u8]) {
        let mut data = data;
        while !data.is_empty() {
            let room = self.view_size - self.current.len();
            let take = room.min(data.len());
            self.current.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.current.len() == self.view_size {
                self.ready.push_back(self.current.split().freeze());
            }
        }
    }

    /// Closes the partially filled chunk so it can be sent.
    pub fn seal(&mut self) {
        if !self.current.is_empty() {
            self.ready.push_back(self.current.split().freeze());
        }
    }

    pub fn take_chunk(&mut self) -> Option<Bytes> {
        self.ready.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.current.is_empty()
    }

    pub fn clear(&mut self) {
        self.ready.clear();
        self.current.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(outbox: &mut Outbox) -> Vec<String> {
        outbox.seal();
        std::iter::from_fn(|| outbox.take_chunk())
            .map(|chunk| String::from_utf8(chunk.to_vec()).expect("utf8"))
            .collect()
    }

    #[test]
    fn test_small_writes_are_coalesced() {
        let mut outbox = Outbox::new(8);
        outbox.push(b"ab");
        outbox.push(b"cd");
        outbox.push(b"ef");

        assert_eq!(drain(&mut outbox), vec!["abcdef"]);
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_large_writes_are_split_at_view_size() {
        let mut outbox = Outbox::new(4);
        outbox.push(b"0123456789");

        assert_eq!(drain(&mut outbox), vec!["0123", "4567", "89"]);
    }

    #[test]
    fn test_nothing_leaks_before_seal() {
        let mut outbox = Outbox::new(4);
        outbox.push(b"ab");

        assert!(outbox.take_chunk().is_none());
        assert!(!outbox.is_empty());
        outbox.clear();
        assert!(outbox.is_empty());
    }
}
