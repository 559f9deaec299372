//! Indexer cursor: the highest block height durably projected.

use serde::{Deserialize, Serialize};

/// The indexer's current position in the chain.
///
/// Never moves backwards: [`Cursor::advance`] ignores heights at or below
/// the current one, so re-scanning an old block cannot rewind progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Last fully projected block; `None` before the first commit.
    pub height: Option<u64>,
    /// First height to scan when nothing has been projected yet.
    pub start_block: u64,
}

impl Cursor {
    pub fn new(height: Option<u64>, start_block: u64) -> Self {
        Self { height, start_block }
    }

    /// Advance to `height` if it is ahead of the current position.
    ///
    /// Returns `true` if the cursor moved.
    pub fn advance(&mut self, height: u64) -> bool {
        match self.height {
            Some(current) if current >= height => false,
            _ => {
                self.height = Some(height);
                true
            }
        }
    }

    /// Returns the next block to scan.
    pub fn next_block(&self) -> u64 {
        match self.height {
            Some(h) => h + 1,
            None => self.start_block,
        }
    }

    /// Returns `true` if every block up to `head` has been projected.
    pub fn is_caught_up(&self, head: u64) -> bool {
        self.next_block() > head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_advance_is_monotonic() {
        let mut cursor = Cursor::new(Some(100), 0);
        assert!(cursor.advance(101));
        assert!(!cursor.advance(99));
        assert!(!cursor.advance(101));
        assert_eq!(cursor.height, Some(101));
    }

    #[test]
    fn cursor_next_block() {
        assert_eq!(Cursor::new(Some(500), 0).next_block(), 501);
        assert_eq!(Cursor::new(None, 42).next_block(), 42);
    }

    #[test]
    fn cursor_caught_up() {
        let cursor = Cursor::new(Some(10), 0);
        assert!(cursor.is_caught_up(10));
        assert!(!cursor.is_caught_up(11));
        assert!(!Cursor::new(None, 0).is_caught_up(0));
    }
}
