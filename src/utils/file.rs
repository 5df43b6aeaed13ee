use std::io::{Read, Seek, SeekFrom};

/// Bound for the underlying storage of every reader in this crate.
pub trait SeekableRead: Seek + Read + Send {}

impl<T> SeekableRead for T where T: Seek + Read + Send {}

pub trait Tell {
    /// Gets the current position
    fn tell(&mut self) -> std::io::Result<u64>;
}

impl<S: Seek> Tell for S {
    fn tell(&mut self) -> std::io::Result<u64> {
        self.seek(SeekFrom::Current(0))
    }
}
