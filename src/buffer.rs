use bytes::{BufMut, BytesMut};

/// Value-semantics byte container used at the boundary with stream I/O
/// layers. Constructible from string-likes, a fill count plus fill byte, or a
/// raw byte slice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    inner: BytesMut,
}

impl Buffer {
    pub fn new() -> Self {
        Self {
            inner: BytesMut::new(),
        }
    }

    /// `n` copies of `byte`.
    pub fn filled(n: usize, byte: u8) -> Self {
        let mut inner = BytesMut::with_capacity(n);
        inner.put_bytes(byte, n);
        Self { inner }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            inner: BytesMut::from(data),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.len()
    }

    pub fn resize(&mut self, n: usize) {
        self.inner.resize(n, 0);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.inner
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.inner
    }
}

impl From<&str> for Buffer {
    fn from(s: &str) -> Self {
        Self::from_slice(s.as_bytes())
    }
}

impl From<String> for Buffer {
    fn from(s: String) -> Self {
        Self::from_slice(s.as_bytes())
    }
}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Self {
        Self::from_slice(data)
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Self::from_slice(&data)
    }
}

impl std::fmt::Display for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_string_like() {
        let buf = Buffer::from("hello");
        assert_eq!(buf.size(), 5);
        assert_eq!(buf.data(), b"hello");
        assert_eq!(buf.to_string(), "hello");
    }

    #[test]
    fn test_filled() {
        let buf = Buffer::filled(4, b'x');
        assert_eq!(buf.data(), b"xxxx");
    }

    #[test]
    fn test_resize_and_empty() {
        let mut buf = Buffer::new();
        assert!(buf.is_empty());
        buf.resize(3);
        assert_eq!(buf.size(), 3);
        assert_eq!(buf.data(), &[0, 0, 0]);
        buf.resize(1);
        assert_eq!(buf.size(), 1);
    }
}
