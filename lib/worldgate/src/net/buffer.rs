use bytes::BytesMut;
use std::io;

const SCRATCH_SIZE: usize = 4096;

/// A bounded FIFO byte queue backing the socket read and write paths. Data is
/// appended at the tail and consumed from the head.
pub struct Buffer {
    data: BytesMut,
    limit: usize,
}

impl Buffer {
    #[inline]
    pub fn new(limit: usize) -> Buffer {
        Buffer {
            data: BytesMut::with_capacity(limit),
            limit,
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.limit - self.data.len()
    }

    /// Slice containing the buffered data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data
    }

    /// Discard `count` bytes from the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        use bytes::Buf;
        self.data.advance(count);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Append raw bytes at the tail. Panics on overflow, callers must check
    /// `free_capacity` first.
    #[inline]
    pub fn extend(&mut self, bytes: &[u8]) {
        if bytes.len() > self.free_capacity() {
            panic!(
                "Buffer overrun: appending {} bytes to {}/{}",
                bytes.len(),
                self.data.len(),
                self.limit
            );
        }

        self.data.extend_from_slice(bytes);
    }

    /// Write the contents of the buffer to the supplied writer, advancing the
    /// read offset past everything written.
    #[inline]
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let orig_len = self.data.len();

        while !self.data.is_empty() {
            let write_count = writer.write(&self.data)?;

            if write_count == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }

            self.consume(write_count);
        }

        Ok(orig_len - self.data.len())
    }

    /// Read in data from the supplied reader until it blocks, the source is
    /// exhausted or the buffer limit is reached.
    #[inline]
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let mut scratch = [0u8; SCRATCH_SIZE];
        let mut total = 0;

        while self.data.len() < self.limit {
            let budget = SCRATCH_SIZE.min(self.free_capacity());
            let read_count = reader.read(&mut scratch[..budget])?;

            if read_count == 0 {
                return Ok(total);
            }

            self.data.extend_from_slice(&scratch[..read_count]);
            total += read_count;
        }

        Err(io::Error::new(io::ErrorKind::Other, "Buffer overrun"))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cmp::min;
    use std::io::Cursor;

    pub(crate) struct MockChannel {
        pub data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        pub fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }

        pub fn clear(&mut self) {
            self.data.clear();
            self.cursor = 0;
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(self.chunk, buf.len());
            self.data.extend(&buf[..count]);

            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_roundtrip() {
        let mock_data: Vec<_> = (0..8192).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data.clone(), 500, mock_data.len());

        let mut buffer = Buffer::new(65536);

        let result = buffer.ingress(&mut channel);

        assert!(result.is_err());
        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::WouldBlock);
        assert_eq!(buffer.len(), mock_data.len());
        assert_eq!(buffer.read_slice(), &mock_data[..]);

        channel.clear();
        let count = buffer.egress(&mut channel).unwrap();

        assert_eq!(count, mock_data.len());
        assert_eq!(buffer.len(), 0);
        assert_eq!(channel.data[..], mock_data[..]);
    }

    #[test]
    fn test_egress_error_on_zero_write() {
        let mut zero_vec = vec![];

        let mut buffer = Buffer::new(65536);

        // The buffer has to have at least some data to trigger the zero write error
        buffer.extend(&[1]);

        let result = buffer.egress(&mut zero_vec[..]);

        assert!(result.is_err());
        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_ingress_buffer_overrun() {
        let mock_data: Vec<_> = (0..131072).map(|item| item as u8).collect();

        let mut buffer = Buffer::new(65536);

        let result = buffer.ingress(&mock_data[..]);

        assert!(result.is_err());

        let err = result.err().unwrap();

        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert_eq!(err.to_string(), "Buffer overrun")
    }

    #[test]
    fn test_no_err() {
        let mut cursor = Cursor::new(vec![1, 2, 3]);
        let mut buffer = Buffer::new(65536);

        buffer.ingress(&mut cursor).unwrap();

        assert_eq!(buffer.read_slice(), &[1, 2, 3]);

        let mut cursor = Cursor::new(Vec::<u8>::new());

        buffer.egress(&mut cursor).unwrap();

        assert!(buffer.is_empty());
        assert_eq!(&cursor.get_ref()[..], &[1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "Buffer overrun")]
    fn test_extend_past_limit() {
        let mut buffer = Buffer::new(4);
        buffer.extend(&[0; 5]);
    }
}
