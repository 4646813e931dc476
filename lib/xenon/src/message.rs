use byteorder::{BigEndian, ByteOrder};
use std::io;

/// A framed wire buffer: a contiguous byte blob plus a cursor marking how
/// far an in-progress read or write has advanced. Requests are built by the
/// caller and drained towards the socket; responses are filled from the
/// socket one header-plus-body at a time.
#[derive(Debug, Default)]
pub struct Message {
    data: Vec<u8>,
    cursor: usize,
    description: String,
}

impl Message {
    #[inline]
    pub fn new() -> Message {
        Message::default()
    }

    /// A zero-filled message of the given size with the cursor at the start.
    #[inline]
    pub fn with_capacity(size: usize) -> Message {
        Message {
            data: vec![0; size],
            cursor: 0,
            description: String::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Zero the contents without touching the size or the cursor.
    #[inline]
    pub fn zero(&mut self) {
        for byte in self.data.iter_mut() {
            *byte = 0;
        }
    }

    /// Grow to the given size, keeping the current content. Shrinking is
    /// not supported; a smaller size is ignored.
    #[inline]
    pub fn grow(&mut self, size: usize) {
        if size > self.data.len() {
            self.data.resize(size, 0);
        }
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[inline]
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    #[inline]
    pub fn set_cursor(&mut self, cursor: usize) {
        self.cursor = cursor;
    }

    #[inline]
    pub fn advance(&mut self, count: usize) {
        self.cursor += count;
    }

    #[inline]
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn set_description(&mut self, description: &str) {
        self.description = description.to_string();
    }

    #[inline]
    pub fn read_u16_at(&self, offset: usize) -> u16 {
        BigEndian::read_u16(&self.data[offset..offset + 2])
    }

    #[inline]
    pub fn read_u32_at(&self, offset: usize) -> u32 {
        BigEndian::read_u32(&self.data[offset..offset + 4])
    }

    #[inline]
    pub fn write_u16_at(&mut self, offset: usize, value: u16) {
        BigEndian::write_u16(&mut self.data[offset..offset + 2], value);
    }

    #[inline]
    pub fn write_u32_at(&mut self, offset: usize, value: u32) {
        BigEndian::write_u32(&mut self.data[offset..offset + 4], value);
    }

    /// Push the bytes between the cursor and the end of the buffer into the
    /// supplied writer, advancing the cursor. A `WouldBlock` from the writer
    /// propagates with the cursor left at the short-write position so the
    /// call can be re-entered later.
    pub fn write_to<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let start = self.cursor;

        while self.cursor < self.data.len() {
            let count = writer.write(&self.data[self.cursor..])?;

            if count == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }

            self.cursor += count;
        }

        Ok(self.cursor - start)
    }

    /// Pull bytes from the supplied reader until the cursor reaches
    /// `target`, growing the buffer as needed. Short reads propagate as
    /// `WouldBlock` with the cursor mid-way; a zero-length read means the
    /// peer closed the connection and surfaces as `UnexpectedEof`.
    pub fn read_from<R: io::Read>(&mut self, mut reader: R, target: usize) -> io::Result<usize> {
        self.grow(target);

        let start = self.cursor;

        while self.cursor < target {
            let count = reader.read(&mut self.data[self.cursor..target])?;

            if count == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }

            self.cursor += count;
        }

        Ok(self.cursor - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    /// Reader/writer moving data in fixed-size chunks with a blocking
    /// boundary, for exercising the partial I/O paths.
    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
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

            let count = min(min(self.chunk, buf.len()), self.max_size - self.data.len());
            self.data.extend(&buf[..count]);

            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_grow_keeps_content() {
        let mut msg = Message::with_capacity(4);
        msg.data_mut().copy_from_slice(&[1, 2, 3, 4]);

        msg.grow(8);

        assert_eq!(msg.len(), 8);
        assert_eq!(&msg.data()[..4], &[1, 2, 3, 4]);

        msg.grow(2);
        assert_eq!(msg.len(), 8);
    }

    #[test]
    fn test_scalar_accessors() {
        let mut msg = Message::with_capacity(8);

        msg.write_u16_at(0, 0x0102);
        msg.write_u32_at(4, 0xdeadbeef);

        assert_eq!(msg.data()[0], 1);
        assert_eq!(msg.data()[1], 2);
        assert_eq!(msg.read_u16_at(0), 0x0102);
        assert_eq!(msg.read_u32_at(4), 0xdeadbeef);
    }

    #[test]
    fn test_write_to_short_write() {
        let mut msg = Message::with_capacity(100);
        for (i, byte) in msg.data_mut().iter_mut().enumerate() {
            *byte = i as u8;
        }

        let mut sink = MockChannel::new(Vec::new(), 7, 40);

        let result = msg.write_to(&mut sink);

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::WouldBlock);
        assert_eq!(msg.cursor(), 40);

        sink.max_size = 100;
        let written = msg.write_to(&mut sink).unwrap();

        assert_eq!(written, 60);
        assert_eq!(msg.cursor(), 100);
        assert_eq!(&sink.data[..], msg.data());
    }

    #[test]
    fn test_read_from_short_read() {
        let payload: Vec<u8> = (0..50).collect();
        let mut source = MockChannel::new(payload.clone(), 9, 0);

        let mut msg = Message::new();

        let result = msg.read_from(&mut source, 80);

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::WouldBlock);
        assert_eq!(msg.cursor(), 50);
        assert_eq!(msg.len(), 80);

        source.data.extend(50..80u8);
        let count = msg.read_from(&mut source, 80).unwrap();

        assert_eq!(count, 30);
        assert_eq!(msg.cursor(), 80);
        assert_eq!(&msg.data()[..50], &payload[..]);
    }

    #[test]
    fn test_read_from_peer_close() {
        let mut msg = Message::new();

        let result = msg.read_from(&[1u8, 2, 3][..], 8);

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(msg.cursor(), 3);
    }
}
