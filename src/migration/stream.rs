//! TCP byte-stream migration transport.
//!
//! Records travel as plain concatenated bytes; page records as an 8-byte
//! entry followed by the page contents, terminated by an all-zero entry
//! (a real entry always carries the present bit, so zero is unambiguous).
//!
//! Pre-copy needs the transport to write pages while the guest mutates
//! them, which a one-sided transport handles but a stream cannot do
//! without re-reading; live migrations therefore downgrade to cold here
//! and only the final stop-and-copy pass is sent.

use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{TcpListener, TcpStream};

use super::{MigrationError, Transport};
use crate::mem::GuestMemory;
use crate::paging::{record_dest_offset, record_page_size};

/// Entry value terminating the page-record stream.
const LAST_PAGE_MARKER: u64 = 0;

pub struct StreamTransport {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl StreamTransport {
    fn from_stream(stream: TcpStream) -> Result<Self, MigrationError> {
        stream.set_nodelay(true).map_err(MigrationError::Transport)?;
        let reader = stream.try_clone().map_err(MigrationError::Transport)?;
        Ok(Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(stream),
        })
    }

    /// Connect to a waiting destination.
    pub fn connect(host: &str, port: u16) -> Result<Self, MigrationError> {
        let stream = TcpStream::connect((host, port)).map_err(MigrationError::Transport)?;
        tracing::info!(host, port, "connected to migration destination");
        Self::from_stream(stream)
    }

    /// Accept exactly one source connection.
    pub fn listen(port: u16) -> Result<Self, MigrationError> {
        let listener =
            TcpListener::bind(("0.0.0.0", port)).map_err(MigrationError::Transport)?;
        tracing::info!(port, "waiting for an incoming migration");
        let (stream, peer) = listener.accept().map_err(MigrationError::Transport)?;
        tracing::info!(%peer, "migration source connected");
        Self::from_stream(stream)
    }
}

impl Transport for StreamTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<(), MigrationError> {
        self.writer.write_all(bytes).map_err(MigrationError::Transport)?;
        self.writer.flush().map_err(MigrationError::Transport)
    }

    fn recv(&mut self, bytes: &mut [u8]) -> Result<(), MigrationError> {
        self.reader.read_exact(bytes).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                MigrationError::Protocol("peer closed the stream mid-record".into())
            } else {
                MigrationError::Transport(e)
            }
        })
    }

    fn send_page(&mut self, entry: u64, page: &[u8]) -> Result<(), MigrationError> {
        // Buffered; the marker flushes the whole page stream.
        self.writer
            .write_all(&entry.to_le_bytes())
            .and_then(|()| self.writer.write_all(page))
            .map_err(MigrationError::Transport)
    }

    fn finish_pages(&mut self) -> Result<(), MigrationError> {
        self.writer
            .write_all(&LAST_PAGE_MARKER.to_le_bytes())
            .map_err(MigrationError::Transport)?;
        self.writer.flush().map_err(MigrationError::Transport)
    }

    fn recv_page(&mut self, mem: &GuestMemory) -> Result<bool, MigrationError> {
        let mut entry_bytes = [0u8; 8];
        self.recv(&mut entry_bytes)?;
        let entry = u64::from_le_bytes(entry_bytes);
        if entry == LAST_PAGE_MARKER {
            return Ok(false);
        }

        let offset = record_dest_offset(entry);
        let size = record_page_size(entry);
        let dest = mem.slice_mut(offset, size)?;
        self.reader
            .read_exact(dest)
            .map_err(MigrationError::Transport)?;
        Ok(true)
    }

    fn supports_live(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::PAGE_SIZE;
    use crate::paging::x86;

    /// A connected transport pair over loopback.
    fn transport_pair() -> (StreamTransport, StreamTransport) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = std::thread::spawn(move || {
            StreamTransport::from_stream(TcpStream::connect(("127.0.0.1", port)).unwrap()).unwrap()
        });
        let (stream, _) = listener.accept().unwrap();
        let server = StreamTransport::from_stream(stream).unwrap();
        (client.join().unwrap(), server)
    }

    #[test]
    fn test_raw_record_roundtrip() {
        let (mut src, mut dst) = transport_pair();
        src.send(b"metadata-record").unwrap();

        let mut buf = [0u8; 15];
        dst.recv(&mut buf).unwrap();
        assert_eq!(&buf, b"metadata-record");
    }

    #[test]
    fn test_page_stream_places_records() {
        let (mut src, mut dst) = transport_pair();
        let mem = GuestMemory::new(8 << 20, false, false).unwrap();

        let entry_4k = 0x5000 | x86::PG_PRESENT | x86::PG_RW;
        let entry_2m = 0x40_0000 | x86::PG_PRESENT | x86::PG_RW | x86::PG_PSE;

        let sender = std::thread::spawn(move || {
            src.send_page(entry_4k, &[0xaa; PAGE_SIZE as usize]).unwrap();
            src.send_page(entry_2m, &vec![0xbb; 2 << 20]).unwrap();
            // A later duplicate wins at the destination.
            src.send_page(entry_4k, &[0xcc; PAGE_SIZE as usize]).unwrap();
            src.finish_pages().unwrap();
        });

        let mut pages = 0;
        while dst.recv_page(&mem).unwrap() {
            pages += 1;
        }
        sender.join().unwrap();

        assert_eq!(pages, 3);
        assert_eq!(mem.read_obj::<u8>(0x5000).unwrap(), 0xcc);
        assert_eq!(mem.read_obj::<u8>(0x40_0000).unwrap(), 0xbb);
        assert_eq!(mem.read_obj::<u8>(0x40_0000 + (2 << 20) - 1).unwrap(), 0xbb);
    }

    #[test]
    fn test_truncated_stream_is_a_protocol_error() {
        let (src, mut dst) = transport_pair();
        drop(src);

        let mut buf = [0u8; 8];
        assert!(matches!(
            dst.recv(&mut buf),
            Err(MigrationError::Protocol(_))
        ));
    }
}
