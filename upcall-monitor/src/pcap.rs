//! Legacy pcap output of captured upcall packets.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::Path;

use pcap_parser::pcap::LegacyPcapBlock;
use pcap_parser::{Linktype, PcapHeader, ToVec};

use crate::error::ConfigurationError;

const PCAP_MAGIC: u32 = 0xa1b2c3d4;

fn gen_err(e: impl std::fmt::Debug) -> io::Error {
    io::Error::other(format!("pcap serialization failed: {e:?}"))
}

/// Writes Ethernet frames to a pcap stream.
pub struct PcapWriter<W: Write> {
    out: W,
    snaplen: u32,
    written: u64,
}

impl PcapWriter<BufWriter<File>> {
    /// Create `path`, refusing to overwrite an existing file.
    pub fn create(path: &Path, snaplen: u32) -> Result<Self, ConfigurationError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|source| match source.kind() {
                ErrorKind::AlreadyExists => ConfigurationError::PcapExists(path.to_path_buf()),
                _ => ConfigurationError::PcapCreate {
                    path: path.to_path_buf(),
                    source,
                },
            })?;
        Self::new(BufWriter::new(file), snaplen).map_err(|source| ConfigurationError::PcapCreate {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl<W: Write> PcapWriter<W> {
    /// Write the file header and return a writer for the frames.
    pub fn new(mut out: W, snaplen: u32) -> io::Result<Self> {
        let mut hdr = PcapHeader {
            magic_number: PCAP_MAGIC,
            version_major: 2,
            version_minor: 4,
            thiszone: 0,
            sigfigs: 0,
            snaplen,
            network: Linktype::ETHERNET,
        };
        out.write_all(&hdr.to_vec().map_err(gen_err)?)?;
        Ok(Self {
            out,
            snaplen,
            written: 0,
        })
    }

    /// Append one frame. `data` is cut to the snap length; `origlen` is the
    /// length the frame had on the wire.
    pub fn write_packet(&mut self, ts_ns: u64, data: &[u8], origlen: u32) -> io::Result<()> {
        let data = &data[..data.len().min(self.snaplen as usize)];
        let mut block = LegacyPcapBlock {
            ts_sec: (ts_ns / 1_000_000_000) as u32,
            ts_usec: ((ts_ns % 1_000_000_000) / 1_000) as u32,
            caplen: data.len() as u32,
            origlen: origlen.max(data.len() as u32),
            data,
        };
        self.out.write_all(&block.to_vec().map_err(gen_err)?)?;
        self.written += 1;
        Ok(())
    }

    pub fn packets_written(&self) -> u64 {
        self.written
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcap_parser::pcap;

    #[test]
    fn frames_parse_back() {
        let mut writer = PcapWriter::new(Vec::new(), 64).unwrap();
        writer.write_packet(5_000_123_456, &[0xaa; 98], 98).unwrap();
        writer.write_packet(6_000_000_000, &[0xbb; 20], 20).unwrap();
        assert_eq!(writer.packets_written(), 2);
        let bytes = writer.into_inner();

        let (rest, header) = pcap::parse_pcap_header(&bytes).unwrap();
        assert_eq!(header.snaplen, 64);
        assert_eq!(header.network, Linktype::ETHERNET);

        let (rest, first) = pcap::parse_pcap_frame(rest).unwrap();
        assert_eq!(first.ts_sec, 5);
        assert_eq!(first.ts_usec, 123);
        assert_eq!(first.caplen, 64);
        assert_eq!(first.origlen, 98);
        assert_eq!(first.data, &[0xaa; 64][..]);

        let (rest, second) = pcap::parse_pcap_frame(rest).unwrap();
        assert_eq!(second.caplen, 20);
        assert_eq!(second.origlen, 20);
        assert!(rest.is_empty());
    }

    #[test]
    fn existing_file_is_refused() {
        let file = tempfile::NamedTempFile::new().unwrap();
        match PcapWriter::create(file.path(), 64) {
            Err(ConfigurationError::PcapExists(path)) => assert_eq!(path, file.path()),
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("existing file was overwritten"),
        }
    }

    #[test]
    fn create_writes_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upcalls.pcap");
        let mut writer = PcapWriter::create(&path, 128).unwrap();
        writer.flush().unwrap();
        drop(writer);

        let bytes = std::fs::read(&path).unwrap();
        let (_, header) = pcap::parse_pcap_header(&bytes).unwrap();
        assert_eq!(header.snaplen, 128);
    }
}
