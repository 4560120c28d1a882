// References:
// https://wiki.wireshark.org/Development/LibpcapFileFormat
// https://www.tcpdump.org/linktypes.html

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use chrono::{DateTime, Local};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use log::{debug, info};

use crate::error::{Error, Result};
use crate::packet::MetaPacket;

const GLOBAL_HEADER_LEN: usize = 24;
const RECORD_HEADER_LEN: usize = 16;
const PCAP_MAGIC: u32 = 0xa1b2c3d4;
const PCAP_MAGIC_NANOS: u32 = 0xa1b23c4d;
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;
const SNAP_LEN: u32 = 65535;
const LINKTYPE_ETHERNET: u32 = 1;
const MAX_RECORD_LEN: u32 = 262144;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Paths ending in `.gz` are written gzip-compressed.
pub fn is_compressed(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

pub fn save(path: &Path, packets: &[MetaPacket]) -> Result<()> {
    let file = BufWriter::new(File::create(path)?);
    if is_compressed(path) {
        let encoder = write_to(GzEncoder::new(file, Compression::default()), packets)?;
        encoder.finish()?.flush()?;
    } else {
        write_to(file, packets)?.flush()?;
    }
    info!("Wrote {} packet(s) to {}", packets.len(), path.display());
    Ok(())
}

/// Read a capture file; gzip input is detected from its content.
pub fn load(path: &Path) -> Result<Vec<MetaPacket>> {
    let mut file = BufReader::new(File::open(path)?);
    let packets = if file.fill_buf()?.starts_with(&GZIP_MAGIC) {
        debug!("{} is gzip-compressed", path.display());
        read_from(GzDecoder::new(file))?
    } else {
        read_from(file)?
    };
    info!("Loaded {} packet(s) from {}", packets.len(), path.display());
    Ok(packets)
}

fn write_to<W: Write>(mut out: W, packets: &[MetaPacket]) -> Result<W> {
    let mut header = Vec::with_capacity(GLOBAL_HEADER_LEN);
    header.extend_from_slice(&PCAP_MAGIC.to_le_bytes());
    header.extend_from_slice(&VERSION_MAJOR.to_le_bytes());
    header.extend_from_slice(&VERSION_MINOR.to_le_bytes());
    header.extend_from_slice(&0i32.to_le_bytes()); // thiszone
    header.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
    header.extend_from_slice(&SNAP_LEN.to_le_bytes());
    header.extend_from_slice(&LINKTYPE_ETHERNET.to_le_bytes());
    out.write_all(&header)?;

    for packet in packets {
        let time = packet.timestamp();
        let secs = u32::try_from(time.timestamp())
            .map_err(|_| Error::capture(format!("timestamp {} does not fit a pcap record", time)))?;
        let data = packet.encode();
        let mut record = [0u8; RECORD_HEADER_LEN];
        record[0..4].copy_from_slice(&secs.to_le_bytes());
        record[4..8].copy_from_slice(&time.timestamp_subsec_micros().to_le_bytes());
        record[8..12].copy_from_slice(&(data.len() as u32).to_le_bytes());
        record[12..16].copy_from_slice(&(data.len() as u32).to_le_bytes());
        out.write_all(&record)?;
        out.write_all(data)?;
    }
    Ok(out)
}

#[derive(Clone, Copy)]
struct Layout {
    big_endian: bool,
    nanos: bool,
}

impl Layout {
    fn detect(magic: [u8; 4]) -> Option<Self> {
        [false, true].into_iter().find_map(|big_endian| {
            let value = if big_endian {
                u32::from_be_bytes(magic)
            } else {
                u32::from_le_bytes(magic)
            };
            match value {
                PCAP_MAGIC => Some(Self {
                    big_endian,
                    nanos: false,
                }),
                PCAP_MAGIC_NANOS => Some(Self {
                    big_endian,
                    nanos: true,
                }),
                _ => None,
            }
        })
    }

    fn u32_at(&self, bytes: &[u8], offset: usize) -> u32 {
        let field = [
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ];
        if self.big_endian {
            u32::from_be_bytes(field)
        } else {
            u32::from_le_bytes(field)
        }
    }
}

fn read_from<R: Read>(mut input: R) -> Result<Vec<MetaPacket>> {
    let mut header = [0u8; GLOBAL_HEADER_LEN];
    if !read_full(&mut input, &mut header)? {
        return Err(Error::capture("empty file"));
    }
    let layout = Layout::detect([header[0], header[1], header[2], header[3]])
        .ok_or_else(|| Error::capture("not a pcap file"))?;
    let linktype = layout.u32_at(&header, 20);
    if linktype != LINKTYPE_ETHERNET {
        return Err(Error::capture(format!("unsupported link type {}", linktype)));
    }

    let mut packets = Vec::new();
    let mut record = [0u8; RECORD_HEADER_LEN];
    while read_full(&mut input, &mut record)? {
        let secs = layout.u32_at(&record, 0);
        let frac = layout.u32_at(&record, 4);
        let incl_len = layout.u32_at(&record, 8);
        if incl_len > MAX_RECORD_LEN {
            return Err(Error::capture(format!(
                "record of {} bytes exceeds the snapshot limit",
                incl_len
            )));
        }

        let mut data = vec![0u8; incl_len as usize];
        input
            .read_exact(&mut data)
            .map_err(|_| Error::capture("truncated record"))?;

        let nanos = if layout.nanos { frac } else { frac.saturating_mul(1000) };
        let time = DateTime::from_timestamp(secs as i64, nanos)
            .map(|t| t.with_timezone(&Local))
            .unwrap_or_else(Local::now);
        packets.push(MetaPacket::with_time(data, time));
    }
    Ok(packets)
}

/// Fill `buf` completely. Returns false on a clean end of input.
fn read_full<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(Error::capture("truncated header")),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::tests::{echo_reply, echo_request};
    use std::io::Cursor;

    #[test]
    fn saves_and_loads_plain_and_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let packets = vec![echo_request(1, 1), echo_reply(1, 1)];

        for name in ["capture.pcap", "capture.pcap.gz"] {
            let path = dir.path().join(name);
            save(&path, &packets).unwrap();
            let loaded = load(&path).unwrap();

            assert_eq!(loaded.len(), 2);
            assert_eq!(loaded[0].encode(), packets[0].encode());
            assert_eq!(loaded[1].encode(), packets[1].encode());
            assert_eq!(
                loaded[0].timestamp().timestamp(),
                packets[0].timestamp().timestamp()
            );
        }

        let raw = std::fs::read(dir.path().join("capture.pcap.gz")).unwrap();
        assert!(raw.starts_with(&GZIP_MAGIC));
    }

    #[test]
    fn reads_big_endian_captures() {
        let mut file = Vec::new();
        file.extend_from_slice(&PCAP_MAGIC.to_be_bytes());
        file.extend_from_slice(&VERSION_MAJOR.to_be_bytes());
        file.extend_from_slice(&VERSION_MINOR.to_be_bytes());
        file.extend_from_slice(&[0; 8]);
        file.extend_from_slice(&SNAP_LEN.to_be_bytes());
        file.extend_from_slice(&LINKTYPE_ETHERNET.to_be_bytes());
        file.extend_from_slice(&1_000_000u32.to_be_bytes());
        file.extend_from_slice(&500u32.to_be_bytes());
        file.extend_from_slice(&3u32.to_be_bytes());
        file.extend_from_slice(&3u32.to_be_bytes());
        file.extend_from_slice(&[0xaa, 0xbb, 0xcc]);

        let packets = read_from(Cursor::new(file)).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].encode(), &[0xaa, 0xbb, 0xcc]);
        assert_eq!(packets[0].timestamp().timestamp(), 1_000_000);
        assert_eq!(packets[0].timestamp().timestamp_subsec_micros(), 500);
    }

    #[test]
    fn rejects_garbage_and_truncation() {
        assert!(matches!(
            read_from(Cursor::new(vec![0u8; 24])),
            Err(Error::Capture(_))
        ));
        assert!(matches!(read_from(Cursor::new(Vec::new())), Err(Error::Capture(_))));

        let mut file = write_to(Vec::new(), &[echo_request(1, 1)]).unwrap();
        file.truncate(file.len() - 4);
        assert!(matches!(read_from(Cursor::new(file)), Err(Error::Capture(_))));
    }

    #[test]
    fn refuses_timestamps_outside_the_format() {
        let before_epoch = DateTime::from_timestamp(-1, 0).unwrap().with_timezone(&Local);
        let past_2106 = DateTime::from_timestamp(1 << 32, 0).unwrap().with_timezone(&Local);
        for time in [before_epoch, past_2106] {
            let packet = MetaPacket::with_time(vec![0xaa; 14], time);
            assert!(matches!(
                write_to(Vec::new(), &[packet]),
                Err(Error::Capture(_))
            ));
        }
    }

    #[test]
    fn suffix_selects_compression() {
        assert!(is_compressed(Path::new("out.pcap.gz")));
        assert!(is_compressed(Path::new("out.GZ")));
        assert!(!is_compressed(Path::new("out.pcap")));
    }
}
