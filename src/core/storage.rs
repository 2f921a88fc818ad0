use std::io::{self, Read, Write};

pub const MAGIC: &[u8; 8] = b"GROWGRD1";
pub const VERSION_V1: u32 = 1;
pub const VERSION_CURRENT: u32 = VERSION_V1;

pub fn compress_lz4(input: &[u8]) -> Vec<u8> {
    lz4_flex::compress(input)
}

pub fn decompress_lz4(input: &[u8], expected_size: usize) -> io::Result<Vec<u8>> {
    // Strict format: raw LZ4 block with external expected size.
    lz4_flex::decompress(input, expected_size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "lz4 decompression failed"))
}

pub struct CountingWriter {
    written: usize,
}

impl CountingWriter {
    pub fn new() -> Self {
        Self { written: 0 }
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

impl Default for CountingWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written = self.written.saturating_add(buf.len());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_u64_le<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

/// Bit-exact: the raw IEEE-754 pattern is stored.
pub fn write_f64_le<W: Write>(w: &mut W, v: f64) -> io::Result<()> {
    w.write_all(&v.to_bits().to_le_bytes())
}

pub fn write_f64_slice<W: Write>(w: &mut W, values: &[f64]) -> io::Result<()> {
    write_u32_le(w, values.len() as u32)?;
    for &v in values {
        write_f64_le(w, v)?;
    }
    Ok(())
}

pub fn write_u32_slice<W: Write>(w: &mut W, values: &[u32]) -> io::Result<()> {
    write_u32_le(w, values.len() as u32)?;
    for &v in values {
        write_u32_le(w, v)?;
    }
    Ok(())
}

pub fn read_exact<const N: usize, R: Read>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn read_u64_le<R: Read>(r: &mut R) -> io::Result<u64> {
    Ok(u64::from_le_bytes(read_exact::<8, _>(r)?))
}

pub fn read_f64_le<R: Read>(r: &mut R) -> io::Result<f64> {
    Ok(f64::from_bits(read_u64_le(r)?))
}

/// Reads a length-prefixed f64 vector, refusing lengths above `max_len`.
pub fn read_f64_vec<R: Read>(r: &mut R, max_len: usize) -> io::Result<Vec<f64>> {
    let n = read_u32_le(r)? as usize;
    if n > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "vector length exceeds limit",
        ));
    }
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(read_f64_le(r)?);
    }
    Ok(out)
}

pub fn read_u32_vec<R: Read>(r: &mut R, max_len: usize) -> io::Result<Vec<u32>> {
    let n = read_u32_le(r)? as usize;
    if n > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "vector length exceeds limit",
        ));
    }
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(read_u32_le(r)?);
    }
    Ok(out)
}

/// Write a chunk whose payload is LZ4-compressed and preceded by the uncompressed length (u32).
///
/// Layout:
/// - tag: [u8;4]
/// - len: u32 (bytes following, including the 4-byte uncompressed length)
/// - uncompressed_len: u32
/// - compressed payload bytes
pub fn write_chunk_lz4<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
    let compressed = compress_lz4(payload);
    let uncompressed_len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk too large"))?;
    let total_len = 4u32.saturating_add(
        u32::try_from(compressed.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk too large"))?,
    );

    w.write_all(&tag)?;
    write_u32_le(w, total_len)?;
    write_u32_le(w, uncompressed_len)?;
    w.write_all(&compressed)
}

pub fn read_chunk_header<R: Read>(r: &mut R) -> io::Result<([u8; 4], u32)> {
    let tag = read_exact::<4, _>(r)?;
    let len = read_u32_le(r)?;
    Ok((tag, len))
}

/// Read the next chunk header, or `None` when the input ends cleanly before it.
/// A header cut short is an `UnexpectedEof` error.
pub fn try_read_chunk_header<R: Read>(r: &mut R) -> io::Result<Option<([u8; 4], u32)>> {
    let mut buf = [0u8; 8];
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(k) => filled += k,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    match filled {
        0 => Ok(None),
        8 => {
            let [t0, t1, t2, t3, l0, l1, l2, l3] = buf;
            Ok(Some(([t0, t1, t2, t3], u32::from_le_bytes([l0, l1, l2, l3]))))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated chunk header",
        )),
    }
}

/// Read and decompress the body of a chunk whose header has just been read.
pub fn read_chunk_payload_lz4<R: Read>(r: &mut R, len: u32) -> io::Result<Vec<u8>> {
    let mut take = r.take(len as u64);
    let uncompressed_len = read_u32_le(&mut take)? as usize;
    let mut compressed = Vec::with_capacity((len as usize).saturating_sub(4));
    take.read_to_end(&mut compressed)?;
    if compressed.len() + 4 != len as usize {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "chunk truncated",
        ));
    }
    decompress_lz4(&compressed, uncompressed_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_roundtrip() {
        let payload: Vec<u8> = (0..500u32).flat_map(|i| (i % 7).to_le_bytes()).collect();
        let mut buf = Vec::new();
        write_chunk_lz4(&mut buf, *b"TEST", &payload).unwrap();

        let mut r = io::Cursor::new(buf);
        let (tag, len) = read_chunk_header(&mut r).unwrap();
        assert_eq!(&tag, b"TEST");
        assert_eq!(read_chunk_payload_lz4(&mut r, len).unwrap(), payload);
    }

    #[test]
    fn truncated_chunk_is_an_error() {
        let mut buf = Vec::new();
        write_chunk_lz4(&mut buf, *b"TEST", &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        buf.truncate(buf.len() - 2);

        let mut r = io::Cursor::new(buf);
        let (_, len) = read_chunk_header(&mut r).unwrap();
        assert!(read_chunk_payload_lz4(&mut r, len).is_err());
    }

    #[test]
    fn f64_is_stored_bit_exact() {
        let values = [0.1 + 0.2, -0.0, f64::MIN_POSITIVE, 1e-300];
        let mut buf = Vec::new();
        write_f64_slice(&mut buf, &values).unwrap();
        let back = read_f64_vec(&mut io::Cursor::new(buf), 16).unwrap();
        for (a, b) in values.iter().zip(&back) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn oversized_vector_length_is_rejected() {
        let mut buf = Vec::new();
        write_u32_slice(&mut buf, &[1, 2, 3]).unwrap();
        assert!(read_u32_vec(&mut io::Cursor::new(buf), 2).is_err());
    }

    #[test]
    fn chunk_header_end_of_input() {
        let mut buf = Vec::new();
        write_chunk_lz4(&mut buf, *b"TEST", &[9; 16]).unwrap();
        let header = buf[..8].to_vec();

        let (tag, _) = try_read_chunk_header(&mut header.as_slice()).unwrap().unwrap();
        assert_eq!(&tag, b"TEST");
        assert!(try_read_chunk_header(&mut io::empty()).unwrap().is_none());
        for cut in 1..8 {
            let err = try_read_chunk_header(&mut &header[..cut]).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        }
    }
}
