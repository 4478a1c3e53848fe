// Copyright 2019 CoreOS, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{bail, Context, Result};
use flate2::bufread::GzDecoder;
use openssl::sha::Sha256;
use std::io::{self, BufRead, ErrorKind, Read, Write};
use std::result;
use xz2::bufread::XzDecoder;

// The default BufReader/BufWriter buffer size is 8 KiB, which isn't large
// enough to fully amortize system call overhead.
// https://github.com/rust-lang/rust/issues/49921
pub const BUFFER_SIZE: usize = 256 * 1024;

/// Like `std::io::copy()`, but limits the number of bytes copied and fails
/// if fewer than that many bytes were available. `on_progress` is called
/// before every read with the number of bytes copied so far, so a caller
/// can interrupt a long copy (pause, cancel) between chunks instead of only
/// between whole files.
pub fn copy_exactly_n(
    reader: &mut (impl Read + ?Sized),
    writer: &mut (impl Write + ?Sized),
    n: u64,
    buf: &mut [u8],
    mut on_progress: impl FnMut(u64) -> Result<()>,
) -> Result<u64> {
    let mut written = 0;
    let mut remaining = n;
    loop {
        if remaining == 0 {
            break;
        }
        on_progress(written)?;
        let bufn = if remaining < buf.len() as u64 {
            &mut buf[..remaining as usize]
        } else {
            &mut buf[..]
        };
        let len = match reader.read(bufn) {
            Ok(0) => break,
            Ok(len) => len,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        writer.write_all(&bufn[..len])?;
        written += len as u64;
        remaining -= len as u64;
    }
    if written != n {
        bail!("expected to copy {} bytes but instead copied {}", n, written);
    }
    Ok(written)
}

/// Format-sniffing decompressor for keyring archives: a keyring is
/// distributed as a gzip- or xz-compressed tarball.  Detects the
/// compression from the leading magic bytes, exactly as the image
/// downloader does for disk images.
enum CompressDecoder<R: BufRead> {
    Uncompressed(R),
    Gzip(GzDecoder<R>),
    Xz(XzDecoder<R>),
}

pub struct DecompressReader<R: BufRead> {
    decoder: CompressDecoder<R>,
}

impl<R: BufRead> DecompressReader<R> {
    pub fn new(mut source: R) -> Result<Self> {
        use CompressDecoder::*;
        let sniff = source.fill_buf().context("sniffing input")?;
        let decoder = if sniff.len() > 2 && &sniff[0..2] == b"\x1f\x8b" {
            Gzip(GzDecoder::new(source))
        } else if sniff.len() > 6 && &sniff[0..6] == b"\xfd7zXZ\x00" {
            Xz(XzDecoder::new(source))
        } else {
            Uncompressed(source)
        };
        Ok(Self { decoder })
    }
}

impl<R: BufRead> Read for DecompressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> result::Result<usize, io::Error> {
        use CompressDecoder::*;
        match &mut self.decoder {
            Uncompressed(d) => d.read(buf),
            Gzip(d) => d.read(buf),
            Xz(d) => d.read(buf),
        }
    }
}

/// Wraps a reader, hashing every byte that passes through it.  Used to
/// compute a file's SHA-256 while it's being streamed to its destination,
/// so the download pipeline never has to make a second pass over the data.
pub struct HashingReader<R: Read> {
    source: R,
    hasher: Sha256,
    position: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            hasher: Sha256::new(),
            position: 0,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Consume the reader and return the lowercase hex digest accumulated
    /// so far.  Should only be called after reading to EOF.
    pub fn finish_hex(self) -> String {
        hex::encode(self.hasher.finish())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.source.read(buf)?;
        if count > 0 {
            self.hasher.update(&buf[..count]);
            self.position += count as u64;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Cursor};

    #[test]
    fn test_copy_exactly_n() {
        let mut sink = io::sink();
        let mut buf = [0u8; 50];
        let data = [1u8; 30];
        assert_eq!(
            copy_exactly_n(&mut &data[..], &mut sink, 30, &mut buf, |_| Ok(())).unwrap(),
            30
        );
        copy_exactly_n(&mut &data[..], &mut sink, 31, &mut buf, |_| Ok(())).unwrap_err();
    }

    #[test]
    fn test_copy_exactly_n_progress_can_abort() {
        let mut sink = io::sink();
        let mut buf = [0u8; 4];
        let data = [1u8; 30];
        let mut seen = 0u64;
        let result = copy_exactly_n(&mut &data[..], &mut sink, 30, &mut buf, |written| {
            seen = written;
            if written >= 8 {
                bail!("aborted");
            }
            Ok(())
        });
        assert!(result.is_err());
        assert!(seen >= 8);
    }

    #[test]
    fn test_hashing_reader() {
        let data = b"hello world";
        let mut reader = HashingReader::new(Cursor::new(&data[..]));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        let digest = reader.finish_hex();
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_decompress_reader_passthrough() {
        let data = b"not compressed";
        let mut reader = DecompressReader::new(BufReader::new(&data[..])).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }
}
