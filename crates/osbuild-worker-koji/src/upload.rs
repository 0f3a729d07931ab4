//! Chunked file upload into the hub's work directory.

use snafu::ResultExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::ChunkDigestSnafu;
use crate::error::ChunkSizeSnafu;
use crate::error::ReadSourceSnafu;
use crate::error::Result;
use crate::session::Session;

/// Size of one upload chunk.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Outcome of a finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uploaded {
    /// Hex MD5 of the whole file.
    pub md5: String,
    pub size: u64,
}

/// Fill `buf` from `reader`, stopping early only at end of input.
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Adler-32 of `data` formatted the way the hub reports it.
pub fn adler32_hex(data: &[u8]) -> String {
    format!("{:08x}", adler::adler32_slice(data))
}

impl Session {
    /// Upload everything `reader` yields as `filepath/filename`.
    ///
    /// Each chunk is verified against the size and Adler-32 digest the hub
    /// echoes back.
    pub async fn upload<R>(&self, mut reader: R, filepath: &str, filename: &str) -> Result<Uploaded>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut offset: u64 = 0;
        let mut hasher = md5::Context::new();

        loop {
            let n = read_chunk(&mut reader, &mut buf).await.context(ReadSourceSnafu)?;
            if n == 0 {
                break;
            }
            let chunk = &buf[..n];
            self.upload_chunk(chunk, filepath, filename, offset).await?;
            hasher.consume(chunk);
            offset += n as u64;
        }

        debug!(filepath, filename, size = offset, "upload finished");
        Ok(Uploaded {
            md5: format!("{:x}", hasher.compute()),
            size: offset,
        })
    }

    async fn upload_chunk(&self, chunk: &[u8], filepath: &str, filename: &str, offset: u64) -> Result<()> {
        let query = [
            ("filepath", filepath.to_string()),
            ("filename", filename.to_string()),
            ("offset", offset.to_string()),
            ("fileverify", "adler32".to_string()),
        ];
        let reply = self.post_raw(&query, chunk.to_vec()).await?;

        let size = reply.int_member("size", "upload reply")?;
        if usize::try_from(size).ok() != Some(chunk.len()) {
            return ChunkSizeSnafu {
                sent: chunk.len(),
                got: size,
            }
            .fail();
        }

        let digest = adler32_hex(chunk);
        let got = reply.str_member("hexdigest", "upload reply")?;
        if got != digest {
            return ChunkDigestSnafu { sent: digest, got }.fail();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adler32_hex_is_zero_padded() {
        assert_eq!(adler32_hex(b""), "00000001");
        assert_eq!(adler32_hex(b"Wikipedia"), "11e60398");
    }

    #[tokio::test]
    async fn test_read_chunk_fills_across_short_reads() {
        let data = vec![7u8; 10];
        let mut reader = tokio::io::BufReader::with_capacity(3, &data[..]);
        let mut buf = [0u8; 8];
        assert_eq!(read_chunk(&mut reader, &mut buf).await.unwrap(), 8);
        assert_eq!(read_chunk(&mut reader, &mut buf).await.unwrap(), 2);
        assert_eq!(read_chunk(&mut reader, &mut buf).await.unwrap(), 0);
    }
}
