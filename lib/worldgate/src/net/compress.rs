use adler32::RollingAdler32;
use flate2::{Compress, CompressError, Compression, FlushCompress, Status};
use slog::{error, Logger};

/// Seed shared with the client for both envelope checksums.
pub const CHECKSUM_SEED: u32 = 0x9827_D8F1;

/// Outbound payloads above this size are routed through the compressor.
pub const COMPRESS_THRESHOLD: usize = 1024;

/// Persistent deflate context for one session's outbound stream.
///
/// The context is deliberately never reset between packets so the dictionary
/// carries across them, each packet ends on a synchronizing flush so the
/// receiver can decode it without waiting for more data.
pub struct CompressionStream {
    ctx: Compress,
    log: Logger,
}

impl CompressionStream {
    pub fn new(level: u32, log: Logger) -> CompressionStream {
        CompressionStream {
            // Raw deflate, the envelope carries its own integrity data
            ctx: Compress::new(Compression::new(level), false),
            log,
        }
    }

    /// Wraps `opcode` + `payload` into a compression envelope:
    /// {u32 uncompressed size, u32 uncompressed checksum, u32 compressed
    /// checksum} followed by the deflate stream for this packet.
    ///
    /// Returns `None` when the codec fails, the caller drops the packet.
    pub fn pack(&mut self, opcode: u16, payload: &[u8]) -> Option<Vec<u8>> {
        let opcode_word = (opcode as u32).to_le_bytes();

        let mut plain_sum = RollingAdler32::from_value(CHECKSUM_SEED);
        plain_sum.update_buffer(&opcode_word);
        plain_sum.update_buffer(payload);

        let mut compressed = Vec::with_capacity(payload.len() / 2 + 64);

        // The opcode travels inside the compressed stream as a u32 prefix
        if let Err(err) = self.deflate(&opcode_word, &mut compressed, FlushCompress::None) {
            error!(self.log, "Packet compression failed"; "opcode" => opcode, "error" => %err);
            return None;
        }

        if let Err(err) = self.deflate(payload, &mut compressed, FlushCompress::Sync) {
            error!(self.log, "Packet compression failed"; "opcode" => opcode, "error" => %err);
            return None;
        }

        let mut packed_sum = RollingAdler32::from_value(CHECKSUM_SEED);
        packed_sum.update_buffer(&compressed);

        let mut envelope = Vec::with_capacity(12 + compressed.len());
        envelope.extend_from_slice(&((payload.len() + 4) as u32).to_le_bytes());
        envelope.extend_from_slice(&plain_sum.hash().to_le_bytes());
        envelope.extend_from_slice(&packed_sum.hash().to_le_bytes());
        envelope.extend_from_slice(&compressed);

        Some(envelope)
    }

    fn deflate(
        &mut self,
        input: &[u8],
        out: &mut Vec<u8>,
        flush: FlushCompress,
    ) -> Result<(), CompressError> {
        let mut consumed = 0usize;

        loop {
            if out.capacity() == out.len() {
                out.reserve(4096);
            }

            let before_in = self.ctx.total_in();
            let status = self.ctx.compress_vec(&input[consumed..], out, flush)?;
            consumed += (self.ctx.total_in() - before_in) as usize;

            let flushed = match flush {
                // A sync flush is complete once deflate stops producing output
                FlushCompress::Sync => status == Status::Ok && out.capacity() > out.len(),
                _ => true,
            };

            if consumed == input.len() && flushed {
                return Ok(());
            }
        }
    }
}
