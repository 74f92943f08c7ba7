use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use ember::crypto::HeaderCrypt;

/// Client header before cipher activation: {u16 big-endian size, u32 opcode}.
pub const PLAIN_HEADER_SIZE: usize = 6;
/// Client header once the cipher is live: one packed little-endian word.
pub const CIPHER_HEADER_SIZE: usize = 4;

/// The size field covers the 4 byte opcode/command word in both shapes.
pub const SIZE_OFFSET: usize = 4;

pub const MIN_CLIENT_SIZE: usize = 4;
pub const MAX_PLAIN_CLIENT_SIZE: usize = 10240;
pub const MAX_CIPHER_CLIENT_SIZE: usize = 20240;

/// Packed word layout: low 13 bits opcode, high 19 bits size.
pub const OPCODE_MASK: u32 = 0x1FFF;
pub const SIZE_SHIFT: u32 = 13;

/// Legacy connectivity probe command tolerated before authentication. The
/// bytes spell the start of the handshake literal.
pub const CONNECTIVITY_PROBE: u32 = 0x4C52_4F57;

/// One decoded client frame. `cmd` is a u32 to accommodate the pre-auth
/// connectivity probe, real opcodes always fit the 13 bit table range.
#[derive(Debug, Eq, PartialEq)]
pub struct ClientFrame {
    pub cmd: u32,
    pub payload: Vec<u8>,
}

struct PendingFrame {
    cmd: u32,
    payload: Vec<u8>,
    wanted: usize,
}

/// Incremental frame parser. Accepts arbitrary chunkings of the inbound byte
/// stream and emits complete frames in order. Tracks exactly one partial
/// frame: a new header is never started before the previous payload finished.
pub struct FrameAssembler {
    ciphered: bool,
    header: [u8; PLAIN_HEADER_SIZE],
    header_fill: usize,
    pending: Option<PendingFrame>,
}

impl FrameAssembler {
    #[inline]
    pub fn new() -> FrameAssembler {
        FrameAssembler {
            ciphered: false,
            header: [0u8; PLAIN_HEADER_SIZE],
            header_fill: 0,
            pending: None,
        }
    }

    /// Switches to the packed ciphered header shape. Called exactly once,
    /// together with cipher initialization on the owning connection.
    #[inline]
    pub fn activate_cipher(&mut self) {
        self.ciphered = true;
    }

    #[inline]
    pub fn is_ciphered(&self) -> bool {
        self.ciphered
    }

    /// Drops any partially assembled state. Used on connection close.
    pub fn reset(&mut self) {
        self.header_fill = 0;
        self.pending = None;
    }

    #[inline]
    fn header_size(&self) -> usize {
        if self.ciphered {
            CIPHER_HEADER_SIZE
        } else {
            PLAIN_HEADER_SIZE
        }
    }

    /// Feeds raw bytes into the assembler, decrypting header prefixes through
    /// `crypt` when active, and appends every completed frame to `out`.
    ///
    /// Errors are fatal to the connection: the assembler is left in an
    /// unspecified state and must not be fed again.
    pub fn feed(
        &mut self,
        mut input: &[u8],
        crypt: &mut Option<HeaderCrypt>,
        out: &mut Vec<ClientFrame>,
    ) -> NetworkResult<()> {
        while !input.is_empty() {
            if let Some(pending) = self.pending.as_mut() {
                let take = (pending.wanted - pending.payload.len()).min(input.len());
                pending.payload.extend_from_slice(&input[..take]);
                input = &input[take..];

                if pending.payload.len() == pending.wanted {
                    let done = self.pending.take().expect("Pending frame must exist");
                    out.push(ClientFrame {
                        cmd: done.cmd,
                        payload: done.payload,
                    });
                }

                continue;
            }

            let header_size = self.header_size();
            let take = (header_size - self.header_fill).min(input.len());
            self.header[self.header_fill..self.header_fill + take].copy_from_slice(&input[..take]);

            // Exactly the header prefix passes through the keystream, byte
            // counts must line up with the wire or the stream desyncs.
            if self.ciphered {
                if let Some(crypt) = crypt.as_mut() {
                    crypt.decrypt(&mut self.header[self.header_fill..self.header_fill + take]);
                }
            }

            self.header_fill += take;
            input = &input[take..];

            if self.header_fill < header_size {
                continue;
            }

            self.header_fill = 0;

            let (cmd, payload_len) = if self.ciphered {
                Self::decode_cipher_header(&self.header[..CIPHER_HEADER_SIZE])?
            } else {
                Self::decode_plain_header(&self.header)?
            };

            if payload_len == 0 {
                out.push(ClientFrame {
                    cmd,
                    payload: Vec::new(),
                });
            } else {
                self.pending = Some(PendingFrame {
                    cmd,
                    payload: Vec::with_capacity(payload_len),
                    wanted: payload_len,
                });
            }
        }

        Ok(())
    }

    fn decode_plain_header(header: &[u8]) -> NetworkResult<(u32, usize)> {
        let size = BigEndian::read_u16(&header[..2]) as usize;
        let cmd = LittleEndian::read_u32(&header[2..6]);

        if size < MIN_CLIENT_SIZE || size > MAX_PLAIN_CLIENT_SIZE {
            return Err(NetworkError::Fatal(ErrorType::PayloadOutOfBounds));
        }

        if cmd >= crate::opcode::NUM_OPCODE_HANDLERS as u32 && cmd != CONNECTIVITY_PROBE {
            return Err(NetworkError::Fatal(ErrorType::OpcodeOutOfRange));
        }

        Ok((cmd, size - SIZE_OFFSET))
    }

    fn decode_cipher_header(header: &[u8]) -> NetworkResult<(u32, usize)> {
        let word = LittleEndian::read_u32(&header[..CIPHER_HEADER_SIZE]);

        let cmd = word & OPCODE_MASK;
        let size = (word >> SIZE_SHIFT) as usize;

        if size < MIN_CLIENT_SIZE || size > MAX_CIPHER_CLIENT_SIZE {
            return Err(NetworkError::Fatal(ErrorType::PayloadOutOfBounds));
        }

        Ok((cmd, size - SIZE_OFFSET))
    }
}

/// Appends the pre-auth server header: {u16 big-endian payload+2, u32 opcode}.
#[inline]
pub fn encode_plain_header(out: &mut Vec<u8>, opcode: u32, payload_len: usize) {
    let mut header = [0u8; PLAIN_HEADER_SIZE];
    BigEndian::write_u16(&mut header[..2], (payload_len + 2) as u16);
    LittleEndian::write_u32(&mut header[2..6], opcode);
    out.extend_from_slice(&header);
}

/// Builds the packed post-auth server header word. The caller encrypts it in
/// place before transmission.
#[inline]
pub fn encode_cipher_header(opcode: u16, payload_len: usize) -> [u8; CIPHER_HEADER_SIZE] {
    debug_assert!(payload_len + SIZE_OFFSET < (1 << 19), "Frame exceeds 19 bit size field");

    let word = ((payload_len + SIZE_OFFSET) as u32) << SIZE_SHIFT | (opcode as u32 & OPCODE_MASK);

    let mut header = [0u8; CIPHER_HEADER_SIZE];
    LittleEndian::write_u32(&mut header, word);
    header
}
