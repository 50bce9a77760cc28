//! Correlation tokens carried in the kernel's 64-bit `user_data` field.
//!
//! Layout (bit-exact, decoded by every dispatch):
//!
//! ```text
//!  63    60 59                      32 31          16 15           0
//! +--------+--------------------------+--------------+--------------+
//! |   op   |        conn_id (28)      |    fd (16)   |  buf_id (16) |
//! +--------+--------------------------+--------------+--------------+
//! ```

const OP_SHIFT: u32 = 60;
const CONN_SHIFT: u32 = 32;
const FD_SHIFT: u32 = 16;

pub const OP_MASK: u64 = 0xF;
pub const CONN_ID_MASK: u32 = (1 << 28) - 1;
pub const FD_MASK: u32 = 0xFFFF;
pub const BUF_ID_MASK: u32 = 0xFFFF;

/// Operation kind of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    Accept = 0,
    Recv = 1,
    /// Reserved code; plain sends are never submitted.
    Send = 2,
    SendZc = 3,
    Cancel = 4,
    Shutdown = 5,
    Close = 6,
    FdPass = 7,
    CrossMsg = 8,
    Timeout = 9,
    /// Reserved code; send buffers are released on the zero-copy notification.
    BufRelease = 10,
    Nop = 11,
}

impl Op {
    pub const ALL: [Op; 12] = [
        Op::Accept,
        Op::Recv,
        Op::Send,
        Op::SendZc,
        Op::Cancel,
        Op::Shutdown,
        Op::Close,
        Op::FdPass,
        Op::CrossMsg,
        Op::Timeout,
        Op::BufRelease,
        Op::Nop,
    ];

    #[inline]
    pub fn from_u8(code: u8) -> Option<Op> {
        Op::ALL.get(code as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Op::Accept => "accept",
            Op::Recv => "recv",
            Op::Send => "send",
            Op::SendZc => "send_zc",
            Op::Cancel => "cancel",
            Op::Shutdown => "shutdown",
            Op::Close => "close",
            Op::FdPass => "fd_pass",
            Op::CrossMsg => "cross_msg",
            Op::Timeout => "timeout",
            Op::BufRelease => "buf_release",
            Op::Nop => "nop",
        }
    }
}

/// Packed correlation value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Token(pub u64);

/// Fields of a token after decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub op_code: u8,
    pub conn_id: u32,
    pub fd: u32,
    pub buf_id: u32,
}

impl Token {
    #[inline]
    pub fn new(op: Op, conn_id: u32, fd: u32, buf_id: u32) -> Self {
        Self::encode(op as u8, conn_id, fd, buf_id)
    }

    /// Pack raw fields. Each field is masked to its width.
    #[inline]
    pub fn encode(op_code: u8, conn_id: u32, fd: u32, buf_id: u32) -> Self {
        Token(
            ((op_code as u64 & OP_MASK) << OP_SHIFT)
                | (((conn_id & CONN_ID_MASK) as u64) << CONN_SHIFT)
                | (((fd & FD_MASK) as u64) << FD_SHIFT)
                | (buf_id & BUF_ID_MASK) as u64,
        )
    }

    #[inline]
    pub fn decode(self) -> Decoded {
        Decoded {
            op_code: self.op_code(),
            conn_id: self.conn_id(),
            fd: self.fd(),
            buf_id: self.buf_id(),
        }
    }

    #[inline]
    pub fn op_code(self) -> u8 {
        ((self.0 >> OP_SHIFT) & OP_MASK) as u8
    }

    /// `None` for the four unassigned op codes (12..=15).
    #[inline]
    pub fn op(self) -> Option<Op> {
        Op::from_u8(self.op_code())
    }

    #[inline]
    pub fn conn_id(self) -> u32 {
        (self.0 >> CONN_SHIFT) as u32 & CONN_ID_MASK
    }

    #[inline]
    pub fn fd(self) -> u32 {
        (self.0 >> FD_SHIFT) as u32 & FD_MASK
    }

    #[inline]
    pub fn buf_id(self) -> u32 {
        self.0 as u32 & BUF_ID_MASK
    }
}

impl From<Token> for u64 {
    fn from(t: Token) -> u64 {
        t.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_layout() {
        let t = Token::new(Op::FdPass, 0x0ABC_DEF1, 0x1234, 0x5678);
        assert_eq!(t.0, 0x7ABC_DEF1_1234_5678);
    }

    #[test]
    fn test_token_round_trip_extremes() {
        let conn_ids = [0, 1, 0x7FF_FFFF, CONN_ID_MASK];
        let small = [0, 1, 0x7FFF, 0xFFFF];
        for op in Op::ALL {
            for &c in &conn_ids {
                for &fd in &small {
                    for &b in &small {
                        let d = Token::new(op, c, fd, b).decode();
                        assert_eq!(
                            d,
                            Decoded { op_code: op as u8, conn_id: c, fd, buf_id: b }
                        );
                        assert_eq!(Op::from_u8(d.op_code), Some(op));
                    }
                }
            }
        }
    }

    #[test]
    fn test_token_round_trip_sweep() {
        // xorshift over the full field ranges
        let mut x: u64 = 0x9E37_79B9_7F4A_7C15;
        for _ in 0..10_000 {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            let op = Op::ALL[(x % 12) as usize];
            let c = (x >> 8) as u32 & CONN_ID_MASK;
            let fd = (x >> 36) as u32 & FD_MASK;
            let b = (x >> 52) as u32 & BUF_ID_MASK;
            let t = Token::new(op, c, fd, b);
            assert_eq!(t.op(), Some(op));
            assert_eq!((t.conn_id(), t.fd(), t.buf_id()), (c, fd, b));
        }
    }

    #[test]
    fn test_token_unknown_op() {
        let t = Token::encode(13, 5, 0, 0);
        assert_eq!(t.op_code(), 13);
        assert_eq!(t.op(), None);
        assert_eq!(t.conn_id(), 5);
    }

    #[test]
    fn test_token_masks_out_of_range() {
        let t = Token::new(Op::Recv, u32::MAX, u32::MAX, u32::MAX);
        assert_eq!(t.op(), Some(Op::Recv));
        assert_eq!(t.conn_id(), CONN_ID_MASK);
        assert_eq!(t.fd(), FD_MASK);
        assert_eq!(t.buf_id(), BUF_ID_MASK);
    }
}
