//! Wire formats: the connect / connect-response handshake message, the
//! rendezvous control message and the immediate-data word carried by RDMA
//! writes. All multi-byte fields are little-endian host order; the engine
//! does not span heterogeneous endianness.

use crate::config::{MAX_NUM_RAILS, NUM_COMM_ID_BITS, NUM_SEG_BITS, NUM_SEQ_BITS};
use crate::error::{RailError, RailResult};
use crate::fabric::{EpName, EP_NAME_LEN};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

pub const MSG_TYPE_CONN: u16 = 1;
pub const MSG_TYPE_CONN_RESP: u16 = 2;
pub const MSG_TYPE_CTRL: u16 = 3;
// Eager payloads have no type field; they are the only unsolicited receive
// that carries an immediate word.

/// Size of an encoded connect / connect-response message.
pub const CONN_MSG_SIZE: usize = 14 + MAX_NUM_RAILS * EP_NAME_LEN;
/// Size of an encoded control message.
pub const CTRL_MSG_SIZE: usize = 18 + MAX_NUM_RAILS * 8;

const COMM_ID_MASK: u32 = (1 << NUM_COMM_ID_BITS) - 1;
const SEQ_MASK: u32 = (1 << NUM_SEQ_BITS) - 1;
const SEG_MASK: u32 = (1 << NUM_SEG_BITS) - 1;

/// Pack the immediate word: `[4b segment count | 18b comm id | 10b seq]`.
#[inline]
pub fn pack_imm(comm_id: u32, seq: u16, num_segments: usize) -> u32 {
    debug_assert!(comm_id <= COMM_ID_MASK);
    debug_assert!(u32::from(seq) <= SEQ_MASK);
    debug_assert!(num_segments as u32 <= SEG_MASK);

    (seq as u32 & SEQ_MASK)
        | ((comm_id & COMM_ID_MASK) << NUM_SEQ_BITS)
        | ((num_segments as u32 & SEG_MASK) << (NUM_SEQ_BITS + NUM_COMM_ID_BITS))
}

/// Unpack the immediate word into (comm id, sequence, segment count).
#[inline]
pub fn unpack_imm(imm: u32) -> (u32, u16, usize) {
    let seq = (imm & SEQ_MASK) as u16;
    let comm_id = (imm >> NUM_SEQ_BITS) & COMM_ID_MASK;
    let num_segments = ((imm >> (NUM_SEQ_BITS + NUM_COMM_ID_BITS)) & SEG_MASK) as usize;
    (comm_id, seq, num_segments)
}

/// Read the type discriminator of an unsolicited message without decoding
/// the rest.
#[inline]
pub fn peek_msg_type(buf: &[u8]) -> RailResult<u16> {
    if buf.len() < 2 {
        return Err(RailError::Protocol("runt unsolicited message"));
    }
    Ok(u16::from_le_bytes([buf[0], buf[1]]))
}

/// Connect and connect-response messages share one layout; only the type
/// field differs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnMsg {
    pub msg_type: u16,
    /// Communicator id of the message's originator.
    pub local_comm_id: u32,
    /// Communicator id of the addressee, as known to the originator.
    pub remote_comm_id: u32,
    pub num_rails: u16,
    pub ep_names: [EpName; MAX_NUM_RAILS],
}

impl ConnMsg {
    pub fn encode(&self, buf: &mut [u8]) -> RailResult<()> {
        if buf.len() < CONN_MSG_SIZE {
            return Err(RailError::Invalid("connect message buffer too small"));
        }

        let mut cursor = Cursor::new(buf);
        cursor.write_u16::<LittleEndian>(self.msg_type)?;
        cursor.write_u16::<LittleEndian>(0)?; // pad
        cursor.write_u32::<LittleEndian>(self.local_comm_id)?;
        cursor.write_u32::<LittleEndian>(self.remote_comm_id)?;
        cursor.write_u16::<LittleEndian>(self.num_rails)?;
        for name in &self.ep_names {
            cursor.write_all(&name.0)?;
        }
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> RailResult<ConnMsg> {
        if buf.len() < CONN_MSG_SIZE {
            return Err(RailError::Protocol("runt connect message"));
        }

        let mut cursor = Cursor::new(buf);
        let msg_type = cursor.read_u16::<LittleEndian>()?;
        if msg_type != MSG_TYPE_CONN && msg_type != MSG_TYPE_CONN_RESP {
            return Err(RailError::Protocol("bad connect message type"));
        }
        let _pad = cursor.read_u16::<LittleEndian>()?;
        let local_comm_id = cursor.read_u32::<LittleEndian>()?;
        let remote_comm_id = cursor.read_u32::<LittleEndian>()?;
        let num_rails = cursor.read_u16::<LittleEndian>()?;
        if num_rails == 0 || num_rails as usize > MAX_NUM_RAILS {
            return Err(RailError::Protocol("bad rail count in connect message"));
        }

        let mut ep_names = [EpName::zeroed(); MAX_NUM_RAILS];
        for name in ep_names.iter_mut() {
            cursor.read_exact(&mut name.0)?;
        }

        Ok(ConnMsg {
            msg_type,
            local_comm_id,
            remote_comm_id,
            num_rails,
            ep_names,
        })
    }
}

/// Rendezvous control message: the receiver advertises its buffer address,
/// length and per-rail remote keys to the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtrlMsg {
    /// The sender-side communicator id this message addresses.
    pub remote_comm_id: u32,
    pub msg_seq_num: u16,
    pub buff_addr: u64,
    pub buff_len: u64,
    pub buff_mr_key: [u64; MAX_NUM_RAILS],
}

impl CtrlMsg {
    pub fn encode(&self, buf: &mut [u8]) -> RailResult<()> {
        if buf.len() < CTRL_MSG_SIZE {
            return Err(RailError::Invalid("control message buffer too small"));
        }

        let mut cursor = Cursor::new(buf);
        cursor.write_u16::<LittleEndian>(MSG_TYPE_CTRL)?;
        cursor.write_u16::<LittleEndian>(0)?; // pad
        cursor.write_u32::<LittleEndian>(self.remote_comm_id)?;
        cursor.write_u16::<LittleEndian>(self.msg_seq_num)?;
        cursor.write_u64::<LittleEndian>(self.buff_addr)?;
        cursor.write_u64::<LittleEndian>(self.buff_len)?;
        for key in &self.buff_mr_key {
            cursor.write_u64::<LittleEndian>(*key)?;
        }
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> RailResult<CtrlMsg> {
        if buf.len() < CTRL_MSG_SIZE {
            return Err(RailError::Protocol("runt control message"));
        }

        let mut cursor = Cursor::new(buf);
        let msg_type = cursor.read_u16::<LittleEndian>()?;
        if msg_type != MSG_TYPE_CTRL {
            return Err(RailError::Protocol("bad control message type"));
        }
        let _pad = cursor.read_u16::<LittleEndian>()?;
        let remote_comm_id = cursor.read_u32::<LittleEndian>()?;
        let msg_seq_num = cursor.read_u16::<LittleEndian>()?;
        let buff_addr = cursor.read_u64::<LittleEndian>()?;
        let buff_len = cursor.read_u64::<LittleEndian>()?;

        let mut buff_mr_key = [0u64; MAX_NUM_RAILS];
        for key in buff_mr_key.iter_mut() {
            *key = cursor.read_u64::<LittleEndian>()?;
        }

        Ok(CtrlMsg {
            remote_comm_id,
            msg_seq_num,
            buff_addr,
            buff_len,
            buff_mr_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SEQ_SPACE;

    #[test]
    fn test_imm_roundtrip() {
        let imm = pack_imm(0x2ffff, 1023, 15);
        assert_eq!(unpack_imm(imm), (0x2ffff, 1023, 15));

        let imm = pack_imm(0, 0, 1);
        assert_eq!(unpack_imm(imm), (0, 0, 1));
    }

    #[test]
    fn test_imm_layout() {
        // [4b nseg | 18b comm | 10b seq]
        let imm = pack_imm(1, 2, 3);
        assert_eq!(imm, 2 | (1 << 10) | (3 << 28));
    }

    #[test]
    fn test_imm_field_isolation() {
        for seq in [0u16, 1, SEQ_SPACE - 1] {
            let imm = pack_imm(0x1234, seq, 4);
            let (comm_id, got_seq, nseg) = unpack_imm(imm);
            assert_eq!(comm_id, 0x1234);
            assert_eq!(got_seq, seq);
            assert_eq!(nseg, 4);
        }
    }

    #[test]
    fn test_conn_msg_roundtrip() {
        let mut names = [EpName::zeroed(); MAX_NUM_RAILS];
        names[0].0[..2].copy_from_slice(b"ab");
        names[1].0[..2].copy_from_slice(b"cd");

        let msg = ConnMsg {
            msg_type: MSG_TYPE_CONN,
            local_comm_id: 7,
            remote_comm_id: 9,
            num_rails: 2,
            ep_names: names,
        };

        let mut buf = [0u8; CONN_MSG_SIZE];
        msg.encode(&mut buf).unwrap();
        assert_eq!(peek_msg_type(&buf).unwrap(), MSG_TYPE_CONN);

        let decoded = ConnMsg::decode(&buf).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_conn_msg_rejects_bad_rails() {
        let msg = ConnMsg {
            msg_type: MSG_TYPE_CONN_RESP,
            local_comm_id: 1,
            remote_comm_id: 2,
            num_rails: (MAX_NUM_RAILS + 1) as u16,
            ep_names: [EpName::zeroed(); MAX_NUM_RAILS],
        };

        let mut buf = [0u8; CONN_MSG_SIZE];
        msg.encode(&mut buf).unwrap();
        assert!(ConnMsg::decode(&buf).is_err());
    }

    #[test]
    fn test_ctrl_msg_roundtrip() {
        let msg = CtrlMsg {
            remote_comm_id: 0x3ffff,
            msg_seq_num: 600,
            buff_addr: 0xdead_beef_0000,
            buff_len: 1 << 24,
            buff_mr_key: [1, 2, 3, 4],
        };

        let mut buf = [0u8; CTRL_MSG_SIZE];
        msg.encode(&mut buf).unwrap();
        assert_eq!(peek_msg_type(&buf).unwrap(), MSG_TYPE_CTRL);

        let decoded = CtrlMsg::decode(&buf).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_ctrl_msg_little_endian_layout() {
        let msg = CtrlMsg {
            remote_comm_id: 0x0102_0304,
            msg_seq_num: 0x0a0b,
            buff_addr: 0,
            buff_len: 0,
            buff_mr_key: [0; MAX_NUM_RAILS],
        };

        let mut buf = [0u8; CTRL_MSG_SIZE];
        msg.encode(&mut buf).unwrap();

        assert_eq!(&buf[..2], &[3, 0]); // type
        assert_eq!(&buf[4..8], &[4, 3, 2, 1]); // comm id, little endian
        assert_eq!(&buf[8..10], &[0x0b, 0x0a]); // seq
    }

    #[test]
    fn test_runt_messages_rejected() {
        assert!(ConnMsg::decode(&[0u8; 4]).is_err());
        assert!(CtrlMsg::decode(&[0u8; 4]).is_err());
        assert!(peek_msg_type(&[0u8; 1]).is_err());
    }
}
