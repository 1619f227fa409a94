use bytes::BytesMut;
use tracing::{debug, error, trace};

use crate::envelope::{Direction, Frame, FrameError, FrameTag, read_var_int};

/// What the multiplexer decided about one inbound host packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intercept {
    /// Not ours. The packet is untouched and belongs to the host decoder.
    Passthrough,
    /// A sidechannel frame. The packet has been swallowed.
    Consumed(Frame),
    /// Carried one of our tags but could not be decoded. Swallowed and dropped.
    Dropped(FrameError),
}

/// Sits in front of the host decoder on one side of the connection and pulls
/// out the frames addressed to that side.
#[derive(Debug, Clone, Copy)]
pub struct Multiplexer {
    inbound: Direction,
}

impl Multiplexer {
    /// The multiplexer of the client end: accepts instructions and query requests.
    pub const fn client() -> Self {
        Self { inbound: Direction::ServerToClient }
    }

    /// The multiplexer of the server end: accepts client events and query responses.
    pub const fn server() -> Self {
        Self { inbound: Direction::ClientToServer }
    }

    pub const fn inbound(&self) -> Direction {
        self.inbound
    }

    pub fn accepts(&self, tag: FrameTag) -> bool {
        tag.direction() == self.inbound
    }

    /// Inspect one complete host packet.
    ///
    /// The tag is peeked through a cursor, so a packet that is not ours is left
    /// byte-for-byte as it was. A packet that is ours is always cleared, even
    /// when its payload turns out to be malformed: a half-understood
    /// sidechannel frame must never reach the host decoder.
    pub fn intercept(&self, packet: &mut BytesMut) -> Intercept {
        if packet.is_empty() {
            return Intercept::Passthrough;
        }

        let mut cursor: &[u8] = &packet[..];
        let tag = match read_var_int(&mut cursor) {
            Ok(id) => match FrameTag::from_wire_id(id) {
                Some(tag) if self.accepts(tag) => tag,
                _ => {
                    trace!(packet_id = id, "passing packet through to host decoder");
                    return Intercept::Passthrough;
                }
            },
            // the host owns anything it can't even read a packet id from
            Err(_) => return Intercept::Passthrough,
        };

        let decoded = Frame::decode_payload(tag, &mut cursor);
        let trailing = cursor.len();
        packet.clear();

        match decoded {
            Ok(frame) => {
                if trailing > 0 {
                    debug!(?tag, trailing, "ignoring trailing bytes after sidechannel frame");
                }
                Intercept::Consumed(frame)
            }
            Err(err) => {
                error!(?tag, error = %err, "dropping malformed sidechannel frame");
                Intercept::Dropped(err)
            }
        }
    }
}
