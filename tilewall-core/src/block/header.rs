//! Fixed-size text header that precedes every block group on the wire.
//!
//! ```text
//! "blockCount frameID configID [firstOrdinal | cfg | end]\0\0\0 ..."   (GROUP_HEADER_SIZE bytes)
//! ```
//!
//! A zero `blockCount` marks a control group. On a data group the
//! optional fourth token is the routing-table ordinal of the group's
//! first block; on a control group it names the kind of signal.
//! Control groups without it are told apart by their config id.

use std::fmt;

use crate::error::WallError;

/// Encoded size of a group header on the wire.
pub const GROUP_HEADER_SIZE: usize = 128;

pub type GroupHeaderBytes = [u8; GROUP_HEADER_SIZE];

// ── GroupFlag ────────────────────────────────────────────────────

/// What a block group carries.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GroupFlag {
    /// Payload-bearing group.
    #[default]
    PixelData = 1,
    /// Announces a new layout configuration.
    ConfigUpdate = 2,
    /// Marks the end of a frame.
    EndFrame = 3,
}

impl TryFrom<u32> for GroupFlag {
    type Error = WallError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(GroupFlag::PixelData),
            2 => Ok(GroupFlag::ConfigUpdate),
            3 => Ok(GroupFlag::EndFrame),
            _ => Err(WallError::UnknownVariant {
                type_name: "GroupFlag",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for GroupFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── GroupHeader ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupHeader {
    pub block_count: u32,
    pub frame_id: u32,
    pub config_id: u32,
    pub first_ordinal: Option<u32>,
    /// Explicit kind of a control group.
    pub kind: Option<GroupFlag>,
}

const CONFIG_TOKEN: &str = "cfg";
const END_TOKEN: &str = "end";

impl GroupHeader {
    pub fn new(block_count: u32, frame_id: u32, config_id: u32) -> Self {
        Self {
            block_count,
            frame_id,
            config_id,
            first_ordinal: None,
            kind: None,
        }
    }

    /// A zero-payload signaling header.
    pub fn control(frame_id: u32, config_id: u32) -> Self {
        Self::new(0, frame_id, config_id)
    }

    /// Name the control signal on the wire. Ignored for data groups.
    pub fn with_kind(mut self, kind: GroupFlag) -> Self {
        if self.is_control() && kind != GroupFlag::PixelData {
            self.kind = Some(kind);
        }
        self
    }

    pub fn with_first_ordinal(mut self, ordinal: u32) -> Self {
        self.first_ordinal = Some(ordinal);
        self
    }

    pub fn is_control(&self) -> bool {
        self.block_count == 0
    }

    /// Meaning of this header given the last configuration id seen on
    /// the same connection. An explicit kind wins; otherwise a control
    /// group with a newer config id announces a layout change and any
    /// other one ends a frame.
    pub fn classify(&self, last_config_id: Option<u32>) -> GroupFlag {
        if !self.is_control() {
            return GroupFlag::PixelData;
        }
        if let Some(kind) = self.kind {
            return kind;
        }
        match last_config_id {
            Some(last) if self.config_id <= last => GroupFlag::EndFrame,
            _ => GroupFlag::ConfigUpdate,
        }
    }

    /// Render the NUL-padded text record.
    pub fn to_bytes(&self) -> GroupHeaderBytes {
        let mut text = format!("{} {} {}", self.block_count, self.frame_id, self.config_id);
        match (self.kind, self.first_ordinal) {
            (Some(GroupFlag::ConfigUpdate), _) => text.push_str(" cfg"),
            (Some(GroupFlag::EndFrame), _) => text.push_str(" end"),
            (_, Some(ord)) => text.push_str(&format!(" {ord}")),
            _ => {}
        }
        let mut bytes: GroupHeaderBytes = [0; GROUP_HEADER_SIZE];
        // Four u32 tokens never exceed 43 bytes.
        bytes[..text.len()].copy_from_slice(text.as_bytes());
        bytes
    }

    /// Parse a header record. Any unparsable or missing field is fatal
    /// for the stream it came from.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WallError> {
        if bytes.len() < GROUP_HEADER_SIZE {
            return Err(WallError::MalformedHeader(format!(
                "group header too short: {} < {GROUP_HEADER_SIZE}",
                bytes.len()
            )));
        }
        let end = bytes[..GROUP_HEADER_SIZE]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(GROUP_HEADER_SIZE);
        let text = std::str::from_utf8(&bytes[..end])
            .map_err(|e| WallError::MalformedHeader(e.to_string()))?;

        let mut tokens = text.split_ascii_whitespace();
        let mut field = |name: &str| -> Result<u32, WallError> {
            let tok = tokens
                .next()
                .ok_or_else(|| WallError::MalformedHeader(format!("missing {name}")))?;
            Ok(tok.parse::<u32>()?)
        };
        let block_count = field("blockCount")?;
        let frame_id = field("frameID")?;
        let config_id = field("configID")?;
        let mut header = Self::new(block_count, frame_id, config_id);
        match tokens.next() {
            Some(CONFIG_TOKEN) if header.is_control() => header.kind = Some(GroupFlag::ConfigUpdate),
            Some(END_TOKEN) if header.is_control() => header.kind = Some(GroupFlag::EndFrame),
            Some(tok) => header.first_ordinal = Some(tok.parse::<u32>()?),
            None => {}
        }
        Ok(header)
    }
}

impl fmt::Display for GroupHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "group(blocks={}, frame={}, config={})",
            self.block_count, self.frame_id, self.config_id
        )
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_text_layout() {
        let h = GroupHeader::new(8, 12, 3);
        let bytes = h.to_bytes();
        assert!(bytes.starts_with(b"8 12 3\0"));
        assert_eq!(bytes.len(), GROUP_HEADER_SIZE);
        assert_eq!(GroupHeader::from_bytes(&bytes).unwrap(), h);
    }

    #[test]
    fn header_with_ordinal() {
        let h = GroupHeader::new(8, 2, 1).with_first_ordinal(16);
        let parsed = GroupHeader::from_bytes(&h.to_bytes()).unwrap();
        assert_eq!(parsed.first_ordinal, Some(16));
    }

    #[test]
    fn control_header() {
        let h = GroupHeader::control(5, 2);
        assert!(h.is_control());
        assert!(h.to_bytes().starts_with(b"0 5 2"));
    }

    #[test]
    fn control_classification_follows_config_id() {
        let h = GroupHeader::control(4, 2);
        assert_eq!(h.classify(None), GroupFlag::ConfigUpdate);
        assert_eq!(h.classify(Some(1)), GroupFlag::ConfigUpdate);
        assert_eq!(h.classify(Some(2)), GroupFlag::EndFrame);
        assert_eq!(GroupHeader::new(3, 4, 2).classify(None), GroupFlag::PixelData);
    }

    #[test]
    fn explicit_kind_outranks_config_order() {
        let end = GroupHeader::control(7, 9).with_kind(GroupFlag::EndFrame);
        let bytes = end.to_bytes();
        assert!(bytes.starts_with(b"0 7 9 end\0"));
        let parsed = GroupHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.kind, Some(GroupFlag::EndFrame));
        // A newer config id would otherwise read as a layout change.
        assert_eq!(parsed.classify(Some(1)), GroupFlag::EndFrame);

        let cfg = GroupHeader::control(7, 1).with_kind(GroupFlag::ConfigUpdate);
        let parsed = GroupHeader::from_bytes(&cfg.to_bytes()).unwrap();
        assert_eq!(parsed.classify(Some(4)), GroupFlag::ConfigUpdate);
    }

    #[test]
    fn kind_tokens_only_name_control_groups() {
        assert_eq!(GroupHeader::new(2, 1, 1).with_kind(GroupFlag::EndFrame).kind, None);
        let mut bytes = [0u8; GROUP_HEADER_SIZE];
        bytes[..9].copy_from_slice(b"2 1 1 end");
        assert!(GroupHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn missing_field_is_malformed() {
        let mut bytes = [0u8; GROUP_HEADER_SIZE];
        bytes[..3].copy_from_slice(b"4 1");
        assert!(matches!(
            GroupHeader::from_bytes(&bytes),
            Err(WallError::MalformedHeader(_))
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        let mut bytes = [0u8; GROUP_HEADER_SIZE];
        bytes[..7].copy_from_slice(b"x -1 zz");
        assert!(GroupHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn short_buffer_is_malformed() {
        assert!(GroupHeader::from_bytes(b"1 2 3").is_err());
    }

    #[test]
    fn flag_from_u32() {
        assert_eq!(GroupFlag::try_from(3).unwrap(), GroupFlag::EndFrame);
        assert!(GroupFlag::try_from(0).is_err());
    }
}
