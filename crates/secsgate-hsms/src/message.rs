// ── SECS-II message model ──
//
// Typed messages exchanged with the codec. Binary encoding is the codec's
// concern; this module only describes stream/function addressing, the
// correlation id, and the nested item tree.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── SecsItem ────────────────────────────────────────────────────────

/// A SECS-II data item. Numeric formats are arrays, as on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", content = "value")]
pub enum SecsItem {
    List(Vec<SecsItem>),
    Ascii(String),
    Binary(Vec<u8>),
    Boolean(Vec<bool>),
    I1(Vec<i8>),
    I2(Vec<i16>),
    I4(Vec<i32>),
    I8(Vec<i64>),
    U1(Vec<u8>),
    U2(Vec<u16>),
    U4(Vec<u32>),
    U8(Vec<u64>),
    F4(Vec<f32>),
    F8(Vec<f64>),
}

impl SecsItem {
    pub fn list(items: impl IntoIterator<Item = SecsItem>) -> Self {
        Self::List(items.into_iter().collect())
    }

    pub fn empty_list() -> Self {
        Self::List(Vec::new())
    }

    pub fn ascii(value: impl Into<String>) -> Self {
        Self::Ascii(value.into())
    }

    /// Single-byte binary item, the usual shape of acknowledge codes.
    pub fn binary(code: u8) -> Self {
        Self::Binary(vec![code])
    }

    pub fn boolean(value: bool) -> Self {
        Self::Boolean(vec![value])
    }

    pub fn u1(value: u8) -> Self {
        Self::U1(vec![value])
    }

    pub fn u4(value: u32) -> Self {
        Self::U4(vec![value])
    }

    pub fn i4(value: i32) -> Self {
        Self::I4(vec![value])
    }

    pub fn f8(value: f64) -> Self {
        Self::F8(vec![value])
    }

    /// Children of a list item.
    pub fn as_list(&self) -> Option<&[SecsItem]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_ascii(&self) -> Option<&str> {
        match self {
            Self::Ascii(s) => Some(s),
            _ => None,
        }
    }

    /// First element of any integer-like format, widened to `u64`.
    ///
    /// Negative signed values yield `None`.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Binary(v) | Self::U1(v) => v.first().map(|&x| u64::from(x)),
            Self::U2(v) => v.first().map(|&x| u64::from(x)),
            Self::U4(v) => v.first().map(|&x| u64::from(x)),
            Self::U8(v) => v.first().copied(),
            Self::Boolean(v) => v.first().map(|&b| u64::from(b)),
            Self::I1(_) | Self::I2(_) | Self::I4(_) | Self::I8(_) => {
                self.as_i64().and_then(|x| u64::try_from(x).ok())
            }
            _ => None,
        }
    }

    /// First element of any integer-like format, widened to `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I1(v) => v.first().map(|&x| i64::from(x)),
            Self::I2(v) => v.first().map(|&x| i64::from(x)),
            Self::I4(v) => v.first().map(|&x| i64::from(x)),
            Self::I8(v) => v.first().copied(),
            _ => self.as_u64().and_then(|x| i64::try_from(x).ok()),
        }
    }

    /// First element of a numeric format as `f64`.
    #[allow(clippy::as_conversions, clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F4(v) => v.first().map(|&x| f64::from(x)),
            Self::F8(v) => v.first().copied(),
            _ => self.as_i64().map(|x| x as f64),
        }
    }

    /// Number of elements (children for lists, bytes/values otherwise).
    pub fn len(&self) -> usize {
        match self {
            Self::List(v) => v.len(),
            Self::Ascii(s) => s.len(),
            Self::Binary(v) | Self::U1(v) => v.len(),
            Self::Boolean(v) => v.len(),
            Self::I1(v) => v.len(),
            Self::I2(v) => v.len(),
            Self::I4(v) => v.len(),
            Self::I8(v) => v.len(),
            Self::U2(v) => v.len(),
            Self::U4(v) => v.len(),
            Self::U8(v) => v.len(),
            Self::F4(v) => v.len(),
            Self::F8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lossy JSON projection used for trace data and event payloads.
    ///
    /// Single-element arrays collapse to scalars; lists become arrays.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;

        fn collapse<T: Into<Value> + Copy>(values: &[T]) -> Value {
            match values {
                [single] => (*single).into(),
                many => Value::Array(many.iter().map(|&v| v.into()).collect()),
            }
        }

        match self {
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Ascii(s) => Value::String(s.clone()),
            Self::Binary(v) | Self::U1(v) => collapse(v),
            Self::Boolean(v) => collapse(v),
            Self::I1(v) => collapse(v),
            Self::I2(v) => collapse(v),
            Self::I4(v) => collapse(v),
            Self::I8(v) => collapse(v),
            Self::U2(v) => collapse(v),
            Self::U4(v) => collapse(v),
            Self::U8(v) => collapse(v),
            Self::F4(v) => collapse(v),
            Self::F8(v) => collapse(v),
        }
    }
}

// ── MessageCategory ─────────────────────────────────────────────────

/// Routing category derived from the stream number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageCategory {
    /// S1 equipment status and S2 equipment control.
    Control,
    /// S5 exception (alarm) handling.
    Alarm,
    /// S6 data collection.
    Data,
    /// S9 system errors.
    SystemError,
    /// S10 terminal services.
    Terminal,
    Other(u8),
}

impl From<u8> for MessageCategory {
    fn from(stream: u8) -> Self {
        match stream {
            1 | 2 => Self::Control,
            5 => Self::Alarm,
            6 => Self::Data,
            9 => Self::SystemError,
            10 => Self::Terminal,
            other => Self::Other(other),
        }
    }
}

// ── SecsMessage ─────────────────────────────────────────────────────

/// A SECS-II message addressed by stream/function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecsMessage {
    pub stream: u8,
    pub function: u8,
    /// The W-bit: the sender expects a secondary message in reply.
    pub reply_expected: bool,
    /// Correlation id. Assigned by the client for primaries, copied from
    /// the primary for replies.
    pub system_bytes: u32,
    pub body: Option<SecsItem>,
}

impl SecsMessage {
    /// Build a primary message. System bytes are assigned on send.
    pub fn new(stream: u8, function: u8, reply_expected: bool, body: Option<SecsItem>) -> Self {
        Self {
            stream,
            function,
            reply_expected,
            system_bytes: 0,
            body,
        }
    }

    #[must_use]
    pub fn with_system_bytes(mut self, system_bytes: u32) -> Self {
        self.system_bytes = system_bytes;
        self
    }

    #[must_use]
    pub fn with_reply_expected(mut self) -> Self {
        self.reply_expected = true;
        self
    }

    /// Primary messages carry odd function numbers.
    pub fn is_primary(&self) -> bool {
        self.function % 2 == 1
    }

    /// Build the secondary for this primary (function + 1, same system bytes).
    pub fn reply_with(&self, body: Option<SecsItem>) -> Self {
        Self {
            stream: self.stream,
            function: self.function.saturating_add(1),
            reply_expected: false,
            system_bytes: self.system_bytes,
            body,
        }
    }

    /// `true` if `self` is the secondary answering `primary`.
    pub fn is_reply_to(&self, primary: &SecsMessage) -> bool {
        self.stream == primary.stream
            && self.function == primary.function.saturating_add(1)
            && self.system_bytes == primary.system_bytes
    }

    pub fn category(&self) -> MessageCategory {
        MessageCategory::from(self.stream)
    }

    /// Compact `SxFy` label, used in logs and errors.
    pub fn label(&self) -> String {
        format!("S{}F{}", self.stream, self.function)
    }
}

impl fmt::Display for SecsMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}F{}", self.stream, self.function)?;
        if self.reply_expected {
            write!(f, " W")?;
        }
        write!(f, " [{:#010x}]", self.system_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn numeric_accessors_widen_across_formats() {
        assert_eq!(SecsItem::U2(vec![512]).as_u64(), Some(512));
        assert_eq!(SecsItem::I4(vec![-3]).as_u64(), None);
        assert_eq!(SecsItem::I4(vec![-3]).as_i64(), Some(-3));
        assert_eq!(SecsItem::binary(4).as_u64(), Some(4));
        assert_eq!(SecsItem::F4(vec![1.5]).as_f64(), Some(1.5));
        assert_eq!(SecsItem::ascii("x").as_u64(), None);
        assert_eq!(SecsItem::U4(Vec::new()).as_u64(), None);
    }

    #[test]
    fn json_projection_collapses_scalars() {
        let item = SecsItem::list([
            SecsItem::u4(7),
            SecsItem::ascii("ok"),
            SecsItem::U1(vec![1, 2]),
        ]);
        assert_eq!(item.to_json(), serde_json::json!([7, "ok", [1, 2]]));
    }

    #[test]
    fn reply_correlates_with_primary() {
        let primary = SecsMessage::new(1, 13, true, None).with_system_bytes(42);
        let reply = primary.reply_with(Some(SecsItem::binary(0)));
        assert!(primary.is_primary());
        assert!(!reply.is_primary());
        assert!(reply.is_reply_to(&primary));
        assert_eq!(reply.label(), "S1F14");

        let other = SecsMessage::new(1, 14, false, None).with_system_bytes(43);
        assert!(!other.is_reply_to(&primary));
    }

    #[test]
    fn category_follows_stream() {
        assert_eq!(MessageCategory::from(1), MessageCategory::Control);
        assert_eq!(MessageCategory::from(2), MessageCategory::Control);
        assert_eq!(MessageCategory::from(5), MessageCategory::Alarm);
        assert_eq!(MessageCategory::from(6), MessageCategory::Data);
        assert_eq!(MessageCategory::from(7), MessageCategory::Other(7));
    }

    #[test]
    fn display_shows_wait_bit_and_system_bytes() {
        let msg = SecsMessage::new(2, 41, true, None).with_system_bytes(0x10);
        assert_eq!(msg.to_string(), "S2F41 W [0x00000010]");
    }
}
