use chrono::{DateTime, Local, Utc};
use crc16::*;

pub const FRAME_BEGIN: &[u8] = b"<Frame>";
pub const FRAME_END: &[u8] = b"</Frame>";
pub const FRAME_CRLF: &[u8] = b"\r\n";

pub const ID_SERVER: u32 = 5; //server id the device expects in Setting frames
pub const SETTING_REASON: &str = "Setting";
pub const DEFAULT_CONFIRM: &str = "New";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollKind {
    IsNewSet,
    IsNewFW,
    IsNewWeather,
}

impl PollKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollKind::IsNewSet => "IsNewSet",
            PollKind::IsNewFW => "IsNewFW",
            PollKind::IsNewWeather => "IsNewWeather",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Table(String),
    Poll(PollKind),
    End,
    Ack,
    Nack,
    Other,
}

impl FrameKind {
    /// Poll or session-end frames: the device's own request/response bookkeeping.
    pub fn is_marker(&self) -> bool {
        matches!(self, FrameKind::Poll(_) | FrameKind::End)
    }

    pub fn is_end(&self) -> bool {
        *self == FrameKind::End
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Removes exactly one complete frame from the front of `buf`.
/// Bytes before `<Frame>` are dropped, bytes after the frame stay buffered.
pub fn extract_frame(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let start = find(buf, FRAME_BEGIN)?;
    if start > 0 {
        trace!("dropping {} bytes before frame start", start);
        buf.drain(..start);
    }
    let mut end = find(buf, FRAME_END)? + FRAME_END.len();
    if buf[end..].starts_with(FRAME_CRLF) {
        end += FRAME_CRLF.len();
    }
    Some(buf.drain(..end).collect())
}

pub fn tag_value<'a>(frame: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = frame.find(&open)? + open.len();
    let len = frame[start..].find(&close)?;
    Some(&frame[start..start + len])
}

/// All flat `<Tag>value</Tag>` pairs inside a frame, in order.
pub fn tag_pairs(frame: &str) -> Vec<(&str, &str)> {
    let mut pairs = vec![];
    let mut rest = frame;
    while let Some(open) = rest.find('<') {
        let after = &rest[open + 1..];
        let name_end = match after.find('>') {
            Some(n) => n,
            None => break,
        };
        let name = &after[..name_end];
        if name.starts_with('/') || name == "Frame" {
            rest = &after[name_end + 1..];
            continue;
        }
        let body = &after[name_end + 1..];
        let close = format!("</{}>", name);
        match body.find(&close) {
            Some(len) => {
                pairs.push((name, &body[..len]));
                rest = &body[len + close.len()..];
            }
            None => rest = body,
        }
    }
    pairs
}

pub fn classify(frame: &str) -> FrameKind {
    if let Some(table) = tag_value(frame, "TblName") {
        return FrameKind::Table(table.to_string());
    }
    match tag_value(frame, "Result") {
        Some("IsNewSet") => FrameKind::Poll(PollKind::IsNewSet),
        Some("IsNewFW") => FrameKind::Poll(PollKind::IsNewFW),
        Some("IsNewWeather") => FrameKind::Poll(PollKind::IsNewWeather),
        Some("END") => FrameKind::End,
        Some("ACK") => FrameKind::Ack,
        Some("NACK") => FrameKind::Nack,
        _ => FrameKind::Other,
    }
}

pub fn crc(content: &str) -> u16 {
    State::<MODBUS>::calculate(content.as_bytes())
}

/// Wraps inner content into a checksummed frame.
pub fn seal(content: &str) -> String {
    format!(
        "<Frame>{}<CRC>{:05}</CRC></Frame>\r\n",
        content,
        crc(content)
    )
}

/// Checks the `<CRC>` of a frame produced by `seal()`.
pub fn verify_crc(frame: &str) -> bool {
    let inner = match frame.find("<Frame>") {
        Some(start) => &frame[start + FRAME_BEGIN.len()..],
        None => return false,
    };
    let crc_pos = match inner.find("<CRC>") {
        Some(pos) => pos,
        None => return false,
    };
    match tag_value(inner, "CRC").and_then(|v| v.parse::<u16>().ok()) {
        Some(expected) => crc(&inner[..crc_pos]) == expected,
        None => false,
    }
}

#[derive(Clone, Debug)]
pub struct SettingFrame<'a> {
    pub id: u64,
    pub id_set: u64,
    pub device_id: &'a str,
    pub table: &'a str,
    pub item: &'a str,
    pub new_value: &'a str,
    pub confirm: &'a str,
    pub now: DateTime<Utc>,
}

pub fn build_setting_frame(s: &SettingFrame) -> String {
    let local = s.now.with_timezone(&Local);
    let content = format!(
        "<ID>{}</ID><ID_Device>{}</ID_Device><ID_Set>{}</ID_Set><ID_SubD>0</ID_SubD>\
         <DT>{}</DT><NewValue>{}</NewValue><Confirm>{}</Confirm><TblName>{}</TblName>\
         <TblItem>{}</TblItem><ID_Server>{}</ID_Server><mytimediff>0</mytimediff>\
         <Reason>{}</Reason><TSec>{}</TSec><ver>{:05}</ver>",
        s.id,
        s.device_id,
        s.id_set,
        local.format("%Y-%m-%d %H:%M:%S"),
        s.new_value,
        s.confirm,
        s.table,
        s.item,
        ID_SERVER,
        SETTING_REASON,
        s.now.format("%Y-%m-%d %H:%M:%S"),
        s.id_set % 100_000,
    );
    seal(&content)
}

/// Canned reply for ordinary data frames.
pub fn local_ack_reply() -> String {
    seal("<Result>ACK</Result><ToDo>GetActual</ToDo>")
}

/// Canned reply for the session-end marker and for polls with nothing to deliver.
pub fn local_end_reply(now: DateTime<Utc>) -> String {
    let local = now.with_timezone(&Local);
    seal(&format!(
        "<Result>END</Result><Time>{}</Time><UTCTime>{}</UTCTime>",
        local.format("%Y-%m-%d %H:%M:%S"),
        now.format("%Y-%m-%d %H:%M:%S"),
    ))
}

/// Local reply matching the kind of device frame it answers.
pub fn local_reply_for(kind: &FrameKind, now: DateTime<Utc>) -> String {
    if kind.is_marker() {
        local_end_reply(now)
    } else {
        local_ack_reply()
    }
}
