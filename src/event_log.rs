use crate::frame::tag_value;
use crate::whitelist::same_value;
use regex::Regex;
use std::sync::OnceLock;

pub const EVENTS_TABLE: &str = "tbl_events";
pub const SETTING_EVENT_TYPE: &str = "Setting";

/// A device-reported parameter change, e.g. `tbl_box_prms / MODE: [1]->[2]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettingChange {
    pub table: String,
    pub item: String,
    pub old: String,
    pub new: String,
}

impl SettingChange {
    pub fn is_item(&self, table: &str, item: &str) -> bool {
        self.table == table && self.item == item
    }

    pub fn confirms(&self, table: &str, item: &str, value: &str) -> bool {
        self.is_item(table, item) && same_value(&self.new, value)
    }
}

fn setting_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?P<table>tbl_[A-Za-z0-9_]+)\s*/\s*(?P<item>[A-Za-z0-9_]+)\s*:\s*\[(?P<old>[^\]]*)\]\s*->\s*\[(?P<new>[^\]]*)\]",
        )
        .expect("setting event regex")
    })
}

/// Parses the content line of a setting event.
pub fn parse_setting_content(content: &str) -> Option<SettingChange> {
    let caps = setting_regex().captures(content)?;
    Some(SettingChange {
        table: caps["table"].to_string(),
        item: caps["item"].to_string(),
        old: caps["old"].trim().to_string(),
        new: caps["new"].trim().to_string(),
    })
}

/// Recognises a `tbl_events` frame of type Setting and extracts the change.
pub fn parse_setting_event(frame: &str) -> Option<SettingChange> {
    if tag_value(frame, "TblName")? != EVENTS_TABLE {
        return None;
    }
    if let Some(kind) = tag_value(frame, "Type") {
        if kind != SETTING_EVENT_TYPE {
            return None;
        }
    }
    parse_setting_content(tag_value(frame, "Content")?)
}
