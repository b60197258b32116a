use crate::error::CommandError;
use serde_json::Value;

pub const MODE_TABLE: &str = "tbl_box_prms";
pub const MODE_ITEM: &str = "MODE";
//re-sync request asking the device to resend all of its tables
pub const MAINTENANCE_TABLE: &str = "tbl_box_prms";
pub const MAINTENANCE_ITEM: &str = "SA";
pub const MAINTENANCE_VALUE: &str = "1";

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ValueKind {
    Int { min: i64, max: i64 },
    Float { min: f64, max: f64 },
    Bool,
}

#[derive(Clone, Copy, Debug)]
pub struct WritableItem {
    pub table: &'static str,
    pub item: &'static str,
    pub kind: ValueKind,
    pub desc: &'static str,
}

impl WritableItem {
    const fn new(
        table: &'static str,
        item: &'static str,
        kind: ValueKind,
        desc: &'static str,
    ) -> Self {
        Self {
            table,
            item,
            kind,
            desc,
        }
    }
}

#[rustfmt::skip]
pub const WRITABLE: &[WritableItem] = &[
    WritableItem::new("tbl_box_prms", "MODE", ValueKind::Int { min: 0, max: 5 }, "box operating mode"),
    WritableItem::new("tbl_box_prms", "SA", ValueKind::Bool, "resend all tables"),
    WritableItem::new("tbl_box_prms", "RQRESET", ValueKind::Bool, "request box reset"),
    WritableItem::new("tbl_batt_prms", "FMT_ON", ValueKind::Bool, "battery formatting"),
    WritableItem::new("tbl_batt_prms", "BAT_MIN", ValueKind::Int { min: 20, max: 100 }, "minimum battery charge"),
    WritableItem::new("tbl_boiler_prms", "ISON", ValueKind::Bool, "boiler control enabled"),
    WritableItem::new("tbl_boiler_prms", "MANUAL", ValueKind::Bool, "boiler manual mode"),
    WritableItem::new("tbl_boiler_prms", "SSR0", ValueKind::Bool, "boiler relay 1"),
    WritableItem::new("tbl_boiler_prms", "SSR1", ValueKind::Bool, "boiler relay 2"),
    WritableItem::new("tbl_boiler_prms", "SSR2", ValueKind::Bool, "boiler relay 3"),
    WritableItem::new("tbl_boiler_prms", "OFFSET", ValueKind::Int { min: 0, max: 10000 }, "boiler power offset"),
    WritableItem::new("tbl_invertor_prms", "GRID_PV_ON", ValueKind::Bool, "grid export enabled"),
    WritableItem::new("tbl_invertor_prms", "GRID_PV_OFF", ValueKind::Bool, "grid export disabled"),
    WritableItem::new("tbl_invertor_prms", "TO_GRID", ValueKind::Bool, "export limit active"),
    WritableItem::new("tbl_invertor_prm1", "AAC_MAX_CHRG", ValueKind::Float { min: 0.0, max: 50.0 }, "max AC charging current"),
    WritableItem::new("tbl_invertor_prm1", "A_MAX_CHRG", ValueKind::Float { min: 0.0, max: 150.0 }, "max charging current"),
];

pub fn lookup(table: &str, item: &str) -> Option<&'static WritableItem> {
    WRITABLE.iter().find(|w| w.table == table && w.item == item)
}

pub fn is_known_table(table: &str) -> bool {
    WRITABLE.iter().any(|w| w.table == table)
}

pub fn is_mode_item(table: &str, item: &str) -> bool {
    table == MODE_TABLE && item == MODE_ITEM
}

pub fn is_maintenance_item(table: &str, item: &str) -> bool {
    table == MAINTENANCE_TABLE && item == MAINTENANCE_ITEM
}

pub fn request_key(table: &str, item: &str, canonical: &str) -> String {
    format!("{}/{}/{}", table, item, canonical)
}

/// Splits a `table/item/value` key back into its parts.
pub fn split_request_key(key: &str) -> Option<(&str, &str, &str)> {
    let mut parts = key.splitn(3, '/');
    Some((parts.next()?, parts.next()?, parts.next()?))
}

fn bad_value(table: &str, item: &str, reason: String) -> CommandError {
    CommandError::BadValue {
        table: table.to_string(),
        item: item.to_string(),
        reason,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Validates a requested value and returns its canonical text form.
pub fn normalize(table: &str, item: &str, value: &Value) -> Result<String, CommandError> {
    let writable = lookup(table, item).ok_or_else(|| CommandError::NotAllowed {
        table: table.to_string(),
        item: item.to_string(),
    })?;

    let number = match (value, writable.kind) {
        (Value::String(s), ValueKind::Bool) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "on" => Some(1.0),
            "false" | "off" => Some(0.0),
            _ => as_number(value),
        },
        _ => as_number(value),
    }
    .filter(|n| n.is_finite())
    .ok_or_else(|| bad_value(table, item, format!("not a number: {}", value)))?;

    match writable.kind {
        ValueKind::Int { min, max } => {
            if number.fract() != 0.0 {
                return Err(bad_value(table, item, format!("{} is not an integer", number)));
            }
            let n = number as i64;
            if n < min || n > max {
                return Err(bad_value(
                    table,
                    item,
                    format!("{} outside of {}..={}", n, min, max),
                ));
            }
            Ok(n.to_string())
        }
        ValueKind::Float { min, max } => {
            if number < min || number > max {
                return Err(bad_value(
                    table,
                    item,
                    format!("{} outside of {}..={}", number, min, max),
                ));
            }
            Ok(format!("{}", number))
        }
        ValueKind::Bool => match number as i64 {
            0 | 1 if number.fract() == 0.0 => Ok((number as i64).to_string()),
            _ => Err(bad_value(table, item, format!("{} is not 0/1", number))),
        },
    }
}

/// Compares two device-side values, numerically when both parse.
pub fn same_value(a: &str, b: &str) -> bool {
    match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
        (Ok(x), Ok(y)) => x == y,
        _ => a.trim() == b.trim(),
    }
}
