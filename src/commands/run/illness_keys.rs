use std::collections::BTreeMap;

use anyhow::{Result, bail};
use rusqlite::Connection;
use rusqlite::types::{ToSql, ToSqlOutput, Value};
use tracing::warn;

use crate::model::UNKNOWN_ILLNESS;

pub(crate) const FALLBACK_ILLNESS_KEYS: [(&str, i64); 5] = [
    ("UNKNOWN", 0),
    ("CONTROL", 1),
    ("SEPSIS", 2),
    ("SEPTIC_SHOCK", 3),
    ("NO_SEPSIS", 4),
];

/// Surrogate key of an illness label. Numeric-looking keys become integers;
/// anything else is kept as found.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum IllnessKey {
    Id(i64),
    Text(String),
    Null,
}

impl ToSql for IllnessKey {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Self::Id(id) => id.to_sql(),
            Self::Text(text) => text.to_sql(),
            Self::Null => Ok(ToSqlOutput::Owned(Value::Null)),
        }
    }
}

pub(crate) type IllnessKeyMap = BTreeMap<String, IllnessKey>;

#[derive(Debug, Clone)]
pub(crate) struct ResolvedIllnessKeys {
    pub(crate) keys: IllnessKeyMap,
    pub(crate) fallback_reason: Option<String>,
}

impl ResolvedIllnessKeys {
    /// Key for `label`, or the `UNKNOWN` key when the label is not mapped.
    pub(crate) fn key_for(&self, label: &str) -> Option<&IllnessKey> {
        self.keys
            .get(label)
            .or_else(|| self.keys.get(UNKNOWN_ILLNESS))
    }

    pub(crate) fn source_name(&self) -> &'static str {
        if self.fallback_reason.is_some() {
            "fallback"
        } else {
            "warehouse"
        }
    }
}

/// Anything that can hand back illness dimension rows as raw cells.
pub(crate) trait IllnessKeySource {
    fn fetch_illness_rows(&self) -> Result<Vec<Vec<Value>>>;
}

impl IllnessKeySource for Connection {
    fn fetch_illness_rows(&self) -> Result<Vec<Vec<Value>>> {
        let mut statement =
            self.prepare("SELECT illness_label, illness_key FROM dim_illness ORDER BY illness_key")?;
        let mut rows = statement.query([])?;
        let mut out = Vec::new();

        while let Some(row) = rows.next()? {
            out.push(vec![row.get::<_, Value>(0)?, row.get::<_, Value>(1)?]);
        }

        Ok(out)
    }
}

pub(crate) fn fallback_illness_keys() -> IllnessKeyMap {
    FALLBACK_ILLNESS_KEYS
        .iter()
        .map(|(label, key)| (label.to_string(), IllnessKey::Id(*key)))
        .collect()
}

/// The only place raw row shapes are inspected: every row must hold exactly
/// a label cell and a key cell.
pub(crate) fn coerce_to_pairs(rows: Vec<Vec<Value>>) -> Result<Vec<(Value, Value)>> {
    let mut pairs = Vec::with_capacity(rows.len());
    for (index, row) in rows.into_iter().enumerate() {
        let cells = row.len();
        let mut cells_iter = row.into_iter();
        match (cells_iter.next(), cells_iter.next(), cells_iter.next()) {
            (Some(label), Some(key), None) => pairs.push((label, key)),
            _ => bail!("row {index} is not a (label, key) pair: {cells} cells"),
        }
    }
    Ok(pairs)
}

fn normalize_label(label: &Value) -> String {
    let text = match label {
        Value::Null => return String::new(),
        Value::Integer(number) => number.to_string(),
        Value::Real(number) => number.to_string(),
        Value::Text(text) => text.clone(),
        Value::Blob(bytes) => String::from_utf8_lossy(bytes).into_owned(),
    };
    text.trim().to_uppercase()
}

fn parse_key(key: Value) -> IllnessKey {
    match key {
        Value::Integer(id) => IllnessKey::Id(id),
        Value::Real(number) if number.is_finite() => IllnessKey::Id(number.trunc() as i64),
        Value::Real(number) => IllnessKey::Text(number.to_string()),
        Value::Text(text) => match text.trim().parse::<i64>() {
            Ok(id) => IllnessKey::Id(id),
            Err(_) => IllnessKey::Text(text),
        },
        Value::Blob(bytes) => IllnessKey::Text(String::from_utf8_lossy(&bytes).into_owned()),
        Value::Null => IllnessKey::Null,
    }
}

/// Label → key map from the warehouse, or the built-in map whenever the
/// lookup is unavailable or yields nothing usable.
pub(crate) fn resolve_illness_keys(source: Option<&dyn IllnessKeySource>) -> ResolvedIllnessKeys {
    let Some(source) = source else {
        return fallback("no illness key source was supplied".to_string());
    };

    let raw_rows = match source.fetch_illness_rows() {
        Ok(rows) => rows,
        Err(err) => return fallback(format!("illness lookup failed: {err:#}")),
    };

    let pairs = match coerce_to_pairs(raw_rows) {
        Ok(pairs) => pairs,
        Err(err) => return fallback(format!("illness rows were not label/key pairs: {err:#}")),
    };

    if pairs.is_empty() {
        return fallback("no illness rows were returned from the warehouse".to_string());
    }

    let mut keys = IllnessKeyMap::new();
    for (label, key) in pairs {
        let label = normalize_label(&label);
        if label.is_empty() {
            continue;
        }
        keys.insert(label, parse_key(key));
    }

    if keys.is_empty() {
        return fallback("no usable illness rows remained after parsing".to_string());
    }

    ResolvedIllnessKeys {
        keys,
        fallback_reason: None,
    }
}

fn fallback(reason: String) -> ResolvedIllnessKeys {
    warn!(reason = %reason, "falling back to built-in illness key map");
    ResolvedIllnessKeys {
        keys: fallback_illness_keys(),
        fallback_reason: Some(reason),
    }
}
