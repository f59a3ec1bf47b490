use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A record as returned by the JSONv2 endpoints: a flat object of field names to
/// (usually string) values.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Record(pub Map<String, Value>);

impl Record {
    /// String value of `name`; `None` when the field is absent or not a string.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn sys_id(&self) -> Option<&str> {
        self.field("sys_id").filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordList {
    pub records: Vec<Record>,
}

impl RecordList {
    pub fn first(&self) -> Option<&Record> {
        self.records.first()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}
