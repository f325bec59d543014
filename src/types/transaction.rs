//! Transaction record parsed at the ingestion boundary

use crate::error::{FieldIssue, FieldProblem, ValidationError};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Number of anonymised PCA components carried by every record
pub const PCA_COMPONENTS: usize = 28;

/// Number of numeric fields in a record (`amount`, `time`, `v1..v28`)
pub const RECORD_FIELDS: usize = PCA_COMPONENTS + 2;

/// A single card transaction to be scored.
///
/// Built only through [`TransactionRecord::new`] or the JSON parsers, so every
/// instance carries all 30 numeric fields.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    transaction_id: String,
    amount: f64,
    time: f64,
    components: [f64; PCA_COMPONENTS],
}

impl TransactionRecord {
    /// Build a record from typed values.
    ///
    /// The id is derived from the values when `transaction_id` is `None`.
    pub fn new(
        transaction_id: Option<String>,
        amount: f64,
        time: f64,
        components: [f64; PCA_COMPONENTS],
    ) -> Result<Self, ValidationError> {
        let mut issues = Vec::new();
        check_value("amount", amount, &mut issues);
        if amount < 0.0 {
            issues.push(FieldIssue::new("amount", FieldProblem::Negative));
        }
        check_value("time", time, &mut issues);
        for (i, v) in components.iter().enumerate() {
            check_value(&component_name(i), *v, &mut issues);
        }
        if !issues.is_empty() {
            return Err(ValidationError { issues });
        }

        let transaction_id =
            transaction_id.unwrap_or_else(|| content_id(amount, time, &components));
        Ok(Self {
            transaction_id,
            amount,
            time,
            components,
        })
    }

    /// Parse a raw inbound payload
    pub fn from_json_slice(payload: &[u8]) -> Result<Self, ValidationError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| ValidationError::malformed(e.to_string()))?;
        Self::from_json_value(&value)
    }

    /// Parse a JSON object with keys `amount`, `time`, `v1..v28`.
    ///
    /// Every missing or non-numeric field is reported, not just the first.
    pub fn from_json_value(value: &Value) -> Result<Self, ValidationError> {
        let object = value
            .as_object()
            .ok_or_else(|| ValidationError::malformed("expected a JSON object"))?;

        let mut issues = Vec::new();
        let amount = read_number(object, "amount", &mut issues);
        let time = read_number(object, "time", &mut issues);
        let mut components = [0.0; PCA_COMPONENTS];
        for (i, slot) in components.iter_mut().enumerate() {
            if let Some(v) = read_number(object, &component_name(i), &mut issues) {
                *slot = v;
            }
        }

        let transaction_id = match lookup(object, "transaction_id") {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(_) => {
                issues.push(FieldIssue::new("transaction_id", FieldProblem::Malformed));
                None
            }
        };

        match (amount, time) {
            (Some(amount), Some(time)) if issues.is_empty() => {
                Self::new(transaction_id, amount, time, components)
            }
            _ => Err(ValidationError { issues }),
        }
    }

    /// Record identifier (caller supplied or content derived)
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// Transaction amount (non-negative)
    pub fn amount(&self) -> f64 {
        self.amount
    }

    /// Seconds elapsed since the reference epoch of the dataset
    pub fn time(&self) -> f64 {
        self.time
    }

    /// PCA components `v1..v28`, index 0 is `v1`
    pub fn components(&self) -> &[f64; PCA_COMPONENTS] {
        &self.components
    }

    /// The 30 raw values in schema order: `amount, time, v1..v28`
    pub fn values(&self) -> [f64; RECORD_FIELDS] {
        let mut out = [0.0; RECORD_FIELDS];
        out[0] = self.amount;
        out[1] = self.time;
        out[2..].copy_from_slice(&self.components);
        out
    }
}

impl Serialize for TransactionRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(RECORD_FIELDS + 1))?;
        map.serialize_entry("transaction_id", &self.transaction_id)?;
        map.serialize_entry("amount", &self.amount)?;
        map.serialize_entry("time", &self.time)?;
        for (i, v) in self.components.iter().enumerate() {
            map.serialize_entry(&component_name(i), v)?;
        }
        map.end()
    }
}

/// `v1`-style key for component index `i` (zero based)
pub fn component_name(i: usize) -> String {
    format!("v{}", i + 1)
}

fn check_value(field: &str, value: f64, issues: &mut Vec<FieldIssue>) {
    if !value.is_finite() {
        issues.push(FieldIssue::new(field, FieldProblem::NotFinite));
    }
}

/// Look up a key by its canonical spelling or the capitalised dataset spelling
fn lookup<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    object.get(key).or_else(|| {
        let mut chars = key.chars();
        let capitalised: String = match chars.next() {
            Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
            None => return None,
        };
        object.get(&capitalised)
    })
}

fn read_number(
    object: &Map<String, Value>,
    key: &str,
    issues: &mut Vec<FieldIssue>,
) -> Option<f64> {
    match lookup(object, key) {
        None | Some(Value::Null) => {
            issues.push(FieldIssue::new(key, FieldProblem::Missing));
            None
        }
        Some(Value::Number(n)) => match n.as_f64() {
            Some(v) => Some(v),
            None => {
                issues.push(FieldIssue::new(key, FieldProblem::NotNumeric));
                None
            }
        },
        Some(_) => {
            issues.push(FieldIssue::new(key, FieldProblem::NotNumeric));
            None
        }
    }
}

fn content_id(amount: f64, time: f64, components: &[f64; PCA_COMPONENTS]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(amount.to_bits().to_le_bytes());
    hasher.update(time.to_bits().to_le_bytes());
    for v in components {
        hasher.update(v.to_bits().to_le_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    format!("tx_{}", &digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::record_json;
    use serde_json::json;

    fn full_record() -> Value {
        let mut object = Map::new();
        object.insert("amount".to_string(), json!(149.62));
        object.insert("time".to_string(), json!(3600));
        for i in 0..PCA_COMPONENTS {
            object.insert(component_name(i), json!(i as f64 * 0.1 - 1.0));
        }
        Value::Object(object)
    }

    #[test]
    fn test_parse_full_record() {
        let record = TransactionRecord::from_json_value(&full_record()).unwrap();

        assert_eq!(record.amount(), 149.62);
        assert_eq!(record.time(), 3600.0);
        assert_eq!(record.components()[0], -1.0);
        assert!(record.transaction_id().starts_with("tx_"));
        assert_eq!(record.values().len(), RECORD_FIELDS);
    }

    #[test]
    fn test_missing_v17_is_named() {
        let mut value = full_record();
        value.as_object_mut().unwrap().remove("v17");

        let err = TransactionRecord::from_json_value(&value).unwrap_err();
        assert_eq!(err.fields(), vec!["v17"]);
        assert_eq!(err.issues[0].problem, FieldProblem::Missing);
    }

    #[test]
    fn test_non_numeric_amount_rejected() {
        let mut value = full_record();
        value["amount"] = json!("a lot");

        let err = TransactionRecord::from_json_value(&value).unwrap_err();
        assert!(err.mentions("amount"));
        assert_eq!(err.issues[0].problem, FieldProblem::NotNumeric);
    }

    #[test]
    fn test_every_bad_field_is_reported() {
        let mut value = full_record();
        let object = value.as_object_mut().unwrap();
        object.remove("time");
        object.insert("v3".to_string(), json!(true));

        let err = TransactionRecord::from_json_value(&value).unwrap_err();
        assert_eq!(err.fields(), vec!["time", "v3"]);
    }

    #[test]
    fn test_negative_amount_rejected() {
        let mut value = full_record();
        value["amount"] = json!(-5.0);

        let err = TransactionRecord::from_json_value(&value).unwrap_err();
        assert_eq!(err.issues[0].problem, FieldProblem::Negative);
    }

    #[test]
    fn test_dataset_capitalisation_accepted() {
        let mut object = Map::new();
        object.insert("Amount".to_string(), json!(10.0));
        object.insert("Time".to_string(), json!(0.0));
        for i in 0..PCA_COMPONENTS {
            object.insert(format!("V{}", i + 1), json!(0.5));
        }

        let record = TransactionRecord::from_json_value(&Value::Object(object)).unwrap();
        assert_eq!(record.amount(), 10.0);
        assert_eq!(record.components()[27], 0.5);
    }

    #[test]
    fn test_malformed_payload() {
        let err = TransactionRecord::from_json_slice(b"not json").unwrap_err();
        assert_eq!(err.issues[0].problem, FieldProblem::Malformed);

        let err = TransactionRecord::from_json_slice(b"[1, 2]").unwrap_err();
        assert_eq!(err.fields(), vec!["payload"]);
    }

    #[test]
    fn test_content_id_is_stable() {
        let a = TransactionRecord::from_json_value(&full_record()).unwrap();
        let b = TransactionRecord::from_json_value(&full_record()).unwrap();
        assert_eq!(a.transaction_id(), b.transaction_id());

        let mut value = full_record();
        value["v5"] = json!(42.0);
        let c = TransactionRecord::from_json_value(&value).unwrap();
        assert_ne!(a.transaction_id(), c.transaction_id());
    }

    #[test]
    fn test_explicit_id_and_serialization() {
        let mut value = full_record();
        value["transaction_id"] = json!("tx_123");

        let record = TransactionRecord::from_json_value(&value).unwrap();
        assert_eq!(record.transaction_id(), "tx_123");

        let json = serde_json::to_value(&record).unwrap();
        let reparsed = TransactionRecord::from_json_value(&json).unwrap();
        assert_eq!(record, reparsed);
    }

    #[test]
    fn test_values_survive_json_text() {
        for seed in 0..1000 {
            let value = record_json(seed);
            let direct = TransactionRecord::from_json_value(&value).unwrap();
            let payload = serde_json::to_vec(&value).unwrap();
            let parsed = TransactionRecord::from_json_slice(&payload).unwrap();

            assert_eq!(direct.values().map(f64::to_bits), parsed.values().map(f64::to_bits));
            assert_eq!(direct.transaction_id(), parsed.transaction_id());

            let reserialized = serde_json::to_vec(&parsed).unwrap();
            assert_eq!(TransactionRecord::from_json_slice(&reserialized).unwrap(), direct);
        }
    }
}
