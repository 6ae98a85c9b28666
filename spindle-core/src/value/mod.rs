//! Dynamically typed cell values and rows.
//!
//! Result rows come back from the engine as serialized batches of value
//! tuples. The collector pairs every tuple with a shared [`RowSchema`] to form
//! a [`Row`].
use std::sync::Arc;

use anyhow::{anyhow, bail, ensure, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A single cell value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
    /// Array elements, or the fields of a nested struct in schema order.
    List(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer value, widening `Int` to `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(i64::from(*v)),
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// The type of a schema field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataType {
    Boolean,
    Integer,
    Long,
    Double,
    String,
    Binary,
    Array(Box<DataType>),
    Struct(RowSchema),
    /// A type name this crate doesn't interpret; values pass through as-is.
    Other(String),
}

impl DataType {
    fn from_json(json: &JsonValue) -> Result<Self> {
        match json {
            JsonValue::String(name) => Ok(match name.as_str() {
                "boolean" => Self::Boolean,
                "integer" => Self::Integer,
                "long" => Self::Long,
                "double" => Self::Double,
                "string" => Self::String,
                "binary" => Self::Binary,
                other => Self::Other(other.to_string()),
            }),
            JsonValue::Object(object) => match object.get("type").and_then(JsonValue::as_str) {
                Some("struct") => Ok(Self::Struct(RowSchema::from_json_value(json)?)),
                Some("array") => {
                    let element = object
                        .get("elementType")
                        .ok_or_else(|| anyhow!("array type without elementType"))?;
                    Ok(Self::Array(Box::new(Self::from_json(element)?)))
                }
                Some(other) => Ok(Self::Other(other.to_string())),
                None => bail!("complex type without a \"type\" tag: {json}"),
            },
            other => bail!("unexpected data type description: {other}"),
        }
    }
}

/// A named, typed column of a [`RowSchema`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }
}

/// The ordered fields of a row.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RowSchema {
    fields: Vec<Field>,
}

impl RowSchema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }

    /// Parse the engine's JSON description of a struct type.
    ///
    /// ```
    /// use spindle::value::{DataType, RowSchema};
    ///
    /// let schema = RowSchema::from_json(
    ///     r#"{"type":"struct","fields":[{"name":"age","type":"long","nullable":true,"metadata":{}}]}"#,
    /// ).unwrap();
    /// assert_eq!(schema.fields()[0].data_type, DataType::Long);
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let json: JsonValue = serde_json::from_str(json)?;
        Self::from_json_value(&json)
    }

    fn from_json_value(json: &JsonValue) -> Result<Self> {
        ensure!(
            json.get("type").and_then(JsonValue::as_str) == Some("struct"),
            "schema root must be a struct type"
        );
        let fields = json
            .get("fields")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| anyhow!("struct type without a fields array"))?;

        let fields = fields
            .iter()
            .map(|field| {
                let name = field
                    .get("name")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| anyhow!("field without a name: {field}"))?;
                let data_type = field
                    .get("type")
                    .ok_or_else(|| anyhow!("field {name:?} without a type"))
                    .and_then(DataType::from_json)?;
                let nullable = field
                    .get("nullable")
                    .and_then(JsonValue::as_bool)
                    .unwrap_or(true);
                Ok(Field::new(name, data_type, nullable))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { fields })
    }
}

/// A tuple of values paired with the schema that names them.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    values: Vec<Value>,
    schema: Arc<RowSchema>,
}

impl Row {
    /// Pair `values` with `schema`; the arity must match.
    pub fn new(values: Vec<Value>, schema: Arc<RowSchema>) -> Result<Self> {
        ensure!(
            values.len() == schema.len(),
            "row has {} values but its schema has {} fields",
            values.len(),
            schema.len()
        );
        Ok(Self { values, schema })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.schema.index_of(name).and_then(|index| self.get(index))
    }

    /// View a nested struct column as a row of its own.
    pub fn get_struct(&self, name: &str) -> Result<Row> {
        let index = self
            .schema
            .index_of(name)
            .ok_or_else(|| anyhow!("no column named {name:?}"))?;
        let DataType::Struct(schema) = &self.schema.fields[index].data_type else {
            bail!("column {name:?} is not a struct");
        };
        let values = self.values[index]
            .as_list()
            .ok_or_else(|| anyhow!("column {name:?} does not hold struct fields"))?;
        Row::new(values.to_vec(), Arc::new(schema.clone()))
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn schema(&self) -> &Arc<RowSchema> {
        &self.schema
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEOPLE: &str = r#"{
        "type": "struct",
        "fields": [
            {"name": "name", "type": "string", "nullable": false, "metadata": {}},
            {"name": "age", "type": "long", "nullable": true, "metadata": {}},
            {"name": "tags", "type": {"type": "array", "elementType": "string", "containsNull": true}, "nullable": true, "metadata": {}},
            {"name": "address", "type": {"type": "struct", "fields": [
                {"name": "city", "type": "string", "nullable": true, "metadata": {}},
                {"name": "zip", "type": "integer", "nullable": true, "metadata": {}}
            ]}, "nullable": true, "metadata": {}},
            {"name": "joined", "type": "timestamp", "nullable": true, "metadata": {}}
        ]
    }"#;

    #[test]
    fn parses_nested_schema() {
        let schema = RowSchema::from_json(PEOPLE).unwrap();
        assert_eq!(schema.len(), 5);
        assert_eq!(schema.fields()[0], Field::new("name", DataType::String, false));
        assert_eq!(
            schema.fields()[2].data_type,
            DataType::Array(Box::new(DataType::String))
        );
        let DataType::Struct(address) = &schema.fields()[3].data_type else {
            panic!("address should be a struct");
        };
        assert_eq!(address.index_of("zip"), Some(1));
        assert_eq!(
            schema.fields()[4].data_type,
            DataType::Other("timestamp".to_string())
        );
    }

    #[test]
    fn rejects_malformed_schema() {
        assert!(RowSchema::from_json(r#"{"type":"array","elementType":"long"}"#).is_err());
        assert!(RowSchema::from_json(r#"{"type":"struct"}"#).is_err());
        assert!(RowSchema::from_json(r#"{"type":"struct","fields":[{"type":"long"}]}"#).is_err());
        assert!(RowSchema::from_json("not json").is_err());
    }

    #[test]
    fn row_access_by_index_and_name() {
        let schema = Arc::new(RowSchema::from_json(PEOPLE).unwrap());
        let row = Row::new(
            vec![
                "ada".into(),
                Value::from(Some(36i64)),
                Value::List(vec!["math".into()]),
                Value::List(vec!["London".into(), 12345.into()]),
                Value::Null,
            ],
            schema,
        )
        .unwrap();

        assert_eq!(row.get(0).and_then(Value::as_str), Some("ada"));
        assert_eq!(row.get_by_name("age").and_then(Value::as_i64), Some(36));
        assert!(row.get_by_name("joined").unwrap().is_null());
        assert!(row.get_by_name("missing").is_none());

        let address = row.get_struct("address").unwrap();
        assert_eq!(address.get_by_name("zip").and_then(Value::as_i64), Some(12345));
        assert!(row.get_struct("name").is_err());
    }

    #[test]
    fn row_arity_must_match_schema() {
        let schema = Arc::new(RowSchema::new(vec![Field::new("a", DataType::Long, true)]));
        assert!(Row::new(vec![], schema.clone()).is_err());
        assert!(Row::new(vec![1i64.into(), 2i64.into()], schema).is_err());
    }
}
