use gesso_contracts::params::NumericWidth;
use gesso_contracts::AssetSpec;
use serde_json::{Number, Value};

/// Runtime value of one stored parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int64(i64),
    Int32(i32),
    Double(f64),
    Float(f32),
    Bool(bool),
    Text(String),
    Image(String),
    ImageList(Vec<String>),
    Model(AssetSpec),
    List(Vec<String>),
    ModelList(Vec<AssetSpec>),
}

impl ParamValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Int64(_) => "int64",
            ParamValue::Int32(_) => "int32",
            ParamValue::Double(_) => "double",
            ParamValue::Float(_) => "float",
            ParamValue::Bool(_) => "bool",
            ParamValue::Text(_) => "text",
            ParamValue::Image(_) => "image",
            ParamValue::ImageList(_) => "image_list",
            ParamValue::Model(_) => "model",
            ParamValue::List(_) => "list",
            ParamValue::ModelList(_) => "model_list",
        }
    }

    /// The textual form used for clean hooks, ignore-if comparison,
    /// and JSON round-trips.
    pub fn to_text(&self) -> String {
        match self {
            ParamValue::Int64(v) => v.to_string(),
            ParamValue::Int32(v) => v.to_string(),
            ParamValue::Double(v) => format!("{v}"),
            ParamValue::Float(v) => format!("{v}"),
            ParamValue::Bool(v) => v.to_string(),
            ParamValue::Text(v) | ParamValue::Image(v) => v.clone(),
            ParamValue::ImageList(rows) => rows.join("|"),
            ParamValue::Model(spec) => spec.name.clone(),
            ParamValue::List(rows) => rows.join(","),
            ParamValue::ModelList(specs) => specs
                .iter()
                .map(|spec| spec.name.clone())
                .collect::<Vec<String>>()
                .join(","),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ParamValue::Int64(v) => Value::Number((*v).into()),
            ParamValue::Int32(v) => Value::Number((*v).into()),
            ParamValue::Double(v) => Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ParamValue::Float(v) => Number::from_f64(f64::from(*v))
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ParamValue::Bool(v) => Value::Bool(*v),
            ParamValue::Text(v) | ParamValue::Image(v) => Value::String(v.clone()),
            ParamValue::ImageList(rows) => Value::Array(
                rows.iter().cloned().map(Value::String).collect(),
            ),
            ParamValue::Model(spec) => Value::String(spec.name.clone()),
            ParamValue::List(rows) => Value::Array(
                rows.iter().cloned().map(Value::String).collect(),
            ),
            ParamValue::ModelList(specs) => Value::Array(
                specs
                    .iter()
                    .map(|spec| Value::String(spec.name.clone()))
                    .collect(),
            ),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int64(v) => Some(*v),
            ParamValue::Int32(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Double(v) => Some(*v),
            ParamValue::Float(v) => Some(f64::from(*v)),
            ParamValue::Int64(v) => Some(*v as f64),
            ParamValue::Int32(v) => Some(f64::from(*v)),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(v) | ParamValue::Image(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            ParamValue::List(rows) | ParamValue::ImageList(rows) => Some(rows.as_slice()),
            _ => None,
        }
    }

    pub fn as_model(&self) -> Option<&AssetSpec> {
        match self {
            ParamValue::Model(spec) => Some(spec),
            _ => None,
        }
    }

    /// Narrowing coercions applied on read: `i64→i32` and `f64→f32`
    /// when the descriptor declares a 32-bit width.
    pub fn narrowed(self, width: NumericWidth) -> ParamValue {
        if width != NumericWidth::W32 {
            return self;
        }
        match self {
            ParamValue::Int64(v) => ParamValue::Int32(v as i32),
            ParamValue::Double(v) => ParamValue::Float(v as f32),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn textual_forms() {
        assert_eq!(ParamValue::Int64(-1).to_text(), "-1");
        assert_eq!(ParamValue::Double(7.5).to_text(), "7.5");
        assert_eq!(ParamValue::Bool(true).to_text(), "true");
        assert_eq!(
            ParamValue::List(vec!["a".to_string(), "b".to_string()]).to_text(),
            "a,b"
        );
        assert_eq!(
            ParamValue::ImageList(vec!["x".to_string(), "y".to_string()]).to_text(),
            "x|y"
        );
    }

    #[test]
    fn narrowing_only_applies_to_wide_numerics() {
        assert_eq!(
            ParamValue::Int64(9).narrowed(NumericWidth::W32),
            ParamValue::Int32(9)
        );
        assert_eq!(
            ParamValue::Double(1.5).narrowed(NumericWidth::W32),
            ParamValue::Float(1.5)
        );
        assert_eq!(
            ParamValue::Text("x".to_string()).narrowed(NumericWidth::W32),
            ParamValue::Text("x".to_string())
        );
        assert_eq!(
            ParamValue::Int64(9).narrowed(NumericWidth::W64),
            ParamValue::Int64(9)
        );
    }

    #[test]
    fn json_forms_for_lists_and_models() {
        let spec = AssetSpec::new("anime/sd_xl_anime", "Stable-Diffusion");
        assert_eq!(
            ParamValue::Model(spec).to_json(),
            Value::String("anime/sd_xl_anime".to_string())
        );
        assert_eq!(
            ParamValue::List(vec!["a".to_string()]).to_json(),
            serde_json::json!(["a"])
        );
    }
}
