//! Schema Translator (C7, spec.md §4.7): JSON <-> the wire encoding the
//! Invoker hands to a backend, walking a declarative `MessageShape`
//! instead of a generated `prost::Message` impl (no backend `.proto`
//! files are known ahead of time — `MethodSpec` is the only schema).
//!
//! Grounded on `grpcurl-rs`'s dynamic-invocation pattern
//! (`tonic::client::Grpc<Channel>` + a custom `Codec`), adapted to
//! encode/decode directly against `prost::encoding`'s public
//! per-wire-type primitives rather than `prost_reflect::DynamicMessage`
//! (no `FileDescriptorProto` exists to build one from).

use base64::Engine;
use bridge_core::model::{FieldSpec, FieldType, MessageShape};
use bridge_core::BridgeError;
use bytes::{Buf, BufMut, BytesMut};
use prost::encoding::{decode_key, decode_varint, skip_field, DecodeContext, WireType};
use serde_json::{Map as JsonMap, Value};

/// Encode a JSON object against `shape` into canonical protobuf wire
/// bytes. Missing required fields -> `InvalidRequest`.
pub fn encode_message(shape: &MessageShape, value: &Value) -> Result<Vec<u8>, BridgeError> {
    let obj = value.as_object();
    let mut buf = BytesMut::new();
    for field in &shape.fields {
        let present = obj.and_then(|o| o.get(&field.name));
        encode_field(field, present, &mut buf)?;
    }
    Ok(buf.to_vec())
}

/// Decode wire bytes produced for `shape` back into a JSON object.
pub fn decode_message(shape: &MessageShape, mut bytes: &[u8]) -> Result<Value, BridgeError> {
    let mut obj = JsonMap::new();
    while bytes.has_remaining() {
        let (tag, wire_type) = decode_key(&mut bytes)
            .map_err(|e| BridgeError::Internal(format!("malformed wire tag: {e}")))?;
        match shape.fields.iter().find(|f| f.number == tag) {
            Some(field) => decode_field(field, wire_type, &mut bytes, &mut obj)?,
            None => {
                skip_field(wire_type, tag, &mut bytes, DecodeContext::default())
                    .map_err(|e| BridgeError::Internal(format!("malformed wire field: {e}")))?;
            }
        }
    }
    for field in &shape.fields {
        if field.required && !obj.contains_key(&field.name) {
            return Err(BridgeError::InvalidRequest(format!(
                "response missing required field '{}'",
                field.name
            )));
        }
    }
    Ok(Value::Object(obj))
}

fn encode_field(field: &FieldSpec, json: Option<&Value>, buf: &mut BytesMut) -> Result<(), BridgeError> {
    let json = match json.or(field.default.as_ref()) {
        Some(v) if !v.is_null() => v,
        _ if field.required => {
            return Err(BridgeError::InvalidRequest(format!(
                "missing required field '{}'",
                field.name
            )))
        }
        _ => return Ok(()),
    };

    match &field.ty {
        FieldType::Repeated(inner) => {
            let Value::Array(items) = json else {
                return Err(BridgeError::InvalidRequest(format!(
                    "field '{}' must be an array",
                    field.name
                )));
            };
            for item in items {
                encode_scalar(field.number, inner, item, &field.name, buf)?;
            }
            Ok(())
        }
        FieldType::Map(value_ty) => {
            let Value::Object(entries) = json else {
                return Err(BridgeError::InvalidRequest(format!(
                    "field '{}' must be an object",
                    field.name
                )));
            };
            for (k, v) in entries {
                let mut entry_buf = BytesMut::new();
                prost::encoding::string::encode(1, &k.clone(), &mut entry_buf);
                encode_scalar(2, value_ty, v, &field.name, &mut entry_buf)?;
                write_length_delimited(field.number, &entry_buf, buf);
            }
            Ok(())
        }
        other => encode_scalar(field.number, other, json, &field.name, buf),
    }
}

fn encode_scalar(
    tag: u32,
    ty: &FieldType,
    json: &Value,
    field_name: &str,
    buf: &mut BytesMut,
) -> Result<(), BridgeError> {
    match ty {
        FieldType::Bool => {
            let v = coerce_bool(json, field_name)?;
            prost::encoding::bool::encode(tag, &v, buf);
        }
        FieldType::Int32 => {
            let v = coerce_i64(json, field_name)? as i32;
            prost::encoding::int32::encode(tag, &v, buf);
        }
        FieldType::Int64 => {
            let v = coerce_i64(json, field_name)?;
            prost::encoding::int64::encode(tag, &v, buf);
        }
        FieldType::Uint64 => {
            let v = coerce_i64(json, field_name)? as u64;
            prost::encoding::uint64::encode(tag, &v, buf);
        }
        FieldType::Float32 => {
            let v = coerce_f64(json, field_name)? as f32;
            prost::encoding::float::encode(tag, &v, buf);
        }
        FieldType::Float64 => {
            let v = coerce_f64(json, field_name)?;
            prost::encoding::double::encode(tag, &v, buf);
        }
        FieldType::String => {
            let Value::String(s) = json else {
                return Err(BridgeError::InvalidRequest(format!(
                    "field '{field_name}' must be a string"
                )));
            };
            prost::encoding::string::encode(tag, s, buf);
        }
        FieldType::Bytes => {
            let Value::String(s) = json else {
                return Err(BridgeError::InvalidRequest(format!(
                    "field '{field_name}' must be a base64 string"
                )));
            };
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(s)
                .map_err(|_| {
                    BridgeError::InvalidRequest(format!(
                        "field '{field_name}' is not valid base64"
                    ))
                })?;
            prost::encoding::bytes::encode(tag, &decoded, buf);
        }
        FieldType::Message(shape) => {
            let inner = encode_message(shape, json)?;
            write_length_delimited(tag, &inner, buf);
        }
        FieldType::Repeated(_) | FieldType::Map(_) => {
            return Err(BridgeError::Internal(format!(
                "nested repeated/map in field '{field_name}' is not supported"
            )))
        }
    }
    Ok(())
}

fn write_length_delimited(tag: u32, payload: &[u8], buf: &mut BytesMut) {
    prost::encoding::encode_key(tag, WireType::LengthDelimited, buf);
    prost::encoding::encode_varint(payload.len() as u64, buf);
    buf.put_slice(payload);
}

fn coerce_bool(json: &Value, field_name: &str) -> Result<bool, BridgeError> {
    match json {
        Value::Bool(b) => Ok(*b),
        Value::String(s) if s == "true" => Ok(true),
        Value::String(s) if s == "false" => Ok(false),
        _ => Err(BridgeError::InvalidRequest(format!(
            "field '{field_name}' must be a bool"
        ))),
    }
}

fn coerce_i64(json: &Value, field_name: &str) -> Result<i64, BridgeError> {
    match json {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| BridgeError::InvalidRequest(format!("field '{field_name}' out of range"))),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| BridgeError::InvalidRequest(format!("field '{field_name}' is not numeric"))),
        _ => Err(BridgeError::InvalidRequest(format!(
            "field '{field_name}' must be an integer"
        ))),
    }
}

fn coerce_f64(json: &Value, field_name: &str) -> Result<f64, BridgeError> {
    match json {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| BridgeError::InvalidRequest(format!("field '{field_name}' out of range"))),
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| BridgeError::InvalidRequest(format!("field '{field_name}' is not numeric"))),
        _ => Err(BridgeError::InvalidRequest(format!(
            "field '{field_name}' must be a number"
        ))),
    }
}

fn decode_field(
    field: &FieldSpec,
    wire_type: WireType,
    bytes: &mut &[u8],
    obj: &mut JsonMap<String, Value>,
) -> Result<(), BridgeError> {
    match &field.ty {
        FieldType::Repeated(inner) => {
            let entry = obj
                .entry(field.name.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            let Value::Array(items) = entry else {
                unreachable!("repeated field entry is always an array")
            };
            if wire_type == WireType::LengthDelimited && is_packable(inner) {
                let len = decode_varint(bytes)
                    .map_err(|e| BridgeError::Internal(format!("malformed packed length: {e}")))?;
                if len as usize > bytes.remaining() {
                    return Err(BridgeError::Internal("packed field length overruns buffer".into()));
                }
                let mut packed = &bytes[..len as usize];
                while packed.has_remaining() {
                    items.push(decode_scalar_value(inner, packable_wire_type(inner), &mut packed, &field.name)?);
                }
                bytes.advance(len as usize);
            } else {
                items.push(decode_scalar_value(inner, wire_type, bytes, &field.name)?);
            }
            Ok(())
        }
        FieldType::Map(value_ty) => {
            let len = decode_varint(bytes)
                .map_err(|e| BridgeError::Internal(format!("malformed map entry length: {e}")))?;
            if len as usize > bytes.remaining() {
                return Err(BridgeError::Internal("map entry length overruns buffer".into()));
            }
            let mut entry_bytes = &bytes[..len as usize];
            let mut key = None;
            let mut value = None;
            while entry_bytes.has_remaining() {
                let (entry_tag, entry_wire) = decode_key(&mut entry_bytes)
                    .map_err(|e| BridgeError::Internal(format!("malformed map key: {e}")))?;
                match entry_tag {
                    1 => {
                        let mut s = String::new();
                        prost::encoding::string::merge(entry_wire, &mut s, &mut entry_bytes, DecodeContext::default())
                            .map_err(|e| BridgeError::Internal(format!("malformed map key: {e}")))?;
                        key = Some(s);
                    }
                    2 => value = Some(decode_scalar_value(value_ty, entry_wire, &mut entry_bytes, &field.name)?),
                    _ => skip_field(entry_wire, entry_tag, &mut entry_bytes, DecodeContext::default())
                        .map_err(|e| BridgeError::Internal(format!("malformed map field: {e}")))?,
                }
            }
            bytes.advance(len as usize);
            if let (Some(k), Some(v)) = (key, value) {
                let map_obj = obj
                    .entry(field.name.clone())
                    .or_insert_with(|| Value::Object(JsonMap::new()));
                if let Value::Object(m) = map_obj {
                    m.insert(k, v);
                }
            }
            Ok(())
        }
        other => {
            let decoded = decode_scalar_value(other, wire_type, bytes, &field.name)?;
            obj.insert(field.name.clone(), decoded);
            Ok(())
        }
    }
}

fn is_packable(ty: &FieldType) -> bool {
    matches!(
        ty,
        FieldType::Bool
            | FieldType::Int32
            | FieldType::Int64
            | FieldType::Uint64
            | FieldType::Float32
            | FieldType::Float64
    )
}

fn packable_wire_type(ty: &FieldType) -> WireType {
    match ty {
        FieldType::Float32 => WireType::ThirtyTwoBit,
        FieldType::Float64 => WireType::SixtyFourBit,
        _ => WireType::Varint,
    }
}

fn decode_scalar_value(
    ty: &FieldType,
    wire_type: WireType,
    bytes: &mut &[u8],
    field_name: &str,
) -> Result<Value, BridgeError> {
    let ctx = DecodeContext::default();
    let err = |e: prost::DecodeError| BridgeError::Internal(format!("field '{field_name}': {e}"));
    match ty {
        FieldType::Bool => {
            let mut v = false;
            prost::encoding::bool::merge(wire_type, &mut v, bytes, ctx).map_err(err)?;
            Ok(Value::Bool(v))
        }
        FieldType::Int32 => {
            let mut v = 0i32;
            prost::encoding::int32::merge(wire_type, &mut v, bytes, ctx).map_err(err)?;
            Ok(Value::from(v))
        }
        FieldType::Int64 => {
            let mut v = 0i64;
            prost::encoding::int64::merge(wire_type, &mut v, bytes, ctx).map_err(err)?;
            Ok(Value::from(v))
        }
        FieldType::Uint64 => {
            let mut v = 0u64;
            prost::encoding::uint64::merge(wire_type, &mut v, bytes, ctx).map_err(err)?;
            Ok(Value::from(v))
        }
        FieldType::Float32 => {
            let mut v = 0f32;
            prost::encoding::float::merge(wire_type, &mut v, bytes, ctx).map_err(err)?;
            Ok(serde_json::json!(v))
        }
        FieldType::Float64 => {
            let mut v = 0f64;
            prost::encoding::double::merge(wire_type, &mut v, bytes, ctx).map_err(err)?;
            Ok(serde_json::json!(v))
        }
        FieldType::String => {
            let mut v = String::new();
            prost::encoding::string::merge(wire_type, &mut v, bytes, ctx).map_err(err)?;
            Ok(Value::String(v))
        }
        FieldType::Bytes => {
            let mut v: Vec<u8> = Vec::new();
            prost::encoding::bytes::merge(wire_type, &mut v, bytes, ctx).map_err(err)?;
            Ok(Value::String(base64::engine::general_purpose::STANDARD.encode(v)))
        }
        FieldType::Message(shape) => {
            if wire_type != WireType::LengthDelimited {
                return Err(BridgeError::Internal(format!(
                    "field '{field_name}': expected length-delimited message"
                )));
            }
            let len = decode_varint(bytes).map_err(err)?;
            if len as usize > bytes.remaining() {
                return Err(BridgeError::Internal("message length overruns buffer".into()));
            }
            let sub = &bytes[..len as usize];
            let decoded = decode_message(shape, sub)?;
            bytes.advance(len as usize);
            Ok(decoded)
        }
        FieldType::Repeated(_) | FieldType::Map(_) => Err(BridgeError::Internal(format!(
            "field '{field_name}': nested repeated/map is not supported"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(name: &str, number: u32, ty: FieldType, required: bool) -> FieldSpec {
        FieldSpec {
            name: name.to_string(),
            number,
            ty,
            required,
            default: None,
        }
    }

    #[test]
    fn round_trips_scalar_fields() {
        let shape = MessageShape {
            fields: vec![
                field("id", 1, FieldType::Int64, true),
                field("name", 2, FieldType::String, false),
                field("active", 3, FieldType::Bool, false),
            ],
        };
        let input = json!({"id": 42, "name": "alice", "active": true});
        let bytes = encode_message(&shape, &input).unwrap();
        let decoded = decode_message(&shape, &bytes).unwrap();
        assert_eq!(decoded["id"], 42);
        assert_eq!(decoded["name"], "alice");
        assert_eq!(decoded["active"], true);
    }

    #[test]
    fn numeric_string_coercion() {
        let shape = MessageShape {
            fields: vec![field("count", 1, FieldType::Int32, true)],
        };
        let bytes = encode_message(&shape, &json!({"count": "7"})).unwrap();
        let decoded = decode_message(&shape, &bytes).unwrap();
        assert_eq!(decoded["count"], 7);
    }

    #[test]
    fn missing_required_field_is_invalid_request() {
        let shape = MessageShape {
            fields: vec![field("id", 1, FieldType::Int64, true)],
        };
        let err = encode_message(&shape, &json!({})).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidRequest(_)));
    }

    #[test]
    fn bytes_field_is_base64_only() {
        let shape = MessageShape {
            fields: vec![field("blob", 1, FieldType::Bytes, true)],
        };
        let err = encode_message(&shape, &json!({"blob": 123})).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidRequest(_)));

        let encoded = base64::engine::general_purpose::STANDARD.encode(b"hello");
        let bytes = encode_message(&shape, &json!({"blob": encoded})).unwrap();
        let decoded = decode_message(&shape, &bytes).unwrap();
        assert_eq!(decoded["blob"], encoded);
    }

    #[test]
    fn repeated_scalar_round_trips() {
        let shape = MessageShape {
            fields: vec![field(
                "tags",
                1,
                FieldType::Repeated(Box::new(FieldType::Int32)),
                false,
            )],
        };
        let bytes = encode_message(&shape, &json!({"tags": [1, 2, 3]})).unwrap();
        let decoded = decode_message(&shape, &bytes).unwrap();
        assert_eq!(decoded["tags"], json!([1, 2, 3]));
    }

    #[test]
    fn nested_message_round_trips() {
        let inner = MessageShape {
            fields: vec![field("street", 1, FieldType::String, false)],
        };
        let shape = MessageShape {
            fields: vec![field("address", 1, FieldType::Message(inner), false)],
        };
        let bytes = encode_message(&shape, &json!({"address": {"street": "Main St"}})).unwrap();
        let decoded = decode_message(&shape, &bytes).unwrap();
        assert_eq!(decoded["address"]["street"], "Main St");
    }

    #[test]
    fn map_field_round_trips() {
        let shape = MessageShape {
            fields: vec![field(
                "labels",
                1,
                FieldType::Map(Box::new(FieldType::String)),
                false,
            )],
        };
        let bytes = encode_message(&shape, &json!({"labels": {"env": "prod"}})).unwrap();
        let decoded = decode_message(&shape, &bytes).unwrap();
        assert_eq!(decoded["labels"]["env"], "prod");
    }

    #[test]
    fn encoding_is_deterministic() {
        let shape = MessageShape {
            fields: vec![field("id", 1, FieldType::Int64, true)],
        };
        let a = encode_message(&shape, &json!({"id": 5})).unwrap();
        let b = encode_message(&shape, &json!({"id": 5})).unwrap();
        assert_eq!(a, b);
    }
}
