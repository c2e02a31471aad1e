//! 特征值编解码与配置档注册表
//!
//! 编解码器把原始字节与结构化值互相转换。注册表按服务 UUID / 特征 UUID
//! 查找配置档（名称、编解码器、离散取值、发现钩子），显式传入 `Central`，
//! 不使用进程级全局状态。

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use super::characteristic::Characteristic;

/// 键值形式的特征值
pub type StringValues = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct CodecError(pub String);

/// 特征值编解码器
pub trait ValueCodec: Send + Sync {
    fn encode_strings(&self, values: &StringValues) -> Result<Vec<u8>, CodecError>;

    fn decode_strings(&self, data: &[u8]) -> Option<StringValues>;

    fn encode_value(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    fn decode_value(&self, data: &[u8]) -> Option<Value>;
}

/// 未知特征的默认编解码器：只能解码，拒绝任何结构化写入
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl ValueCodec for RawCodec {
    fn encode_strings(&self, _values: &StringValues) -> Result<Vec<u8>, CodecError> {
        Err(CodecError("raw characteristic has no string encoding".into()))
    }

    fn decode_strings(&self, data: &[u8]) -> Option<StringValues> {
        Some(StringValues::from([("value".to_string(), hex::encode(data))]))
    }

    fn encode_value(&self, _value: &Value) -> Result<Vec<u8>, CodecError> {
        Err(CodecError("raw characteristic has no value encoding".into()))
    }

    fn decode_value(&self, data: &[u8]) -> Option<Value> {
        Some(Value::Array(data.iter().map(|b| Value::from(*b)).collect()))
    }
}

/// UTF-8 文本，键为 `value`
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl ValueCodec for Utf8Codec {
    fn encode_strings(&self, values: &StringValues) -> Result<Vec<u8>, CodecError> {
        values
            .get("value")
            .map(|v| v.as_bytes().to_vec())
            .ok_or_else(|| CodecError("missing key 'value'".into()))
    }

    fn decode_strings(&self, data: &[u8]) -> Option<StringValues> {
        let text = std::str::from_utf8(data).ok()?;
        Some(StringValues::from([("value".to_string(), text.to_string())]))
    }

    fn encode_value(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        match value {
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            other => Err(CodecError(format!("expected a string, got {other}"))),
        }
    }

    fn decode_value(&self, data: &[u8]) -> Option<Value> {
        std::str::from_utf8(data)
            .ok()
            .map(|s| Value::String(s.to_string()))
    }
}

/// JSON 文本
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ValueCodec for JsonCodec {
    fn encode_strings(&self, values: &StringValues) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(values).map_err(|e| CodecError(e.to_string()))
    }

    fn decode_strings(&self, data: &[u8]) -> Option<StringValues> {
        let object: BTreeMap<String, Value> = serde_json::from_slice(data).ok()?;
        Some(
            object
                .into_iter()
                .map(|(k, v)| match v {
                    Value::String(s) => (k, s),
                    other => (k, other.to_string()),
                })
                .collect(),
        )
    }

    fn encode_value(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError(e.to_string()))
    }

    fn decode_value(&self, data: &[u8]) -> Option<Value> {
        serde_json::from_slice(data).ok()
    }
}

/// 特征被发现后调用的钩子
pub type DiscoveredHook = Arc<dyn Fn(Characteristic) + Send + Sync>;

/// 特征配置档
#[derive(Clone)]
pub struct CharacteristicProfile {
    pub uuid: Uuid,
    pub name: String,
    pub codec: Arc<dyn ValueCodec>,
    pub discrete_values: Vec<String>,
    pub after_discovered: Option<DiscoveredHook>,
}

impl CharacteristicProfile {
    pub fn new(uuid: Uuid, name: impl Into<String>) -> Self {
        Self {
            uuid,
            name: name.into(),
            codec: Arc::new(RawCodec),
            discrete_values: Vec::new(),
            after_discovered: None,
        }
    }

    /// 注册表中没有对应条目时使用
    pub fn unknown(uuid: Uuid) -> Self {
        Self::new(uuid, "Unknown")
    }

    pub fn with_codec(mut self, codec: impl ValueCodec + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn with_discrete_values(mut self, values: Vec<String>) -> Self {
        self.discrete_values = values;
        self
    }

    pub fn on_discovered<F>(mut self, hook: F) -> Self
    where
        F: Fn(Characteristic) + Send + Sync + 'static,
    {
        self.after_discovered = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for CharacteristicProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CharacteristicProfile")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("discrete_values", &self.discrete_values)
            .field("after_discovered", &self.after_discovered.is_some())
            .finish_non_exhaustive()
    }
}

/// 服务配置档
#[derive(Debug, Clone)]
pub struct ServiceProfile {
    pub uuid: Uuid,
    pub name: String,
    characteristics: HashMap<Uuid, CharacteristicProfile>,
}

impl ServiceProfile {
    pub fn new(uuid: Uuid, name: impl Into<String>) -> Self {
        Self {
            uuid,
            name: name.into(),
            characteristics: HashMap::new(),
        }
    }

    pub fn with_characteristic(mut self, profile: CharacteristicProfile) -> Self {
        self.characteristics.insert(profile.uuid, profile);
        self
    }

    pub fn characteristic(&self, uuid: &Uuid) -> Option<&CharacteristicProfile> {
        self.characteristics.get(uuid)
    }
}

/// 配置档注册表
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    services: HashMap<Uuid, ServiceProfile>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, profile: ServiceProfile) {
        self.services.insert(profile.uuid, profile);
    }

    pub fn with_service(mut self, profile: ServiceProfile) -> Self {
        self.register(profile);
        self
    }

    pub fn service(&self, uuid: &Uuid) -> Option<&ServiceProfile> {
        self.services.get(uuid)
    }

    pub fn service_name(&self, uuid: &Uuid) -> String {
        self.service(uuid)
            .map_or_else(|| "Unknown".to_string(), |p| p.name.clone())
    }

    /// 查找特征配置档，找不到时返回 "Unknown" 配置档
    pub fn characteristic(&self, service: &Uuid, uuid: &Uuid) -> CharacteristicProfile {
        self.service(service)
            .and_then(|s| s.characteristic(uuid))
            .cloned()
            .unwrap_or_else(|| CharacteristicProfile::unknown(*uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raw_codec_rejects_structured_writes() {
        assert!(RawCodec.encode_strings(&StringValues::new()).is_err());
        assert!(RawCodec.encode_value(&json!(1)).is_err());
        let decoded = RawCodec.decode_strings(&[0x0a, 0xff]).unwrap();
        assert_eq!(decoded["value"], "0aff");
        assert_eq!(RawCodec.decode_value(&[1, 2]), Some(json!([1, 2])));
    }

    #[test]
    fn test_utf8_codec() {
        let values = StringValues::from([("value".to_string(), "on".to_string())]);
        assert_eq!(Utf8Codec.encode_strings(&values).unwrap(), b"on");
        assert!(Utf8Codec.encode_strings(&StringValues::new()).is_err());
        assert!(Utf8Codec.encode_value(&json!(3)).is_err());
        assert_eq!(Utf8Codec.decode_value(b"off"), Some(json!("off")));
        assert_eq!(Utf8Codec.decode_strings(&[0xff, 0xfe]), None);
    }

    #[test]
    fn test_json_codec_strings_flatten_values() {
        let decoded = JsonCodec
            .decode_strings(br#"{"temperature": 21.5, "unit": "C"}"#)
            .unwrap();
        assert_eq!(decoded["temperature"], "21.5");
        assert_eq!(decoded["unit"], "C");
        assert!(JsonCodec.decode_value(b"not json").is_none());
    }

    #[test]
    fn test_registry_fallback() {
        let service = Uuid::from_u128(0x180d);
        let known = Uuid::from_u128(0x2a37);
        let registry = ProfileRegistry::new().with_service(
            ServiceProfile::new(service, "Heart Rate").with_characteristic(
                CharacteristicProfile::new(known, "Heart Rate Measurement")
                    .with_codec(JsonCodec)
                    .with_discrete_values(vec!["on".into(), "off".into()]),
            ),
        );

        assert_eq!(registry.service_name(&service), "Heart Rate");
        assert_eq!(registry.service_name(&Uuid::nil()), "Unknown");
        let profile = registry.characteristic(&service, &known);
        assert_eq!(profile.name, "Heart Rate Measurement");
        assert_eq!(profile.discrete_values.len(), 2);
        let unknown = registry.characteristic(&service, &Uuid::nil());
        assert_eq!(unknown.name, "Unknown");
        assert!(unknown.codec.encode_value(&json!("x")).is_err());
    }
}
