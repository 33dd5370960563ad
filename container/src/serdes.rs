//! Codec registry and the envelope-boundary serde manager
//!
//! The registry maps codec names to codecs. The manager applies the most
//! specific binding for an envelope's stream: stream-level overrides
//! system-level, and change-log streams always use the owning store's
//! codecs. Payloads with no binding stay raw.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use config::Config;

use weir_common::codec::{Serde, SerdeFactory};
use weir_common::config::{SerializerConfig, StorageConfig, StreamConfig, SystemConfig};
use weir_common::{
    Datum, IncomingEnvelope, OutgoingEnvelope, SerdeError, SystemStream,
};

use crate::registry::ComponentRegistry;

const DEFAULT_STORE_SERDE: &str = "bytes";

/// Identity codec over raw bytes
pub struct BytesSerde;

impl Serde for BytesSerde {
    fn encode(&self, datum: &Datum) -> Result<Vec<u8>, SerdeError> {
        match datum {
            Datum::Bytes(bytes) => Ok(bytes.to_vec()),
            other => Err(SerdeError::Encode(format!("bytes codec cannot encode {other:?}"))),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Datum, SerdeError> {
        Ok(Datum::Bytes(Bytes::copy_from_slice(bytes)))
    }
}

/// UTF-8 text codec
pub struct StringSerde;

impl Serde for StringSerde {
    fn encode(&self, datum: &Datum) -> Result<Vec<u8>, SerdeError> {
        match datum {
            Datum::Text(text) => Ok(text.as_bytes().to_vec()),
            other => Err(SerdeError::Encode(format!("string codec cannot encode {other:?}"))),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Datum, SerdeError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| SerdeError::Decode(format!("invalid UTF-8: {e}")))?;
        Ok(Datum::Text(text.to_string()))
    }
}

/// Signed 64-bit integers as decimal text
pub struct IntegerSerde;

impl Serde for IntegerSerde {
    fn encode(&self, datum: &Datum) -> Result<Vec<u8>, SerdeError> {
        match datum {
            Datum::Integer(value) => Ok(value.to_string().into_bytes()),
            other => Err(SerdeError::Encode(format!("integer codec cannot encode {other:?}"))),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Datum, SerdeError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| SerdeError::Decode(format!("invalid UTF-8: {e}")))?;
        let value = text
            .trim()
            .parse::<i64>()
            .map_err(|e| SerdeError::Decode(format!("invalid integer '{text}': {e}")))?;
        Ok(Datum::Integer(value))
    }
}

/// JSON documents via serde_json
pub struct JsonSerde;

impl Serde for JsonSerde {
    fn encode(&self, datum: &Datum) -> Result<Vec<u8>, SerdeError> {
        match datum {
            Datum::Json(value) => {
                serde_json::to_vec(value).map_err(|e| SerdeError::Encode(e.to_string()))
            }
            other => Err(SerdeError::Encode(format!("json codec cannot encode {other:?}"))),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Datum, SerdeError> {
        serde_json::from_slice(bytes)
            .map(Datum::Json)
            .map_err(|e| SerdeError::Decode(e.to_string()))
    }
}

pub struct BytesSerdeFactory;

impl SerdeFactory for BytesSerdeFactory {
    fn build(&self, _name: &str, _config: &Config) -> Result<Arc<dyn Serde>> {
        Ok(Arc::new(BytesSerde))
    }
}

pub struct StringSerdeFactory;

impl SerdeFactory for StringSerdeFactory {
    fn build(&self, _name: &str, _config: &Config) -> Result<Arc<dyn Serde>> {
        Ok(Arc::new(StringSerde))
    }
}

pub struct IntegerSerdeFactory;

impl SerdeFactory for IntegerSerdeFactory {
    fn build(&self, _name: &str, _config: &Config) -> Result<Arc<dyn Serde>> {
        Ok(Arc::new(IntegerSerde))
    }
}

pub struct JsonSerdeFactory;

impl SerdeFactory for JsonSerdeFactory {
    fn build(&self, _name: &str, _config: &Config) -> Result<Arc<dyn Serde>> {
        Ok(Arc::new(JsonSerde))
    }
}

/// Named codec lookup. The four built-in codecs are always present under
/// their own names; `serializers.registry.<name>.class` entries add more.
pub struct SerdeRegistry {
    codecs: HashMap<String, Arc<dyn Serde>>,
}

impl SerdeRegistry {
    pub fn from_config(config: &Arc<Config>, components: &ComponentRegistry) -> Result<Self> {
        let mut codecs: HashMap<String, Arc<dyn Serde>> = HashMap::new();
        codecs.insert("bytes".to_string(), Arc::new(BytesSerde));
        codecs.insert("string".to_string(), Arc::new(StringSerde));
        codecs.insert("integer".to_string(), Arc::new(IntegerSerde));
        codecs.insert("json".to_string(), Arc::new(JsonSerde));

        let serializers = SerializerConfig::new(config.clone());
        for name in serializers.serde_names() {
            let factory_name = serializers.serde_factory(&name)?;
            let factory = components.serde_factory(&factory_name)?;
            codecs.insert(name.clone(), factory.build(&name, config)?);
        }
        Ok(Self { codecs })
    }

    pub fn codec(&self, name: &str) -> Result<Arc<dyn Serde>, SerdeError> {
        self.codecs.get(name).cloned().ok_or_else(|| SerdeError::UnknownCodec(name.to_string()))
    }
}

#[derive(Clone, Default)]
struct Binding {
    key: Option<Arc<dyn Serde>>,
    value: Option<Arc<dyn Serde>>,
}

/// Applies codecs on the envelope boundary: decode inbound, encode
/// outbound
pub struct SerdeManager {
    system_bindings: HashMap<String, Binding>,
    stream_bindings: HashMap<SystemStream, Binding>,
    changelog_bindings: HashMap<SystemStream, Binding>,
}

impl SerdeManager {
    pub fn from_config(config: &Arc<Config>, registry: &SerdeRegistry) -> Result<Self> {
        let lookup = |name: Option<String>| -> Result<Option<Arc<dyn Serde>>> {
            match name {
                Some(name) => Ok(Some(registry.codec(&name)?)),
                None => Ok(None),
            }
        };

        let systems = SystemConfig::new(config.clone());
        let mut system_bindings = HashMap::new();
        for system in systems.system_names() {
            let binding = Binding {
                key: lookup(systems.key_serde(&system))?,
                value: lookup(systems.msg_serde(&system))?,
            };
            if binding.key.is_some() || binding.value.is_some() {
                system_bindings.insert(system, binding);
            }
        }

        let streams = StreamConfig::new(config.clone());
        let mut stream_bindings = HashMap::new();
        if let Ok(by_system) = config.get_table("streams") {
            for (system, streams_value) in by_system {
                for (stream, _) in streams_value.into_table().unwrap_or_default() {
                    let ss = SystemStream::new(&system, &stream);
                    let binding = Binding {
                        key: lookup(streams.key_serde(&ss))?,
                        value: lookup(streams.msg_serde(&ss))?,
                    };
                    if binding.key.is_some() || binding.value.is_some() {
                        stream_bindings.insert(ss, binding);
                    }
                }
            }
        }

        let storage = StorageConfig::new(config.clone());
        let mut changelog_bindings = HashMap::new();
        for store in storage.store_names() {
            if let Some(changelog) = storage.changelog(&store)? {
                let key_name =
                    storage.key_serde(&store).unwrap_or_else(|| DEFAULT_STORE_SERDE.to_string());
                let value_name =
                    storage.msg_serde(&store).unwrap_or_else(|| DEFAULT_STORE_SERDE.to_string());
                let binding = Binding {
                    key: Some(registry.codec(&key_name)?),
                    value: Some(registry.codec(&value_name)?),
                };
                changelog_bindings.insert(changelog, binding);
            }
        }

        Ok(Self {
            system_bindings,
            stream_bindings,
            changelog_bindings,
        })
    }

    /// True when the stream backs a store
    pub fn is_changelog(&self, ss: &SystemStream) -> bool {
        self.changelog_bindings.contains_key(ss)
    }

    fn binding_for(&self, ss: &SystemStream) -> Binding {
        if let Some(binding) = self.changelog_bindings.get(ss) {
            return binding.clone();
        }
        let stream = self.stream_bindings.get(ss);
        let system = self.system_bindings.get(&ss.system);
        Binding {
            key: stream
                .and_then(|b| b.key.clone())
                .or_else(|| system.and_then(|b| b.key.clone())),
            value: stream
                .and_then(|b| b.value.clone())
                .or_else(|| system.and_then(|b| b.value.clone())),
        }
    }

    /// Decode a raw inbound envelope into domain values. Fields with no
    /// binding stay raw bytes.
    pub fn decode(&self, envelope: &IncomingEnvelope) -> Result<IncomingEnvelope, SerdeError> {
        let binding = self.binding_for(&envelope.ssp.system_stream);
        Ok(IncomingEnvelope {
            ssp: envelope.ssp.clone(),
            offset: envelope.offset.clone(),
            key: decode_field(&binding.key, &envelope.key)?,
            value: decode_field(&binding.value, &envelope.value)?,
        })
    }

    /// Encode an outbound envelope down to raw bytes for its destination
    pub fn encode(&self, envelope: &OutgoingEnvelope) -> Result<OutgoingEnvelope, SerdeError> {
        let binding = self.binding_for(&envelope.system_stream);
        Ok(OutgoingEnvelope {
            system_stream: envelope.system_stream.clone(),
            partition: envelope.partition,
            key: encode_field(&binding.key, &envelope.key)?,
            value: encode_field(&binding.value, &envelope.value)?,
        })
    }
}

fn decode_field(
    codec: &Option<Arc<dyn Serde>>,
    datum: &Option<Datum>,
) -> Result<Option<Datum>, SerdeError> {
    match (codec, datum) {
        (_, None) => Ok(None),
        (None, Some(datum)) => Ok(Some(datum.clone())),
        (Some(codec), Some(datum)) => {
            let bytes = datum.as_bytes().ok_or_else(|| {
                SerdeError::Decode("inbound payload was not raw bytes".to_string())
            })?;
            codec.decode(bytes).map(Some)
        }
    }
}

fn encode_field(
    codec: &Option<Arc<dyn Serde>>,
    datum: &Option<Datum>,
) -> Result<Option<Datum>, SerdeError> {
    match (codec, datum) {
        (_, None) => Ok(None),
        (None, Some(Datum::Bytes(bytes))) => Ok(Some(Datum::Bytes(bytes.clone()))),
        (None, Some(other)) => Err(SerdeError::Encode(format!(
            "no codec bound for non-raw outbound value {other:?}"
        ))),
        (Some(codec), Some(datum)) => codec.encode(datum).map(|bytes| Some(Datum::bytes(bytes))),
    }
}
