//! Codec contract: named serializers plugged in at the envelope boundary

use std::sync::Arc;

use anyhow::Result;
use config::Config;

use crate::errors::SerdeError;
use crate::types::Datum;

/// A named codec. Encode-then-decode is the identity on the domain values
/// the codec supports; unsupported values fail rather than degrade.
pub trait Serde: Send + Sync {
    fn encode(&self, datum: &Datum) -> Result<Vec<u8>, SerdeError>;
    fn decode(&self, bytes: &[u8]) -> Result<Datum, SerdeError>;
}

/// Builds a codec from config. Resolved through the component registry by
/// the factory name given in `serializers.registry.<name>.class`.
pub trait SerdeFactory: Send + Sync {
    fn build(&self, name: &str, config: &Config) -> Result<Arc<dyn Serde>>;
}
